//! Content-addressed package store.
//!
//! Extracted package bodies live at `<root>/v1/<hex[..2]>/<hex[2..]>/`,
//! keyed by the hex digest of their tarball integrity. An entry appears by
//! `rename` from a staging directory under `<root>/tmp`, so a visible entry
//! is always complete. Entries are never modified after publish.

use super::locks::{KeyedGuard, KeyedLocks};
use crate::config::Channel;
use crate::paths::cache_dir;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Environment variable to override the store location.
pub const STORE_DIR_ENV: &str = "HYPERPM_STORE_DIR";

/// On-disk layout version of the store.
pub const STORE_LAYOUT: &str = "v1";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A published package body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// Hex digest of the tarball integrity.
    pub key: String,
    /// Directory holding the package files.
    pub path: PathBuf,
}

/// The shared package store with per-key single-writer locks.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    locks: KeyedLocks<String>,
}

impl ContentStore {
    /// Open a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Open the store for `channel`, honoring `HYPERPM_STORE_DIR`.
    #[must_use]
    pub fn for_channel(channel: Channel) -> Self {
        let root = std::env::var_os(STORE_DIR_ENV)
            .map_or_else(|| cache_dir(channel).join("store"), PathBuf::from);
        Self::new(root)
    }

    /// Get the store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an entry with `key` lives at once published.
    #[must_use]
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let split = key.len().min(2);
        self.root
            .join(STORE_LAYOUT)
            .join(&key[..split])
            .join(&key[split..])
    }

    /// Look up a published entry.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<StoreEntry> {
        let path = self.entry_path(key);
        path.is_dir().then(|| StoreEntry {
            key: key.to_string(),
            path,
        })
    }

    /// Acquire the single-writer lock for `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_, String> {
        self.locks.lock(&key.to_string()).await
    }

    /// Number of keys with a live writer lock.
    #[must_use]
    pub fn active_locks(&self) -> usize {
        self.locks.active()
    }

    /// Fresh staging directory on the store's filesystem.
    #[must_use]
    pub fn staging_dir(&self, key: &str) -> PathBuf {
        self.root.join("tmp").join(format!(
            "{key}-{}-{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    /// Move an extracted package into place and drop its staging directory.
    ///
    /// If another process published the same key first, the existing entry
    /// wins and the staged copy is discarded.
    ///
    /// # Errors
    /// Returns an error if the rename fails and no entry exists afterwards.
    pub fn publish(&self, key: &str, extracted: &Path, staging: &Path) -> io::Result<StoreEntry> {
        let dest = self.entry_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let result = match fs::rename(extracted, &dest) {
            Ok(()) => {
                debug!(key, path = %dest.display(), "published store entry");
                Ok(StoreEntry {
                    key: key.to_string(),
                    path: dest,
                })
            }
            Err(e) => self.lookup(key).ok_or(e),
        };

        let _ = fs::remove_dir_all(staging);
        result
    }
}

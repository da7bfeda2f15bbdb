//! Materialize store entries into the nested `node_modules` tree.
//!
//! Every placement is a real directory whose files are hard links into the
//! content store (copies where hard links are unsupported). A marker file
//! records which store entry a placement came from; only marked placements
//! are ever replaced or pruned.

use super::error::LinkError;
use super::graph::{DependencyGraph, NodeId, ResolvedNode};
use super::locks::KeyedLocks;
use super::store::StoreEntry;
use hyperpm_util::fs::{atomic_write, link_tree, LinkStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Marker file written into every placement.
pub const MARKER_FILE: &str = ".hyperpm-placement.json";

const NODE_MODULES: &str = "node_modules";

/// Contents of a placement marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementMarker {
    /// Store key the files were linked from; empty while linking.
    pub key: String,
    pub name: String,
    pub version: String,
}

/// Result of linking one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Files were placed.
    Linked(LinkStats),
    /// The placement already held this store entry.
    Unchanged,
}

/// Summary of a full tree link.
#[derive(Debug, Clone, Default)]
pub struct InstalledTree {
    /// Install path to absolute placement directory.
    pub placements: BTreeMap<String, PathBuf>,
    /// Placements written this run.
    pub linked: usize,
    /// Placements that were already up to date.
    pub unchanged: usize,
    /// Files hard-linked or copied.
    pub files: LinkStats,
}

/// Places packages under a project root with per-path locking.
#[derive(Debug)]
pub struct Linker {
    project_root: PathBuf,
    locks: KeyedLocks<String>,
}

impl Linker {
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            locks: KeyedLocks::new(),
        }
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Absolute directory of a node's placement.
    ///
    /// # Errors
    /// `UnsafePath` if the install path would leave `node_modules`.
    pub fn placement_path(&self, node: &ResolvedNode) -> Result<PathBuf, LinkError> {
        let mut path = self.project_root.clone();
        for part in node.install_path.split('/') {
            if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
                return Err(LinkError::UnsafePath {
                    install_path: node.install_path.clone(),
                });
            }
            path.push(part);
        }
        Ok(path)
    }

    /// Place one node's store entry at its install path.
    ///
    /// # Errors
    /// `StoreEntryMissing` if `entry` is not the node's published entry,
    /// `PathConflict` if the path holds content we did not place, `Io` for
    /// filesystem failures.
    pub async fn link_node(
        &self,
        node: &ResolvedNode,
        entry: &StoreEntry,
    ) -> Result<LinkOutcome, LinkError> {
        if node.store_key().as_deref() != Some(entry.key.as_str()) || !entry.path.is_dir() {
            return Err(LinkError::StoreEntryMissing {
                name: node.label(),
                key: entry.key.clone(),
            });
        }

        let dest = self.placement_path(node)?;
        let _guard = self.locks.lock(&node.install_path).await;

        let marker = PlacementMarker {
            key: entry.key.clone(),
            name: node.name.clone(),
            version: node.version.to_string(),
        };
        let source = entry.path.clone();
        let target = dest.clone();
        let placed = tokio::task::spawn_blocking(move || place(&source, &target, marker))
            .await
            .map_err(|e| LinkError::Io {
                path: dest.clone(),
                message: e.to_string(),
            })??;

        match placed {
            Some(stats) => {
                debug!(package = %node.label(), path = %node.install_path, linked = stats.linked, copied = stats.copied, "linked");
                Ok(LinkOutcome::Linked(stats))
            }
            None => {
                trace!(package = %node.label(), path = %node.install_path, "placement up to date");
                Ok(LinkOutcome::Unchanged)
            }
        }
    }

    /// Link every node of `graph` in creation order.
    ///
    /// # Errors
    /// Stops at the first node that fails.
    pub async fn link_all(
        &self,
        graph: &DependencyGraph,
        entries: &HashMap<NodeId, StoreEntry>,
    ) -> Result<InstalledTree, LinkError> {
        let mut tree = InstalledTree::default();

        for node in graph.nodes() {
            let entry = entries
                .get(&node.id)
                .ok_or_else(|| LinkError::StoreEntryMissing {
                    name: node.label(),
                    key: node.store_key().unwrap_or_default(),
                })?;

            match self.link_node(node, entry).await? {
                LinkOutcome::Linked(stats) => {
                    tree.linked += 1;
                    tree.files.linked += stats.linked;
                    tree.files.copied += stats.copied;
                }
                LinkOutcome::Unchanged => tree.unchanged += 1,
            }
            tree.placements
                .insert(node.install_path.clone(), self.placement_path(node)?);
        }

        Ok(tree)
    }

    /// Remove marked placements that are not part of `graph`.
    ///
    /// Returns the install paths removed. Unmarked content is left alone.
    ///
    /// # Errors
    /// Returns an error if a placement cannot be removed.
    pub fn prune_extraneous(&self, graph: &DependencyGraph) -> Result<Vec<String>, LinkError> {
        let keep: HashSet<&str> = graph.nodes().map(|n| n.install_path.as_str()).collect();
        let mut removed = Vec::new();

        let root = self.project_root.join(NODE_MODULES);
        if root.is_dir() {
            prune_dir(&root, NODE_MODULES, &keep, &mut removed)
                .map_err(|e| LinkError::io(&root, &e))?;
        }

        for path in &removed {
            debug!(path = %path, "pruned extraneous placement");
        }
        Ok(removed)
    }
}

/// Put `source` at `dest` unless the marker already records `marker.key`.
/// Returns `None` when the placement was up to date.
fn place(
    source: &Path,
    dest: &Path,
    mut marker: PlacementMarker,
) -> Result<Option<LinkStats>, LinkError> {
    match read_marker(dest) {
        Some(existing) if existing.key == marker.key => return Ok(None),
        Some(existing) => {
            debug!(previous = %existing.version, path = %dest.display(), "replacing placement");
            clear_placement(dest).map_err(|e| LinkError::io(dest, &e))?;
        }
        None => check_unmarked(dest)?,
    }

    let key = std::mem::take(&mut marker.key);
    // An interrupted link leaves an empty key, which the next run replaces
    write_marker(dest, &marker)?;

    let stats = link_tree(source, dest, &[NODE_MODULES]).map_err(|e| LinkError::io(dest, &e))?;

    marker.key = key;
    write_marker(dest, &marker)?;
    Ok(Some(stats))
}

fn read_marker(dir: &Path) -> Option<PlacementMarker> {
    let content = fs::read(dir.join(MARKER_FILE)).ok()?;
    serde_json::from_slice(&content).ok()
}

fn write_marker(dir: &Path, marker: &PlacementMarker) -> Result<(), LinkError> {
    fs::create_dir_all(dir).map_err(|e| LinkError::io(dir, &e))?;
    let content = serde_json::to_vec(marker).map_err(|e| LinkError::Io {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;
    let path = dir.join(MARKER_FILE);
    atomic_write(&path, &content).map_err(|e| LinkError::io(&path, &e))
}

/// An unmarked path may only be a bare container for nested placements.
fn check_unmarked(dest: &Path) -> Result<(), LinkError> {
    let meta = match fs::symlink_metadata(dest) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(LinkError::io(dest, &e)),
    };
    if !meta.is_dir() {
        return Err(LinkError::PathConflict {
            path: dest.to_path_buf(),
        });
    }

    let entries = fs::read_dir(dest).map_err(|e| LinkError::io(dest, &e))?;
    for entry in entries {
        let entry = entry.map_err(|e| LinkError::io(dest, &e))?;
        if entry.file_name() != NODE_MODULES {
            return Err(LinkError::PathConflict {
                path: dest.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Remove everything in a placement except its nested `node_modules`.
fn clear_placement(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == NODE_MODULES {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn prune_dir(
    node_modules: &Path,
    prefix: &str,
    keep: &HashSet<&str>,
    removed: &mut Vec<String>,
) -> io::Result<()> {
    let mut names: Vec<String> = fs::read_dir(node_modules)?
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();

    for name in names {
        let path = node_modules.join(&name);
        if name.starts_with('@') {
            if !path.is_dir() {
                continue;
            }
            let mut inner: Vec<String> = fs::read_dir(&path)?
                .filter_map(Result::ok)
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect();
            inner.sort();
            for pkg in inner {
                let rel = format!("{prefix}/{name}/{pkg}");
                prune_placement(&path.join(&pkg), &rel, keep, removed)?;
            }
            let _ = fs::remove_dir(&path);
        } else {
            let rel = format!("{prefix}/{name}");
            prune_placement(&path, &rel, keep, removed)?;
        }
    }
    Ok(())
}

fn prune_placement(
    dir: &Path,
    rel: &str,
    keep: &HashSet<&str>,
    removed: &mut Vec<String>,
) -> io::Result<()> {
    let is_dir = fs::symlink_metadata(dir).is_ok_and(|m| m.is_dir());
    if !is_dir {
        return Ok(());
    }

    let nested = dir.join(NODE_MODULES);
    if nested.is_dir() {
        prune_dir(&nested, &format!("{rel}/{NODE_MODULES}"), keep, removed)?;
        let _ = fs::remove_dir(&nested);
    }

    if !keep.contains(rel) && read_marker(dir).is_some() {
        clear_placement(dir)?;
        // Only succeeds when nothing unmarked is left inside
        let _ = fs::remove_dir(dir);
        removed.push(rel.to_string());
    }
    Ok(())
}

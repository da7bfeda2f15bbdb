use crate::config::Channel;
use crate::error::Error;
use crate::version::SCHEMA_VERSION;
use std::path::{Path, PathBuf};

/// Find the project root by walking up from `cwd` looking for `package.json`.
///
/// Returns the first directory containing one, or `None` if none is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").exists() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Like [`project_root`], but an error when no `package.json` is found.
pub fn require_project_root(cwd: &Path) -> Result<PathBuf, Error> {
    project_root(cwd).ok_or_else(|| Error::ProjectNotFound {
        start: cwd.to_path_buf(),
    })
}

/// Get the cache directory for hyperpm.
///
/// Uses platform-appropriate locations with versioning:
/// - Linux: `$XDG_CACHE_HOME/hyperpm/v{N}/{channel}` or `~/.cache/hyperpm/v{N}/{channel}`
/// - macOS: `~/Library/Caches/hyperpm/v{N}/{channel}`
/// - Windows: `%LOCALAPPDATA%\hyperpm\v{N}\{channel}`
#[must_use]
pub fn cache_dir(channel: Channel) -> PathBuf {
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".hyperpm-cache"),
                |p| p.join(".cache").join("hyperpm"),
            )
        },
        |p| p.join("hyperpm"),
    );

    base.join(format!("v{SCHEMA_VERSION}"))
        .join(channel.as_str())
}

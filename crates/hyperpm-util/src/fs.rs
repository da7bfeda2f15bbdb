use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// This provides crash-safety: the file will either have the old contents or
/// the new contents, never a partial write.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));

    // Create temp file in the same directory to ensure same filesystem for rename
    let mut temp_path = parent.to_path_buf();
    temp_path.push(format!(
        ".{}.tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // On Windows, rename can fail if target exists. Try copy + remove as fallback.
            if cfg!(windows) {
                fs::copy(&temp_path, path)?;
                let _ = fs::remove_file(&temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

/// Counts from a [`link_tree`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Files placed as hard links.
    pub linked: u64,
    /// Files that had to be copied (hard links unsupported).
    pub copied: u64,
}

/// Mirror the directory tree at `src` into `dst` using hard links.
///
/// Directories are created, regular files are hard-linked, and symlinks are
/// skipped. A file falls back to a copy only when the hard link fails (for
/// example across devices). Existing files at `dst` are replaced. Entries
/// whose first path component is listed in `skip` are ignored.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a file cannot be placed.
pub fn link_tree(src: &Path, dst: &Path, skip: &[&str]) -> io::Result<LinkStats> {
    let mut stats = LinkStats::default();
    fs::create_dir_all(dst)?;

    let walker = WalkDir::new(src).min_depth(1).follow_links(false);
    for entry in walker.into_iter().filter_entry(|e| {
        e.depth() != 1 || !skip.iter().any(|s| e.file_name() == *s)
    }) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let ty = entry.file_type();

        if ty.is_dir() {
            fs::create_dir_all(&target)?;
        } else if ty.is_file() {
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            if fs::hard_link(entry.path(), &target).is_ok() {
                stats.linked += 1;
            } else {
                fs::copy(entry.path(), &target)?;
                stats.copied += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");

        // Overwrite
        atomic_write(&path, b"world").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "world");
    }

    #[test]
    fn test_atomic_write_no_temp_left_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        atomic_write(&path, b"content").unwrap();

        // No temp files should remain
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].as_ref().unwrap().file_name().to_str().unwrap(),
            "test.txt"
        );
    }

    #[test]
    fn test_link_tree_mirrors_files() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("lib")).unwrap();
        fs::write(src.path().join("package.json"), "{}").unwrap();
        fs::write(src.path().join("lib").join("index.js"), "x").unwrap();

        let target = dst.path().join("pkg");
        let stats = link_tree(src.path(), &target, &[]).unwrap();

        assert_eq!(stats.linked + stats.copied, 2);
        assert_eq!(
            fs::read_to_string(target.join("lib").join("index.js")).unwrap(),
            "x"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_link_tree_shares_inodes() {
        use std::os::unix::fs::MetadataExt;

        let src = tempdir().unwrap();
        fs::write(src.path().join("a.js"), "a").unwrap();
        let target = src.path().join("out");

        link_tree(src.path(), &target, &["out"]).unwrap();

        let original = fs::metadata(src.path().join("a.js")).unwrap();
        let linked = fs::metadata(target.join("a.js")).unwrap();
        assert_eq!(original.ino(), linked.ino());
    }

    #[test]
    fn test_link_tree_skips_listed_entries() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("node_modules").join("x")).unwrap();
        fs::write(src.path().join("node_modules").join("x").join("f"), "f").unwrap();
        fs::write(src.path().join("index.js"), "i").unwrap();

        link_tree(src.path(), dst.path(), &["node_modules"]).unwrap();

        assert!(dst.path().join("index.js").exists());
        assert!(!dst.path().join("node_modules").exists());
    }

    #[test]
    fn test_link_tree_replaces_existing_file() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("index.js"), "new").unwrap();
        fs::write(dst.path().join("index.js"), "old").unwrap();

        link_tree(src.path(), dst.path(), &[]).unwrap();

        assert_eq!(fs::read_to_string(dst.path().join("index.js")).unwrap(), "new");
    }
}

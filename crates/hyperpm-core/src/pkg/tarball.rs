//! Tarball extraction.

use super::error::PkgError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;

/// Ceiling on the total bytes written while unpacking one tarball.
pub const MAX_UNPACKED_SIZE: u64 = 1024 * 1024 * 1024;

/// Unpack a gzipped npm tarball under `staging` and return the package root.
///
/// npm tarballs hold a single top-level directory, usually `package/` but
/// some (e.g. `@types/*`) use the bare package name. Absolute paths and
/// `..` components are rejected; symlinks and special entries are skipped.
///
/// # Errors
/// `PKG_EXTRACT_FAILED` for undecodable or unsafe archives, or when the
/// unpacked files exceed [`MAX_UNPACKED_SIZE`]. `PKG_CACHE_ERROR` when the
/// staging directory cannot be written.
pub fn unpack(bytes: &[u8], staging: &Path) -> Result<PathBuf, PkgError> {
    unpack_with_limit(bytes, staging, MAX_UNPACKED_SIZE)
}

fn unpack_with_limit(bytes: &[u8], staging: &Path, limit: u64) -> Result<PathBuf, PkgError> {
    fs::create_dir_all(staging)?;
    extract_tgz_to(bytes, staging, limit)?;
    find_extracted_root(staging)
}

/// Find the single top-level directory in an extracted tarball.
fn find_extracted_root(staging: &Path) -> Result<PathBuf, PkgError> {
    let package_dir = staging.join("package");
    if package_dir.is_dir() {
        return Ok(package_dir);
    }

    let entries: Vec<_> = fs::read_dir(staging)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect();

    match entries.len() {
        1 => Ok(entries[0].path()),
        0 => Err(PkgError::extract_failed(
            "Tarball does not contain any top-level directory",
        )),
        n => Err(PkgError::extract_failed(format!(
            "Tarball contains {n} top-level directories, expected 1"
        ))),
    }
}

fn extract_tgz_to(bytes: &[u8], dest: &Path, limit: u64) -> Result<(), PkgError> {
    let gz = GzDecoder::new(bytes);
    let mut archive = Archive::new(gz);
    let mut written: u64 = 0;

    for entry in archive
        .entries()
        .map_err(|e| PkgError::extract_failed(format!("Failed to read tarball entries: {e}")))?
    {
        let mut entry = entry
            .map_err(|e| PkgError::extract_failed(format!("Failed to read tarball entry: {e}")))?;

        let path = entry
            .path()
            .map_err(|e| PkgError::extract_failed(format!("Failed to read entry path: {e}")))?
            .into_owned();
        check_entry_path(&path)?;

        let dest_path = dest.join(&path);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else if entry_type.is_file() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&dest_path)?;
            let remaining = limit.saturating_sub(written);
            let mut bounded = (&mut entry).take(remaining.saturating_add(1));
            let copied = io::copy(&mut bounded, &mut file).map_err(|e| {
                PkgError::extract_failed(format!("Truncated entry {}: {e}", path.display()))
            })?;
            if copied > remaining {
                return Err(PkgError::extract_failed(format!(
                    "Tarball unpacks to more than {limit} bytes"
                )));
            }
            written += copied;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    // Keep the executable bits, never setuid/setgid or world-writable
                    let perms = fs::Permissions::from_mode((mode & 0o755) | 0o644);
                    let _ = fs::set_permissions(&dest_path, perms);
                }
            }
        }
    }

    Ok(())
}

fn check_entry_path(path: &Path) -> Result<(), PkgError> {
    if path.is_absolute() || path.has_root() {
        return Err(PkgError::extract_failed(format!(
            "Tarball contains absolute path: {}",
            path.display()
        )));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(PkgError::extract_failed(format!(
            "Tarball contains path traversal: {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::Builder;
    use tempfile::tempdir;

    /// Build a gzipped tarball from `(path, contents)` pairs.
    pub(crate) fn make_tgz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            for (path, data) in files {
                let mut header = tar::Header::new_gnu();
                header.set_path(path).unwrap();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append(&header, *data).unwrap();
            }
            builder.finish().unwrap();
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_unpack_package_prefix() {
        let dir = tempdir().unwrap();
        let tgz = make_tgz(&[
            ("package/package.json", br#"{"name":"test","version":"1.0.0"}"#),
            ("package/lib/index.js", b"module.exports = 42;"),
        ]);

        let root = unpack(&tgz, dir.path()).unwrap();

        assert_eq!(root, dir.path().join("package"));
        assert!(root.join("package.json").exists());
        assert!(root.join("lib").join("index.js").exists());
    }

    #[test]
    fn test_non_package_prefix() {
        // @types/* tarballs use the bare package name
        let dir = tempdir().unwrap();
        let tgz = make_tgz(&[("node/index.d.ts", b"test")]);

        let root = unpack(&tgz, dir.path()).unwrap();
        assert!(root.join("index.d.ts").exists());
    }

    #[test]
    fn test_reject_empty_tarball() {
        let dir = tempdir().unwrap();
        let tgz = make_tgz(&[]);
        let err = unpack(&tgz, dir.path()).unwrap_err();
        assert_eq!(err.code(), codes::PKG_EXTRACT_FAILED);
    }

    #[test]
    fn test_reject_multiple_roots() {
        let dir = tempdir().unwrap();
        let tgz = make_tgz(&[("a/x.js", b"1"), ("b/y.js", b"2")]);
        let err = unpack(&tgz, dir.path()).unwrap_err();
        assert_eq!(err.code(), codes::PKG_EXTRACT_FAILED);
    }

    #[test]
    fn test_reject_garbage() {
        let dir = tempdir().unwrap();
        let err = unpack(b"definitely not gzip", dir.path()).unwrap_err();
        assert_eq!(err.code(), codes::PKG_EXTRACT_FAILED);
    }

    #[test]
    fn test_reject_oversized_contents() {
        let dir = tempdir().unwrap();
        let big = vec![b'a'; 4096];
        let tgz = make_tgz(&[
            ("package/package.json", b"{}"),
            ("package/a.txt", &big),
            ("package/b.txt", &big),
        ]);

        let err = unpack_with_limit(&tgz, dir.path(), 6000).unwrap_err();
        assert_eq!(err.code(), codes::PKG_EXTRACT_FAILED);
        assert!(err.message().contains("6000"));

        let fits = tempdir().unwrap();
        assert!(unpack_with_limit(&tgz, fits.path(), 8194).is_ok());
    }

    #[test]
    fn test_check_entry_path() {
        assert!(check_entry_path(Path::new("package/index.js")).is_ok());
        assert!(check_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(check_entry_path(Path::new("package/../../evil")).is_err());
    }
}

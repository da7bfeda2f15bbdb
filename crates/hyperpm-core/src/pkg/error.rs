//! Package manager error types.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Package manager error codes.
pub mod codes {
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_VERSION_NOT_FOUND: &str = "PKG_VERSION_NOT_FOUND";
    pub const PKG_REGISTRY_ERROR: &str = "PKG_REGISTRY_ERROR";
    pub const PKG_DOWNLOAD_FAILED: &str = "PKG_DOWNLOAD_FAILED";
    pub const PKG_EXTRACT_FAILED: &str = "PKG_EXTRACT_FAILED";
    pub const NODE_MODULES_WRITE_FAILED: &str = "NODE_MODULES_WRITE_FAILED";
    pub const PKG_CACHE_ERROR: &str = "PKG_CACHE_ERROR";
    pub const PKG_PACKAGE_JSON_NOT_FOUND: &str = "PKG_PACKAGE_JSON_NOT_FOUND";
    pub const PKG_PACKAGE_JSON_INVALID: &str = "PKG_PACKAGE_JSON_INVALID";
    pub const PKG_DEP_RANGE_INVALID: &str = "PKG_DEP_RANGE_INVALID";

    // Resolution
    pub const PKG_RESOLVE_CONFLICT: &str = "PKG_RESOLVE_CONFLICT";
    pub const PKG_RESOLVE_UNSATISFIABLE: &str = "PKG_RESOLVE_UNSATISFIABLE";
    pub const PKG_RESOLVE_UNSUPPORTED_SPEC: &str = "PKG_RESOLVE_UNSUPPORTED_SPEC";

    // Fetch & extract
    pub const PKG_INTEGRITY_MISMATCH: &str = "PKG_INTEGRITY_MISMATCH";
    pub const PKG_INTEGRITY_INVALID: &str = "PKG_INTEGRITY_INVALID";
    pub const PKG_NETWORK_FAILURE: &str = "PKG_NETWORK_FAILURE";
    pub const PKG_ARCHIVE_CORRUPT: &str = "PKG_ARCHIVE_CORRUPT";

    // Linking
    pub const PKG_LINK_PATH_CONFLICT: &str = "PKG_LINK_PATH_CONFLICT";
    pub const PKG_STORE_ENTRY_MISSING: &str = "PKG_STORE_ENTRY_MISSING";
    pub const PKG_LINK_UNSAFE_PATH: &str = "PKG_LINK_UNSAFE_PATH";

    // Orchestration
    pub const PKG_INSTALL_CANCELLED: &str = "PKG_INSTALL_CANCELLED";
}

/// Package manager error.
#[derive(Debug, Clone)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Create a spec invalid error.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    /// Create a package not found error.
    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::PKG_NOT_FOUND, format!("Package not found: {name}"))
    }

    /// Create a registry error.
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, msg)
    }

    /// Create an extract failed error.
    pub fn extract_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_EXTRACT_FAILED, msg)
    }

    /// Create a package.json not found error.
    #[must_use]
    pub fn package_json_not_found(path: &std::path::Path) -> Self {
        Self::new(
            codes::PKG_PACKAGE_JSON_NOT_FOUND,
            format!("package.json not found: {}", path.display()),
        )
    }

    /// Create a package.json invalid error.
    pub fn package_json_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PACKAGE_JSON_INVALID, msg)
    }

    /// Create a dependency range invalid error.
    #[must_use]
    pub fn dep_range_invalid(name: &str, actual_type: &str) -> Self {
        Self::new(
            codes::PKG_DEP_RANGE_INVALID,
            format!("Invalid range for '{name}': expected string, got {actual_type}"),
        )
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        Self::new(codes::PKG_CACHE_ERROR, e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Connection failed: {e}"))
        } else {
            Self::new(codes::PKG_REGISTRY_ERROR, e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, format!("Invalid JSON: {e}"))
    }
}

/// Graph-wide resolution failure. Always fatal for the whole install.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// Two constraints on one package cannot be separated by nesting.
    #[error("conflict on {name} at {scope}: {existing} does not satisfy {range} (required by {required_by})")]
    Conflict {
        name: String,
        scope: String,
        existing: String,
        range: String,
        required_by: String,
    },

    /// The package, or the exact version/tag requested, does not exist.
    #[error("{name}{} not found in registry", .version.as_ref().map(|v| format!("@{v}")).unwrap_or_default())]
    NotFound {
        name: String,
        version: Option<String>,
    },

    /// The declared range matches none of the published versions.
    #[error("no version of {name} satisfies {range}")]
    ConstraintUnsatisfiable { name: String, range: String },

    /// The dependency uses a specifier the registry resolver cannot handle.
    #[error("unsupported dependency specifier for {name}: {spec}")]
    UnsupportedSpec { name: String, spec: String },

    /// Metadata could not be fetched.
    #[error("registry request for {name} failed: {message}")]
    Registry { name: String, message: String },
}

impl ResolutionError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => codes::PKG_RESOLVE_CONFLICT,
            Self::NotFound { version: None, .. } => codes::PKG_NOT_FOUND,
            Self::NotFound { .. } => codes::PKG_VERSION_NOT_FOUND,
            Self::ConstraintUnsatisfiable { .. } => codes::PKG_RESOLVE_UNSATISFIABLE,
            Self::UnsupportedSpec { .. } => codes::PKG_RESOLVE_UNSUPPORTED_SPEC,
            Self::Registry { .. } => codes::PKG_REGISTRY_ERROR,
        }
    }
}

/// Per-node failure of the fetch & extract stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Downloaded bytes do not hash to the expected integrity.
    #[error("integrity mismatch for {name}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// The integrity string could not be parsed.
    #[error("invalid integrity for {name}: '{integrity}'")]
    InvalidIntegrity { name: String, integrity: String },

    /// Transient failures persisted past the retry ceiling.
    #[error("download of {url} failed after {attempts} attempts: {message}")]
    NetworkFailure {
        url: String,
        attempts: u32,
        message: String,
    },

    /// A non-transient download failure (4xx, oversized body).
    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    /// The archive could not be decoded or has an unsafe layout.
    #[error("corrupt archive for {name}: {message}")]
    CorruptArchive { name: String, message: String },

    /// The store could not be written.
    #[error("store write failed: {0}")]
    Store(String),
}

impl FetchError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::IntegrityMismatch { .. } => codes::PKG_INTEGRITY_MISMATCH,
            Self::InvalidIntegrity { .. } => codes::PKG_INTEGRITY_INVALID,
            Self::NetworkFailure { .. } => codes::PKG_NETWORK_FAILURE,
            Self::Download { .. } => codes::PKG_DOWNLOAD_FAILED,
            Self::CorruptArchive { .. } => codes::PKG_ARCHIVE_CORRUPT,
            Self::Store(_) => codes::PKG_CACHE_ERROR,
        }
    }
}

/// Per-node failure of the link stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The target path holds content this installer did not place.
    #[error("refusing to overwrite unrecognized content at {}", .path.display())]
    PathConflict { path: PathBuf },

    /// The node's store entry was never materialized.
    #[error("store entry {key} for {name} is missing")]
    StoreEntryMissing { name: String, key: String },

    /// The install path does not stay inside `node_modules`.
    #[error("install path {install_path} escapes node_modules")]
    UnsafePath { install_path: String },

    /// Filesystem failure while placing the package.
    #[error("failed to link {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
}

impl LinkError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathConflict { .. } => codes::PKG_LINK_PATH_CONFLICT,
            Self::StoreEntryMissing { .. } => codes::PKG_STORE_ENTRY_MISSING,
            Self::UnsafePath { .. } => codes::PKG_LINK_UNSAFE_PATH,
            Self::Io { .. } => codes::NODE_MODULES_WRITE_FAILED,
        }
    }

    pub(crate) fn io(path: &std::path::Path, e: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        let err = PkgError::spec_invalid("bad spec");
        assert_eq!(err.code(), codes::PKG_SPEC_INVALID);
        assert!(err.to_string().contains(codes::PKG_SPEC_INVALID));
    }

    #[test]
    fn test_error_codes_uppercase() {
        // All codes should be SCREAMING_SNAKE_CASE
        let all_codes = [
            codes::PKG_SPEC_INVALID,
            codes::PKG_NOT_FOUND,
            codes::PKG_VERSION_NOT_FOUND,
            codes::PKG_REGISTRY_ERROR,
            codes::PKG_DOWNLOAD_FAILED,
            codes::PKG_EXTRACT_FAILED,
            codes::NODE_MODULES_WRITE_FAILED,
            codes::PKG_CACHE_ERROR,
            codes::PKG_PACKAGE_JSON_NOT_FOUND,
            codes::PKG_PACKAGE_JSON_INVALID,
            codes::PKG_DEP_RANGE_INVALID,
            codes::PKG_RESOLVE_CONFLICT,
            codes::PKG_RESOLVE_UNSATISFIABLE,
            codes::PKG_RESOLVE_UNSUPPORTED_SPEC,
            codes::PKG_INTEGRITY_MISMATCH,
            codes::PKG_INTEGRITY_INVALID,
            codes::PKG_NETWORK_FAILURE,
            codes::PKG_ARCHIVE_CORRUPT,
            codes::PKG_LINK_PATH_CONFLICT,
            codes::PKG_STORE_ENTRY_MISSING,
            codes::PKG_LINK_UNSAFE_PATH,
            codes::PKG_INSTALL_CANCELLED,
        ];

        for code in all_codes {
            assert!(
                code.chars().all(|c| c.is_uppercase() || c == '_'),
                "Error code '{code}' should be SCREAMING_SNAKE_CASE"
            );
        }
    }

    #[test]
    fn test_not_found_codes_distinguish_version() {
        let pkg = ResolutionError::NotFound {
            name: "left-pad".to_string(),
            version: None,
        };
        let version = ResolutionError::NotFound {
            name: "left-pad".to_string(),
            version: Some("9.9.9".to_string()),
        };
        assert_eq!(pkg.code(), codes::PKG_NOT_FOUND);
        assert_eq!(version.code(), codes::PKG_VERSION_NOT_FOUND);
        assert_eq!(version.to_string(), "left-pad@9.9.9 not found in registry");
    }

    #[test]
    fn test_link_error_messages_include_path() {
        let err = LinkError::PathConflict {
            path: PathBuf::from("node_modules/a"),
        };
        assert!(err.to_string().contains("node_modules/a"));
        assert_eq!(err.code(), codes::PKG_LINK_PATH_CONFLICT);
    }
}

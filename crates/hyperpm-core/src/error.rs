use std::path::PathBuf;
use thiserror::Error;

/// Error codes for [`Error`].
pub mod codes {
    pub const IO_ERROR: &str = "IO_ERROR";
    pub const PROJECT_NOT_FOUND: &str = "PROJECT_NOT_FOUND";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Core error type for hyperpm operations outside the package engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No package.json found in {start} or any parent directory")]
    ProjectNotFound { start: PathBuf },

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => codes::IO_ERROR,
            Self::ProjectNotFound { .. } => codes::PROJECT_NOT_FOUND,
            Self::Other(_) => codes::INTERNAL_ERROR,
        }
    }
}

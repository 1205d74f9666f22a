//! Error taxonomy for a reconciliation pass.
//!
//! Every variant is fatal for the current pass. Nothing here is retried
//! internally; re-running the pass is what makes recovery safe.

use std::io;
use std::path::{Path, PathBuf};

/// Errors surfaced by the convergence core.
#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    /// Checksum mismatch, malformed archive, missing executable.
    #[error("verification failed: {0}")]
    Verification(String),

    /// Download or network failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Host package manager failure.
    #[error("package manager failure: {0}")]
    Package(String),

    /// Malformed desired state, fragment or persisted state.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Service start/stop/enable failure.
    #[error("service error: {0}")]
    Service(String),

    /// Filesystem failure on a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConvergeError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ConvergeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ConvergeError::Configuration(msg.into())
    }
}

/// Shorthand result type for the library.
pub type Result<T, E = ConvergeError> = std::result::Result<T, E>;

/// Attach a path to a raw `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| ConvergeError::io(path, e))
    }
}

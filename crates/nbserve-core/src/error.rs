//! Error types for nbserve-core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for nbserve-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in nbserve-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Kernel subprocess could not be spawned or never signaled ready.
    #[error("kernel start failure: {0}")]
    KernelStart(String),

    /// IPC communication error with the kernel subprocess.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Session exists but its kernel is dead and could not be restarted.
    #[error("session unavailable for {}", path.display())]
    SessionUnavailable { path: PathBuf },

    /// Path rejected by the access policy.
    #[error("access denied for {}: {reason}", path.display())]
    AccessDenied { path: PathBuf, reason: String },

    /// Cell index outside the notebook's cell list.
    #[error("cell index {index} out of range (notebook has {count} cells)")]
    CellIndexOutOfRange { index: usize, count: usize },

    /// Invalid cell range for a range execution.
    #[error("invalid cell range {start}..={end} (notebook has {count} cells)")]
    InvalidRange {
        start: usize,
        end: usize,
        count: usize,
    },

    /// Failed to read or parse a notebook document.
    #[error("notebook error: {0}")]
    Notebook(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Runtime error types.

use mcp::ServerId;
use thiserror::Error;

/// Runtime errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The referenced tool server is unknown or already stopped.
    #[error("server not found: {0}")]
    ServerNotFound(ServerId),

    /// No binding exists for the capability.
    #[error("capability not bound: {0}")]
    NotBound(String),

    /// The inject queue is full or the daemon is gone.
    #[error("daemon not accepting commands")]
    InjectRejected,

    /// An error from the tool-server layer.
    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    /// An error from discovery or installation.
    #[error(transparent)]
    Acquire(#[from] acquire::Error),

    /// An error from the event journal.
    #[error(transparent)]
    Journal(#[from] storage::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

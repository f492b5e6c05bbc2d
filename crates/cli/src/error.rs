//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("journal not found at {path}. Run 'quartermaster run' first")]
    JournalNotFound { path: PathBuf },

    #[error("unknown priority '{0}' (expected high, medium, or low)")]
    BadPriority(String),

    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Acquire(#[from] acquire::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

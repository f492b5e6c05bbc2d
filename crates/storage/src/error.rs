//! Journal error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    #[error("row decode failed: {0}")]
    Decode(String),
}

impl From<serde_rusqlite::Error> for Error {
    fn from(e: serde_rusqlite::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Transport and tool-server error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

/// The stage of the start sequence at which a server failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStage {
    Spawn,
    Init,
    List,
}

impl std::fmt::Display for StartStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartStage::Spawn => write!(f, "spawn"),
            StartStage::Init => write!(f, "init"),
            StartStage::List => write!(f, "list"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{stage} failed: {reason}")]
    StartFailed { stage: StartStage, reason: String },

    #[error("transport closed")]
    TransportClosed,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("server error: {0}")]
    Server(#[from] JsonRpcError),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("server is not ready (state: {0})")]
    NotReady(String),

    #[error("server is stopped")]
    Stopped,

    #[error("restart budget exhausted")]
    RestartExhausted,
}

impl Error {
    /// Stage tag for start-sequence failures, used by acquisition records.
    pub fn start_stage(&self) -> Option<StartStage> {
        match self {
            Error::Spawn(_) => Some(StartStage::Spawn),
            Error::StartFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

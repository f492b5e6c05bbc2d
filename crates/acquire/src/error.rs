//! Discovery and installation error types.

use thiserror::Error;

/// The installation stage at which a candidate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Prepare,
    Fetch,
    Verify,
}

impl std::fmt::Display for InstallStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstallStage::Prepare => "prepare",
            InstallStage::Fetch => "fetch",
            InstallStage::Verify => "verify",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// A single catalog query failed. Discovery logs and skips these.
    #[error("catalog '{catalog}' failed: {reason}")]
    CatalogFailed { catalog: String, reason: String },

    #[error("install {stage} failed: {reason}")]
    Install { stage: InstallStage, reason: String },
}

impl Error {
    pub fn install(stage: InstallStage, reason: impl Into<String>) -> Self {
        Error::Install {
            stage,
            reason: reason.into(),
        }
    }

    pub fn install_stage(&self) -> Option<InstallStage> {
        match self {
            Error::Install { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

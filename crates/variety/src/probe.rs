//! Collaborator interface for sub-system capability counts.

use thiserror::Error;

use crate::snapshot::{Subsystem, SystemSnapshot};

#[derive(Debug, Error)]
pub enum Error {
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Supplies the capability count for each control-hierarchy sub-system.
///
/// An unavailable collaborator is not fatal: its sub-system contributes
/// zero to the snapshot.
pub trait SubsystemProbe: Send + Sync {
    fn capability_count(&self, subsystem: Subsystem) -> Result<u32>;
}

/// Assemble a snapshot, degrading unavailable sub-systems to zero.
pub fn snapshot_from(probe: &dyn SubsystemProbe) -> SystemSnapshot {
    let mut snapshot = SystemSnapshot::default();
    for subsystem in Subsystem::ALL {
        let count = probe.capability_count(subsystem).unwrap_or(0);
        snapshot.set(subsystem, count);
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyProbe;

    impl SubsystemProbe for FlakyProbe {
        fn capability_count(&self, subsystem: Subsystem) -> Result<u32> {
            match subsystem {
                Subsystem::Operations => Ok(9),
                Subsystem::Intelligence => {
                    Err(Error::CollaboratorUnavailable("intel offline".into()))
                }
                _ => Ok(1),
            }
        }
    }

    #[test]
    fn unavailable_subsystems_degrade_to_zero() {
        let snapshot = snapshot_from(&FlakyProbe);
        assert_eq!(snapshot.operations, 9);
        assert_eq!(snapshot.intelligence, 0);
        assert_eq!(snapshot.coordination, 1);
    }
}

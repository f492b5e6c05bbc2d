//! Capability discovery and installation.
//!
//! Given capability descriptors, [`Discovery`] produces ranked
//! [`Candidate`]s from one or more package catalogs; [`Installer`]
//! materializes a candidate on disk and yields the [`RunSpec`] a
//! tool-server process is spawned from.

mod candidate;
mod catalog;
mod discovery;
mod error;
mod installer;

pub use candidate::{Candidate, CatalogEntry, Source};
pub use catalog::{Catalog, HttpCatalog};
pub use discovery::{Discovery, DiscoveryConfig};
pub use error::{Error, InstallStage, Result};
pub use installer::{CommandFetcher, Fetcher, Installation, Installer, RunSpec};

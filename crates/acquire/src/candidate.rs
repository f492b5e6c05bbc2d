//! Discovered-package types shared by catalogs, discovery, and the
//! installer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a candidate package comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Registry,
    Git,
    Local,
}

/// A discovered package that might supply one or more capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub version: String,
    pub source: Source,
    pub install_command: String,
    pub capabilities: BTreeSet<String>,
    pub relevance_score: f64,
    pub quality_score: f64,
}

impl Candidate {
    /// `name@version`, the identity installs are keyed by.
    pub fn coordinate(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Combined ordering key: relevance × quality, best first.
    pub fn rank_score(&self) -> f64 {
        self.relevance_score * self.quality_score
    }
}

/// One raw entry as returned by a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Normalized 0..1.
    #[serde(default)]
    pub popularity: f64,
    pub last_updated: DateTime<Utc>,
}

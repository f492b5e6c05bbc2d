//! Package catalogs.
//!
//! The built-in client speaks the npm-style search endpoint
//! (`GET {base}/-/v1/search?text=…`), but anything returning
//! name/version/description/keywords/popularity/last-updated entries can
//! implement [`Catalog`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::candidate::CatalogEntry;
use crate::error::{Error, Result};

/// A searchable package catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    fn name(&self) -> &str;

    /// Search for packages matching `term`. A failure is reported per
    /// catalog; discovery treats it as an empty contribution.
    async fn search(&self, term: &str) -> Result<Vec<CatalogEntry>>;
}

/// HTTP+JSON catalog client for npm-style registries.
pub struct HttpCatalog {
    name: String,
    base_url: String,
    client: reqwest::Client,
    page_size: usize,
}

impl HttpCatalog {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::CatalogFailed {
                catalog: name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            name,
            base_url: base_url.into(),
            client,
            page_size: 25,
        })
    }

    fn fail(&self, reason: impl std::fmt::Display) -> Error {
        Error::CatalogFailed {
            catalog: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, term: &str) -> Result<Vec<CatalogEntry>> {
        let url = format!("{}/-/v1/search", self.base_url.trim_end_matches('/'));
        let size = self.page_size.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("text", term), ("size", size.as_str())])
            .send()
            .await
            .map_err(|e| self.fail(e))?
            .error_for_status()
            .map_err(|e| self.fail(e))?;

        let body: SearchResponse = response.json().await.map_err(|e| self.fail(e))?;
        Ok(body
            .objects
            .into_iter()
            .filter_map(SearchObject::into_entry)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    objects: Vec<SearchObject>,
}

#[derive(Debug, Deserialize)]
struct SearchObject {
    package: PackageMeta,
    #[serde(default)]
    score: Score,
}

impl SearchObject {
    fn into_entry(self) -> Option<CatalogEntry> {
        Some(CatalogEntry {
            name: self.package.name,
            version: self.package.version,
            description: self.package.description,
            keywords: self.package.keywords,
            popularity: self.score.detail.popularity.clamp(0.0, 1.0),
            last_updated: self.package.date?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PackageMeta {
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct Score {
    #[serde(default)]
    detail: ScoreDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ScoreDetail {
    #[serde(default)]
    popularity: f64,
}

//! Candidate discovery: query catalogs, filter, score, rank, cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use variety::CapabilityDescriptor;

use crate::candidate::{Candidate, CatalogEntry, Source};
use crate::catalog::Catalog;

/// Discovery tuning. The `marker` keeps only entries that look like tool
/// servers; the alias table widens a descriptor kind into known package
/// families.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub marker: String,
    pub official_prefix: String,
    pub aliases: HashMap<String, Vec<String>>,
    pub cache_ttl: Duration,
    pub max_concurrent_queries: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert(
            "operational_capabilities".to_string(),
            vec!["server-filesystem".to_string(), "server-everything".to_string()],
        );
        aliases.insert(
            "environmental_sensing".to_string(),
            vec!["server-brave-search".to_string(), "server-fetch".to_string()],
        );
        aliases.insert(
            "adaptive_control".to_string(),
            vec!["server-sequential-thinking".to_string()],
        );
        aliases.insert(
            "coordination_patterns".to_string(),
            vec!["server-slack".to_string()],
        );
        Self {
            marker: "mcp".to_string(),
            official_prefix: "@modelcontextprotocol/".to_string(),
            aliases,
            cache_ttl: Duration::from_secs(300),
            max_concurrent_queries: 8,
        }
    }
}

struct CacheEntry {
    expires_at: Instant,
    candidates: Vec<Candidate>,
}

/// Ranked candidate discovery over one or more catalogs, with a TTL cache
/// keyed by the normalized descriptor set.
pub struct Discovery {
    catalogs: Vec<Arc<dyn Catalog>>,
    config: DiscoveryConfig,
    cache: DashMap<String, CacheEntry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl Discovery {
    pub fn new(catalogs: Vec<Arc<dyn Catalog>>, config: DiscoveryConfig) -> Self {
        Self {
            catalogs,
            config,
            cache: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Ranked candidates for the descriptor set, best first.
    ///
    /// Never fails: catalog errors are logged and skipped, and total
    /// failure yields an empty list for the caller to police.
    pub async fn discover(&self, descriptors: &[CapabilityDescriptor]) -> Vec<Candidate> {
        if descriptors.is_empty() || self.catalogs.is_empty() {
            return Vec::new();
        }

        let key = cache_key(descriptors);
        if let Some(hit) = self.cached(&key) {
            debug!(key, "discovery cache hit");
            return hit;
        }

        // Concurrent misses for the same key coalesce onto one upstream
        // sweep: late arrivals block here, then land on the fresh entry.
        let gate = {
            let entry = self
                .inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            entry.value().clone()
        };
        let _held = gate.lock().await;
        if let Some(hit) = self.cached(&key) {
            return hit;
        }

        let candidates = self.sweep(descriptors).await;
        self.cache.insert(
            key.clone(),
            CacheEntry {
                expires_at: Instant::now() + self.config.cache_ttl,
                candidates: candidates.clone(),
            },
        );
        self.inflight.remove(&key);
        candidates
    }

    fn cached(&self, key: &str) -> Option<Vec<Candidate>> {
        if let Some(entry) = self.cache.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.candidates.clone());
            }
        }
        // Expired entries are purged lazily.
        self.cache
            .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        None
    }

    async fn sweep(&self, descriptors: &[CapabilityDescriptor]) -> Vec<Candidate> {
        let terms = self.query_terms(descriptors);
        let queries: Vec<(Arc<dyn Catalog>, String)> = self
            .catalogs
            .iter()
            .flat_map(|catalog| terms.iter().map(move |t| (catalog.clone(), t.clone())))
            .collect();

        async fn query_one(catalog: Arc<dyn Catalog>, term: String) -> Vec<CatalogEntry> {
            match catalog.search(&term).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(catalog = catalog.name(), term, "catalog query failed: {e}");
                    Vec::new()
                }
            }
        }

        let futs: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = Vec<CatalogEntry>> + Send>>> =
            queries
                .into_iter()
                .map(|(catalog, term)| {
                    Box::pin(query_one(catalog, term))
                        as std::pin::Pin<Box<dyn std::future::Future<Output = Vec<CatalogEntry>> + Send>>
                })
                .collect();

        let batches: Vec<Vec<CatalogEntry>> = futures::stream::iter(futs)
            .buffer_unordered(self.config.max_concurrent_queries)
            .collect()
            .await;

        let now = Utc::now();
        let mut best: HashMap<String, Candidate> = HashMap::new();
        for entry in batches.into_iter().flatten() {
            if !matches_marker(&entry, &self.config.marker) {
                continue;
            }
            let candidate = self.score(entry, descriptors, now);
            match best.get(&candidate.name) {
                Some(seen) if seen.rank_score() >= candidate.rank_score() => {}
                _ => {
                    best.insert(candidate.name.clone(), candidate);
                }
            }
        }

        let mut ranked: Vec<Candidate> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.rank_score()
                .partial_cmp(&a.rank_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        ranked
    }

    fn query_terms(&self, descriptors: &[CapabilityDescriptor]) -> BTreeSet<String> {
        let mut terms = BTreeSet::new();
        for descriptor in descriptors {
            terms.extend(descriptor.search_terms.iter().cloned());
            if let Some(extra) = self.config.aliases.get(&descriptor.kind) {
                terms.extend(extra.iter().cloned());
            }
        }
        terms
    }

    fn score(
        &self,
        entry: CatalogEntry,
        descriptors: &[CapabilityDescriptor],
        now: DateTime<Utc>,
    ) -> Candidate {
        let keywords = derived_keywords(&entry);
        let best_jaccard = descriptors
            .iter()
            .map(|d| jaccard(&d.search_terms, &keywords))
            .fold(0.0, f64::max);
        let relevance = (best_jaccard
            * (0.5 + 0.5 * entry.popularity.clamp(0.0, 1.0))
            * recency_weight(entry.last_updated, now))
        .clamp(0.0, 1.0);
        let quality = quality_score(&entry, now, &self.config.official_prefix);

        Candidate {
            install_command: format!("npm install {}@{}", entry.name, entry.version),
            name: entry.name,
            version: entry.version,
            source: Source::Registry,
            capabilities: keywords,
            relevance_score: relevance,
            quality_score: quality,
        }
    }
}

fn cache_key(descriptors: &[CapabilityDescriptor]) -> String {
    // Normalized: kinds and terms are sorted, so equal sets key equally.
    let mut parts: BTreeSet<String> = BTreeSet::new();
    for d in descriptors {
        let terms: Vec<&str> = d.search_terms.iter().map(String::as_str).collect();
        parts.insert(format!("{}:{}", d.kind, terms.join("+")));
    }
    parts.into_iter().collect::<Vec<_>>().join("|")
}

fn matches_marker(entry: &CatalogEntry, marker: &str) -> bool {
    let marker = marker.to_lowercase();
    entry.name.to_lowercase().contains(&marker)
        || entry.description.to_lowercase().contains(&marker)
        || entry
            .keywords
            .iter()
            .any(|k| k.to_lowercase().contains(&marker))
}

/// Keywords plus name tokens, lowercased.
fn derived_keywords(entry: &CatalogEntry) -> BTreeSet<String> {
    let mut keywords: BTreeSet<String> = entry
        .keywords
        .iter()
        .map(|k| k.to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    keywords.extend(
        entry
            .name
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(str::to_string),
    );
    keywords
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Exponential decay with a one-year half-life.
fn recency_weight(last_updated: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let days = (now - last_updated).num_days().max(0) as f64;
    0.5_f64.powf(days / 365.0)
}

/// Bounded sum of quality indicators.
fn quality_score(entry: &CatalogEntry, now: DateTime<Utc>, official_prefix: &str) -> f64 {
    let mut quality: f64 = 0.1;
    if !official_prefix.is_empty() && entry.name.starts_with(official_prefix) {
        quality += 0.4;
    }
    if (now - entry.last_updated).num_days() <= 180 {
        quality += 0.3;
    }
    if entry.popularity >= 0.5 {
        quality += 0.2;
    }
    quality.min(1.0)
}

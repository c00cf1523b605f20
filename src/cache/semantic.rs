use crate::config::CacheConfig;
use crate::utils::{lock_or_recover, preview};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Term-frequency vector over lower-cased alphanumeric tokens.
#[derive(Debug, Clone, Default)]
struct BagOfWords {
    counts: HashMap<String, f64>,
    norm: f64,
}

impl BagOfWords {
    fn new(text: &str) -> Self {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            *counts.entry(token.to_lowercase()).or_default() += 1.0;
        }
        let norm = counts.values().map(|v| v * v).sum::<f64>().sqrt();
        Self { counts, norm }
    }

    fn cosine(&self, other: &BagOfWords) -> f64 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let (small, large) = if self.counts.len() <= other.counts.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f64 = small
            .counts
            .iter()
            .filter_map(|(t, a)| large.counts.get(t).map(|b| a * b))
            .sum();
        dot / (self.norm * other.norm)
    }
}

fn query_key(query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    query: String,
    result: String,
    words: BagOfWords,
    created_at: DateTime<Utc>,
    ttl: Duration,
    access_count: u64,
    last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > self.ttl
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarHit {
    pub query: String,
    pub result: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticCacheStats {
    pub cached_queries: usize,
    pub max_capacity: usize,
    pub utilization_pct: f64,
    pub total_accesses: u64,
    pub avg_query_age_seconds: i64,
    pub similarity_threshold: f64,
}

/// Response cache keyed by query meaning.
///
/// Exact repeats hit by SHA-256 of the query text; otherwise the closest
/// cached query by bag-of-words cosine similarity is returned when it clears
/// the threshold. Entries expire after their TTL; at capacity the least
/// recently used entry is evicted.
pub struct SemanticCache {
    max_entries: usize,
    similarity_threshold: f64,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SemanticCache {
    pub fn new(max_entries: usize, similarity_threshold: f64, default_ttl: Duration) -> Self {
        info!(
            max_entries,
            similarity_threshold, "semantic cache initialized"
        );
        Self {
            max_entries: max_entries.max(1),
            similarity_threshold,
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(
            cfg.max_entries,
            cfg.similarity_threshold,
            Duration::minutes(cfg.ttl_minutes),
        )
    }

    pub fn set(&self, query: &str, result: &str) {
        self.set_at(query, result, self.default_ttl, Utc::now());
    }

    pub fn set_at(&self, query: &str, result: &str, ttl: Duration, now: DateTime<Utc>) {
        let key = query_key(query);
        let mut entries = lock_or_recover(&self.entries);
        if !entries.contains_key(&key)
            && entries.len() >= self.max_entries
            && let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
        {
            entries.remove(&oldest);
            debug!("evicted least recently used cache entry");
        }
        entries.insert(
            key,
            CacheEntry {
                query: query.to_string(),
                result: result.to_string(),
                words: BagOfWords::new(query),
                created_at: now,
                ttl,
                access_count: 0,
                last_accessed: now,
            },
        );
        debug!(
            query = %preview(query, 50),
            size = entries.len(),
            max = self.max_entries,
            "cached query"
        );
    }

    /// Exact lookup.
    pub fn get(&self, query: &str) -> Option<String> {
        self.get_at(query, Utc::now())
    }

    pub fn get_at(&self, query: &str, now: DateTime<Utc>) -> Option<String> {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries.get_mut(&query_key(query))?;
        if entry.is_expired(now) {
            return None;
        }
        entry.access_count += 1;
        entry.last_accessed = now;
        debug!(query = %preview(query, 50), "cache hit (exact)");
        Some(entry.result.clone())
    }

    /// Live entries at or above the similarity threshold, best first.
    pub fn find_similar(&self, query: &str, limit: usize) -> Vec<SimilarHit> {
        self.find_similar_at(query, limit, Utc::now())
    }

    pub fn find_similar_at(&self, query: &str, limit: usize, now: DateTime<Utc>) -> Vec<SimilarHit> {
        let probe = BagOfWords::new(query);
        let mut entries = lock_or_recover(&self.entries);
        let mut scored: Vec<(String, f64)> = entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.clone(), probe.cosine(&e.words)))
            .filter(|(_, s)| *s >= self.similarity_threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);

        let hits: Vec<SimilarHit> = scored
            .into_iter()
            .filter_map(|(key, similarity)| {
                let entry = entries.get_mut(&key)?;
                entry.access_count += 1;
                entry.last_accessed = now;
                Some(SimilarHit {
                    query: entry.query.clone(),
                    result: entry.result.clone(),
                    similarity,
                })
            })
            .collect();
        if let Some(best) = hits.first() {
            info!(
                query = %preview(query, 50),
                similarity = best.similarity,
                "cache semantic match"
            );
        }
        hits
    }

    /// Exact match first, then the best semantic match. The score is 1.0 for
    /// exact hits.
    pub fn get_or_similar(&self, query: &str) -> Option<(String, f64)> {
        self.get_or_similar_at(query, Utc::now())
    }

    pub fn get_or_similar_at(&self, query: &str, now: DateTime<Utc>) -> Option<(String, f64)> {
        if let Some(exact) = self.get_at(query, now) {
            return Some((exact, 1.0));
        }
        self.find_similar_at(query, 1, now)
            .into_iter()
            .next()
            .map(|hit| (hit.result, hit.similarity))
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = lock_or_recover(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_or_recover(&self.entries).clear();
        info!("semantic cache cleared");
    }

    pub fn stats(&self) -> SemanticCacheStats {
        let now = Utc::now();
        let entries = lock_or_recover(&self.entries);
        let count = entries.len();
        let total_age: i64 = entries
            .values()
            .map(|e| (now - e.created_at).num_seconds())
            .sum();
        SemanticCacheStats {
            cached_queries: count,
            max_capacity: self.max_entries,
            utilization_pct: count as f64 / self.max_entries as f64 * 100.0,
            total_accesses: entries.values().map(|e| e.access_count).sum(),
            avg_query_age_seconds: total_age / count.max(1) as i64,
            similarity_threshold: self.similarity_threshold,
        }
    }
}

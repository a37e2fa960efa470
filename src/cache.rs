//! Semantic cache
//!
//! Content-fingerprint keyed cache in front of the inference provider. A hit
//! lets a stage skip the provider call and complete from the stored findings.

use crate::models::Stage;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Compute the SHA256 fingerprint of a stage's accumulated input.
/// Streams JSON directly into the hasher.
pub fn fingerprint<T: Serialize>(stage: Stage, input: &T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_str().as_bytes());
    hasher.update([0u8]);

    if serde_json::to_writer(&mut HashWriter(&mut hasher), input).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub job_id: Uuid,
    pub stage: Stage,
    pub context_hash: String,
}

impl CacheKey {
    pub fn new(job_id: Uuid, stage: Stage, context_hash: impl Into<String>) -> Self {
        Self {
            job_id,
            stage,
            context_hash: context_hash.into(),
        }
    }
}

struct CachedEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct SemanticCache {
    entries: Arc<RwLock<HashMap<CacheKey, CachedEntry>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SemanticCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        let entries = self.entries.read().await;
        let hit = entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone());

        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %key.job_id, stage = %key.stage, "Semantic cache hit");
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write-through after a genuine (non-cached) completion
    pub async fn put(&self, key: CacheKey, value: Value) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CachedEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every entry belonging to `job_id`
    pub async fn invalidate_job(&self, job_id: Uuid) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| key.job_id != job_id);
        before - entries.len()
    }

    /// Remove entries past their lifetime; returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().await.len(),
        }
    }
}

impl Default for SemanticCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_stable_and_stage_scoped() {
        let input = json!({"documents": [{"name": "a", "text": "CFOP 5102"}]});
        let a = fingerprint(Stage::Extraction, &input);
        let b = fingerprint(Stage::Extraction, &input);
        let c = fingerprint(Stage::Classification, &input);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint(Stage::Extraction, &json!({"documents": []})));
    }

    #[tokio::test]
    async fn test_get_put_and_stats() {
        let cache = SemanticCache::default();
        let key = CacheKey::new(Uuid::new_v4(), Stage::Analysis, "h1");

        assert!(cache.get(&key).await.is_none());
        cache.put(key.clone(), json!({"report": "ok"})).await;
        assert_eq!(cache.get(&key).await, Some(json!({"report": "ok"})));

        // same hash, different job: distinct entry
        let other = CacheKey::new(Uuid::new_v4(), Stage::Analysis, "h1");
        assert!(cache.get(&other).await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats, CacheStats { hits: 1, misses: 2, entries: 1 });
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = SemanticCache::new(Duration::from_millis(10));
        let key = CacheKey::new(Uuid::new_v4(), Stage::Extraction, "h");
        cache.put(key.clone(), json!(1)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key).await.is_none());

        // expired but still held until purged
        assert_eq!(cache.stats().await.entries, 1);
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_invalidate_job() {
        let cache = SemanticCache::default();
        let job = Uuid::new_v4();
        cache.put(CacheKey::new(job, Stage::Extraction, "a"), json!(1)).await;
        cache.put(CacheKey::new(job, Stage::Analysis, "b"), json!(2)).await;
        cache.put(CacheKey::new(Uuid::new_v4(), Stage::Analysis, "b"), json!(3)).await;

        assert_eq!(cache.invalidate_job(job).await, 2);
        assert_eq!(cache.stats().await.entries, 1);
    }
}

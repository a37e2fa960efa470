//! Content index scoped by job id
//!
//! The indexing stage writes document and report chunks here; retrieval is
//! for whatever sits downstream of the pipeline.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_CHUNK_CHARS: usize = 800;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentChunk {
    /// Document name, or `report` for the analysis summary
    pub source: String,
    pub ordinal: usize,
    pub text: String,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store chunks for `job_id`; returns how many were stored.
    async fn upsert(&self, job_id: Uuid, chunks: Vec<ContentChunk>) -> Result<usize>;

    async fn query(&self, job_id: Uuid, text: &str, limit: usize) -> Result<Vec<ContentChunk>>;
}

/// Split `text` into chunks of at most `max_chars` characters on whitespace
/// boundaries. A single word longer than `max_chars` becomes its own chunk.
pub fn chunk_text(source: &str, text: &str, max_chars: usize) -> Vec<ContentChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };

        if needed > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| ContentChunk {
            source: source.to_string(),
            ordinal,
            text,
        })
        .collect()
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// In-memory index ranking chunks by term overlap
#[derive(Default)]
pub struct InMemoryVectorIndex {
    chunks: Arc<RwLock<HashMap<Uuid, Vec<ContentChunk>>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, job_id: Uuid) -> usize {
        self.chunks.read().await.get(&job_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, job_id: Uuid, chunks: Vec<ContentChunk>) -> Result<usize> {
        let stored = chunks.len();
        let mut index = self.chunks.write().await;
        let entries = index.entry(job_id).or_default();

        for chunk in chunks {
            match entries
                .iter_mut()
                .find(|c| c.source == chunk.source && c.ordinal == chunk.ordinal)
            {
                Some(existing) => *existing = chunk,
                None => entries.push(chunk),
            }
        }
        Ok(stored)
    }

    async fn query(&self, job_id: Uuid, text: &str, limit: usize) -> Result<Vec<ContentChunk>> {
        let wanted = terms(text);
        let index = self.chunks.read().await;
        let Some(entries) = index.get(&job_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(usize, &ContentChunk)> = entries
            .iter()
            .map(|chunk| (terms(&chunk.text).intersection(&wanted).count(), chunk))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }
}

//! Job store
//!
//! Durable, expiring record of job state. The only shared mutable resource in
//! the pipeline: every mutation is a field-level read-modify-write under the
//! store's lock, never a whole-record overwrite by the caller.
//! In-memory by default; `postgres::PostgresJobStore` for durable deployments.

pub mod postgres;

use crate::models::{Job, JobMetadata, JobStatus, PipelineStep, StepStatus, StepUpdate};
use crate::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub use postgres::PostgresJobStore;

/// Trait for job persistence
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Create a processing job with the given pipeline.
    async fn create(
        &self,
        id: Uuid,
        pipeline: Vec<PipelineStep>,
        metadata: JobMetadata,
    ) -> Result<Job>;

    /// Unknown or expired ids are `Ok(None)`.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Add or overwrite only the given keys of `result`. Returns false when
    /// the job does not exist.
    async fn merge_result(&self, id: Uuid, partial: Map<String, Value>) -> Result<bool>;

    async fn update_step(
        &self,
        id: Uuid,
        index: usize,
        status: StepStatus,
        info: Option<String>,
    ) -> Result<StepUpdate>;

    /// Move the job to a terminal status. A terminal job never changes
    /// status again; returns whether this call did the transition.
    async fn finish(&self, id: Uuid, status: JobStatus, error: Option<String>) -> Result<bool>;

    async fn set_context_hash(&self, id: Uuid, hash: String) -> Result<bool>;

    /// Reset the retention window of a job to `ttl` from now.
    async fn expire(&self, id: Uuid, ttl: Duration) -> Result<bool>;

    /// Drop every expired record; returns how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

struct StoredJob {
    job: Job,
    expires_at: Instant,
}

impl StoredJob {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory job store
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, StoredJob>>>,
    ttl: Duration,
}

impl InMemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Run `f` against a live job under the write lock. Expired records are
    /// evicted and treated as missing.
    async fn with_live_job<T>(&self, id: Uuid, f: impl FnOnce(&mut Job) -> T) -> Option<T> {
        let mut jobs = self.jobs.write().await;
        let now = Instant::now();

        match jobs.get_mut(&id) {
            Some(stored) if stored.is_live(now) => Some(f(&mut stored.job)),
            Some(_) => {
                jobs.remove(&id);
                debug!(job_id = %id, "Evicted expired job");
                None
            }
            None => None,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(
        &self,
        id: Uuid,
        pipeline: Vec<PipelineStep>,
        metadata: JobMetadata,
    ) -> Result<Job> {
        let job = Job::new(id, pipeline, metadata);
        let mut jobs = self.jobs.write().await;
        jobs.insert(
            id,
            StoredJob {
                job: job.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let jobs = self.jobs.read().await;
        let now = Instant::now();
        Ok(jobs
            .get(&id)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.job.clone()))
    }

    async fn merge_result(&self, id: Uuid, partial: Map<String, Value>) -> Result<bool> {
        Ok(self
            .with_live_job(id, |job| job.merge_result(partial))
            .await
            .is_some())
    }

    async fn update_step(
        &self,
        id: Uuid,
        index: usize,
        status: StepStatus,
        info: Option<String>,
    ) -> Result<StepUpdate> {
        Ok(self
            .with_live_job(id, |job| {
                if job.is_terminal() && status == StepStatus::InProgress {
                    return StepUpdate::Rejected;
                }
                job.transition_step(index, status, info)
            })
            .await
            .unwrap_or(StepUpdate::NotFound))
    }

    async fn finish(&self, id: Uuid, status: JobStatus, error: Option<String>) -> Result<bool> {
        Ok(self
            .with_live_job(id, |job| {
                if job.is_terminal() || status == JobStatus::Processing {
                    return false;
                }
                job.status = status;
                job.error = error;
                job.metadata.updated_at = chrono::Utc::now();
                true
            })
            .await
            .unwrap_or(false))
    }

    async fn set_context_hash(&self, id: Uuid, hash: String) -> Result<bool> {
        Ok(self
            .with_live_job(id, |job| job.metadata.context_hash = Some(hash))
            .await
            .is_some())
    }

    async fn expire(&self, id: Uuid, ttl: Duration) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let now = Instant::now();
        match jobs.get_mut(&id) {
            Some(stored) if stored.is_live(now) => {
                stored.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut jobs = self.jobs.write().await;
        let now = Instant::now();
        let before = jobs.len();
        jobs.retain(|_, stored| stored.is_live(now));
        Ok(before - jobs.len())
    }
}

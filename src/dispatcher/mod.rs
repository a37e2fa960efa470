//! Pipeline dispatcher
//!
//! Sequences the stages of each job. Exactly one step is in progress at a
//! time; the next stage starts only after the current one emitted its
//! terminal event. Events naming a stage that is not the job's current stage
//! are ignored, which absorbs duplicate and out-of-order deliveries.

use crate::cache::fingerprint;
use crate::error::PipelineError;
use crate::events::{Event, EventBus, EventHandler, TaskCompleted, TaskFailed, TaskStart};
use crate::models::{default_pipeline, FiscalDocument, Job, JobMetadata, JobStatus, Stage, StepStatus, StepUpdate};
use crate::payload::{ExecutiveReport, PipelinePayload};
use crate::state::JobStore;
use crate::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const EXECUTIVE_REPORT_KEY: &str = "executiveReport";

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    bus: EventBus,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Create a job for `documents` and start its first stage.
    pub async fn start_job(&self, documents: Vec<FiscalDocument>) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        self.store
            .create(job_id, default_pipeline(), JobMetadata::new(documents.len()))
            .await?;

        info!(job_id = %job_id, documents = documents.len(), "Job created");

        self.start_stage(job_id, Stage::Extraction, PipelinePayload::new(documents))
            .await?;
        Ok(job_id)
    }

    /// Move `stage` to in-progress and announce it. Only the caller whose
    /// transition is applied publishes `task:start`.
    async fn start_stage(&self, job_id: Uuid, stage: Stage, payload: PipelinePayload) -> Result<bool> {
        match self
            .store
            .update_step(job_id, stage.index(), StepStatus::InProgress, None)
            .await?
        {
            StepUpdate::Applied => {}
            update => {
                debug!(job_id = %job_id, stage = %stage, ?update, "Stage already started or not startable");
                return Ok(false);
            }
        }

        self.store
            .set_context_hash(job_id, fingerprint(stage, &payload))
            .await?;

        info!(job_id = %job_id, stage = %stage, "Dispatching stage");

        self.bus
            .publish(Event::TaskStart(TaskStart {
                job_id,
                task_name: stage,
                payload,
            }))
            .await;
        Ok(true)
    }

    async fn live_job(&self, job_id: Uuid, stage: Stage) -> Result<Option<Job>> {
        match self.store.get(job_id).await? {
            Some(job) if !job.is_terminal() => Ok(Some(job)),
            Some(_) => {
                warn!(job_id = %job_id, stage = %stage, "Ignoring event for finished job");
                Ok(None)
            }
            None => {
                warn!(job_id = %job_id, stage = %stage, "Ignoring event for unknown or expired job");
                Ok(None)
            }
        }
    }

    /// Make sure the step of `stage` ends in `status`. The stage's own write
    /// normally did this already; an in-progress step is settled here.
    async fn settle_step(
        &self,
        job: &Job,
        stage: Stage,
        status: StepStatus,
        info: Option<String>,
    ) -> Result<bool> {
        let Some(step) = job.pipeline.get(stage.index()) else {
            return Ok(false);
        };

        if step.status == status {
            return Ok(true);
        }
        if step.status != StepStatus::InProgress {
            return Ok(false);
        }

        let update = self
            .store
            .update_step(job.id, stage.index(), status, info)
            .await?;
        Ok(matches!(update, StepUpdate::Applied | StepUpdate::Unchanged))
    }

    async fn on_completed(&self, msg: TaskCompleted) -> Result<()> {
        let stage = msg.task_name;
        let Some(job) = self.live_job(msg.job_id, stage).await? else {
            return Ok(());
        };

        let next = Stage::ALL.get(stage.index() + 1).copied();
        let next_pending = next
            .and_then(|n| job.pipeline.get(n.index()))
            .map(|step| step.status == StepStatus::Pending)
            .unwrap_or(true);

        let step_started = job
            .pipeline
            .get(stage.index())
            .map(|step| matches!(step.status, StepStatus::InProgress | StepStatus::Completed))
            .unwrap_or(false);

        if !next_pending || !step_started {
            warn!(job_id = %job.id, stage = %stage, "Ignoring stale task:completed");
            return Ok(());
        }

        // the last stage only completes if the report can be built from its payload
        let report = match next {
            Some(_) => None,
            None => match ExecutiveReport::from_payload(&msg.payload) {
                Ok(report) => Some(report),
                Err(e) => return self.fail_final_stage(&job, stage, e).await,
            },
        };

        if !self.settle_step(&job, stage, StepStatus::Completed, None).await? {
            warn!(job_id = %job.id, stage = %stage, "Ignoring stale task:completed");
            return Ok(());
        }

        let mut partial = Map::new();
        partial.insert(stage.as_str().to_string(), msg.result_payload);
        self.store.merge_result(job.id, partial).await?;

        match (next, report) {
            (Some(next), _) => {
                self.start_stage(job.id, next, msg.payload).await?;
            }
            (None, Some(report)) => self.finish_job(job.id, report).await?,
            (None, None) => {}
        }
        Ok(())
    }

    async fn fail_final_stage(&self, job: &Job, stage: Stage, e: PipelineError) -> Result<()> {
        let message = format!("Executive report could not be assembled: {}", e);
        error!(job_id = %job.id, stage = %stage, error = %e, "Executive report could not be assembled");

        if !self
            .settle_step(job, stage, StepStatus::Failed, Some(message.clone()))
            .await?
        {
            warn!(job_id = %job.id, stage = %stage, "Final step already settled, failing job only");
        }
        self.store
            .finish(job.id, JobStatus::Failed, Some(message))
            .await?;
        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, report: ExecutiveReport) -> Result<()> {
        let mut partial = Map::new();
        partial.insert(
            EXECUTIVE_REPORT_KEY.to_string(),
            serde_json::to_value(&report)?,
        );
        self.store.merge_result(job_id, partial).await?;

        if self.store.finish(job_id, JobStatus::Completed, None).await? {
            info!(job_id = %job_id, "Job completed");
        }
        Ok(())
    }

    async fn on_failed(&self, msg: TaskFailed) -> Result<()> {
        let stage = msg.task_name;
        let Some(job) = self.live_job(msg.job_id, stage).await? else {
            return Ok(());
        };

        if !self.settle_step(&job, stage, StepStatus::Failed, None).await? {
            warn!(job_id = %job.id, stage = %stage, "Ignoring stale task:failed");
            return Ok(());
        }

        if self
            .store
            .finish(job.id, JobStatus::Failed, Some(msg.error.clone()))
            .await?
        {
            error!(job_id = %job.id, stage = %stage, error = %msg.error, "Job failed");
        }
        Ok(())
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }
}

#[async_trait::async_trait]
impl EventHandler for Dispatcher {
    fn label(&self) -> &str {
        "dispatcher"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::TaskCompleted(msg) => self.on_completed(msg).await,
            Event::TaskFailed(msg) => self.on_failed(msg).await,
            _ => Ok(()),
        }
    }
}

/// Stage findings as stored in the job result, keyed by stage name
pub fn stage_result(job: &Job, stage: Stage) -> Option<&Value> {
    job.result.as_ref()?.get(stage.as_str())
}

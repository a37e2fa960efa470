//! Tool-call bridge
//!
//! Lets a stage suspend on a provider-requested tool call and resume when the
//! result arrives. Suspension is an explicit record keyed by (job, stage)
//! moving `AwaitingTool -> Resumed`; the transition is taken by exactly one
//! caller, so a duplicate completion can never resume a stage twice. A job
//! has at most one call awaiting a tool at any time.

use crate::error::PipelineError;
use crate::models::{Stage, ToolCall, ToolResult};
use crate::payload::PipelinePayload;
use crate::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything the stage needs to continue after the tool returns
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedContext {
    pub prompt: String,
    pub payload: PipelinePayload,
    pub context_hash: String,
    /// Results from earlier round trips of the same stage
    pub tool_results: Vec<ToolResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    AwaitingTool,
    Resumed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub job_id: Uuid,
    pub stage: Stage,
    pub call: ToolCall,
    pub context: CapturedContext,
    /// 1-based count of suspensions for this (job, stage)
    pub round_trip: u32,
    pub state: PendingState,
}

pub struct ToolBridge {
    pending: RwLock<HashMap<(Uuid, Stage), PendingToolCall>>,
    max_round_trips: u32,
}

impl ToolBridge {
    pub fn new(max_round_trips: u32) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            max_round_trips,
        }
    }

    pub fn max_round_trips(&self) -> u32 {
        self.max_round_trips
    }

    /// Record a suspension. Fails if any call of the job is already
    /// outstanding or if the stage's round-trip cap would be exceeded.
    /// Returns the round trip number.
    pub async fn suspend(
        &self,
        job_id: Uuid,
        stage: Stage,
        call: ToolCall,
        context: CapturedContext,
    ) -> Result<u32> {
        let mut pending = self.pending.write().await;
        let key = (job_id, stage);

        if let Some(existing) = pending
            .values()
            .find(|p| p.job_id == job_id && p.state == PendingState::AwaitingTool)
        {
            return Err(PipelineError::InvalidTransition(format!(
                "job {} already awaits tool '{}' for stage '{}'",
                job_id, existing.call.name, existing.stage
            )));
        }

        let previous = pending.get(&key).map(|p| p.round_trip).unwrap_or(0);

        let round_trip = previous + 1;
        if round_trip > self.max_round_trips {
            pending.remove(&key);
            return Err(PipelineError::ToolInvocation(format!(
                "stage '{}' exceeded {} tool round trips",
                stage, self.max_round_trips
            )));
        }

        info!(
            job_id = %job_id,
            stage = %stage,
            tool = %call.name,
            round_trip,
            "Stage suspended on tool call"
        );

        pending.insert(
            key,
            PendingToolCall {
                job_id,
                stage,
                call,
                context,
                round_trip,
                state: PendingState::AwaitingTool,
            },
        );

        Ok(round_trip)
    }

    /// Take the `AwaitingTool -> Resumed` transition. Only the first caller
    /// gets the pending call back; later callers get `None`.
    pub async fn resume(&self, job_id: Uuid, stage: Stage) -> Option<PendingToolCall> {
        let mut pending = self.pending.write().await;
        let record = pending.get_mut(&(job_id, stage))?;

        if record.state != PendingState::AwaitingTool {
            debug!(job_id = %job_id, stage = %stage, "Ignoring duplicate tool completion");
            return None;
        }

        record.state = PendingState::Resumed;
        Some(record.clone())
    }

    pub async fn get(&self, job_id: Uuid, stage: Stage) -> Option<PendingToolCall> {
        self.pending.read().await.get(&(job_id, stage)).cloned()
    }

    /// Forget the stage's record once it has completed or failed.
    pub async fn release(&self, job_id: Uuid, stage: Stage) -> bool {
        self.pending.write().await.remove(&(job_id, stage)).is_some()
    }

    /// Forget every record of a job that no longer exists.
    pub async fn release_job(&self, job_id: Uuid) -> usize {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|(job, _), _| *job != job_id);
        before - pending.len()
    }
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::new(3)
    }
}

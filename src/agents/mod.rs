//! Agent contract
//!
//! Each stage implements `StageAgent`; `AgentRunner` wraps it as an event
//! handler and owns the uniform plumbing:
//!
//! task:start -> BOUNDARY CHECK -> CACHE? -> EXECUTE -> (SUSPEND -> RESUME)* -> SETTLE
//!
//! Settling a stage is one Job Store write plus exactly one terminal event.

pub mod analysis;
pub mod audit;
pub mod classification;
pub mod extraction;
pub mod indexing;
pub mod validation;

pub use analysis::AnalysisAgent;
pub use audit::AuditAgent;
pub use classification::ClassificationAgent;
pub use extraction::ExtractionAgent;
pub use indexing::IndexingAgent;
pub use validation::ValidationAgent;

use crate::bridge::{CapturedContext, ToolBridge};
use crate::cache::{fingerprint, CacheKey, SemanticCache};
use crate::error::PipelineError;
use crate::events::{Event, EventBus, EventHandler, TaskCompleted, TaskFailed, TaskStart, ToolCompleted, ToolRun};
use crate::inference::{decode_structured, InferenceProvider, InferenceRequest, ProviderReply};
use crate::models::{Stage, StepStatus, StepUpdate, ToolCall, ToolResult};
use crate::payload::{PipelinePayload, StageFindings};
use crate::state::JobStore;
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a stage sees when it runs
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub payload: PipelinePayload,
    /// Fingerprint of `payload` for this stage
    pub context_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed {
        findings: StageFindings,
        /// Progress note stored on the pipeline step
        info: Option<String>,
    },
    /// The provider asked for a tool; the stage suspends until it returns
    ToolRequested { call: ToolCall, prompt: String },
}

impl StageOutcome {
    pub fn completed(findings: StageFindings, info: impl Into<String>) -> Self {
        StageOutcome::Completed {
            findings,
            info: Some(info.into()),
        }
    }
}

/// Trait for a single pipeline stage
#[async_trait::async_trait]
pub trait StageAgent: Send + Sync {
    fn stage(&self) -> Stage;

    /// Stages backed by the inference provider go through the semantic cache
    fn uses_inference(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome>;

    /// Continue after a tool round trip. `tool_results` holds every result
    /// this stage has received so far, oldest first.
    async fn resume(
        &self,
        _ctx: &StageContext,
        _prompt: &str,
        _tool_results: &[ToolResult],
    ) -> Result<StageOutcome> {
        Err(PipelineError::ToolInvocation(format!(
            "stage '{}' does not accept tool results",
            self.stage()
        )))
    }
}

/// Ask the provider and decode a structured text reply. A tool call is
/// malformed here because no tools were offered.
pub(crate) async fn infer_structured(
    provider: &dyn InferenceProvider,
    request: &InferenceRequest,
) -> Result<Value> {
    match provider.infer(request).await? {
        ProviderReply::Text(text) => decode_structured(&text),
        ProviderReply::ToolCall(call) => Err(PipelineError::MalformedProviderResponse {
            step: "reply",
            detail: format!("unexpected tool call '{}' without offered tools", call.name),
        }),
    }
}

//
// ================= Runner =================
//

/// Event handler wrapping one stage agent
pub struct AgentRunner {
    agent: Arc<dyn StageAgent>,
    store: Arc<dyn JobStore>,
    bus: EventBus,
    cache: Arc<SemanticCache>,
    bridge: Arc<ToolBridge>,
    label: String,
}

impl AgentRunner {
    pub fn new(
        agent: Arc<dyn StageAgent>,
        store: Arc<dyn JobStore>,
        bus: EventBus,
        cache: Arc<SemanticCache>,
        bridge: Arc<ToolBridge>,
    ) -> Self {
        let label = format!("{}-agent", agent.stage());
        Self {
            agent,
            store,
            bus,
            cache,
            bridge,
            label,
        }
    }

    pub fn stage(&self) -> Stage {
        self.agent.stage()
    }

    fn cache_key(&self, ctx: &StageContext) -> CacheKey {
        CacheKey::new(ctx.job_id, self.stage(), ctx.context_hash.clone())
    }

    async fn cached_findings(&self, ctx: &StageContext) -> Option<StageFindings> {
        if !self.agent.uses_inference() {
            return None;
        }
        let value = self.cache.get(&self.cache_key(ctx)).await?;
        match serde_json::from_value::<StageFindings>(value) {
            Ok(findings) if findings.stage() == self.stage() => Some(findings),
            _ => {
                warn!(job_id = %ctx.job_id, stage = %self.stage(), "Discarding unusable cache entry");
                None
            }
        }
    }

    async fn on_start(&self, msg: TaskStart) {
        let stage = self.stage();
        let ctx = StageContext {
            job_id: msg.job_id,
            context_hash: fingerprint(stage, &msg.payload),
            payload: msg.payload,
        };

        info!(job_id = %ctx.job_id, stage = %stage, "Stage started");

        if let Err(e) = ctx.payload.ensure_ready_for(stage) {
            self.fail(&ctx, e).await;
            return;
        }

        if let Some(findings) = self.cached_findings(&ctx).await {
            debug!(job_id = %ctx.job_id, stage = %stage, "Completing from semantic cache");
            self.complete(&ctx, findings, Some("served from cache".to_string()), false)
                .await;
            return;
        }

        let outcome = self.agent.execute(&ctx).await;
        self.settle(ctx, outcome, Vec::new()).await;
    }

    async fn on_tool_completed(&self, msg: ToolCompleted) {
        let stage = self.stage();
        let Some(pending) = self.bridge.resume(msg.job_id, stage).await else {
            return;
        };

        let ctx = StageContext {
            job_id: msg.job_id,
            payload: pending.context.payload,
            context_hash: pending.context.context_hash,
        };

        info!(
            job_id = %ctx.job_id,
            stage = %stage,
            tool = %msg.tool_name,
            round_trip = pending.round_trip,
            "Stage resumed"
        );

        if msg.tool_name != pending.call.name {
            let e = PipelineError::ToolInvocation(format!(
                "expected result of '{}', got '{}'",
                pending.call.name, msg.tool_name
            ));
            self.fail(&ctx, e).await;
            return;
        }

        if let Some(tool_error) = &msg.tool_result.error {
            let e = PipelineError::ToolInvocation(format!("{}: {}", msg.tool_name, tool_error));
            self.fail(&ctx, e).await;
            return;
        }

        let mut tool_results = pending.context.tool_results;
        tool_results.push(msg.tool_result);

        let outcome = self
            .agent
            .resume(&ctx, &pending.context.prompt, &tool_results)
            .await;
        self.settle(ctx, outcome, tool_results).await;
    }

    async fn settle(
        &self,
        ctx: StageContext,
        outcome: Result<StageOutcome>,
        tool_results: Vec<ToolResult>,
    ) {
        match outcome {
            Ok(StageOutcome::Completed { findings, info }) => {
                self.complete(&ctx, findings, info, true).await
            }
            Ok(StageOutcome::ToolRequested { call, prompt }) => {
                self.suspend(ctx, call, prompt, tool_results).await
            }
            Err(e) => self.fail(&ctx, e).await,
        }
    }

    async fn suspend(
        &self,
        ctx: StageContext,
        call: ToolCall,
        prompt: String,
        tool_results: Vec<ToolResult>,
    ) {
        let captured = CapturedContext {
            prompt: prompt.clone(),
            payload: ctx.payload.clone(),
            context_hash: ctx.context_hash.clone(),
            tool_results,
        };

        if let Err(e) = self
            .bridge
            .suspend(ctx.job_id, self.stage(), call.clone(), captured)
            .await
        {
            self.fail(&ctx, e).await;
            return;
        }

        self.bus
            .publish(Event::ToolRun(ToolRun {
                job_id: ctx.job_id,
                tool_call: call,
                payload: ctx.payload,
                prompt,
            }))
            .await;
    }

    async fn complete(
        &self,
        ctx: &StageContext,
        findings: StageFindings,
        info: Option<String>,
        write_through: bool,
    ) {
        let stage = self.stage();

        if findings.stage() != stage {
            let e = PipelineError::StageExecution(format!(
                "stage '{}' produced findings for '{}'",
                stage,
                findings.stage()
            ));
            self.fail(ctx, e).await;
            return;
        }

        let result_payload = match findings.to_result_payload() {
            Ok(value) => value,
            Err(e) => {
                self.fail(ctx, e).await;
                return;
            }
        };

        if write_through && self.agent.uses_inference() {
            match serde_json::to_value(&findings) {
                Ok(value) => self.cache.put(self.cache_key(ctx), value).await,
                Err(e) => warn!(job_id = %ctx.job_id, stage = %stage, error = %e, "Cache write skipped"),
            }
        }

        self.write_step(ctx.job_id, StepStatus::Completed, info).await;
        self.bridge.release(ctx.job_id, stage).await;

        info!(job_id = %ctx.job_id, stage = %stage, "Stage completed");

        self.bus
            .publish(Event::TaskCompleted(TaskCompleted {
                job_id: ctx.job_id,
                task_name: stage,
                result_payload,
                payload: ctx.payload.clone().with(findings),
            }))
            .await;
    }

    async fn fail(&self, ctx: &StageContext, e: PipelineError) {
        let stage = self.stage();
        let message = e.to_string();

        error!(job_id = %ctx.job_id, stage = %stage, error = %message, "Stage failed");

        self.write_step(ctx.job_id, StepStatus::Failed, Some(message.clone()))
            .await;
        self.bridge.release(ctx.job_id, stage).await;

        self.bus
            .publish(Event::TaskFailed(TaskFailed {
                job_id: ctx.job_id,
                task_name: stage,
                error: message,
            }))
            .await;
    }

    /// The stage's single Job Store write. A rejected write is logged and the
    /// terminal event still goes out; the dispatcher decides what it means.
    async fn write_step(&self, job_id: Uuid, status: StepStatus, info: Option<String>) {
        let stage = self.stage();
        match self
            .store
            .update_step(job_id, stage.index(), status, info)
            .await
        {
            Ok(StepUpdate::Applied) | Ok(StepUpdate::Unchanged) => {}
            Ok(update) => {
                warn!(job_id = %job_id, stage = %stage, ?update, "Step write not applied")
            }
            Err(e) => {
                warn!(job_id = %job_id, stage = %stage, error = %e, "Step write failed")
            }
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for AgentRunner {
    fn label(&self) -> &str {
        &self.label
    }

    async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::TaskStart(msg) if msg.task_name == self.stage() => self.on_start(msg).await,
            Event::ToolCompleted(msg) => self.on_tool_completed(msg).await,
            _ => {}
        }
        Ok(())
    }
}

//! Analysis stage: executive analysis from the inference provider. Above the
//! configured aggregate value the provider is offered the tax simulation
//! tool and may suspend the stage on it.

use super::{StageAgent, StageContext, StageOutcome};
use crate::error::PipelineError;
use crate::inference::{decode_structured, InferenceProvider, InferenceRequest, ProviderReply};
use crate::models::{Stage, ToolResult, ToolSpec};
use crate::payload::{AnalysisFindings, StageFindings};
use crate::Result;
use serde_json::json;
use std::sync::Arc;

const PROMPT: &str = "Write an executive fiscal analysis of the batch: risks found in the \
    audit, registry problems and the operation mix. Call tax_simulation when it is offered \
    and include its recommendation.";

pub struct AnalysisAgent {
    provider: Arc<dyn InferenceProvider>,
    /// Offered when the aggregate value exceeds `threshold`
    simulation: Option<ToolSpec>,
    threshold: f64,
}

impl AnalysisAgent {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        simulation: Option<ToolSpec>,
        threshold: f64,
    ) -> Self {
        Self {
            provider,
            simulation,
            threshold,
        }
    }

    fn build_request(&self, ctx: &StageContext, prompt: &str) -> Result<(InferenceRequest, f64)> {
        let extraction = ctx.payload.extraction()?;
        let validation = ctx.payload.validation()?;
        let audit = ctx.payload.audit()?;
        let classification = ctx.payload.classification()?;

        let total_value = extraction.total_value();
        let context = json!({
            "totalValue": total_value,
            "documentCount": ctx.payload.documents.len(),
            "audit": audit.batch,
            "observations": audit
                .documents
                .iter()
                .filter(|doc| doc.is_flagged())
                .map(|doc| json!({ "document": doc.document, "observations": doc.observations }))
                .collect::<Vec<_>>(),
            "validation": {
                "checked": validation.records.len(),
                "failedLookups": validation.failed_lookups,
            },
            "classification": classification.classification,
        });

        let mut request = InferenceRequest::new(Stage::Analysis, prompt, context);
        if total_value > self.threshold {
            request.tools.extend(self.simulation.clone());
        }
        Ok((request, total_value))
    }

    async fn ask(
        &self,
        request: InferenceRequest,
        total_value: f64,
    ) -> Result<StageOutcome> {
        match self.provider.infer(&request).await? {
            ProviderReply::ToolCall(call) => {
                if !request.tools.iter().any(|t| t.name == call.name) {
                    return Err(PipelineError::MalformedProviderResponse {
                        step: "reply",
                        detail: format!("tool '{}' was not offered", call.name),
                    });
                }
                Ok(StageOutcome::ToolRequested {
                    call,
                    prompt: request.prompt,
                })
            }
            ProviderReply::Text(text) => {
                let report = decode_structured(&text)?;
                let simulations = request.tool_results;
                let info = if simulations.is_empty() {
                    "analysis ready".to_string()
                } else {
                    format!("analysis ready with {} tool result(s)", simulations.len())
                };

                Ok(StageOutcome::completed(
                    StageFindings::Analysis(AnalysisFindings {
                        report,
                        total_value,
                        simulations,
                    }),
                    info,
                ))
            }
        }
    }
}

#[async_trait::async_trait]
impl StageAgent for AnalysisAgent {
    fn stage(&self) -> Stage {
        Stage::Analysis
    }

    fn uses_inference(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let (request, total_value) = self.build_request(ctx, PROMPT)?;
        self.ask(request, total_value).await
    }

    async fn resume(
        &self,
        ctx: &StageContext,
        prompt: &str,
        tool_results: &[ToolResult],
    ) -> Result<StageOutcome> {
        let (mut request, total_value) = self.build_request(ctx, prompt)?;
        request.tool_results = tool_results.to_vec();
        self.ask(request, total_value).await
    }
}

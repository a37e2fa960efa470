//! Inference provider contract
//!
//! Stages send structured context and receive either structured text or a
//! tool-call request. Provider text goes through an explicit decode pipeline
//! before any stage sees it.

use crate::error::PipelineError;
use crate::models::{Stage, ToolCall, ToolResult, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub mod gemini;
pub use gemini::GeminiProvider;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceRequest {
    pub stage: Stage,
    pub prompt: String,
    pub context: Value,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// Results of tool calls already executed for this stage, oldest first
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
}

impl InferenceRequest {
    pub fn new(stage: Stage, prompt: impl Into<String>, context: Value) -> Self {
        Self {
            stage,
            prompt: prompt.into(),
            context,
            tools: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderReply {
    Text(String),
    ToolCall(ToolCall),
}

/// Trait for inference providers (LLM controlled)
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn infer(&self, request: &InferenceRequest) -> Result<ProviderReply>;
}

//
// ================= Decode Pipeline =================
//

/// Steps tried in order when decoding provider text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /// ```json ... ``` (or bare ```) fenced block
    Fenced,
    /// The whole text
    Raw,
    /// Outermost `{ ... }` span
    Braced,
}

fn fenced_block(text: &str) -> Option<&str> {
    let (start, marker_len) = match text.find("```json") {
        Some(start) => (start, 7),
        None => (text.find("```")?, 3),
    };
    let after = &text[start + marker_len..];
    let end = after.find("```")?;
    Some(after[..end].trim())
}

fn braced_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn candidate(text: &str, step: DecodeStep) -> Option<&str> {
    match step {
        DecodeStep::Fenced => fenced_block(text),
        DecodeStep::Raw => Some(text.trim()),
        DecodeStep::Braced => braced_span(text),
    }
}

/// Decode provider text into a JSON object.
///
/// Fails with `MalformedProviderResponse` at step `decode` when no step
/// yields JSON, and at step `shape` when steps yield JSON but never an
/// object.
pub fn decode_structured(text: &str) -> Result<Value> {
    let mut non_object: Option<Value> = None;

    for step in [DecodeStep::Fenced, DecodeStep::Raw, DecodeStep::Braced] {
        let Some(raw) = candidate(text, step) else {
            continue;
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(value) => {
                non_object.get_or_insert(value);
            }
            Err(_) => {}
        }
    }

    if let Some(value) = non_object {
        return Err(PipelineError::MalformedProviderResponse {
            step: "shape",
            detail: format!("expected a JSON object, got {}", value),
        });
    }

    let preview: String = text.chars().take(120).collect();
    Err(PipelineError::MalformedProviderResponse {
        step: "decode",
        detail: format!("no parseable structure found | raw={}", preview),
    })
}

//
// ================= Mock Provider =================
//

/// Deterministic provider for development & testing.
/// Keeps the pipeline functional without LLM dependency.
#[derive(Default)]
pub struct MockInferenceProvider {
    calls: [AtomicUsize; 6],
    overrides: HashMap<Stage, String>,
}

impl MockInferenceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with fixed `text` for every request of `stage`
    pub fn with_reply(mut self, stage: Stage, text: impl Into<String>) -> Self {
        self.overrides.insert(stage, text.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    pub fn calls_for(&self, stage: Stage) -> usize {
        self.calls[stage.index()].load(Ordering::SeqCst)
    }

    fn fenced(value: Value) -> String {
        format!("Here is the result:\n```json\n{}\n```", value)
    }

    fn extraction_reply(context: &Value) -> Value {
        let documents: Vec<Value> = context
            .get("documents")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .map(|doc| {
                        json!({
                            "name": doc.get("name").cloned().unwrap_or(Value::Null),
                            "kind": "NF-e",
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        json!({ "documentCount": documents.len(), "documents": documents })
    }

    fn classification_reply(context: &Value) -> Value {
        let categories: Vec<Value> = context
            .get("documents")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .map(|doc| {
                        let first_cfop = doc
                            .pointer("/codes/cfops/0")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let operation = match first_cfop.chars().next() {
                            Some('1' | '2' | '3') => "inbound",
                            Some('5' | '6' | '7') => "outbound",
                            _ => "unknown",
                        };
                        json!({
                            "document": doc.get("name").cloned().unwrap_or(Value::Null),
                            "operation": operation,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        json!({ "categories": categories })
    }

    fn analysis_reply(request: &InferenceRequest) -> ProviderReply {
        let offered = request.tools.iter().any(|t| t.name == "tax_simulation");
        if offered && request.tool_results.is_empty() {
            let revenue = request
                .context
                .get("totalValue")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            return ProviderReply::ToolCall(ToolCall {
                name: "tax_simulation".to_string(),
                args: json!({ "annualRevenue": revenue }),
            });
        }

        let flagged = request
            .context
            .pointer("/audit/flaggedDocuments")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let risk = match flagged {
            0 => "low",
            1 => "medium",
            _ => "high",
        };

        ProviderReply::Text(Self::fenced(json!({
            "summary": format!("{} document(s) flagged during fiscal audit", flagged),
            "risk": risk,
            "simulationIncluded": !request.tool_results.is_empty(),
        })))
    }
}

#[async_trait]
impl InferenceProvider for MockInferenceProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<ProviderReply> {
        self.calls[request.stage.index()].fetch_add(1, Ordering::SeqCst);

        if let Some(text) = self.overrides.get(&request.stage) {
            return Ok(ProviderReply::Text(text.clone()));
        }

        let reply = match request.stage {
            Stage::Extraction => {
                ProviderReply::Text(Self::fenced(Self::extraction_reply(&request.context)))
            }
            Stage::Classification => {
                ProviderReply::Text(Self::fenced(Self::classification_reply(&request.context)))
            }
            Stage::Analysis => Self::analysis_reply(request),
            _ => ProviderReply::Text("{}".to_string()),
        };

        Ok(reply)
    }
}

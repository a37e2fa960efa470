//! Gemini-backed inference provider
//!
//! Uses a long-lived reqwest::Client for connection pooling. Offered tools are
//! sent as function declarations; a `functionCall` part in the reply becomes a
//! `ProviderReply::ToolCall`.

use super::{InferenceProvider, InferenceRequest, ProviderReply};
use crate::error::PipelineError;
use crate::models::ToolCall;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

const DEFAULT_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

const SYSTEM_PROMPT: &str = r#"You are a Brazilian fiscal document analyst.

Guidelines:
- Work only from the context you are given
- Answer with a single JSON object inside a ```json fenced block
- Call an offered function when its result is needed for the answer"#;

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_request(request: &InferenceRequest) -> GeminiRequest {
        let mut contents = vec![Content {
            role: "user".to_string(),
            parts: vec![Part::text(format!(
                "{}\n\nContext:\n{}",
                request.prompt, request.context
            ))],
        }];

        // replay each executed tool as a call/response pair
        for result in &request.tool_results {
            contents.push(Content {
                role: "model".to_string(),
                parts: vec![Part {
                    function_call: Some(FunctionCall {
                        name: result.name.clone(),
                        args: Value::Object(Default::default()),
                    }),
                    ..Part::default()
                }],
            });
            contents.push(Content {
                role: "function".to_string(),
                parts: vec![Part {
                    function_response: Some(FunctionResponse {
                        name: result.name.clone(),
                        response: result.output.clone(),
                    }),
                    ..Part::default()
                }],
            });
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![ToolDeclarations {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|spec| FunctionDeclaration {
                        name: spec.name.clone(),
                        description: spec.description.clone(),
                        parameters: spec.parameters.clone(),
                    })
                    .collect(),
            }])
        };

        GeminiRequest {
            contents,
            tools,
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part::text(SYSTEM_PROMPT)],
            },
        }
    }
}

/// Pick the reply out of the first candidate. A function call wins over text.
fn interpret(response: GeminiResponse) -> Result<ProviderReply> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        PipelineError::MalformedProviderResponse {
            step: "candidates",
            detail: "no candidates in provider response".to_string(),
        }
    })?;

    let mut text = String::new();
    for part in candidate.content.parts {
        if let Some(call) = part.function_call {
            return Ok(ProviderReply::ToolCall(ToolCall {
                name: call.name,
                args: call.args,
            }));
        }
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
    }

    if text.trim().is_empty() {
        return Err(PipelineError::MalformedProviderResponse {
            step: "content",
            detail: format!(
                "empty content (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            ),
        });
    }

    Ok(ProviderReply::Text(text))
}

#[async_trait]
impl InferenceProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<ProviderReply> {
        if self.api_key.is_empty() {
            return Err(PipelineError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let body = Self::build_request(request);

        info!(
            stage = %request.stage,
            tools = request.tools.len(),
            tool_results = request.tool_results.len(),
            "Calling Gemini API"
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                PipelineError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(PipelineError::LlmError(format!(
                "Gemini API error ({}): {}",
                status, error_text
            )));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            PipelineError::MalformedProviderResponse {
                step: "envelope",
                detail: e.to_string(),
            }
        })?;

        interpret(parsed)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Stage, ToolResult, ToolSpec};
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let mut request = InferenceRequest::new(
            Stage::Analysis,
            "Analyze the batch",
            json!({"totalValue": 150000.0}),
        );
        request.tools.push(ToolSpec {
            name: "tax_simulation".into(),
            description: "Compare tax regimes".into(),
            parameters: json!({"type": "object"}),
        });
        request
            .tool_results
            .push(ToolResult::success("tax_simulation", json!({"recommended": "simples"})));

        let body = serde_json::to_value(GeminiProvider::build_request(&request)).unwrap();

        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "tax_simulation"
        );
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(
            body["contents"][2]["parts"][0]["functionResponse"]["response"]["recommended"],
            "simples"
        );
        assert!(body["generationConfig"]["maxOutputTokens"].is_number());
        assert!(body["contents"][0]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("150000"));
    }

    #[test]
    fn test_interpret_function_call() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "tax_simulation", "args": {"annualRevenue": 1.0}}}
                ]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        match interpret(response).unwrap() {
            ProviderReply::ToolCall(call) => assert_eq!(call.name, "tax_simulation"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_interpret_empty_candidates() {
        let response: GeminiResponse = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(
            interpret(response),
            Err(PipelineError::MalformedProviderResponse { step: "candidates", .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_key_fails_fast() {
        let provider = GeminiProvider::new("").unwrap();
        let request = InferenceRequest::new(Stage::Extraction, "x", json!({}));
        assert!(matches!(
            provider.infer(&request).await,
            Err(PipelineError::LlmError(_))
        ));
    }
}

//! Extraction stage: deterministic pre-extraction plus a structured summary
//! from the inference provider.

use super::{infer_structured, StageAgent, StageContext, StageOutcome};
use crate::fiscal;
use crate::inference::{InferenceProvider, InferenceRequest};
use crate::models::Stage;
use crate::payload::{DocumentExtract, ExtractionFindings, StageFindings};
use crate::Result;
use serde_json::json;
use std::sync::Arc;

/// Characters of raw text sent to the provider per document
const EXCERPT_CHARS: usize = 2000;

const PROMPT: &str = "Summarize each fiscal document: issuer, document kind and the \
    main operation. Use the pre-extracted fields as ground truth.";

pub struct ExtractionAgent {
    provider: Arc<dyn InferenceProvider>,
}

impl ExtractionAgent {
    pub fn new(provider: Arc<dyn InferenceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl StageAgent for ExtractionAgent {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    fn uses_inference(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let documents: Vec<DocumentExtract> = ctx
            .payload
            .documents
            .iter()
            .map(|doc| DocumentExtract {
                name: doc.name.clone(),
                cnpjs: fiscal::extract_cnpjs(&doc.text),
                invoice_total: fiscal::extract_invoice_total(&doc.text),
                codes: fiscal::extract_codes(&doc.text),
            })
            .collect();

        let context = json!({
            "documents": documents
                .iter()
                .zip(&ctx.payload.documents)
                .map(|(extract, doc)| json!({
                    "name": extract.name,
                    "cnpjs": extract.cnpjs,
                    "invoiceTotal": extract.invoice_total,
                    "codes": extract.codes,
                    "excerpt": doc.text.chars().take(EXCERPT_CHARS).collect::<String>(),
                }))
                .collect::<Vec<_>>(),
        });

        let request = InferenceRequest::new(Stage::Extraction, PROMPT, context);
        let summary = infer_structured(self.provider.as_ref(), &request).await?;

        let info = format!("{} document(s) extracted", documents.len());
        Ok(StageOutcome::completed(
            StageFindings::Extraction(ExtractionFindings { documents, summary }),
            info,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::sample_documents;
    use crate::error::PipelineError;
    use crate::inference::MockInferenceProvider;
    use crate::payload::PipelinePayload;
    use uuid::Uuid;

    fn ctx() -> StageContext {
        StageContext {
            job_id: Uuid::new_v4(),
            payload: PipelinePayload::new(sample_documents()),
            context_hash: "h".into(),
        }
    }

    #[tokio::test]
    async fn test_extracts_fields_and_summary() {
        let provider = Arc::new(MockInferenceProvider::new());
        let agent = ExtractionAgent::new(provider.clone());

        let outcome = agent.execute(&ctx()).await.unwrap();
        let StageOutcome::Completed {
            findings: StageFindings::Extraction(findings),
            info,
        } = outcome
        else {
            panic!("unexpected outcome");
        };

        assert_eq!(findings.documents.len(), 2);
        assert_eq!(findings.documents[0].cnpjs, vec!["11222333000181".to_string()]);
        assert_eq!(findings.documents[0].invoice_total, Some(1180.0));
        assert_eq!(findings.documents[1].codes.cfops, vec!["6108".to_string()]);
        assert_eq!(findings.summary["documentCount"], 2);
        assert_eq!(info.as_deref(), Some("2 document(s) extracted"));
        assert_eq!(provider.calls_for(Stage::Extraction), 1);
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_malformed() {
        let provider = Arc::new(
            MockInferenceProvider::new().with_reply(Stage::Extraction, "I cannot help with that"),
        );
        let agent = ExtractionAgent::new(provider);

        assert!(matches!(
            agent.execute(&ctx()).await,
            Err(PipelineError::MalformedProviderResponse { step: "decode", .. })
        ));
    }
}

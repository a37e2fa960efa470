//! Classification stage: operation-type classification of each document from
//! the extracted codes and audit findings.

use super::{infer_structured, StageAgent, StageContext, StageOutcome};
use crate::inference::{InferenceProvider, InferenceRequest};
use crate::models::Stage;
use crate::payload::{ClassificationFindings, StageFindings};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;

const PROMPT: &str = "Classify each document by operation type (inbound, outbound, \
    transfer, return) using its CFOP codes and audit observations.";

pub struct ClassificationAgent {
    provider: Arc<dyn InferenceProvider>,
}

impl ClassificationAgent {
    pub fn new(provider: Arc<dyn InferenceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl StageAgent for ClassificationAgent {
    fn stage(&self) -> Stage {
        Stage::Classification
    }

    fn uses_inference(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let extraction = ctx.payload.extraction()?;
        let audit = ctx.payload.audit()?;

        let documents: Vec<Value> = extraction
            .documents
            .iter()
            .map(|doc| {
                let check = audit.documents.iter().find(|c| c.document == doc.name);
                json!({
                    "name": doc.name,
                    "codes": doc.codes,
                    "invoiceTotal": doc.invoice_total,
                    "observations": check.map(|c| c.observations.clone()).unwrap_or_default(),
                })
            })
            .collect();

        let request = InferenceRequest::new(
            Stage::Classification,
            PROMPT,
            json!({ "documents": documents }),
        );
        let classification = infer_structured(self.provider.as_ref(), &request).await?;

        Ok(StageOutcome::completed(
            StageFindings::Classification(ClassificationFindings { classification }),
            format!("{} document(s) classified", documents.len()),
        ))
    }
}

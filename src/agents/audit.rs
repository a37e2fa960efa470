//! Audit stage: fiscal consistency checks per document plus the batch
//! aggregate. No external calls.

use super::{StageAgent, StageContext, StageOutcome};
use crate::fiscal;
use crate::models::Stage;
use crate::payload::{AuditFindings, StageFindings};
use crate::Result;

pub struct AuditAgent;

#[async_trait::async_trait]
impl StageAgent for AuditAgent {
    fn stage(&self) -> Stage {
        Stage::Audit
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let documents: Vec<_> = ctx
            .payload
            .documents
            .iter()
            .map(|doc| fiscal::check_document(&doc.name, &doc.text))
            .collect();
        let batch = fiscal::aggregate(&documents);

        let info = format!(
            "{} of {} document(s) flagged",
            batch.flagged_documents, batch.documents
        );

        Ok(StageOutcome::completed(
            StageFindings::Audit(AuditFindings { documents, batch }),
            info,
        ))
    }
}

//! Indexing stage: chunk document text and the analysis report into the
//! job-scoped content index.

use super::{StageAgent, StageContext, StageOutcome};
use crate::models::Stage;
use crate::payload::{IndexingFindings, StageFindings};
use crate::vector_index::{chunk_text, VectorIndex, DEFAULT_CHUNK_CHARS};
use crate::Result;
use std::sync::Arc;

pub const REPORT_SOURCE: &str = "report";

pub struct IndexingAgent {
    index: Arc<dyn VectorIndex>,
    chunk_chars: usize,
}

impl IndexingAgent {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self {
            index,
            chunk_chars: DEFAULT_CHUNK_CHARS,
        }
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }
}

#[async_trait::async_trait]
impl StageAgent for IndexingAgent {
    fn stage(&self) -> Stage {
        Stage::Indexing
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let analysis = ctx.payload.analysis()?;

        let mut chunks: Vec<_> = ctx
            .payload
            .documents
            .iter()
            .flat_map(|doc| chunk_text(&doc.name, &doc.text, self.chunk_chars))
            .collect();
        let report = serde_json::to_string(&analysis.report)?;
        chunks.extend(chunk_text(REPORT_SOURCE, &report, self.chunk_chars));

        let chunks_indexed = self.index.upsert(ctx.job_id, chunks).await?;

        Ok(StageOutcome::completed(
            StageFindings::Indexing(IndexingFindings { chunks_indexed }),
            format!("{} chunk(s) indexed", chunks_indexed),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FiscalDocument;
    use crate::payload::{AnalysisFindings, PipelinePayload};
    use crate::vector_index::InMemoryVectorIndex;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_indexes_documents_and_report() {
        let index = Arc::new(InMemoryVectorIndex::new());
        let agent = IndexingAgent::new(index.clone()).with_chunk_chars(20);

        let payload = PipelinePayload::new(vec![FiscalDocument::new(
            "nf-001.txt",
            "CFOP 5102 venda de mercadoria dentro do estado",
        )])
        .with(StageFindings::Analysis(AnalysisFindings {
            report: json!({"risk": "low"}),
            total_value: 10.0,
            simulations: vec![],
        }));

        let job_id = Uuid::new_v4();
        let ctx = StageContext {
            job_id,
            payload,
            context_hash: "h".into(),
        };

        let StageOutcome::Completed {
            findings: StageFindings::Indexing(findings),
            ..
        } = agent.execute(&ctx).await.unwrap()
        else {
            panic!("unexpected outcome");
        };

        assert!(findings.chunks_indexed >= 3);
        assert_eq!(index.count(job_id).await, findings.chunks_indexed);

        let hits = index.query(job_id, "mercadoria", 3).await.unwrap();
        assert_eq!(hits[0].source, "nf-001.txt");
    }
}

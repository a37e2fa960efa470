//! Accumulating pipeline payload
//!
//! Every stage contributes one typed slot. A stage checks at its boundary
//! that all prior slots are populated before it runs.

use crate::error::PipelineError;
use crate::fiscal::{ExtractedCodes, FiscalBatchSummary, FiscalCheckSummary};
use crate::models::{FiscalDocument, Stage, ToolResult, ValidationRecord};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

//
// ================= Findings =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentExtract {
    pub name: String,
    pub cnpjs: Vec<String>,
    pub invoice_total: Option<f64>,
    pub codes: ExtractedCodes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionFindings {
    pub documents: Vec<DocumentExtract>,
    /// Structured document summary returned by the inference provider
    pub summary: Value,
}

impl ExtractionFindings {
    /// Sum of all invoice totals found
    pub fn total_value(&self) -> f64 {
        self.documents
            .iter()
            .filter_map(|doc| doc.invoice_total)
            .sum()
    }

    /// Distinct CNPJs across all documents, in order of appearance
    pub fn distinct_cnpjs(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for cnpj in self.documents.iter().flat_map(|doc| doc.cnpjs.iter()) {
            if !out.contains(cnpj) {
                out.push(cnpj.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFindings {
    pub records: Vec<ValidationRecord>,
    pub failed_lookups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditFindings {
    pub documents: Vec<FiscalCheckSummary>,
    pub batch: FiscalBatchSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationFindings {
    pub classification: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisFindings {
    pub report: Value,
    pub total_value: f64,
    #[serde(default)]
    pub simulations: Vec<ToolResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexingFindings {
    pub chunks_indexed: usize,
}

/// Tagged union of every stage's findings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", content = "findings", rename_all = "lowercase")]
pub enum StageFindings {
    Extraction(ExtractionFindings),
    Validation(ValidationFindings),
    Audit(AuditFindings),
    Classification(ClassificationFindings),
    Analysis(AnalysisFindings),
    Indexing(IndexingFindings),
}

impl StageFindings {
    pub fn stage(&self) -> Stage {
        match self {
            StageFindings::Extraction(_) => Stage::Extraction,
            StageFindings::Validation(_) => Stage::Validation,
            StageFindings::Audit(_) => Stage::Audit,
            StageFindings::Classification(_) => Stage::Classification,
            StageFindings::Analysis(_) => Stage::Analysis,
            StageFindings::Indexing(_) => Stage::Indexing,
        }
    }

    /// The findings body without the stage tag (the wire `resultPayload`)
    pub fn to_result_payload(&self) -> Result<Value> {
        let value = match self {
            StageFindings::Extraction(f) => serde_json::to_value(f)?,
            StageFindings::Validation(f) => serde_json::to_value(f)?,
            StageFindings::Audit(f) => serde_json::to_value(f)?,
            StageFindings::Classification(f) => serde_json::to_value(f)?,
            StageFindings::Analysis(f) => serde_json::to_value(f)?,
            StageFindings::Indexing(f) => serde_json::to_value(f)?,
        };
        Ok(value)
    }
}

//
// ================= Payload =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePayload {
    pub documents: Vec<FiscalDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionFindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationFindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditFindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationFindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisFindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing: Option<IndexingFindings>,
}

impl PipelinePayload {
    pub fn new(documents: Vec<FiscalDocument>) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }

    pub fn has(&self, stage: Stage) -> bool {
        match stage {
            Stage::Extraction => self.extraction.is_some(),
            Stage::Validation => self.validation.is_some(),
            Stage::Audit => self.audit.is_some(),
            Stage::Classification => self.classification.is_some(),
            Stage::Analysis => self.analysis.is_some(),
            Stage::Indexing => self.indexing.is_some(),
        }
    }

    /// Every stage before `stage` must have contributed its findings.
    pub fn ensure_ready_for(&self, stage: Stage) -> Result<()> {
        match stage
            .predecessors()
            .iter()
            .find(|prior| !self.has(**prior))
        {
            Some(missing) => Err(PipelineError::MissingStageOutput(*missing)),
            None => Ok(()),
        }
    }

    /// Superset of this payload plus `findings`
    pub fn with(mut self, findings: StageFindings) -> Self {
        self.apply(findings);
        self
    }

    pub fn apply(&mut self, findings: StageFindings) {
        match findings {
            StageFindings::Extraction(f) => self.extraction = Some(f),
            StageFindings::Validation(f) => self.validation = Some(f),
            StageFindings::Audit(f) => self.audit = Some(f),
            StageFindings::Classification(f) => self.classification = Some(f),
            StageFindings::Analysis(f) => self.analysis = Some(f),
            StageFindings::Indexing(f) => self.indexing = Some(f),
        }
    }

    pub fn extraction(&self) -> Result<&ExtractionFindings> {
        self.extraction
            .as_ref()
            .ok_or(PipelineError::MissingStageOutput(Stage::Extraction))
    }

    pub fn validation(&self) -> Result<&ValidationFindings> {
        self.validation
            .as_ref()
            .ok_or(PipelineError::MissingStageOutput(Stage::Validation))
    }

    pub fn audit(&self) -> Result<&AuditFindings> {
        self.audit
            .as_ref()
            .ok_or(PipelineError::MissingStageOutput(Stage::Audit))
    }

    pub fn classification(&self) -> Result<&ClassificationFindings> {
        self.classification
            .as_ref()
            .ok_or(PipelineError::MissingStageOutput(Stage::Classification))
    }

    pub fn analysis(&self) -> Result<&AnalysisFindings> {
        self.analysis
            .as_ref()
            .ok_or(PipelineError::MissingStageOutput(Stage::Analysis))
    }

    pub fn indexing(&self) -> Result<&IndexingFindings> {
        self.indexing
            .as_ref()
            .ok_or(PipelineError::MissingStageOutput(Stage::Indexing))
    }
}

//
// ================= Executive Report =================
//

/// Final report merged into the job result when the last stage completes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutiveReport {
    pub documents: usize,
    pub total_value: f64,
    pub validated_companies: usize,
    pub failed_lookups: usize,
    pub flagged_documents: usize,
    pub icms_inconsistent: usize,
    pub classification: Value,
    pub analysis: Value,
    pub simulations: Vec<ToolResult>,
    pub chunks_indexed: usize,
}

impl ExecutiveReport {
    pub fn from_payload(payload: &PipelinePayload) -> Result<Self> {
        payload.ensure_ready_for(Stage::Indexing)?;

        let validation = payload.validation()?;
        let audit = payload.audit()?;
        let analysis = payload.analysis()?;

        Ok(Self {
            documents: payload.documents.len(),
            total_value: analysis.total_value,
            validated_companies: validation
                .records
                .len()
                .saturating_sub(validation.failed_lookups),
            failed_lookups: validation.failed_lookups,
            flagged_documents: audit.batch.flagged_documents,
            icms_inconsistent: audit.batch.icms_inconsistent,
            classification: payload.classification()?.classification.clone(),
            analysis: analysis.report.clone(),
            simulations: analysis.simulations.clone(),
            chunks_indexed: payload.indexing()?.chunks_indexed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extraction() -> StageFindings {
        StageFindings::Extraction(ExtractionFindings {
            documents: vec![
                DocumentExtract {
                    name: "a".into(),
                    cnpjs: vec!["11222333000181".into()],
                    invoice_total: Some(100.0),
                    codes: ExtractedCodes::default(),
                },
                DocumentExtract {
                    name: "b".into(),
                    cnpjs: vec!["11222333000181".into(), "44555666000199".into()],
                    invoice_total: Some(50.5),
                    codes: ExtractedCodes::default(),
                },
            ],
            summary: json!({}),
        })
    }

    #[test]
    fn test_boundary_check_names_first_missing_stage() {
        let payload = PipelinePayload::new(vec![]);
        assert!(payload.ensure_ready_for(Stage::Extraction).is_ok());

        match payload.ensure_ready_for(Stage::Audit) {
            Err(PipelineError::MissingStageOutput(stage)) => assert_eq!(stage, Stage::Extraction),
            other => panic!("unexpected: {:?}", other),
        }

        let payload = payload.with(extraction());
        match payload.ensure_ready_for(Stage::Audit) {
            Err(PipelineError::MissingStageOutput(stage)) => assert_eq!(stage, Stage::Validation),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_extraction_helpers() {
        let payload = PipelinePayload::new(vec![]).with(extraction());
        let findings = payload.extraction().unwrap();
        assert_eq!(findings.total_value(), 150.5);
        assert_eq!(
            findings.distinct_cnpjs(),
            vec!["11222333000181".to_string(), "44555666000199".to_string()]
        );
    }

    #[test]
    fn test_payload_wire_shape_is_superset() {
        let base = PipelinePayload::new(vec![FiscalDocument::new("a", "text")]);
        let before = serde_json::to_value(&base).unwrap();
        let after = serde_json::to_value(base.with(extraction())).unwrap();

        assert!(before.get("extraction").is_none());
        assert_eq!(before["documents"], after["documents"]);
        assert!(after["extraction"]["documents"].is_array());
    }

    #[test]
    fn test_result_payload_drops_stage_tag() {
        let value = extraction().to_result_payload().unwrap();
        assert!(value.get("stage").is_none());
        assert_eq!(value["documents"][0]["invoiceTotal"], 100.0);
    }
}

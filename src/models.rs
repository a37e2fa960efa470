//! Core data models for the fiscal pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//
// ================= Stages =================
//

/// The six named units of pipeline work, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extraction,
    Validation,
    Audit,
    Classification,
    Analysis,
    Indexing,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Extraction,
        Stage::Validation,
        Stage::Audit,
        Stage::Classification,
        Stage::Analysis,
        Stage::Indexing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Validation => "validation",
            Stage::Audit => "audit",
            Stage::Classification => "classification",
            Stage::Analysis => "analysis",
            Stage::Indexing => "indexing",
        }
    }

    /// Position of the stage in the default pipeline
    pub fn index(&self) -> usize {
        match self {
            Stage::Extraction => 0,
            Stage::Validation => 1,
            Stage::Audit => 2,
            Stage::Classification => 3,
            Stage::Analysis => 4,
            Stage::Indexing => 5,
        }
    }

    /// Stages that must have completed before this one may run
    pub fn predecessors(&self) -> &'static [Stage] {
        &Self::ALL[..self.index()]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

//
// ================= Job =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStep {
    pub index: usize,
    pub name: Stage,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// Ordered, all-pending pipeline covering every stage
pub fn default_pipeline() -> Vec<PipelineStep> {
    Stage::ALL
        .iter()
        .enumerate()
        .map(|(index, stage)| PipelineStep {
            index,
            name: *stage,
            status: StepStatus::Pending,
            info: None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    /// Fingerprint of the accumulated input of the most recently started stage
    #[serde(default)]
    pub context_hash: Option<String>,
    #[serde(default)]
    pub document_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobMetadata {
    pub fn new(document_count: usize) -> Self {
        let now = Utc::now();
        Self {
            context_hash: None,
            document_count,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub pipeline: Vec<PipelineStep>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metadata: JobMetadata,
}

impl Job {
    pub fn new(id: Uuid, pipeline: Vec<PipelineStep>, metadata: JobMetadata) -> Self {
        Self {
            id,
            status: JobStatus::Processing,
            pipeline,
            result: None,
            error: None,
            metadata,
        }
    }

    /// The single in-progress step, if any
    pub fn current_step(&self) -> Option<&PipelineStep> {
        self.pipeline
            .iter()
            .find(|step| step.status == StepStatus::InProgress)
    }

    pub fn failed_step(&self) -> Option<&PipelineStep> {
        self.pipeline
            .iter()
            .find(|step| step.status == StepStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status != JobStatus::Processing
    }

    /// Shallow-merge `partial` into `result`, keeping sibling keys.
    pub fn merge_result(&mut self, partial: serde_json::Map<String, Value>) {
        let target = self
            .result
            .get_or_insert_with(|| Value::Object(serde_json::Map::new()));

        if !target.is_object() {
            *target = Value::Object(serde_json::Map::new());
        }

        if let Value::Object(map) = target {
            for (key, value) in partial {
                map.insert(key, value);
            }
        }
        self.metadata.updated_at = Utc::now();
    }

    /// Apply a step transition under the pipeline invariants.
    pub fn transition_step(
        &mut self,
        index: usize,
        status: StepStatus,
        info: Option<String>,
    ) -> StepUpdate {
        let update = apply_step_transition(&mut self.pipeline, index, status, info);
        if update != StepUpdate::Rejected {
            self.metadata.updated_at = Utc::now();
        }
        update
    }
}

/// Outcome of a `update_step` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepUpdate {
    /// Status moved forward
    Applied,
    /// Status already equal; only `info` was refreshed
    Unchanged,
    /// Would regress, skip a predecessor, or create a second in-progress step
    Rejected,
    NotFound,
}

/// Pure transition rule shared by every job store backend.
///
/// pending -> in-progress requires every lower step completed and no step in
/// progress; in-progress -> completed | failed is always allowed. Everything
/// else is rejected.
pub fn apply_step_transition(
    pipeline: &mut [PipelineStep],
    index: usize,
    status: StepStatus,
    info: Option<String>,
) -> StepUpdate {
    let Some(current) = pipeline.get(index).map(|s| s.status) else {
        return StepUpdate::Rejected;
    };

    if current == status {
        if info.is_some() {
            pipeline[index].info = info;
        }
        return StepUpdate::Unchanged;
    }

    let allowed = match (current, status) {
        (StepStatus::Pending, StepStatus::InProgress) => {
            pipeline[..index]
                .iter()
                .all(|s| s.status == StepStatus::Completed)
                && !pipeline.iter().any(|s| s.status == StepStatus::InProgress)
        }
        (StepStatus::InProgress, StepStatus::Completed)
        | (StepStatus::InProgress, StepStatus::Failed) => true,
        _ => false,
    };

    if !allowed {
        return StepUpdate::Rejected;
    }

    let step = &mut pipeline[index];
    step.status = status;
    if info.is_some() {
        step.info = info;
    }
    StepUpdate::Applied
}

//
// ================= Documents =================
//

/// Raw fiscal document submitted to a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiscalDocument {
    pub name: String,
    pub text: String,
}

impl FiscalDocument {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

//
// ================= Tool I/O =================
//

/// A request from the inference provider to run a named function
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub name: String,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(name: impl Into<String>, output: Value) -> Self {
        Self {
            name: name.into(),
            output,
            error: None,
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            name: name.into(),
            output: serde_json::json!({ "error": error.clone() }),
            error: Some(error),
        }
    }
}

/// Function declaration offered to the inference provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

//
// ================= Registry Validation =================
//

/// Result of one external company-registry lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ValidationRecord {
    Failure {
        error: bool,
        message: String,
        identifier: String,
    },
    Success {
        identifier: String,
        profile: Value,
    },
}

impl ValidationRecord {
    pub fn success(identifier: impl Into<String>, profile: Value) -> Self {
        ValidationRecord::Success {
            identifier: identifier.into(),
            profile,
        }
    }

    pub fn failure(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationRecord::Failure {
            error: true,
            message: message.into(),
            identifier: identifier.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationRecord::Failure { .. })
    }

    pub fn identifier(&self) -> &str {
        match self {
            ValidationRecord::Failure { identifier, .. }
            | ValidationRecord::Success { identifier, .. } => identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(Uuid::new_v4(), default_pipeline(), JobMetadata::new(1))
    }

    #[test]
    fn test_step_status_wire_names() {
        let json = serde_json::to_string(&StepStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn test_forward_transitions() {
        let mut job = job();
        assert_eq!(job.transition_step(0, StepStatus::InProgress, None), StepUpdate::Applied);
        assert_eq!(job.current_step().unwrap().name, Stage::Extraction);
        assert_eq!(job.transition_step(0, StepStatus::Completed, None), StepUpdate::Applied);
        assert_eq!(job.transition_step(1, StepStatus::InProgress, None), StepUpdate::Applied);
        assert_eq!(job.current_step().unwrap().name, Stage::Validation);
    }

    #[test]
    fn test_rejects_skip_regression_and_second_active() {
        let mut job = job();
        // cannot skip stage 0
        assert_eq!(job.transition_step(1, StepStatus::InProgress, None), StepUpdate::Rejected);

        job.transition_step(0, StepStatus::InProgress, None);
        assert_eq!(job.transition_step(0, StepStatus::Pending, None), StepUpdate::Rejected);

        job.transition_step(0, StepStatus::Completed, None);
        assert_eq!(job.transition_step(0, StepStatus::InProgress, None), StepUpdate::Rejected);
        assert_eq!(job.transition_step(0, StepStatus::Failed, None), StepUpdate::Rejected);
        assert_eq!(job.transition_step(9, StepStatus::InProgress, None), StepUpdate::Rejected);
    }

    #[test]
    fn test_same_status_refreshes_info_only() {
        let mut job = job();
        job.transition_step(0, StepStatus::InProgress, None);
        let update = job.transition_step(0, StepStatus::InProgress, Some("3 documents".into()));
        assert_eq!(update, StepUpdate::Unchanged);
        assert_eq!(job.pipeline[0].info.as_deref(), Some("3 documents"));
    }

    #[test]
    fn test_merge_result_keeps_siblings() {
        let mut job = job();
        let mut a = serde_json::Map::new();
        a.insert("extraction".into(), serde_json::json!({"docs": 3}));
        job.merge_result(a);

        let mut b = serde_json::Map::new();
        b.insert("audit".into(), serde_json::json!({"flagged": 1}));
        job.merge_result(b);

        let result = job.result.unwrap();
        assert_eq!(result["extraction"]["docs"], 3);
        assert_eq!(result["audit"]["flagged"], 1);
    }

    #[test]
    fn test_validation_record_shapes() {
        let failure = ValidationRecord::failure("11222333000181", "timeout");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["error"], true);
        assert_eq!(json["identifier"], "11222333000181");

        let parsed: ValidationRecord = serde_json::from_value(json).unwrap();
        assert!(parsed.is_error());

        let success = ValidationRecord::success("11222333000181", serde_json::json!({"razao_social": "ACME"}));
        let parsed: ValidationRecord =
            serde_json::from_value(serde_json::to_value(&success).unwrap()).unwrap();
        assert!(!parsed.is_error());
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Audit.predecessors(), &[Stage::Extraction, Stage::Validation]);
        assert_eq!("indexing".parse::<Stage>().unwrap(), Stage::Indexing);
        assert!("report".parse::<Stage>().is_err());
    }
}

//! Fiscal Pipeline Orchestrator
//!
//! Runs batches of fiscal documents through a fixed six-stage pipeline:
//! extraction, validation, audit, classification, analysis and indexing.
//!
//! Stages never call each other. They communicate only through typed events
//! on a shared bus, and the dispatcher alone decides what runs next. Job
//! state lives in an expiring job store that callers poll.
//!
//! FLOW:
//! SUBMIT → task:start → STAGE → task:completed → DISPATCH → ... → REPORT

pub mod agents;
pub mod api;
pub mod audit;
pub mod bridge;
pub mod cache;
pub mod company_registry;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fiscal;
pub mod inference;
pub mod models;
pub mod orchestrator;
pub mod payload;
pub mod state;
pub mod tools;
pub mod vector_index;

pub use error::{PipelineError, Result};

// Re-export common types
pub use config::PipelineConfig;
pub use events::{Event, EventBus, EventHandler, EventName};
pub use models::*;
pub use orchestrator::{Collaborators, Orchestrator};
pub use payload::{ExecutiveReport, PipelinePayload, StageFindings};

//! Event audit trail and failure alerting
//!
//! Passive observers: they record what crossed the bus and never publish or
//! take part in recovery.

use crate::events::{Event, EventHandler, EventName};
use crate::models::Stage;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedEvent {
    pub sequence: u64,
    pub name: EventName,
    pub stage: Option<Stage>,
    pub body: Value,
    pub recorded_at: DateTime<Utc>,
}

fn stage_of(event: &Event) -> Option<Stage> {
    match event {
        Event::TaskStart(m) => Some(m.task_name),
        Event::TaskCompleted(m) => Some(m.task_name),
        Event::TaskFailed(m) => Some(m.task_name),
        Event::ToolRun(_) | Event::ToolCompleted(_) => None,
    }
}

/// Per-job record of every event seen, in arrival order
pub struct EventLog {
    records: Arc<RwLock<HashMap<Uuid, Vec<LoggedEvent>>>>,
    sequence: AtomicU64,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            sequence: AtomicU64::new(0),
        }
    }

    pub async fn record(&self, event: &Event) -> Result<u64> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let entry = LoggedEvent {
            sequence,
            name: event.name(),
            stage: stage_of(event),
            body: event.to_wire()?,
            recorded_at: Utc::now(),
        };

        let mut records = self.records.write().await;
        records.entry(event.job_id()).or_default().push(entry);
        Ok(sequence)
    }

    pub async fn events_for(&self, job_id: Uuid) -> Vec<LoggedEvent> {
        let records = self.records.read().await;
        let mut events = records.get(&job_id).cloned().unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        events
    }

    /// Stages named by `name` events of one job, in order
    pub async fn stages_for(&self, job_id: Uuid, name: EventName) -> Vec<Stage> {
        self.events_for(job_id)
            .await
            .into_iter()
            .filter(|e| e.name == name)
            .filter_map(|e| e.stage)
            .collect()
    }

    /// Jobs with a recorded trail
    pub async fn job_ids(&self) -> Vec<Uuid> {
        self.records.read().await.keys().copied().collect()
    }

    /// Forget a job's trail
    pub async fn clear(&self, job_id: Uuid) -> usize {
        self.records
            .write()
            .await
            .remove(&job_id)
            .map(|events| events.len())
            .unwrap_or(0)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventHandler for EventLog {
    fn label(&self) -> &str {
        "event-log"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        self.record(&event).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub job_id: Uuid,
    pub stage: Stage,
    pub error: String,
}

/// Alerts kept for inspection; older ones are dropped first
pub const MAX_RETAINED_ALERTS: usize = 256;

/// Observes `task:failed` for out-of-band notification
pub struct FailureAlerter {
    alerts: RwLock<VecDeque<Alert>>,
    capacity: usize,
    count: AtomicUsize,
}

impl FailureAlerter {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RETAINED_ALERTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            alerts: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            count: AtomicUsize::new(0),
        }
    }

    /// Total failures observed, including alerts no longer retained
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.iter().cloned().collect()
    }

    /// Hand over and forget the retained alerts
    pub async fn drain(&self) -> Vec<Alert> {
        self.alerts.write().await.drain(..).collect()
    }
}

impl Default for FailureAlerter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventHandler for FailureAlerter {
    fn label(&self) -> &str {
        "failure-alerter"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let Event::TaskFailed(failed) = event else {
            return Ok(());
        };

        error!(
            job_id = %failed.job_id,
            stage = %failed.task_name,
            error = %failed.error,
            "ALERT: pipeline stage failed"
        );

        let mut alerts = self.alerts.write().await;
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(Alert {
            job_id: failed.job_id,
            stage: failed.task_name,
            error: failed.error,
        });
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//! Event fabric
//!
//! Typed publish/subscribe bus decoupling stage agents, the dispatcher and
//! external collaborators by event name. Each bus is an explicit instance;
//! nothing is registered globally.
//!
//! Delivery: every current subscriber of an event name receives the event in
//! its own spawned task, scheduled in subscription order. A slow or failing
//! handler never blocks the publisher or the other handlers.

use crate::models::{Stage, ToolCall, ToolResult};
use crate::payload::PipelinePayload;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

//
// ================= Event Names =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "task:start")]
    TaskStart,
    #[serde(rename = "task:completed")]
    TaskCompleted,
    #[serde(rename = "task:failed")]
    TaskFailed,
    #[serde(rename = "tool:run")]
    ToolRun,
    #[serde(rename = "orchestrator:tool_completed")]
    ToolCompleted,
}

impl EventName {
    pub const ALL: [EventName; 5] = [
        EventName::TaskStart,
        EventName::TaskCompleted,
        EventName::TaskFailed,
        EventName::ToolRun,
        EventName::ToolCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::TaskStart => "task:start",
            EventName::TaskCompleted => "task:completed",
            EventName::TaskFailed => "task:failed",
            EventName::ToolRun => "tool:run",
            EventName::ToolCompleted => "orchestrator:tool_completed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Messages =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStart {
    pub job_id: Uuid,
    pub task_name: Stage,
    pub payload: PipelinePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleted {
    pub job_id: Uuid,
    pub task_name: Stage,
    /// The stage's own findings
    pub result_payload: Value,
    /// Incoming payload plus the stage's contribution
    pub payload: PipelinePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailed {
    pub job_id: Uuid,
    pub task_name: Stage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolRun {
    pub job_id: Uuid,
    pub tool_call: ToolCall,
    pub payload: PipelinePayload,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCompleted {
    pub job_id: Uuid,
    pub tool_result: ToolResult,
    pub original_payload: PipelinePayload,
    pub prompt: String,
    pub tool_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TaskStart(TaskStart),
    TaskCompleted(TaskCompleted),
    TaskFailed(TaskFailed),
    ToolRun(ToolRun),
    ToolCompleted(ToolCompleted),
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::TaskStart(_) => EventName::TaskStart,
            Event::TaskCompleted(_) => EventName::TaskCompleted,
            Event::TaskFailed(_) => EventName::TaskFailed,
            Event::ToolRun(_) => EventName::ToolRun,
            Event::ToolCompleted(_) => EventName::ToolCompleted,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            Event::TaskStart(m) => m.job_id,
            Event::TaskCompleted(m) => m.job_id,
            Event::TaskFailed(m) => m.job_id,
            Event::ToolRun(m) => m.job_id,
            Event::ToolCompleted(m) => m.job_id,
        }
    }

    /// Message body as it appears on the wire
    pub fn to_wire(&self) -> Result<Value> {
        let value = match self {
            Event::TaskStart(m) => serde_json::to_value(m)?,
            Event::TaskCompleted(m) => serde_json::to_value(m)?,
            Event::TaskFailed(m) => serde_json::to_value(m)?,
            Event::ToolRun(m) => serde_json::to_value(m)?,
            Event::ToolCompleted(m) => serde_json::to_value(m)?,
        };
        Ok(value)
    }
}

//
// ================= Handlers =================
//

/// A consumer of events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Label used in logs
    fn label(&self) -> &str {
        "handler"
    }

    async fn handle(&self, event: Event) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

//
// ================= Bus =================
//

struct BusInner {
    subscribers: RwLock<HashMap<EventName, Vec<Subscription>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Cloneable handle to one event bus instance
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register `handler` for `name`.
    ///
    /// Registering the same handler instance twice for the same name returns
    /// the existing subscription.
    pub async fn subscribe(
        &self,
        name: EventName,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let mut subscribers = self.inner.subscribers.write().await;
        let entries = subscribers.entry(name).or_default();

        if let Some(existing) = entries.iter().find(|s| same_handler(&s.handler, &handler)) {
            return existing.id;
        }

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(event = %name, handler = handler.label(), "Subscribed");
        entries.push(Subscription { id, handler });
        id
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write().await;
        let mut removed = false;
        for entries in subscribers.values_mut() {
            let before = entries.len();
            entries.retain(|s| s.id != id);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Fire-and-forget delivery to every current subscriber of the event's
    /// name. Returns the number of handlers scheduled.
    pub async fn publish(&self, event: Event) -> usize {
        if self.is_closed() {
            debug!(event = %event.name(), "Bus closed, dropping event");
            return 0;
        }

        let name = event.name();
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscribers = self.inner.subscribers.read().await;
            subscribers
                .get(&name)
                .map(|entries| entries.iter().map(|s| Arc::clone(&s.handler)).collect())
                .unwrap_or_default()
        };

        debug!(
            event = %name,
            job_id = %event.job_id(),
            handlers = handlers.len(),
            "Publishing event"
        );

        for handler in &handlers {
            let handler = Arc::clone(handler);
            let event = event.clone();
            tokio::spawn(async move {
                let job_id = event.job_id();
                if let Err(e) = handler.handle(event).await {
                    warn!(
                        event = %name,
                        job_id = %job_id,
                        handler = handler.label(),
                        error = %e,
                        "Event handler failed"
                    );
                }
            });
        }

        handlers.len()
    }

    pub async fn subscriber_count(&self, name: EventName) -> usize {
        let subscribers = self.inner.subscribers.read().await;
        subscribers.get(&name).map(Vec::len).unwrap_or(0)
    }

    /// Drop every subscription; later publishes deliver to nobody.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscribers.write().await.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recorder {
        tag: &'static str,
        delay: Option<Duration>,
        fail: bool,
        tx: mpsc::UnboundedSender<(&'static str, Uuid)>,
    }

    #[async_trait::async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: Event) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let _ = self.tx.send((self.tag, event.job_id()));
            if self.fail {
                return Err(PipelineError::StageExecution("boom".into()));
            }
            Ok(())
        }
    }

    fn recorder(
        tag: &'static str,
        tx: &mpsc::UnboundedSender<(&'static str, Uuid)>,
    ) -> Arc<Recorder> {
        Arc::new(Recorder {
            tag,
            delay: None,
            fail: false,
            tx: tx.clone(),
        })
    }

    fn failed(job_id: Uuid) -> Event {
        Event::TaskFailed(TaskFailed {
            job_id,
            task_name: Stage::Audit,
            error: "x".into(),
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<(&'static str, Uuid)>) -> (&'static str, Uuid) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_delivers_only_to_matching_name() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(EventName::TaskFailed, recorder("failed", &tx)).await;
        bus.subscribe(EventName::TaskCompleted, recorder("completed", &tx)).await;

        let job_id = Uuid::new_v4();
        assert_eq!(bus.publish(failed(job_id)).await, 1);
        assert_eq!(recv(&mut rx).await, ("failed", job_id));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_or_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(
            EventName::TaskFailed,
            Arc::new(Recorder {
                tag: "slow",
                delay: Some(Duration::from_millis(300)),
                fail: false,
                tx: tx.clone(),
            }),
        )
        .await;
        bus.subscribe(
            EventName::TaskFailed,
            Arc::new(Recorder {
                tag: "failing",
                delay: None,
                fail: true,
                tx: tx.clone(),
            }),
        )
        .await;
        bus.subscribe(EventName::TaskFailed, recorder("fast", &tx)).await;

        assert_eq!(bus.publish(failed(Uuid::new_v4())).await, 3);

        let first = recv(&mut rx).await.0;
        let second = recv(&mut rx).await.0;
        assert_ne!(first, "slow");
        assert_ne!(second, "slow");
        assert_eq!(recv(&mut rx).await.0, "slow");
    }

    #[tokio::test]
    async fn test_subscription_is_idempotent_per_handler() {
        let bus = EventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn EventHandler> = recorder("a", &tx);

        let first = bus.subscribe(EventName::ToolRun, Arc::clone(&handler)).await;
        let second = bus.subscribe(EventName::ToolRun, Arc::clone(&handler)).await;
        assert_eq!(first, second);
        assert_eq!(bus.subscriber_count(EventName::ToolRun).await, 1);

        // same handler on another name is a separate registration
        bus.subscribe(EventName::TaskStart, handler).await;
        assert_eq!(bus.subscriber_count(EventName::TaskStart).await, 1);

        assert!(bus.unsubscribe(first).await);
        assert_eq!(bus.subscriber_count(EventName::ToolRun).await, 0);
    }

    #[tokio::test]
    async fn test_instances_are_independent_and_closable() {
        let a = EventBus::new();
        let b = EventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        a.subscribe(EventName::TaskFailed, recorder("a", &tx)).await;
        assert_eq!(b.publish(failed(Uuid::new_v4())).await, 0);

        a.close().await;
        assert!(a.is_closed());
        assert_eq!(a.publish(failed(Uuid::new_v4())).await, 0);
        assert_eq!(a.subscriber_count(EventName::TaskFailed).await, 0);
    }

    #[test]
    fn test_wire_field_names() {
        let event = Event::ToolCompleted(ToolCompleted {
            job_id: Uuid::nil(),
            tool_result: ToolResult::success("tax_simulation", serde_json::json!({"ok": true})),
            original_payload: PipelinePayload::default(),
            prompt: "p".into(),
            tool_name: "tax_simulation".into(),
        });
        let wire = event.to_wire().unwrap();
        for key in ["jobId", "toolResult", "originalPayload", "prompt", "toolName"] {
            assert!(wire.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(event.name().as_str(), "orchestrator:tool_completed");
    }
}

//! Orchestrator facade
//!
//! Wires one event bus, the job store, the dispatcher, the six stage runners,
//! the tool executor and the passive observers together, and exposes the
//! job-level entry points.

use crate::agents::{
    AgentRunner, AnalysisAgent, AuditAgent, ClassificationAgent, ExtractionAgent, IndexingAgent,
    StageAgent, ValidationAgent,
};
use crate::audit::{EventLog, FailureAlerter};
use crate::bridge::ToolBridge;
use crate::cache::SemanticCache;
use crate::company_registry::{CompanyRegistry, HttpCompanyRegistry};
use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::PipelineError;
use crate::events::{EventBus, EventName};
use crate::inference::{GeminiProvider, InferenceProvider, MockInferenceProvider};
use crate::models::{FiscalDocument, Job};
use crate::state::{InMemoryJobStore, JobStore, PostgresJobStore};
use crate::tools::{create_default_registry, ToolExecutor, ToolRegistry, TAX_SIMULATION};
use crate::vector_index::{InMemoryVectorIndex, VectorIndex};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// External collaborators the core talks to
pub struct Collaborators {
    pub provider: Arc<dyn InferenceProvider>,
    pub registry: Arc<dyn CompanyRegistry>,
    pub index: Arc<dyn VectorIndex>,
    pub store: Arc<dyn JobStore>,
    pub tools: Arc<ToolRegistry>,
}

impl Collaborators {
    /// Pick backends from configuration: Gemini when a key is set, Postgres
    /// when a database url is set, in-memory otherwise.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let provider: Arc<dyn InferenceProvider> = match &config.gemini_api_key {
            Some(key) => Arc::new(GeminiProvider::new(key.clone())?),
            None => {
                warn!("GEMINI_API_KEY not set, using mock inference provider");
                Arc::new(MockInferenceProvider::new())
            }
        };

        let store: Arc<dyn JobStore> = match &config.database_url {
            Some(url) => Arc::new(PostgresJobStore::connect_lazy(url, config.job_ttl)?),
            None => {
                info!("Job store backend: in-memory");
                Arc::new(InMemoryJobStore::new(config.job_ttl))
            }
        };

        Ok(Self {
            provider,
            registry: Arc::new(HttpCompanyRegistry::new(config.registry_base_url.clone())?),
            index: Arc::new(InMemoryVectorIndex::new()),
            store,
            tools: Arc::new(create_default_registry()),
        })
    }
}

pub struct Orchestrator {
    bus: EventBus,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<SemanticCache>,
    bridge: Arc<ToolBridge>,
    event_log: Arc<EventLog>,
    alerter: Arc<FailureAlerter>,
}

/// Drops everything kept for jobs past their retention window
#[derive(Clone)]
struct RetentionSweep {
    store: Arc<dyn JobStore>,
    cache: Arc<SemanticCache>,
    bridge: Arc<ToolBridge>,
    event_log: Arc<EventLog>,
}

impl RetentionSweep {
    async fn run(&self) -> Result<usize> {
        let purged = self.store.purge_expired().await?;
        let expired_entries = self.cache.purge_expired().await;

        let mut forgotten = 0;
        for job_id in self.event_log.job_ids().await {
            if self.store.get(job_id).await?.is_some() {
                continue;
            }
            let events = self.event_log.clear(job_id).await;
            let entries = self.cache.invalidate_job(job_id).await;
            self.bridge.release_job(job_id).await;
            debug!(job_id = %job_id, events, entries, "Dropped trail of expired job");
            forgotten += 1;
        }

        if purged + expired_entries + forgotten > 0 {
            debug!(purged, expired_entries, forgotten, "Retention sweep finished");
        }
        Ok(forgotten)
    }
}

impl Orchestrator {
    /// Build the pipeline and register every subscriber on a fresh bus.
    pub async fn start(config: &PipelineConfig, collaborators: Collaborators) -> Self {
        let bus = EventBus::new();
        let store = collaborators.store;
        let cache = Arc::new(SemanticCache::new(config.cache_ttl));
        let bridge = Arc::new(ToolBridge::new(config.max_tool_round_trips));

        let agents: Vec<Arc<dyn StageAgent>> = vec![
            Arc::new(ExtractionAgent::new(collaborators.provider.clone())),
            Arc::new(ValidationAgent::new(
                collaborators.registry,
                config.lookup_delay,
            )),
            Arc::new(AuditAgent),
            Arc::new(ClassificationAgent::new(collaborators.provider.clone())),
            Arc::new(AnalysisAgent::new(
                collaborators.provider,
                collaborators.tools.spec(TAX_SIMULATION),
                config.tax_simulation_threshold,
            )),
            Arc::new(IndexingAgent::new(collaborators.index)),
        ];

        for agent in agents {
            let runner = Arc::new(AgentRunner::new(
                agent,
                Arc::clone(&store),
                bus.clone(),
                Arc::clone(&cache),
                Arc::clone(&bridge),
            ));
            bus.subscribe(EventName::TaskStart, runner.clone()).await;
            bus.subscribe(EventName::ToolCompleted, runner).await;
        }

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), bus.clone()));
        bus.subscribe(EventName::TaskCompleted, dispatcher.clone()).await;
        bus.subscribe(EventName::TaskFailed, dispatcher.clone()).await;

        let executor = Arc::new(ToolExecutor::new(collaborators.tools, bus.clone()));
        bus.subscribe(EventName::ToolRun, executor).await;

        let event_log = Arc::new(EventLog::new());
        for name in EventName::ALL {
            bus.subscribe(name, event_log.clone()).await;
        }

        let alerter = Arc::new(FailureAlerter::new());
        bus.subscribe(EventName::TaskFailed, alerter.clone()).await;

        info!("Pipeline orchestrator started");

        Self {
            bus,
            store,
            dispatcher,
            cache,
            bridge,
            event_log,
            alerter,
        }
    }

    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(config)?;
        Ok(Self::start(config, collaborators).await)
    }

    /// Submit documents as a new job; returns its id immediately.
    pub async fn submit(&self, documents: Vec<FiscalDocument>) -> Result<Uuid> {
        self.dispatcher.start_job(documents).await
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }

    /// Poll until the job reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_completion(&self, job_id: Uuid, timeout: Duration) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.store.get(job_id).await? {
                Some(job) if job.is_terminal() => return Ok(job),
                Some(_) => {}
                None => {
                    return Err(PipelineError::StateError(format!(
                        "job {} not found",
                        job_id
                    )))
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::Timeout(format!(
                    "job {} still processing after {:?}",
                    job_id, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn retention(&self) -> RetentionSweep {
        RetentionSweep {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            bridge: Arc::clone(&self.bridge),
            event_log: Arc::clone(&self.event_log),
        }
    }

    /// Drop expired job records together with their event trails, cache
    /// entries and pending tool calls. Returns how many job trails were
    /// forgotten.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.retention().run().await
    }

    /// Run `sweep_expired` every `every`.
    pub fn spawn_retention_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let sweep = self.retention();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep.run().await {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
        })
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        Arc::clone(&self.event_log)
    }

    pub fn alerter(&self) -> Arc<FailureAlerter> {
        Arc::clone(&self.alerter)
    }

    pub fn cache(&self) -> Arc<SemanticCache> {
        Arc::clone(&self.cache)
    }

    pub async fn shutdown(&self) {
        self.bus.close().await;
        info!("Pipeline orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::{INVOICE_A, INVOICE_B};
    use crate::company_registry::StaticCompanyRegistry;
    use crate::dispatcher::{stage_result, EXECUTIVE_REPORT_KEY};
    use crate::models::{JobStatus, Stage, StepStatus};
    use crate::tools::Tool;
    use serde_json::{json, Value};

    const INVOICE_C: &str = "DANFE 003\n\
        CNPJ: 12.345.678/0001-95\n\
        CFOP 1202 Devolucao de venda\n\
        CST 060\n\
        NCM 3004.90.99\n\
        Valor Total da Nota: 2.500,00";

    const WAIT: Duration = Duration::from_secs(10);

    fn config() -> PipelineConfig {
        PipelineConfig {
            lookup_delay: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    fn three_documents() -> Vec<FiscalDocument> {
        vec![
            FiscalDocument::new("nf-001.txt", INVOICE_A),
            FiscalDocument::new("nf-002.txt", INVOICE_B),
            FiscalDocument::new("nf-003.txt", INVOICE_C),
        ]
    }

    struct Harness {
        orchestrator: Orchestrator,
        provider: Arc<MockInferenceProvider>,
        registry: Arc<StaticCompanyRegistry>,
    }

    async fn harness_with(
        provider: MockInferenceProvider,
        registry: StaticCompanyRegistry,
        tools: ToolRegistry,
    ) -> Harness {
        let provider = Arc::new(provider);
        let registry = Arc::new(registry);
        let orchestrator = Orchestrator::start(
            &config(),
            Collaborators {
                provider: provider.clone(),
                registry: registry.clone(),
                index: Arc::new(InMemoryVectorIndex::new()),
                store: Arc::new(InMemoryJobStore::default()),
                tools: Arc::new(tools),
            },
        )
        .await;

        Harness {
            orchestrator,
            provider,
            registry,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            MockInferenceProvider::new(),
            StaticCompanyRegistry::new(),
            create_default_registry(),
        )
        .await
    }

    #[tokio::test]
    async fn test_three_documents_run_every_stage_in_order() {
        let h = harness().await;
        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();

        let job = h.orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
        assert!(job.error.is_none());
        assert!(job.pipeline.iter().all(|s| s.status == StepStatus::Completed));

        let result = job.result.as_ref().unwrap();
        for stage in Stage::ALL {
            assert!(result.get(stage.as_str()).is_some(), "missing {}", stage);
        }

        let report = &result[EXECUTIVE_REPORT_KEY];
        assert_eq!(report["documents"], 3);
        assert_eq!(report["totalValue"], 153680.0);
        assert_eq!(report["flaggedDocuments"], 2);
        assert_eq!(report["validatedCompanies"], 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let log = h.orchestrator.event_log();
        assert_eq!(
            log.stages_for(job_id, EventName::TaskStart).await,
            Stage::ALL.to_vec()
        );
        assert_eq!(
            log.stages_for(job_id, EventName::TaskCompleted).await,
            Stage::ALL.to_vec()
        );
        assert_eq!(h.registry.calls(), 3);
    }

    #[tokio::test]
    async fn test_tool_round_trip_happens_exactly_once() {
        let h = harness().await;
        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();
        let job = h.orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = h.orchestrator.event_log().events_for(job_id).await;
        let count = |name: EventName| events.iter().filter(|e| e.name == name).count();
        assert_eq!(count(EventName::ToolRun), 1);
        assert_eq!(count(EventName::ToolCompleted), 1);
        assert_eq!(count(EventName::TaskCompleted), 6);

        let analysis = stage_result(&job, Stage::Analysis).unwrap();
        assert_eq!(analysis["simulations"].as_array().unwrap().len(), 1);
        assert_eq!(
            analysis["simulations"][0]["output"]["recommended"],
            "simples_nacional"
        );
        assert_eq!(analysis["report"]["simulationIncluded"], true);
        // initial request plus the resumed synthesis
        assert_eq!(h.provider.calls_for(Stage::Analysis), 2);
    }

    #[tokio::test]
    async fn test_single_failed_lookup_keeps_job_going() {
        let ids = [
            "11.222.333/0001-81",
            "44.555.666/0001-99",
            "99.888.777/0001-66",
            "12.345.678/0001-95",
            "98.765.432/0001-10",
        ];
        let documents = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                FiscalDocument::new(format!("nf-{}", i), format!("CNPJ {}\nCFOP 5102", id))
            })
            .collect();

        let h = harness_with(
            MockInferenceProvider::new(),
            StaticCompanyRegistry::new().with_failure("99888777000166"),
            create_default_registry(),
        )
        .await;

        let job_id = h.orchestrator.submit(documents).await.unwrap();
        let job = h.orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let validation = stage_result(&job, Stage::Validation).unwrap();
        let records = validation["records"].as_array().unwrap();
        assert_eq!(records.len(), 5);
        let errors: Vec<&Value> = records.iter().filter(|r| r["error"] == true).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["identifier"], "99888777000166");
        assert_eq!(job.result.as_ref().unwrap()[EXECUTIVE_REPORT_KEY]["failedLookups"], 1);
    }

    #[tokio::test]
    async fn test_malformed_provider_reply_fails_only_that_stage() {
        let h = harness_with(
            MockInferenceProvider::new().with_reply(Stage::Classification, "no json here"),
            StaticCompanyRegistry::new(),
            create_default_registry(),
        )
        .await;

        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();
        let job = h.orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_step().unwrap().index, Stage::Classification.index());
        assert!(job.error.as_deref().unwrap().contains("decode"));

        let statuses: Vec<StepStatus> = job.pipeline.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Completed,
                StepStatus::Completed,
                StepStatus::Completed,
                StepStatus::Failed,
                StepStatus::Pending,
                StepStatus::Pending,
            ]
        );

        let result = job.result.as_ref().unwrap();
        assert!(result.get("classification").is_none());
        assert!(result.get(EXECUTIVE_REPORT_KEY).is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.orchestrator.alerter().count(), 1);
    }

    struct BrokenSimulation;

    #[async_trait::async_trait]
    impl Tool for BrokenSimulation {
        fn name(&self) -> &'static str {
            TAX_SIMULATION
        }
        fn description(&self) -> &'static str {
            "always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: &Value) -> Result<Value> {
            Err(PipelineError::ToolInvocation("simulation backend down".into()))
        }
    }

    #[tokio::test]
    async fn test_tool_failure_fails_originating_stage() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(BrokenSimulation));
        let h = harness_with(MockInferenceProvider::new(), StaticCompanyRegistry::new(), tools).await;

        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();
        let job = h.orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_step().unwrap().name, Stage::Analysis);
        assert!(job.error.unwrap().contains("simulation backend down"));
    }

    fn rank(status: StepStatus) -> u8 {
        match status {
            StepStatus::Pending => 0,
            StepStatus::InProgress => 1,
            StepStatus::Completed | StepStatus::Failed => 2,
        }
    }

    #[tokio::test]
    async fn test_step_status_never_regresses() {
        let h = harness().await;
        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();

        let mut snapshots = Vec::new();
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let job = h.orchestrator.job(job_id).await.unwrap().unwrap();
            let in_progress = job
                .pipeline
                .iter()
                .filter(|s| s.status == StepStatus::InProgress)
                .count();
            assert!(in_progress <= 1);

            let done = job.is_terminal();
            snapshots.push(job.pipeline);
            if done || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::task::yield_now().await;
        }

        for window in snapshots.windows(2) {
            for (before, after) in window[0].iter().zip(&window[1]) {
                assert!(rank(before.status) <= rank(after.status), "step {} regressed", before.index);
            }
        }
        let last = snapshots.last().unwrap();
        assert!(last.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_payload_reaches_later_stages() {
        let h = harness().await;
        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();
        h.orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = h.orchestrator.event_log().events_for(job_id).await;
        let indexing_start = events
            .iter()
            .find(|e| e.name == EventName::TaskStart && e.stage == Some(Stage::Indexing))
            .unwrap();

        let payload = &indexing_start.body["payload"];
        for stage in &Stage::ALL[..Stage::Indexing.index()] {
            assert!(payload.get(stage.as_str()).is_some(), "payload lacks {}", stage);
        }
        assert_eq!(payload["documents"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_each_stage_starts_with_previous_completed_payload() {
        let h = harness().await;
        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();
        let job = h.orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = h.orchestrator.event_log().events_for(job_id).await;
        let payload_of = |name: EventName, stage: Stage| -> Value {
            let matching: Vec<&Value> = events
                .iter()
                .filter(|e| e.name == name && e.stage == Some(stage))
                .map(|e| &e.body["payload"])
                .collect();
            assert_eq!(matching.len(), 1, "{} {}", name.as_str(), stage);
            matching[0].clone()
        };

        for pair in Stage::ALL.windows(2) {
            let (previous, stage) = (pair[0], pair[1]);
            let completed = payload_of(EventName::TaskCompleted, previous);
            let started = payload_of(EventName::TaskStart, stage);
            assert_eq!(started, completed, "{} did not receive {}'s payload", stage, previous);
            assert!(started.get(previous.as_str()).is_some());
        }
    }

    #[tokio::test]
    async fn test_retention_sweep_forgets_expired_jobs() {
        let config = PipelineConfig {
            lookup_delay: Duration::ZERO,
            job_ttl: Duration::from_secs(1),
            ..PipelineConfig::default()
        };
        let orchestrator = Orchestrator::start(
            &config,
            Collaborators {
                provider: Arc::new(MockInferenceProvider::new()),
                registry: Arc::new(StaticCompanyRegistry::new()),
                index: Arc::new(InMemoryVectorIndex::new()),
                store: Arc::new(InMemoryJobStore::new(config.job_ttl)),
                tools: Arc::new(create_default_registry()),
            },
        )
        .await;

        let job_id = orchestrator.submit(three_documents()).await.unwrap();
        orchestrator.wait_for_completion(job_id, WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // nothing is dropped while the job is retained
        assert_eq!(orchestrator.sweep_expired().await.unwrap(), 0);
        assert!(!orchestrator.event_log().events_for(job_id).await.is_empty());
        assert!(orchestrator.cache().stats().await.entries > 0);

        let sweeper = orchestrator.spawn_retention_sweeper(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(1300)).await;
        sweeper.abort();

        assert!(orchestrator.job(job_id).await.unwrap().is_none());
        assert!(orchestrator.event_log().events_for(job_id).await.is_empty());
        assert_eq!(orchestrator.cache().stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_and_timeout() {
        let h = harness().await;
        assert!(h.orchestrator.job(Uuid::new_v4()).await.unwrap().is_none());
        assert!(matches!(
            h.orchestrator
                .wait_for_completion(Uuid::new_v4(), Duration::from_millis(10))
                .await,
            Err(PipelineError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let h = harness().await;
        h.orchestrator.shutdown().await;

        let job_id = h.orchestrator.submit(three_documents()).await.unwrap();
        assert!(matches!(
            h.orchestrator
                .wait_for_completion(job_id, Duration::from_millis(100))
                .await,
            Err(PipelineError::Timeout(_))
        ));
        assert_eq!(h.provider.calls(), 0);
    }
}

//! Tool trait, registry and executor
//!
//! Tools are deterministic, side-effect-free operations the inference provider
//! can request mid-stage. The executor answers `tool:run` events with exactly
//! one `orchestrator:tool_completed` event.

use crate::error::PipelineError;
use crate::events::{Event, EventBus, EventHandler, ToolCompleted};
use crate::models::{ToolResult, ToolSpec};
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const TAX_SIMULATION: &str = "tax_simulation";

/// Trait for a single tool (deterministic execution)
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the accepted arguments
    fn parameters(&self) -> Value;
    async fn execute(&self, args: &Value) -> Result<Value>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|tool| tool.spec())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with every built-in fiscal tool.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(TaxSimulationTool));
    registry
}

//
// ================= Tax Simulation =================
//

/// Simples Nacional, Annex I (commerce): (upper revenue bound, nominal rate, deduction)
const SIMPLES_BRACKETS: [(f64, f64, f64); 6] = [
    (180_000.0, 0.04, 0.0),
    (360_000.0, 0.073, 5_940.0),
    (720_000.0, 0.095, 13_860.0),
    (1_800_000.0, 0.107, 22_500.0),
    (3_600_000.0, 0.143, 87_300.0),
    (4_800_000.0, 0.19, 378_000.0),
];

const IRPJ_RATE: f64 = 0.15;
const IRPJ_SURCHARGE_RATE: f64 = 0.10;
/// Annual profit above which the IRPJ surcharge applies
const IRPJ_SURCHARGE_THRESHOLD: f64 = 240_000.0;
const CSLL_RATE: f64 = 0.09;

const PRESUMED_IRPJ_BASE: f64 = 0.08;
const PRESUMED_CSLL_BASE: f64 = 0.12;
const PRESUMED_PIS: f64 = 0.0065;
const PRESUMED_COFINS: f64 = 0.03;

const REAL_PIS: f64 = 0.0165;
const REAL_COFINS: f64 = 0.076;
const DEFAULT_PROFIT_MARGIN: f64 = 0.10;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn irpj(profit: f64) -> f64 {
    profit * IRPJ_RATE + (profit - IRPJ_SURCHARGE_THRESHOLD).max(0.0) * IRPJ_SURCHARGE_RATE
}

fn simples_nacional(revenue: f64) -> Value {
    match SIMPLES_BRACKETS.iter().find(|(limit, _, _)| revenue <= *limit) {
        Some((_, nominal, deduction)) => {
            let tax = (revenue * nominal - deduction).max(0.0);
            json!({
                "regime": "simples_nacional",
                "eligible": true,
                "effectiveRate": round2(tax / revenue * 100.0),
                "annualTax": round2(tax),
            })
        }
        None => json!({
            "regime": "simples_nacional",
            "eligible": false,
            "reason": "annual revenue above the Simples Nacional ceiling",
        }),
    }
}

fn lucro_presumido(revenue: f64) -> Value {
    let irpj = irpj(revenue * PRESUMED_IRPJ_BASE);
    let csll = revenue * PRESUMED_CSLL_BASE * CSLL_RATE;
    let pis = revenue * PRESUMED_PIS;
    let cofins = revenue * PRESUMED_COFINS;
    let total = irpj + csll + pis + cofins;

    json!({
        "regime": "lucro_presumido",
        "eligible": true,
        "effectiveRate": round2(total / revenue * 100.0),
        "annualTax": round2(total),
        "breakdown": {
            "irpj": round2(irpj),
            "csll": round2(csll),
            "pis": round2(pis),
            "cofins": round2(cofins),
        },
    })
}

fn lucro_real(revenue: f64, margin: f64) -> Value {
    let profit = revenue * margin;
    let irpj = irpj(profit);
    let csll = profit * CSLL_RATE;
    let pis = revenue * REAL_PIS;
    let cofins = revenue * REAL_COFINS;
    let total = irpj + csll + pis + cofins;

    json!({
        "regime": "lucro_real",
        "eligible": true,
        "effectiveRate": round2(total / revenue * 100.0),
        "annualTax": round2(total),
        "profitMargin": margin,
        "breakdown": {
            "irpj": round2(irpj),
            "csll": round2(csll),
            "pis": round2(pis),
            "cofins": round2(cofins),
        },
    })
}

/// Compares the annual tax burden of the three Brazilian corporate regimes
pub struct TaxSimulationTool;

#[async_trait::async_trait]
impl Tool for TaxSimulationTool {
    fn name(&self) -> &'static str {
        TAX_SIMULATION
    }

    fn description(&self) -> &'static str {
        "Simulate annual tax burden under Simples Nacional, Lucro Presumido and Lucro Real"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "annualRevenue": {
                    "type": "number",
                    "description": "Gross annual revenue in BRL"
                },
                "profitMargin": {
                    "type": "number",
                    "description": "Net margin used for Lucro Real, between 0 and 1"
                }
            },
            "required": ["annualRevenue"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let revenue = args
            .get("annualRevenue")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                PipelineError::InvalidToolInput("Expected numeric 'annualRevenue'".to_string())
            })?;

        if !revenue.is_finite() || revenue <= 0.0 {
            return Err(PipelineError::InvalidToolInput(format!(
                "annualRevenue must be positive, got {}",
                revenue
            )));
        }

        let margin = match args.get("profitMargin").and_then(Value::as_f64) {
            Some(m) if (0.0..=1.0).contains(&m) => m,
            Some(m) => {
                return Err(PipelineError::InvalidToolInput(format!(
                    "profitMargin must be between 0 and 1, got {}",
                    m
                )))
            }
            None => DEFAULT_PROFIT_MARGIN,
        };

        let regimes = vec![
            simples_nacional(revenue),
            lucro_presumido(revenue),
            lucro_real(revenue, margin),
        ];

        let eligible: Vec<(&str, f64)> = regimes
            .iter()
            .filter(|r| r["eligible"] == true)
            .filter_map(|r| Some((r["regime"].as_str()?, r["annualTax"].as_f64()?)))
            .collect();

        let best = eligible
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .copied();
        let worst = eligible.iter().map(|(_, tax)| *tax).fold(0.0, f64::max);

        let (recommended, savings) = match best {
            Some((name, tax)) => (json!(name), round2(worst - tax)),
            None => (Value::Null, 0.0),
        };

        Ok(json!({
            "annualRevenue": round2(revenue),
            "regimes": regimes,
            "recommended": recommended,
            "estimatedSavings": savings,
        }))
    }
}

//
// ================= Executor =================
//

/// Runs requested tools and reports back on the bus.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    bus: EventBus,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, bus: EventBus) -> Self {
        Self { registry, bus }
    }

    async fn run(&self, name: &str, args: &Value) -> ToolResult {
        let Some(tool) = self.registry.get(name) else {
            return ToolResult::failure(name, PipelineError::ToolNotFound(name.to_string()).to_string());
        };

        match tool.execute(args).await {
            Ok(output) => ToolResult::success(name, output),
            Err(e) => {
                warn!(tool = name, error = %e, "Tool execution failed");
                ToolResult::failure(name, e.to_string())
            }
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for ToolExecutor {
    fn label(&self) -> &str {
        "tool-executor"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let Event::ToolRun(run) = event else {
            return Ok(());
        };

        let name = run.tool_call.name.clone();
        info!(job_id = %run.job_id, tool = %name, "Executing tool");

        let tool_result = self.run(&name, &run.tool_call.args).await;

        self.bus
            .publish(Event::ToolCompleted(ToolCompleted {
                job_id: run.job_id,
                tool_result,
                original_payload: run.payload,
                prompt: run.prompt,
                tool_name: name,
            }))
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventName, ToolRun};
    use crate::models::ToolCall;
    use crate::payload::PipelinePayload;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn approx(a: &Value, b: f64) -> bool {
        (a.as_f64().unwrap() - b).abs() < 0.01
    }

    #[tokio::test]
    async fn test_simulation_prefers_simples_for_small_revenue() {
        let out = TaxSimulationTool
            .execute(&json!({"annualRevenue": 250000.0}))
            .await
            .unwrap();

        assert!(approx(&out["regimes"][0]["annualTax"], 12310.0));
        assert!(approx(&out["regimes"][1]["annualTax"], 14825.0));
        assert!(approx(&out["regimes"][2]["annualTax"], 29125.0));
        assert_eq!(out["recommended"], "simples_nacional");
        assert!(approx(&out["estimatedSavings"], 16815.0));
    }

    #[tokio::test]
    async fn test_simulation_above_simples_ceiling() {
        let out = TaxSimulationTool
            .execute(&json!({"annualRevenue": 5000000.0}))
            .await
            .unwrap();

        assert_eq!(out["regimes"][0]["eligible"], false);
        // presumed profit 400k -> 60k IRPJ + 16k surcharge
        assert!(approx(&out["regimes"][1]["breakdown"]["irpj"], 76000.0));
        assert_eq!(out["recommended"], "lucro_presumido");
    }

    #[tokio::test]
    async fn test_simulation_rejects_bad_input() {
        assert!(matches!(
            TaxSimulationTool.execute(&json!({})).await,
            Err(PipelineError::InvalidToolInput(_))
        ));
        assert!(TaxSimulationTool
            .execute(&json!({"annualRevenue": -1.0}))
            .await
            .is_err());
        assert!(TaxSimulationTool
            .execute(&json!({"annualRevenue": 1000.0, "profitMargin": 2.0}))
            .await
            .is_err());
    }

    #[test]
    fn test_registry_spec() {
        let registry = create_default_registry();
        let spec = registry.spec(TAX_SIMULATION).unwrap();
        assert_eq!(spec.parameters["required"][0], "annualRevenue");
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.list(), vec![TAX_SIMULATION]);
    }

    struct Capture(mpsc::UnboundedSender<ToolCompleted>);

    #[async_trait::async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, event: Event) -> Result<()> {
            if let Event::ToolCompleted(done) = event {
                let _ = self.0.send(done);
            }
            Ok(())
        }
    }

    async fn run_through_bus(call: ToolCall) -> ToolCompleted {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = ToolExecutor::new(Arc::new(create_default_registry()), bus.clone());

        bus.subscribe(EventName::ToolRun, Arc::new(executor)).await;
        bus.subscribe(EventName::ToolCompleted, Arc::new(Capture(tx))).await;

        bus.publish(Event::ToolRun(ToolRun {
            job_id: Uuid::new_v4(),
            tool_call: call,
            payload: PipelinePayload::default(),
            prompt: "analyze".into(),
        }))
        .await;

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_executor_publishes_completion() {
        let done = run_through_bus(ToolCall {
            name: TAX_SIMULATION.into(),
            args: json!({"annualRevenue": 100000.0}),
        })
        .await;

        assert_eq!(done.tool_name, TAX_SIMULATION);
        assert_eq!(done.prompt, "analyze");
        assert!(done.tool_result.error.is_none());
        assert_eq!(done.tool_result.output["recommended"], "simples_nacional");
    }

    #[tokio::test]
    async fn test_executor_reports_unknown_tool_as_failure() {
        let done = run_through_bus(ToolCall {
            name: "wire_transfer".into(),
            args: json!({}),
        })
        .await;

        assert!(done.tool_result.error.unwrap().contains("wire_transfer"));
    }
}

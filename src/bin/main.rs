use fiscal_pipeline_orchestrator::{
    company_registry::StaticCompanyRegistry,
    inference::MockInferenceProvider,
    models::FiscalDocument,
    state::InMemoryJobStore,
    tools::create_default_registry,
    vector_index::InMemoryVectorIndex,
    Collaborators, Orchestrator, PipelineConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn sample_batch() -> Vec<FiscalDocument> {
    vec![
        FiscalDocument::new(
            "nf-001.txt",
            "NOTA FISCAL ELETRONICA\n\
             Emitente CNPJ: 11.222.333/0001-81\n\
             CFOP: 5102 Venda de mercadoria\n\
             CST: 00\n\
             NCM: 8471.30.12\n\
             Base de Calculo do ICMS: 1.000,00\n\
             Aliquota: 18%\n\
             Valor do ICMS: 180,00\n\
             Valor Total da Nota: 1.180,00",
        ),
        FiscalDocument::new(
            "nf-002.txt",
            "NF-e 002\n\
             CNPJ 44.555.666/0001-99\n\
             CFOP 6108\n\
             CST 040\n\
             NCM 6403.99.90\n\
             Base de Calculo do ICMS: 10.000,00\n\
             Aliquota: 12%\n\
             Valor do ICMS: 1.500,00\n\
             Valor Total da Nota: 150.000,00",
        ),
        FiscalDocument::new(
            "nf-003.txt",
            "DANFE 003\n\
             CNPJ: 12.345.678/0001-95\n\
             CFOP 1202 Devolucao de venda\n\
             CST 060\n\
             NCM 3004.90.99\n\
             Valor Total da Nota: 2.500,00",
        ),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Fiscal pipeline demo starting");

    let config = PipelineConfig {
        lookup_delay: Duration::from_millis(100),
        ..PipelineConfig::default()
    };

    // Offline collaborators
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

    let job_id = orchestrator.submit(sample_batch()).await?;
    info!(job_id = %job_id, "Job submitted");

    let job = orchestrator
        .wait_for_completion(job_id, Duration::from_secs(30))
        .await?;

    println!("\n=== JOB {} ===", job.id);
    println!("Status: {}", job.status.as_str());
    for step in &job.pipeline {
        println!(
            "  {}. {:<15} {:?} {}",
            step.index + 1,
            step.name.as_str(),
            step.status,
            step.info.as_deref().unwrap_or("")
        );
    }
    if let Some(error) = &job.error {
        println!("Error: {}", error);
    }
    if let Some(report) = job.result.as_ref().and_then(|r| r.get("executiveReport")) {
        println!("\nExecutive report:\n{}", serde_json::to_string_pretty(report)?);
    }

    orchestrator.shutdown().await;
    Ok(())
}

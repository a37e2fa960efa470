//! Validation stage: sequential company-registry lookups of every distinct
//! CNPJ, paced by a fixed delay. A failed lookup becomes an error record and
//! never fails the stage.

use super::{StageAgent, StageContext, StageOutcome};
use crate::company_registry::CompanyRegistry;
use crate::error::PipelineError;
use crate::models::{Stage, ValidationRecord};
use crate::payload::{StageFindings, ValidationFindings};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ValidationAgent {
    registry: Arc<dyn CompanyRegistry>,
    delay: Duration,
}

impl ValidationAgent {
    pub fn new(registry: Arc<dyn CompanyRegistry>, delay: Duration) -> Self {
        Self { registry, delay }
    }

    async fn lookup(&self, cnpj: &str) -> ValidationRecord {
        match self.registry.lookup(cnpj).await {
            Ok(profile) => ValidationRecord::success(cnpj, profile),
            Err(PipelineError::ExternalLookup { message, .. }) => {
                warn!(cnpj, error = %message, "Registry lookup failed");
                ValidationRecord::failure(cnpj, message)
            }
            Err(e) => {
                warn!(cnpj, error = %e, "Registry lookup failed");
                ValidationRecord::failure(cnpj, e.to_string())
            }
        }
    }
}

#[async_trait::async_trait]
impl StageAgent for ValidationAgent {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let identifiers = ctx.payload.extraction()?.distinct_cnpjs();
        let mut records = Vec::with_capacity(identifiers.len());

        for (i, cnpj) in identifiers.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            debug!(job_id = %ctx.job_id, cnpj = %cnpj, position = i + 1, "Validating CNPJ");
            records.push(self.lookup(cnpj).await);
        }

        let failed_lookups = records.iter().filter(|r| r.is_error()).count();
        let info = format!(
            "{} of {} CNPJ(s) validated",
            records.len() - failed_lookups,
            records.len()
        );

        Ok(StageOutcome::completed(
            StageFindings::Validation(ValidationFindings {
                records,
                failed_lookups,
            }),
            info,
        ))
    }
}

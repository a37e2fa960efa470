//! External company registry (CNPJ lookup)
//!
//! One identifier in, a structured company profile or an `ExternalLookup`
//! error out. Callers are expected to pace their requests; the registry
//! itself does no rate limiting.

use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait CompanyRegistry: Send + Sync {
    async fn lookup(&self, cnpj: &str) -> Result<Value>;
}

fn lookup_error(cnpj: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::ExternalLookup {
        identifier: cnpj.to_string(),
        message: message.into(),
    }
}

/// Registry backed by a BrasilAPI-compatible `GET {base}/{cnpj}` endpoint
#[derive(Clone)]
pub struct HttpCompanyRegistry {
    client: Client,
    base_url: String,
}

impl HttpCompanyRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, cnpj: &str) -> String {
        format!("{}/{}", self.base_url, cnpj)
    }
}

#[async_trait]
impl CompanyRegistry for HttpCompanyRegistry {
    async fn lookup(&self, cnpj: &str) -> Result<Value> {
        let url = self.url_for(cnpj);
        debug!(cnpj, "Registry lookup");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| lookup_error(cnpj, format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(lookup_error(cnpj, "CNPJ not found in registry"));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(lookup_error(cnpj, "registry rate limit exceeded"));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| lookup_error(cnpj, format!("invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(lookup_error(
                cnpj,
                format!("registry returned {}: {}", status, body),
            ));
        }

        Ok(body)
    }
}

/// Fixed in-process registry for development and tests
#[derive(Default)]
pub struct StaticCompanyRegistry {
    profiles: HashMap<String, Value>,
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl StaticCompanyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, cnpj: impl Into<String>, profile: Value) -> Self {
        self.profiles.insert(cnpj.into(), profile);
        self
    }

    /// Make lookups of `cnpj` fail with a transport-style error
    pub fn with_failure(mut self, cnpj: impl Into<String>) -> Self {
        self.failing.insert(cnpj.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompanyRegistry for StaticCompanyRegistry {
    async fn lookup(&self, cnpj: &str) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.contains(cnpj) {
            return Err(lookup_error(cnpj, "registry unavailable"));
        }

        // unknown identifiers resolve to a minimal active profile
        Ok(self.profiles.get(cnpj).cloned().unwrap_or_else(|| {
            serde_json::json!({
                "cnpj": cnpj,
                "descricao_situacao_cadastral": "ATIVA",
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_building_trims_slash() {
        let registry = HttpCompanyRegistry::new("https://registry.test/api/cnpj/v1/").unwrap();
        assert_eq!(
            registry.url_for("11222333000181"),
            "https://registry.test/api/cnpj/v1/11222333000181"
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_lookup_error() {
        let registry = HttpCompanyRegistry::new("http://127.0.0.1:1").unwrap();
        match registry.lookup("11222333000181").await {
            Err(PipelineError::ExternalLookup { identifier, .. }) => {
                assert_eq!(identifier, "11222333000181")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_static_registry() {
        let registry = StaticCompanyRegistry::new()
            .with_profile("11222333000181", json!({"razao_social": "ACME LTDA"}))
            .with_failure("99888777000166");

        let profile = registry.lookup("11222333000181").await.unwrap();
        assert_eq!(profile["razao_social"], "ACME LTDA");
        assert!(registry.lookup("99888777000166").await.is_err());
        assert_eq!(
            registry.lookup("44555666000199").await.unwrap()["cnpj"],
            "44555666000199"
        );
        assert_eq!(registry.calls(), 3);
    }
}

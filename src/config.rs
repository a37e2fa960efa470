//! Pipeline configuration, read from the environment

use crate::error::PipelineError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REGISTRY_API_BASE_URL: &str = "https://brasilapi.com.br/api/cnpj/v1";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Job record retention window
    pub job_ttl: Duration,
    pub cache_ttl: Duration,
    /// Delay between sequential registry lookups of one job
    pub lookup_delay: Duration,
    /// Cap on suspend/resume cycles per stage
    pub max_tool_round_trips: u32,
    /// Aggregate invoice value above which analysis offers the tax simulation tool
    pub tax_simulation_threshold: f64,
    pub gemini_api_key: Option<String>,
    pub registry_base_url: String,
    pub database_url: Option<String>,
    pub port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            job_ttl: Duration::from_secs(24 * 60 * 60),
            cache_ttl: Duration::from_secs(60 * 60),
            lookup_delay: Duration::from_millis(1000),
            max_tool_round_trips: 3,
            tax_simulation_threshold: 100_000.0,
            gemini_api_key: None,
            registry_base_url: DEFAULT_REGISTRY_API_BASE_URL.to_string(),
            database_url: None,
            port: 8080,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match non_empty(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| PipelineError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}

impl PipelineConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            job_ttl: parse_var::<u64>("JOB_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_ttl),
            cache_ttl: parse_var::<u64>("CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            lookup_delay: parse_var::<u64>("REGISTRY_LOOKUP_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lookup_delay),
            max_tool_round_trips: parse_var("MAX_TOOL_ROUND_TRIPS")?
                .unwrap_or(defaults.max_tool_round_trips),
            tax_simulation_threshold: parse_var("TAX_SIMULATION_THRESHOLD")?
                .unwrap_or(defaults.tax_simulation_threshold),
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            registry_base_url: non_empty("REGISTRY_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.registry_base_url),
            database_url: non_empty("POSTGRES_URL").or_else(|| non_empty("DATABASE_URL")),
            port: match parse_var::<u16>("PORT")? {
                Some(port) => port,
                None => parse_var("API_PORT")?.unwrap_or(defaults.port),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_tool_round_trips, 3);
        assert_eq!(config.lookup_delay, Duration::from_secs(1));
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("FISCAL_TEST_BAD_NUMBER", "twelve");
        let parsed = parse_var::<u64>("FISCAL_TEST_BAD_NUMBER");
        assert!(matches!(parsed, Err(PipelineError::Config(_))));

        env::set_var("FISCAL_TEST_GOOD_NUMBER", " 42 ");
        assert_eq!(parse_var::<u64>("FISCAL_TEST_GOOD_NUMBER").unwrap(), Some(42));
        assert_eq!(parse_var::<u64>("FISCAL_TEST_UNSET_NUMBER").unwrap(), None);
    }
}

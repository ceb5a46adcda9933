//! Pipeline configuration.
//!
//! Everything has a default mirroring the shipped topology, so a bare
//! `Config::default()` is a runnable single-process pipeline. A TOML file
//! overrides selectively; the API token can also come from the
//! `CLAIMS_API_TOKEN` environment variable so it stays out of config
//! files.

use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const STAGE_IMPORTER: &str = "importer";
pub const STAGE_ENRICHER: &str = "enricher";
pub const STAGE_MERGER: &str = "merger";
pub const STAGE_OUTPUT: &str = "output";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the sqlite database holding the claims log, checkpoint,
    /// identity cache and merge records.
    pub database_path: String,
    /// Broker to attach to. Only the in-process `memory://` broker is
    /// currently implemented.
    pub broker_url: String,
    /// Topic exchange all pipeline queues bind to.
    pub exchange: String,
    /// Minimum similarity ratio for the author-position matcher.
    pub min_similarity_ratio: f64,
    /// How often the reconciliation engine polls the registry, seconds.
    pub poll_interval_secs: u64,
    /// Registry timestamps more than this far ahead of our local claim
    /// are re-emitted as `updated`, seconds.
    pub update_window_secs: i64,
    pub supervisor: SupervisorConfig,
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub stages: BTreeMap<String, StageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Fleet health-check interval, seconds.
    pub poll_interval_secs: u64,
    /// Recycle instances older than this, seconds. Zero disables.
    pub ttl_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            poll_interval_secs: 15,
            ttl_secs: 7200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Registry update feed; `{since}` is replaced with an RFC 3339
    /// timestamp.
    pub updates_endpoint: String,
    /// Public registry bio endpoint; `{id}` is replaced with the
    /// identity id.
    pub public_profile_endpoint: String,
    /// Institution search endpoint used to bootstrap name variants.
    pub search_endpoint: String,
    /// Bearer credential for the privileged endpoints.
    pub token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            updates_endpoint: "https://api.example.edu/v1/orcid/export/{since}".to_string(),
            public_profile_endpoint: "https://pub.orcid.org/v1.2/{id}/orcid-bio".to_string(),
            search_endpoint: "https://api.example.edu/v1/search/query".to_string(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 1024,
            ttl_secs: 3600,
        }
    }
}

/// Per-stage broker wiring. One subscribe topic, one publish topic, one
/// error topic; concurrency is the number of independent instances (the
/// importer must stay at one, its checkpoint write is not coordinated).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub concurrency: usize,
    pub subscribe: Option<String>,
    pub publish: Option<String>,
    pub error: Option<String>,
    pub durable: bool,
    pub forwarding: Option<ForwardingConfig>,
}

/// Secondary topology for stages that relay out of the pipeline. The
/// target exchange is mandatory.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingConfig {
    pub exchange: String,
    pub publish: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut stages = BTreeMap::new();
        stages.insert(
            STAGE_IMPORTER.to_string(),
            StageConfig {
                concurrency: 1,
                subscribe: Some("orcid.fresh-claims".to_string()),
                publish: Some("orcid.claims".to_string()),
                error: Some("orcid.error".to_string()),
                durable: true,
                forwarding: None,
            },
        );
        stages.insert(
            STAGE_ENRICHER.to_string(),
            StageConfig {
                concurrency: 1,
                subscribe: Some("orcid.claims".to_string()),
                publish: Some("orcid.updates".to_string()),
                error: Some("orcid.error".to_string()),
                durable: true,
                forwarding: None,
            },
        );
        stages.insert(
            STAGE_MERGER.to_string(),
            StageConfig {
                concurrency: 1,
                subscribe: Some("orcid.updates".to_string()),
                publish: Some("orcid.output".to_string()),
                error: Some("orcid.error".to_string()),
                durable: true,
                forwarding: None,
            },
        );
        stages.insert(
            STAGE_OUTPUT.to_string(),
            StageConfig {
                concurrency: 1,
                subscribe: Some("orcid.output".to_string()),
                publish: None,
                error: Some("orcid.error".to_string()),
                durable: true,
                forwarding: Some(ForwardingConfig {
                    exchange: "indexer".to_string(),
                    publish: Some("indexer.updates".to_string()),
                }),
            },
        );
        Config {
            database_path: "claims.db".to_string(),
            broker_url: "memory://local".to_string(),
            exchange: "orcid-claims".to_string(),
            min_similarity_ratio: 0.6,
            poll_interval_secs: 300,
            update_window_secs: 60,
            supervisor: SupervisorConfig::default(),
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            stages,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_env() -> Config {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("CLAIMS_API_TOKEN") {
            if !token.is_empty() {
                self.api.token = token;
            }
        }
    }

    pub fn stage(&self, name: &str) -> Result<&StageConfig> {
        self.stages
            .get(name)
            .ok_or_else(|| PipelineError::Config(format!("no stage named {:?} configured", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology_is_chained() {
        let config = Config::default();
        let importer = config.stage(STAGE_IMPORTER).unwrap();
        let enricher = config.stage(STAGE_ENRICHER).unwrap();
        let merger = config.stage(STAGE_MERGER).unwrap();
        let output = config.stage(STAGE_OUTPUT).unwrap();

        assert_eq!(importer.publish, enricher.subscribe);
        assert_eq!(enricher.publish, merger.subscribe);
        assert_eq!(merger.publish, output.subscribe);
        assert!(output.forwarding.is_some());
        assert_eq!(importer.concurrency, 1);
    }

    #[test]
    fn test_toml_overrides() {
        let parsed: Config = toml::from_str(
            r#"
            exchange = "test-exchange"
            min_similarity_ratio = 0.9

            [stages.merger]
            concurrency = 4
            subscribe = "orcid.updates"
            publish = "orcid.output"
            error = "orcid.error"
            durable = false
            "#,
        )
        .unwrap();
        assert_eq!(parsed.exchange, "test-exchange");
        assert_eq!(parsed.stage(STAGE_MERGER).unwrap().concurrency, 4);
        // untouched sections keep their defaults
        assert_eq!(parsed.poll_interval_secs, 300);
    }
}

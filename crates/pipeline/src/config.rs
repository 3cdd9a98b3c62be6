use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("unknown mode {0:?} (expected fast, balanced or accurate)")]
    UnknownMode(String),
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mode: OperationMode,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub extraction: ExtractionConfig,
    pub chunking: ChunkingConfig,
    pub stores: StoresConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Fast,     // Short timeouts, fewer retries
    Accurate, // Long timeouts, more retries, stricter confidence floor
    Balanced, // Default
}

impl FromStr for OperationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(OperationMode::Fast),
            "balanced" => Ok(OperationMode::Balanced),
            "accurate" => Ok(OperationMode::Accurate),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub workers: usize,
    /// Maximum number of non-terminal documents accepted at once.
    pub queue_depth: usize,
    pub stage_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Document-level RETRY cycles before FAILED.
    pub max_retries: u32,
    /// Attempts inside a single stage call before the failure reaches the
    /// state machine.
    pub stage_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub confidence_floor: f32,
    pub llm_url: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub qdrant_url: String,
    pub qdrant_collection: String,
    pub embedding_url: String,
    pub embedding_model: String,
    /// Expected vector size; 0 accepts whatever the model returns.
    pub embedding_dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Balanced,
            concurrency: ConcurrencyConfig {
                workers: default_workers(),
                queue_depth: 1000,
                stage_timeout_secs: 60,
                poll_interval_ms: 500,
                lease_secs: 300,
            },
            retry: RetryConfig {
                max_retries: 3,
                stage_attempts: 1,
                initial_backoff_ms: 1000,
                max_backoff_ms: 30000,
                backoff_factor: 2.0,
                jitter: 0.2,
            },
            extraction: ExtractionConfig {
                confidence_floor: extract::DEFAULT_CONFIDENCE_FLOOR,
                llm_url: "http://localhost:11434".to_string(),
                llm_model: "llama3.1:8b".to_string(),
                llm_timeout_secs: 120,
            },
            chunking: ChunkingConfig {
                target_tokens: 1000,
                overlap_tokens: 200,
            },
            stores: StoresConfig {
                database_url: "sqlite://pipeline.db".to_string(),
                database_max_connections: 5,
                neo4j_uri: "127.0.0.1:7687".to_string(),
                neo4j_user: "neo4j".to_string(),
                neo4j_password: "password".to_string(),
                qdrant_url: "http://localhost:6333".to_string(),
                qdrant_collection: "document_chunks".to_string(),
                embedding_url: "http://localhost:11434".to_string(),
                embedding_model: "nomic-embed-text".to_string(),
                embedding_dimension: 0,
            },
            server: ServerConfig {
                bind_addr: "0.0.0.0:3000".to_string(),
            },
        }
    }
}

impl AppConfig {
    pub fn fast_mode() -> Self {
        let mut config = Self::default();
        config.mode = OperationMode::Fast;
        config.concurrency.workers = default_workers() * 2;
        config.concurrency.stage_timeout_secs = 30;
        config.retry.max_retries = 2;
        config.retry.initial_backoff_ms = 500;
        config.retry.max_backoff_ms = 5000;
        config
    }

    pub fn accurate_mode() -> Self {
        let mut config = Self::default();
        config.mode = OperationMode::Accurate;
        config.concurrency.stage_timeout_secs = 120;
        config.retry.max_retries = 5;
        config.retry.stage_attempts = 2;
        config.retry.initial_backoff_ms = 2000;
        config.retry.max_backoff_ms = 60000;
        config.extraction.confidence_floor = 0.6;
        config
    }

    pub fn for_mode(mode: OperationMode) -> Self {
        match mode {
            OperationMode::Fast => Self::fast_mode(),
            OperationMode::Balanced => Self::default(),
            OperationMode::Accurate => Self::accurate_mode(),
        }
    }

    /// Process environment; callers load `.env` beforehand if they want it.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Start from the `PIPELINE_MODE` preset and override individual keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mode = match lookup("PIPELINE_MODE") {
            Some(raw) => raw.parse()?,
            None => OperationMode::Balanced,
        };
        let mut config = Self::for_mode(mode);
        let env = Env(&lookup);

        let c = &mut config.concurrency;
        env.parse("PIPELINE_WORKERS", &mut c.workers)?;
        env.parse("PIPELINE_QUEUE_DEPTH", &mut c.queue_depth)?;
        env.parse("PIPELINE_STAGE_TIMEOUT_SECS", &mut c.stage_timeout_secs)?;
        env.parse("PIPELINE_POLL_INTERVAL_MS", &mut c.poll_interval_ms)?;
        env.parse("PIPELINE_LEASE_SECS", &mut c.lease_secs)?;

        let r = &mut config.retry;
        env.parse("PIPELINE_MAX_RETRIES", &mut r.max_retries)?;
        env.parse("PIPELINE_STAGE_ATTEMPTS", &mut r.stage_attempts)?;
        env.parse("PIPELINE_INITIAL_BACKOFF_MS", &mut r.initial_backoff_ms)?;
        env.parse("PIPELINE_MAX_BACKOFF_MS", &mut r.max_backoff_ms)?;
        env.parse("PIPELINE_BACKOFF_FACTOR", &mut r.backoff_factor)?;
        env.parse("PIPELINE_JITTER", &mut r.jitter)?;

        let x = &mut config.extraction;
        env.parse("EXTRACTION_CONFIDENCE_FLOOR", &mut x.confidence_floor)?;
        env.string("LLM_URL", &mut x.llm_url);
        env.string("LLM_MODEL", &mut x.llm_model);
        env.parse("LLM_TIMEOUT_SECS", &mut x.llm_timeout_secs)?;

        env.parse("CHUNK_TARGET_TOKENS", &mut config.chunking.target_tokens)?;
        env.parse("CHUNK_OVERLAP_TOKENS", &mut config.chunking.overlap_tokens)?;

        let s = &mut config.stores;
        env.string("DATABASE_URL", &mut s.database_url);
        env.parse("DATABASE_MAX_CONNECTIONS", &mut s.database_max_connections)?;
        env.string("NEO4J_URI", &mut s.neo4j_uri);
        env.string("NEO4J_USER", &mut s.neo4j_user);
        env.string("NEO4J_PASSWORD", &mut s.neo4j_password);
        env.string("QDRANT_URL", &mut s.qdrant_url);
        env.string("QDRANT_COLLECTION", &mut s.qdrant_collection);
        env.string("EMBEDDING_URL", &mut s.embedding_url);
        env.string("EMBEDDING_MODEL", &mut s.embedding_model);
        env.parse("EMBEDDING_DIMENSION", &mut s.embedding_dimension)?;

        env.string("BIND_ADDR", &mut config.server.bind_addr);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.workers == 0 {
            return Err(ConfigError::Constraint("workers must be at least 1".into()));
        }
        if self.concurrency.queue_depth == 0 {
            return Err(ConfigError::Constraint("queue depth must be at least 1".into()));
        }
        if self.concurrency.lease_secs == 0 {
            return Err(ConfigError::Constraint("lease must be at least 1 second".into()));
        }
        if self.concurrency.stage_timeout_secs == 0 {
            return Err(ConfigError::Constraint("stage timeout must be at least 1 second".into()));
        }
        if self.retry.stage_attempts == 0 {
            return Err(ConfigError::Constraint("stage attempts must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Constraint("jitter must be in [0, 1)".into()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Constraint("backoff factor must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.extraction.confidence_floor) {
            return Err(ConfigError::Constraint(
                "confidence floor must be in [0, 1]".into(),
            ));
        }
        if self.chunking.overlap_tokens >= self.chunking.target_tokens {
            return Err(ConfigError::Constraint(
                "chunk overlap must be smaller than the target".into(),
            ));
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.concurrency.stage_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.concurrency.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.concurrency.lease_secs)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &'static str, target: &mut String) {
        if let Some(value) = (self.0)(key) {
            *target = value;
        }
    }

    fn parse<T: FromStr>(&self, key: &'static str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = (self.0)(key) {
            *target = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.mode, OperationMode::Balanced);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.stage_attempts, 1);
        assert_eq!(config.chunking.target_tokens, 1000);
        assert_eq!(config.chunking.overlap_tokens, 200);
    }

    #[test]
    fn mode_preset_then_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PIPELINE_MODE", "accurate"),
            ("PIPELINE_WORKERS", "3"),
            ("QDRANT_COLLECTION", "docs"),
        ]))
        .unwrap();
        assert_eq!(config.mode, OperationMode::Accurate);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.concurrency.workers, 3);
        assert_eq!(config.stores.qdrant_collection, "docs");
    }

    #[test]
    fn unparseable_value_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[("PIPELINE_MAX_RETRIES", "three")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "PIPELINE_MAX_RETRIES",
                value: "three".into()
            }
        );
        assert!(AppConfig::from_lookup(lookup(&[("PIPELINE_MODE", "turbo")])).is_err());
    }

    #[test]
    fn zero_lease_or_stage_timeout_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PIPELINE_LEASE_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Constraint(_)));
        let err =
            AppConfig::from_lookup(lookup(&[("PIPELINE_STAGE_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Constraint(_)));
        assert!(AppConfig::from_lookup(lookup(&[("PIPELINE_LEASE_SECS", "1")])).is_ok());
    }

    #[test]
    fn overlap_must_fit_in_target() {
        let err = AppConfig::from_lookup(lookup(&[("CHUNK_OVERLAP_TOKENS", "1000")])).unwrap_err();
        assert!(matches!(err, ConfigError::Constraint(_)));
    }
}

use serde::{Deserialize, Serialize};

/// Top-level engine configuration, loaded from an optional `dagflow.toml`.
///
/// All fields have defaults so an absent config file is equivalent to
/// `EngineConfig::default()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub retries: RetryConfig,
    pub adapters: AdaptersConfig,
}

/// Scheduling and cancellation parameters for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    /// Bound on concurrently `Running` nodes.
    pub max_parallelism: usize,
    /// Default per-node timeout when a node declares none.
    pub default_timeout_seconds: u64,
    /// Grace window the executor waits for handlers to drain after cancel
    /// before marking them `Failed{"cancelled"}`.
    pub cancel_grace_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            default_timeout_seconds: 120,
            cancel_grace_seconds: 5,
        }
    }
}

/// Retry policy overrides for handlers whose retry counts the spec fixes
/// but allows surfacing as configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub llm_retries: u32,
    pub http_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            llm_retries: 1,
            http_retries: 3,
        }
    }
}

/// Adapter binary/endpoint overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdaptersConfig {
    /// Script interpreter binary; defaults to a PATH lookup of `python3`.
    pub script_interpreter: Option<String>,
}

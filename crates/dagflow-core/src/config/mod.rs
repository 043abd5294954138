use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{AdaptersConfig, EngineConfig, ExecutionConfig, RetryConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate an `EngineConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(EngineConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate an `EngineConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.execution.max_parallelism == 0 {
        return Err(ConfigError::Validation {
            message: "execution.max_parallelism must be > 0".to_string(),
        });
    }

    if config.execution.default_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "execution.default_timeout_seconds must be > 0".to_string(),
        });
    }

    if config.retries.llm_retries > 10 {
        return Err(ConfigError::Validation {
            message: "retries.llm_retries is implausibly high (> 10)".to_string(),
        });
    }

    if config.retries.http_retries > 10 {
        return Err(ConfigError::Validation {
            message: "retries.http_retries is implausibly high (> 10)".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = EngineConfig::default();
        validate(&config).unwrap();
    }

    #[test]
    fn minimal_toml_parses_to_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.execution.max_parallelism, 8);
        assert_eq!(config.execution.default_timeout_seconds, 120);
        assert_eq!(config.retries.llm_retries, 1);
        assert_eq!(config.retries.http_retries, 3);
    }

    #[test]
    fn full_example_config_parses() {
        let data = r#"
[execution]
max_parallelism = 4
default_timeout_seconds = 60
cancel_grace_seconds = 2

[retries]
llm_retries = 2
http_retries = 5

[adapters]
script_interpreter = "/usr/bin/python3"
"#;

        let config = parse_config(data).unwrap();
        assert_eq!(config.execution.max_parallelism, 4);
        assert_eq!(config.execution.default_timeout_seconds, 60);
        assert_eq!(config.execution.cancel_grace_seconds, 2);
        assert_eq!(config.retries.llm_retries, 2);
        assert_eq!(config.retries.http_retries, 5);
        assert_eq!(
            config.adapters.script_interpreter.as_deref(),
            Some("/usr/bin/python3")
        );
    }

    #[test]
    fn partial_config_fills_defaults() {
        let data = r#"
[execution]
max_parallelism = 2
"#;
        let config = parse_config(data).unwrap();
        assert_eq!(config.execution.max_parallelism, 2);
        assert_eq!(config.execution.default_timeout_seconds, 120);
    }

    #[test]
    fn zero_parallelism_rejected() {
        let data = r#"
[execution]
max_parallelism = 0
"#;
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("max_parallelism"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let data = r#"
[execution]
default_timeout_seconds = 0
"#;
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("default_timeout_seconds"));
    }

    #[test]
    fn unknown_field_in_toml_returns_parse_error() {
        let data = r#"
[execution]
nonexistent_field = "bad"
"#;
        let err = parse_config(data).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = load_config(Path::new("/tmp/nonexistent-dagflow-test.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn implausible_retry_count_rejected() {
        let data = r#"
[retries]
llm_retries = 50
"#;
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("llm_retries"));
    }
}

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dagflow_core::adapters::{
    HttpAdapter, LlmAdapter, ProcessScriptAdapter, ReqwestHttpAdapter, ScriptAdapter,
    TokioFilesystemAdapter, UnconfiguredLlmAdapter,
};
use dagflow_core::config::{self, EngineConfig};
use dagflow_core::document;
use dagflow_core::executor::Executor;
use dagflow_core::handlers::{FileHandler, HandlerRegistry, HttpHandler, LlmHandler, ScriptHandler};
use dagflow_core::plan;
use serde_json::Value as JsonValue;

/// Exit code for a document that fails to parse or validate, chosen to sit
/// outside the execution-status range (0/2/3/130) the same way a shell's
/// own "command not usable" convention (64, `EX_USAGE`) does.
const EXIT_VALIDATION_ERROR: u8 = 64;

#[derive(Parser)]
#[command(name = "dagflow", version, about = "Declarative DAG workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow document and print its execution record as JSON.
    Run {
        /// Path to the workflow document (TOML).
        document: PathBuf,
        /// Input bindings as `key=value`; repeatable. Values are parsed as
        /// JSON when possible, falling back to a plain string.
        #[arg(long = "inputs", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Override `execution.max_parallelism` from the config file.
        #[arg(long)]
        parallelism: Option<usize>,
        /// Override the default per-node timeout, e.g. "30s", "5m".
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<std::time::Duration>,
        /// Path to an `EngineConfig` TOML file; defaults are used if absent.
        #[arg(long, default_value = "dagflow.toml")]
        config: PathBuf,
    },
    /// Validate a workflow document without executing it.
    Validate {
        /// Path to the workflow document (TOML).
        document: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dagflow_core::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { document, inputs, parallelism, timeout, config } => {
            run(document, inputs, parallelism, timeout, config).await
        }
        Command::Validate { document } => validate(document),
    }
}

async fn run(
    document_path: PathBuf,
    raw_inputs: Vec<String>,
    parallelism: Option<usize>,
    timeout: Option<std::time::Duration>,
    config_path: PathBuf,
) -> Result<ExitCode> {
    let text = std::fs::read_to_string(&document_path)
        .with_context(|| format!("reading document '{}'", document_path.display()))?;

    let doc = match document::parse(&text) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(EXIT_VALIDATION_ERROR));
        }
    };

    let mut engine_config = config::load_config(&config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default engine config");
        EngineConfig::default()
    });
    if let Some(parallelism) = parallelism {
        engine_config.execution.max_parallelism = parallelism;
    }
    if let Some(timeout) = timeout {
        engine_config.execution.default_timeout_seconds = timeout.as_secs();
    }

    let inputs = match coerce_inputs(&doc, &raw_inputs) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(EXIT_VALIDATION_ERROR));
        }
    };

    let plan = match plan::validate(doc) {
        Ok(plan) => plan,
        Err(errors) => {
            for error in &errors {
                eprintln!("error: {error}");
            }
            return Ok(ExitCode::from(EXIT_VALIDATION_ERROR));
        }
    };

    let registry = Arc::new(build_registry(&engine_config));
    let executor = Executor::new(registry, engine_config);

    let env_vars: BTreeMap<String, JsonValue> = std::env::vars()
        .map(|(k, v)| (k, JsonValue::String(v)))
        .collect();

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let record = executor.execute(&plan, inputs, env_vars, cancel_rx).await;

    println!("{}", serde_json::to_string_pretty(&record)?);

    Ok(ExitCode::from(record.exit_code() as u8))
}

fn validate(document_path: PathBuf) -> Result<ExitCode> {
    let text = std::fs::read_to_string(&document_path)
        .with_context(|| format!("reading document '{}'", document_path.display()))?;

    let doc = match document::parse(&text) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(EXIT_VALIDATION_ERROR));
        }
    };

    match plan::validate(doc) {
        Ok(_) => {
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("error: {error}");
            }
            Ok(ExitCode::from(EXIT_VALIDATION_ERROR))
        }
    }
}

fn build_registry(config: &EngineConfig) -> HandlerRegistry {
    let llm: Arc<dyn LlmAdapter> = Arc::new(UnconfiguredLlmAdapter);
    let http: Arc<dyn HttpAdapter> = Arc::new(ReqwestHttpAdapter::default());
    let script: Arc<dyn ScriptAdapter> =
        Arc::new(ProcessScriptAdapter::new(config.adapters.script_interpreter.clone()));

    HandlerRegistry::new(
        LlmHandler::new(llm, config.retries.llm_retries),
        HttpHandler::new(http, config.retries.http_retries),
        FileHandler::new(Arc::new(TokioFilesystemAdapter)),
        ScriptHandler::new(script),
    )
}

/// Parse `--inputs key=value` pairs, coercing each value against the
/// document's declared input type. A value that parses as JSON is taken
/// verbatim (so `--inputs count=3` yields a number for a `number` input);
/// otherwise it is kept as a plain string.
fn coerce_inputs(
    doc: &document::Document,
    raw: &[String],
) -> Result<BTreeMap<String, JsonValue>, String> {
    let mut inputs = BTreeMap::new();

    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("--inputs '{entry}' is not in key=value form"))?;

        let parsed = serde_json::from_str::<JsonValue>(value)
            .unwrap_or_else(|_| JsonValue::String(value.to_string()));

        if let Some(decl) = doc.inputs.get(key) {
            if !decl.type_.matches(&parsed) {
                return Err(format!(
                    "input '{key}' expects type '{}', got '{}'",
                    decl.type_.label(),
                    value
                ));
            }
        }

        inputs.insert(key.to_string(), parsed);
    }

    for (name, decl) in &doc.inputs {
        if inputs.contains_key(name) {
            continue;
        }
        if let Some(default) = &decl.default {
            inputs.insert(name.clone(), default.clone());
        } else if decl.required {
            return Err(format!("missing required input '{name}'"));
        }
    }

    Ok(inputs)
}

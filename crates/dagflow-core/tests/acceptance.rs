//! Crate-root acceptance tests driving the public API end to end: parse a
//! document, validate it into a plan, execute it, and check the shape of
//! the resulting record. Unlike `executor`'s own `#[cfg(test)]` module,
//! these never reach into private internals.

use std::collections::BTreeMap;
use std::sync::Arc;

use dagflow_core::adapters::simulated::{SimulatedHttpAdapter, SimulatedLlmAdapter};
use dagflow_core::adapters::{HttpAdapter, LlmAdapter, ProcessScriptAdapter, ScriptAdapter};
use dagflow_core::config::EngineConfig;
use dagflow_core::document;
use dagflow_core::executor::Executor;
use dagflow_core::handlers::{FileHandler, HandlerRegistry, HttpHandler, LlmHandler, ScriptHandler};
use dagflow_core::plan;
use dagflow_core::record::ExecutionStatus;

fn registry() -> Arc<HandlerRegistry> {
    let llm: Arc<dyn LlmAdapter> = Arc::new(SimulatedLlmAdapter::default());
    let http: Arc<dyn HttpAdapter> = Arc::new(SimulatedHttpAdapter::default());
    let script: Arc<dyn ScriptAdapter> = Arc::new(ProcessScriptAdapter::new(None));
    Arc::new(HandlerRegistry::new(
        LlmHandler::new(llm, 1),
        HttpHandler::new(http, 3),
        FileHandler::new(Arc::new(dagflow_core::adapters::TokioFilesystemAdapter)),
        ScriptHandler::new(script),
    ))
}

fn never_cancelled() -> tokio::sync::watch::Receiver<bool> {
    tokio::sync::watch::channel(false).1
}

/// A document with a required input, a default-valued input, a chain of
/// transforms, and a declared output resolves end to end, and the declared
/// output actually reflects the computed value (output resolution, §8).
#[tokio::test]
async fn full_document_resolves_declared_outputs() {
    let text = r#"
name = "greeting"
version = "1.0.0"

[inputs.name]
type = "string"
required = true

[inputs.greeting]
type = "string"
required = false
default = "Hello"

[[nodes]]
id = "compose"
kind = "transform"
[nodes.config]
template = "{{ inputs.greeting }}, {{ inputs.name }}!"

[[nodes]]
id = "shout"
kind = "transform"
depends_on = ["compose"]
[nodes.config]
template = "{{ compose | upper }}"

[outputs]
message = "{{ shout }}"
"#;

    let doc = document::parse(text).unwrap();
    let plan = plan::validate(doc).unwrap();
    let executor = Executor::new(registry(), EngineConfig::default());

    let mut inputs = BTreeMap::new();
    inputs.insert("name".to_string(), serde_json::json!("Ada"));

    let record = executor
        .execute(&plan, inputs, BTreeMap::new(), never_cancelled())
        .await;

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(
        record.outputs["message"],
        serde_json::json!("HELLO, ADA!")
    );
}

/// Completion invariant: every declared node resolves to exactly one of
/// Success/Failed/Skipped, even across a document with an unreachable
/// branch (the non-chosen side of a route).
#[tokio::test]
async fn every_node_reaches_a_terminal_state() {
    let text = r#"
name = "routing"
version = "1.0.0"

[[nodes]]
id = "pick"
kind = "route"

[[nodes.config.routes]]
is_default = true
to = "taken"

[[nodes]]
id = "taken"
kind = "transform"
depends_on = ["pick"]
[nodes.config]
template = "went"

[[nodes]]
id = "not_taken"
kind = "transform"
depends_on = ["pick"]
[nodes.config]
template = "skipped"
"#;

    let doc = document::parse(text).unwrap();
    let node_count = doc.nodes.len();
    let plan = plan::validate(doc).unwrap();
    let executor = Executor::new(registry(), EngineConfig::default());

    let record = executor
        .execute(&plan, BTreeMap::new(), BTreeMap::new(), never_cancelled())
        .await;

    assert_eq!(record.progress.len(), node_count);
    let resolved = record
        .progress
        .values()
        .filter(|p| {
            matches!(
                p.status,
                dagflow_core::record::NodeStatus::Success
                    | dagflow_core::record::NodeStatus::Failed
                    | dagflow_core::record::NodeStatus::Skipped
            )
        })
        .count();
    assert_eq!(resolved, node_count);
}

/// A malformed document (unknown dependency) is rejected at validation
/// time and never reaches the executor (S3).
#[test]
fn validation_failure_short_circuits_before_execution() {
    let text = r#"
name = "bad"
version = "1.0.0"

[[nodes]]
id = "only"
kind = "transform"
depends_on = ["missing"]
[nodes.config]
template = "x"
"#;

    let doc = document::parse(text).unwrap();
    let errors = plan::validate(doc).unwrap_err();
    assert!(!errors.is_empty());
}

//! Execution-shaped integration tests for the scenarios in §8 (S1, S2, S4,
//! S5, S6). S3 (validation failure) belongs to `plan`'s own test module;
//! it never reaches the executor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::adapters::simulated::{SimulatedHttpAdapter, SimulatedLlmAdapter};
use crate::adapters::{
    AdapterError, CancelSignal, HttpAdapter, HttpRequest, HttpResponse, LlmAdapter,
    ProcessScriptAdapter, ScriptAdapter,
};
use crate::config::EngineConfig;
use crate::document;
use crate::handlers::{FileHandler, HandlerRegistry, HttpHandler, LlmHandler, ScriptHandler};
use crate::plan;
use crate::record::ExecutionStatus;

use super::Executor;

fn registry() -> Arc<HandlerRegistry> {
    registry_with_http_retries(3)
}

fn registry_with_http_retries(http_retries: u32) -> Arc<HandlerRegistry> {
    let llm: Arc<dyn LlmAdapter> = Arc::new(SimulatedLlmAdapter::default());
    let http: Arc<dyn HttpAdapter> = Arc::new(SimulatedHttpAdapter::default());
    let script: Arc<dyn ScriptAdapter> = Arc::new(ProcessScriptAdapter::new(None));
    Arc::new(HandlerRegistry::new(
        LlmHandler::new(llm, 1),
        HttpHandler::new(http, http_retries),
        FileHandler::new(Arc::new(crate::adapters::TokioFilesystemAdapter)),
        ScriptHandler::new(script),
    ))
}

fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}

async fn run(text: &str, inputs: BTreeMap<String, serde_json::Value>) -> crate::record::ExecutionRecord {
    let doc = document::parse(text).unwrap();
    let plan = plan::validate(doc).unwrap();
    let executor = Executor::new(registry(), EngineConfig::default());
    executor.execute(&plan, inputs, BTreeMap::new(), never_cancelled()).await
}

/// S1: split -> filter -> transform -> aggregate(array) over companies,
/// keeping only those with revenue over 1e6 and dividing by 1e6.
#[tokio::test]
async fn s1_dataflow_conservation() {
    let text = r#"
name = "s1"
version = "1.0.0"

[inputs.companies]
type = "array"
required = true

[[nodes]]
id = "split_companies"
kind = "split"
[nodes.config]
field = "{{ inputs.companies }}"
item_name = "company"

[[nodes]]
id = "big_enough"
kind = "filter"
depends_on = ["split_companies"]
[nodes.config]
condition = "{{ company.rev > 1000000 }}"

[[nodes]]
id = "scaled"
kind = "transform"
depends_on = ["big_enough"]
[nodes.config]
template = { r = "{{ company.rev / 1000000 }}" }

[[nodes]]
id = "collected"
kind = "aggregate"
depends_on = ["scaled"]
[nodes.config]
mode = "array"

[outputs]
result = "{{ collected }}"
"#;

    let mut inputs = BTreeMap::new();
    inputs.insert(
        "companies".to_string(),
        serde_json::json!([
            {"rev": 2_000_000.0},
            {"rev": 500_000.0},
            {"rev": 5_000_000.0},
        ]),
    );

    let record = run(text, inputs).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(
        record.outputs["result"],
        serde_json::json!([{"r": 2.0}, {"r": 5.0}])
    );
}

/// S2: route with branches enterprise/startup/default; classification
/// picks "enterprise" so only branch A runs, B and C are skipped, and the
/// route's own output records the chosen branch.
#[tokio::test]
async fn s2_conditional_routing() {
    let text = r#"
name = "s2"
version = "1.0.0"

[[nodes]]
id = "classify"
kind = "transform"
[nodes.config]
template = { size = "enterprise" }

[[nodes]]
id = "pick_route"
kind = "route"
depends_on = ["classify"]

[[nodes.config.routes]]
when = "{{ classify.size == \"enterprise\" }}"
to = "branch_a"

[[nodes.config.routes]]
when = "{{ classify.size == \"startup\" }}"
to = "branch_b"

[[nodes.config.routes]]
is_default = true
to = "branch_c"

[[nodes]]
id = "branch_a"
kind = "transform"
depends_on = ["pick_route"]
[nodes.config]
template = "a-ran"

[[nodes]]
id = "branch_b"
kind = "transform"
depends_on = ["pick_route"]
[nodes.config]
template = "b-ran"

[[nodes]]
id = "branch_c"
kind = "transform"
depends_on = ["pick_route"]
[nodes.config]
template = "c-ran"

[outputs]
chosen = "{{ pick_route.chosen }}"
"#;

    let record = run(text, BTreeMap::new()).await;
    assert_eq!(record.outputs["chosen"], serde_json::json!("branch_a"));
    assert_eq!(
        record.progress["branch_a"].status,
        crate::record::NodeStatus::Success
    );
    assert_eq!(
        record.progress["branch_b"].status,
        crate::record::NodeStatus::Skipped
    );
    assert_eq!(
        record.progress["branch_c"].status,
        crate::record::NodeStatus::Skipped
    );
}

/// S4: node X fails; a downstream node with `skip_errors = true` still
/// runs and sees `Failed` for X, so overall status is `partial`.
#[tokio::test]
async fn s4_partial_failure_with_skip_errors() {
    let text = r#"
name = "s4"
version = "1.0.0"

[[nodes]]
id = "always_fails"
kind = "http"
[nodes.config]
url = "https://example.invalid/nope"

[[nodes]]
id = "tolerant"
kind = "transform"
depends_on = ["always_fails"]
skip_errors = true
[nodes.config]
template = "{{ always_fails.error | default(\"none\") }}"

[outputs]
ok = "{{ tolerant }}"
fail = "{{ always_fails }}"
"#;

    let doc = document::parse(text).unwrap();
    let plan = plan::validate(doc).unwrap();
    let executor = Executor::new(registry_with_http_retries(0), EngineConfig::default());
    let record = executor
        .execute(&plan, BTreeMap::new(), BTreeMap::new(), never_cancelled())
        .await;

    assert_eq!(record.status, ExecutionStatus::Partial);
    assert!(record.errors.contains_key("always_fails"));
    assert_eq!(
        record.progress["tolerant"].status,
        crate::record::NodeStatus::Success
    );
}

/// S5: cancel before execution starts; every node resolves to `Skipped`
/// (none reach `Running`) and the overall status is `Cancelled`.
#[tokio::test]
async fn s5_cancellation() {
    let text = r#"
name = "s5"
version = "1.0.0"

[[nodes]]
id = "n1"
kind = "transform"
[nodes.config]
template = "1"

[[nodes]]
id = "n2"
kind = "transform"
depends_on = ["n1"]
[nodes.config]
template = "2"
"#;

    let doc = document::parse(text).unwrap();
    let plan = plan::validate(doc).unwrap();
    let executor = Executor::new(registry(), EngineConfig::default());
    let (_tx, rx) = watch::channel(true);

    let record = executor
        .execute(&plan, BTreeMap::new(), BTreeMap::new(), rx)
        .await;

    assert_eq!(record.status, ExecutionStatus::Cancelled);
    for progress in record.progress.values() {
        assert_ne!(progress.status, crate::record::NodeStatus::Running);
    }
}

/// S6: split over 4 elements with per-element random-ish delay; aggregate
/// must preserve the original array order regardless of completion order.
#[tokio::test]
async fn s6_aggregate_preserves_order() {
    let text = r#"
name = "s6"
version = "1.0.0"

[inputs.letters]
type = "array"
required = true

[[nodes]]
id = "split_letters"
kind = "split"
[nodes.config]
field = "{{ inputs.letters }}"
item_name = "letter"

[[nodes]]
id = "upper"
kind = "transform"
depends_on = ["split_letters"]
[nodes.config]
template = "{{ letter | upper }}"

[[nodes]]
id = "collected"
kind = "aggregate"
depends_on = ["upper"]
[nodes.config]
mode = "array"

[outputs]
result = "{{ collected }}"
"#;

    let mut inputs = BTreeMap::new();
    inputs.insert(
        "letters".to_string(),
        serde_json::json!(["a", "b", "c", "d"]),
    );

    let record = run(text, inputs).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(
        record.outputs["result"],
        serde_json::json!(["A", "B", "C", "D"])
    );
}

/// Completion invariant (§8.3): every declared node ends in exactly one
/// terminal state.
#[tokio::test]
async fn completion_invariant_holds() {
    let record = run(
        r#"
name = "completion"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "transform"
[nodes.config]
template = "1"

[[nodes]]
id = "b"
kind = "transform"
depends_on = ["a"]
[nodes.config]
template = "2"
"#,
        BTreeMap::new(),
    )
    .await;

    assert_eq!(record.progress.len(), 2);
    for progress in record.progress.values() {
        assert!(matches!(
            progress.status,
            crate::record::NodeStatus::Success
                | crate::record::NodeStatus::Failed
                | crate::record::NodeStatus::Skipped
        ));
    }
}

/// An adapter whose `request` never returns before the test's patience runs
/// out, used to exercise the cancellation grace window (§5c).
struct NeverRespondingHttpAdapter;

#[async_trait::async_trait]
impl HttpAdapter for NeverRespondingHttpAdapter {
    async fn request(&self, _req: HttpRequest, _cancel: &CancelSignal) -> Result<HttpResponse, AdapterError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("grace window should have forced completion first")
    }
}

/// S6/§5c: once the cancel signal fires, a node already running is given
/// only `cancel_grace_seconds` to finish before the executor forces it to
/// `Failed{"cancelled"}` and returns — it does not wait for the handler.
#[tokio::test]
async fn cancellation_grace_window_force_fails_stuck_handler() {
    let text = r#"
name = "grace"
version = "1.0.0"

[[nodes]]
id = "stuck"
kind = "http"
[nodes.config]
url = "https://example.invalid/stuck"
"#;

    let doc = document::parse(text).unwrap();
    let plan = plan::validate(doc).unwrap();

    let llm: Arc<dyn LlmAdapter> = Arc::new(SimulatedLlmAdapter::default());
    let http: Arc<dyn HttpAdapter> = Arc::new(NeverRespondingHttpAdapter);
    let script: Arc<dyn ScriptAdapter> = Arc::new(ProcessScriptAdapter::new(None));
    let registry = Arc::new(HandlerRegistry::new(
        LlmHandler::new(llm, 1),
        HttpHandler::new(http, 0),
        FileHandler::new(Arc::new(crate::adapters::TokioFilesystemAdapter)),
        ScriptHandler::new(script),
    ));

    let mut config = EngineConfig::default();
    config.execution.cancel_grace_seconds = 0;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = cancel_tx.send(true);
    });

    let executor = Executor::new(registry, config);
    let record = tokio::time::timeout(
        Duration::from_secs(5),
        executor.execute(&plan, BTreeMap::new(), BTreeMap::new(), cancel_rx),
    )
    .await
    .expect("executor should force-complete within the grace window, not hang");

    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.progress["stuck"].status, crate::record::NodeStatus::Failed);
    assert_eq!(record.progress["stuck"].error.as_deref(), Some("cancelled"));
}

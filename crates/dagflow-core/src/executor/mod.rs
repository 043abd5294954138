//! DAG scheduling, dispatch, and error policy (§4.6).
//!
//! The worker pool is a bounded [`tokio::sync::Semaphore`] gating a
//! `tokio::spawn` per ready node, with completions merged through an
//! `mpsc` channel — the same spawn-one-task-per-unit-of-work-and-merge
//! shape as the teacher's `ParallelSupervisor::spawn_all`. Cancellation is
//! a `tokio::sync::watch::Receiver<bool>` every handler invocation
//! observes, generalizing the teacher's per-process `oneshot` cancel
//! (`SupervisorHandle::cancel`) to a signal the whole pool shares.

mod fanout;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};

use crate::adapters::CancelSignal;
use crate::config::EngineConfig;
use crate::dataflow::DataflowPlan;
use crate::document::NodeKind;
use crate::environment::Environment;
use crate::handlers::{HandlerOutcome, HandlerRegistry};
use crate::plan::Plan;
use crate::record::{ErrorEntry, ExecutionRecord, ExecutionStatus, NodeOutput, NodeProgress, NodeStatus};

pub use fanout::ElementResult;
use fanout::FanOutResults;

/// Everything a running execution shares across concurrently dispatched
/// tasks and nested fan-out instances.
struct Shared {
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    dataflow: DataflowPlan,
    /// One final [`NodeOutput`] per declared node (§3). For a node that
    /// lives inside a fan-out group this is a synthesized summary across
    /// every element instance (`Success` only if every instance
    /// succeeded); the per-element values feed the closing `aggregate`
    /// directly via `fan_out`, never through this map.
    outputs: Mutex<BTreeMap<String, NodeOutput>>,
    progress: Mutex<BTreeMap<String, NodeProgress>>,
    fan_out: FanOutResults,
    cancel: CancelSignal,
}

pub struct Executor {
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
}

impl Executor {
    pub fn new(registry: Arc<HandlerRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub async fn execute(
        &self,
        plan: &Plan,
        inputs: BTreeMap<String, JsonValue>,
        env_vars: BTreeMap<String, JsonValue>,
        cancel: CancelSignal,
    ) -> ExecutionRecord {
        let started_at = chrono::Utc::now();
        let id = uuid::Uuid::new_v4();

        let dataflow = crate::dataflow::build(plan);
        let root_env = Environment::new(env_vars, inputs.clone());

        let shared = Arc::new(Shared {
            registry: self.registry.clone(),
            config: self.config.clone(),
            dataflow,
            outputs: Mutex::new(BTreeMap::new()),
            progress: Mutex::new(
                plan.document
                    .node_names()
                    .map(|n| {
                        (
                            n.to_string(),
                            NodeProgress { status: NodeStatus::Pending, started_at: None, completed_at: None, error: None },
                        )
                    })
                    .collect(),
            ),
            fan_out: FanOutResults::default(),
            cancel: cancel.clone(),
        });

        let top_level: Vec<String> = shared
            .dataflow
            .top_level_nodes(plan)
            .into_iter()
            .map(String::from)
            .collect();

        let semaphore = Arc::new(Semaphore::new(shared.config.execution.max_parallelism));
        run_node_set(shared.clone(), plan, &top_level, root_env, semaphore).await;

        let outputs_map = shared.outputs.lock().await.clone();
        let progress_map = shared.progress.lock().await.clone();

        let mut record_outputs = BTreeMap::new();
        let mut errors = BTreeMap::new();
        let mut success_count = 0usize;
        let mut failure_count = 0usize;

        for (name, expr) in &plan.document.outputs {
            let env_for_outputs = Environment::new(BTreeMap::new(), inputs.clone());
            let mut env_for_outputs = env_for_outputs;
            for (node, output) in &outputs_map {
                env_for_outputs.publish(node.clone(), output.published_value());
            }
            let value = crate::template::render(expr, &env_for_outputs)
                .map(|v| v)
                .unwrap_or(JsonValue::Null);
            record_outputs.insert(name.clone(), value);
        }

        for (name, output) in &outputs_map {
            match output {
                NodeOutput::Success { .. } => success_count += 1,
                NodeOutput::Failed { error, inputs_snapshot, timestamp } => {
                    failure_count += 1;
                    errors.insert(
                        name.clone(),
                        ErrorEntry {
                            error: error.clone(),
                            inputs_snapshot: inputs_snapshot.clone(),
                            timestamp: *timestamp,
                        },
                    );
                }
                NodeOutput::Skipped { .. } => {}
            }
        }

        let cancelled = *cancel.borrow();
        let total = plan.document.nodes.len();
        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else if success_count == total {
            ExecutionStatus::Completed
        } else if success_count > 0 && failure_count > 0 {
            ExecutionStatus::Partial
        } else if failure_count > 0 || success_count == 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Partial
        };

        ExecutionRecord {
            id,
            workflow_name: plan.document.name.clone(),
            status,
            started_at,
            completed_at: Some(chrono::Utc::now()),
            inputs,
            outputs: record_outputs,
            progress: progress_map,
            errors,
        }
    }
}

/// Run the node state machine (§4.6) over one fan-out-group's worth of
/// node ids (or, for the outermost call, every top-level node). External
/// dependencies (nodes outside `ids`) are assumed already terminal.
async fn run_node_set(
    shared: Arc<Shared>,
    plan: &Plan,
    ids: &[String],
    env: Environment,
    semaphore: Arc<Semaphore>,
) -> BTreeMap<String, NodeOutput> {
    let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let env = Arc::new(tokio::sync::RwLock::new(env));

    let mut pending_deps: BTreeMap<String, usize> = BTreeMap::new();
    for id in ids {
        let mut deps: HashSet<String> = plan
            .dependencies
            .get(id)
            .map(|d| d.iter().filter(|x| id_set.contains(x.as_str())).cloned().collect())
            .unwrap_or_default();
        if let Some(group) = shared.dataflow.groups.iter().find(|g| g.closer.as_deref() == Some(id.as_str())) {
            deps.insert(group.opener.clone());
        }
        pending_deps.insert(id.clone(), deps.len());
    }

    let mut done: BTreeMap<String, NodeOutput> = BTreeMap::new();
    let mut dispatched: HashSet<String> = HashSet::new();
    // Dependent id -> the reason it inherits. A `Failed` upstream always
    // propagates "upstream failure"; a `Skipped` upstream (e.g. `filter`)
    // propagates its own reason, so a filtered sub-DAG reads `"filtered"`
    // all the way down rather than turning into "upstream failure" at the
    // first hop (§4.5).
    let mut skip_cascade: HashMap<String, String> = HashMap::new();

    let (tx, mut rx) = mpsc::channel::<(String, NodeOutput)>(ids.len().max(1));

    // Set once the cancel signal first reads true (§5): a grace-window
    // deadline, after which any dispatched-but-not-finished node is forced
    // to `Failed{"cancelled"}` rather than waited on indefinitely.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut cancel_watch = shared.cancel.clone();

    loop {
        let cancelled_now = *cancel_watch.borrow();

        for id in ids {
            if dispatched.contains(id) || done.contains_key(id) {
                continue;
            }
            if *pending_deps.get(id).unwrap_or(&0) != 0 {
                continue;
            }
            dispatched.insert(id.clone());

            if let Some(reason) = skip_cascade.get(id).cloned() {
                let _ = tx.send((id.clone(), NodeOutput::Skipped { reason })).await;
                continue;
            }

            if cancelled_now {
                let _ = tx
                    .send((id.clone(), NodeOutput::Skipped { reason: "cancelled".to_string() }))
                    .await;
                continue;
            }

            // A `route` node already marked this id `"not taken"` (§4.4) via
            // `mark_not_taken` before this set even considered it ready —
            // that write lands in `shared.outputs` before the route's own
            // completion reaches this loop, so it is always visible here.
            // Honor it instead of spawning the node's own handler.
            let pre_marked = shared.outputs.lock().await.get(id).cloned();
            if let Some(pre) = pre_marked {
                let _ = tx.send((id.clone(), pre)).await;
                continue;
            }

            spawn_node(
                shared.clone(),
                plan,
                id.clone(),
                env.clone(),
                semaphore.clone(),
                tx.clone(),
            );
        }

        if done.len() == ids.len() {
            break;
        }

        if cancelled_now && cancel_deadline.is_none() {
            let grace = Duration::from_secs(shared.config.execution.cancel_grace_seconds);
            cancel_deadline = Some(tokio::time::Instant::now() + grace);
        }

        let received = match cancel_deadline {
            Some(deadline) => {
                tokio::select! {
                    r = rx.recv() => r,
                    _ = tokio::time::sleep_until(deadline) => {
                        force_fail_remaining(&shared, ids, &dispatched, &mut done).await;
                        break;
                    }
                }
            }
            None => {
                tokio::select! {
                    r = rx.recv() => r,
                    // Wake as soon as cancellation fires so a node that is
                    // mid-flight when cancel arrives starts its grace
                    // window immediately instead of waiting on `rx.recv()`
                    // with no deadline racing it.
                    _ = cancel_watch.changed() => continue,
                }
            }
        };

        let Some((id, output)) = received else { break };

        {
            let mut progress = shared.progress.lock().await;
            if let Some(p) = progress.get_mut(&id) {
                p.completed_at = Some(chrono::Utc::now());
                p.status = match &output {
                    NodeOutput::Success { .. } => NodeStatus::Success,
                    NodeOutput::Failed { .. } => NodeStatus::Failed,
                    NodeOutput::Skipped { .. } => NodeStatus::Skipped,
                };
                if let NodeOutput::Failed { error, .. } = &output {
                    p.error = Some(error.clone());
                }
            }
        }

        {
            let mut env_guard = env.write().await;
            env_guard.publish(id.clone(), output.published_value());
        }

        let node = plan.node(&id);
        let skip_errors = node.map(|n| n.skip_errors).unwrap_or(false);
        if !output.is_success() && !skip_errors {
            let reason = match &output {
                NodeOutput::Skipped { reason } => reason.clone(),
                _ => "upstream failure".to_string(),
            };
            for dependent in ids {
                if plan
                    .dependencies
                    .get(dependent)
                    .map(|d| d.contains(&id))
                    .unwrap_or(false)
                {
                    skip_cascade.entry(dependent.clone()).or_insert_with(|| reason.clone());
                }
            }
        }

        done.insert(id.clone(), output);

        recount_pending(plan, &shared.dataflow, ids, &id_set, &done, &mut pending_deps);
    }

    {
        let mut outputs = shared.outputs.lock().await;
        for (id, output) in &done {
            outputs.insert(id.clone(), output.clone());
        }
    }

    done
}

/// Cancellation grace window expired (§5c): every node that was dispatched
/// but never reported completion is forced to `Failed{"cancelled"}`; every
/// node that never got a chance to start is `Skipped{"unreached"}`.
async fn force_fail_remaining(
    shared: &Arc<Shared>,
    ids: &[String],
    dispatched: &HashSet<String>,
    done: &mut BTreeMap<String, NodeOutput>,
) {
    let mut progress = shared.progress.lock().await;
    for id in ids {
        if done.contains_key(id) {
            continue;
        }
        let output = if dispatched.contains(id) {
            NodeOutput::Failed {
                error: "cancelled".to_string(),
                inputs_snapshot: JsonValue::Null,
                timestamp: chrono::Utc::now(),
            }
        } else {
            NodeOutput::Skipped { reason: "unreached".to_string() }
        };
        if let Some(p) = progress.get_mut(id) {
            p.completed_at = Some(chrono::Utc::now());
            p.status = match &output {
                NodeOutput::Failed { .. } => NodeStatus::Failed,
                _ => NodeStatus::Skipped,
            };
            if let NodeOutput::Failed { error, .. } = &output {
                p.error = Some(error.clone());
            }
        }
        done.insert(id.clone(), output);
    }
}

fn recount_pending(
    plan: &Plan,
    dataflow: &DataflowPlan,
    ids: &[String],
    id_set: &HashSet<&str>,
    done: &BTreeMap<String, NodeOutput>,
    pending_deps: &mut BTreeMap<String, usize>,
) {
    for id in ids {
        if done.contains_key(id) {
            continue;
        }
        let mut count = plan
            .dependencies
            .get(id)
            .map(|d| d.iter().filter(|x| id_set.contains(x.as_str()) && !done.contains_key(*x)).count())
            .unwrap_or(0);
        if let Some(group) = dataflow.groups.iter().find(|g| g.closer.as_deref() == Some(id.as_str())) {
            if !done.contains_key(&group.opener) {
                count += 1;
            }
        }
        pending_deps.insert(id.clone(), count);
    }
}

fn spawn_node(
    shared: Arc<Shared>,
    plan: &Plan,
    id: String,
    env: Arc<tokio::sync::RwLock<Environment>>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<(String, NodeOutput)>,
) {
    let plan = plan.clone();
    tokio::spawn(async move {
        let _permit = semaphore.clone().acquire_owned().await.ok();

        {
            let mut progress = shared.progress.lock().await;
            if let Some(p) = progress.get_mut(&id) {
                p.status = NodeStatus::Running;
                p.started_at = Some(chrono::Utc::now());
            }
        }

        let node = match plan.node(&id) {
            Some(n) => n.clone(),
            None => return,
        };

        let output = run_one_node(&shared, &plan, &node, env, semaphore).await;
        let _ = tx.send((id, output)).await;
    });
}

async fn run_one_node(
    shared: &Arc<Shared>,
    plan: &Plan,
    node: &crate::document::NodeDecl,
    env: Arc<tokio::sync::RwLock<Environment>>,
    semaphore: Arc<Semaphore>,
) -> NodeOutput {
    if *shared.cancel.borrow() {
        return NodeOutput::Skipped { reason: "cancelled".to_string() };
    }

    match node.kind {
        NodeKind::Split => {
            fanout::run_split(shared.clone(), plan, node, env, semaphore).await
        }
        NodeKind::Aggregate => fanout::run_aggregate(shared, plan, node, env).await,
        NodeKind::Join => run_join(shared, node, env).await,
        NodeKind::Foreach => fanout::run_foreach(shared.clone(), plan, node, env).await,
        _ => {
            let snapshot = env.read().await.clone();
            let handler = match shared.registry.get(node.kind) {
                Some(h) => h,
                None => return NodeOutput::Failed {
                    error: format!("no handler registered for kind '{}'", node.kind.label()),
                    inputs_snapshot: node.config.clone(),
                    timestamp: chrono::Utc::now(),
                },
            };

            match handler.handle(&node.id, &node.config, &snapshot, &shared.cancel).await {
                Ok(HandlerOutcome::Success(value)) => NodeOutput::Success { value },
                Ok(HandlerOutcome::Skipped(reason)) => NodeOutput::Skipped { reason },
                Ok(HandlerOutcome::Route(route)) => {
                    mark_not_taken(shared, plan, &route).await;
                    NodeOutput::Success { value: serde_json::json!({ "chosen": route.chosen }) }
                }
                Err(e) => NodeOutput::Failed {
                    error: e.to_string(),
                    inputs_snapshot: node.config.clone(),
                    timestamp: chrono::Utc::now(),
                },
            }
        }
    }
}

/// Eagerly mark a non-chosen route branch's exclusive descendants
/// `Skipped{"not taken"}` so they never dispatch (§4.4).
async fn mark_not_taken(shared: &Arc<Shared>, plan: &Plan, route: &crate::handlers::RouteOutcome) {
    let mut to_visit: VecDeque<String> = route.not_chosen.iter().cloned().collect();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(target) = to_visit.pop_front() {
        if !visited.insert(target.clone()) {
            continue;
        }
        {
            let mut outputs = shared.outputs.lock().await;
            outputs
                .entry(target.clone())
                .or_insert(NodeOutput::Skipped { reason: "not taken".to_string() });
        }
        {
            let mut progress = shared.progress.lock().await;
            if let Some(p) = progress.get_mut(&target) {
                p.status = NodeStatus::Skipped;
                p.completed_at = Some(chrono::Utc::now());
            }
        }
        if let Some(dependents) = plan.dependents.get(&target) {
            for dep in dependents {
                to_visit.push_back(dep.clone());
            }
        }
    }
}

/// `join` handler: a barrier over `sources`. Since the executor already
/// gates a node's dispatch on its `depends_on`/implicit-reference edges
/// being terminal, by the time this runs every source is already resolved
/// in the environment; this only needs to assemble the combined value.
async fn run_join(
    shared: &Arc<Shared>,
    node: &crate::document::NodeDecl,
    env: Arc<tokio::sync::RwLock<Environment>>,
) -> NodeOutput {
    let sources = match node.config.get("sources").and_then(JsonValue::as_array) {
        Some(s) => s,
        None => {
            return NodeOutput::Failed {
                error: "join: missing 'sources'".to_string(),
                inputs_snapshot: node.config.clone(),
                timestamp: chrono::Utc::now(),
            }
        }
    };

    let snapshot = env.read().await.clone();
    let mut names = Vec::new();
    for source in sources {
        match source.as_str() {
            Some(name) => names.push(name.to_string()),
            None => {
                return NodeOutput::Failed {
                    error: "join: 'sources' entries must be node names".to_string(),
                    inputs_snapshot: node.config.clone(),
                    timestamp: chrono::Utc::now(),
                }
            }
        }
    }

    if let Some(on) = node.config.get("on").and_then(JsonValue::as_str) {
        let mut by_key = serde_json::Map::new();
        for name in &names {
            let value = snapshot.node_value(name).cloned().unwrap_or(JsonValue::Null);
            let key_env = {
                let mut e = snapshot.clone();
                e.publish("item", value.clone());
                e
            };
            let key = crate::template::render(on, &key_env).unwrap_or(JsonValue::Null);
            by_key.insert(crate::template::stringify(&key), value);
        }
        return NodeOutput::Success { value: JsonValue::Object(by_key) };
    }

    let mut merged = serde_json::Map::new();
    for name in &names {
        merged.insert(name.clone(), snapshot.node_value(name).cloned().unwrap_or(JsonValue::Null));
    }
    NodeOutput::Success { value: JsonValue::Object(merged) }
}

pub(crate) fn watch_never_cancelled() -> CancelSignal {
    watch::channel(false).1
}

#[cfg(test)]
mod tests;

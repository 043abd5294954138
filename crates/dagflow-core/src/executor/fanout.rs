//! Fan-out group execution: the `split`/`aggregate`/`foreach` half of §4.5
//! that the generic node state machine in [`super`] delegates to.
//!
//! A `split` is dispatched like any other node, but instead of calling a
//! [`crate::handlers::NodeHandler`] it evaluates its `field` into an array
//! and replays the group's member sub-DAG once per surviving element via
//! [`super::run_node_set`] — the same "resolve structure once, replay per
//! unit" split [`crate::dataflow`] documents between plan time and
//! execution time. Because the *parent* scope's node-set only sees the
//! `split` and `aggregate` ids (not the members between them, which belong
//! to the fan-out group), the per-element results have nowhere to live
//! except a side channel: [`FanOutResults`], keyed by group id, written by
//! `run_split` and consumed exactly once by the matching `run_aggregate`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::document::NodeDecl;
use crate::environment::{Environment, LoopFrame};
use crate::plan::Plan;
use crate::record::NodeOutput;

use super::Shared;

/// Everything one surviving element produced: every member node's
/// [`NodeOutput`], keyed by node id, for one pass through the group.
pub type ElementResult = BTreeMap<String, NodeOutput>;

/// Per-element results of every fan-out group currently in flight, keyed
/// by [`crate::dataflow::FanOutGroup::id`]. A `split` stores its group's
/// results here; the matching `aggregate` takes them back out exactly
/// once — nested groups share the same table, keyed by their own id.
#[derive(Default)]
pub struct FanOutResults {
    groups: Mutex<BTreeMap<usize, Vec<ElementResult>>>,
}

impl FanOutResults {
    async fn store(&self, group_id: usize, results: Vec<ElementResult>) {
        self.groups.lock().await.insert(group_id, results);
    }

    async fn take(&self, group_id: usize) -> Option<Vec<ElementResult>> {
        self.groups.lock().await.remove(&group_id)
    }
}

fn fail(node: &NodeDecl, message: impl Into<String>) -> NodeOutput {
    NodeOutput::Failed {
        error: message.into(),
        inputs_snapshot: node.config.clone(),
        timestamp: chrono::Utc::now(),
    }
}

/// `split` (§4.5): evaluate `field` to an array, then run the group's
/// member sub-DAG once per element in parallel, each with its own loop
/// binding. Stores the per-element results for the matching `aggregate`
/// and returns the evaluated array as this node's own output.
pub async fn run_split(
    shared: Arc<Shared>,
    plan: &Plan,
    node: &NodeDecl,
    env: Arc<RwLock<Environment>>,
    semaphore: Arc<Semaphore>,
) -> NodeOutput {
    let Some(field_src) = node.config.get("field").and_then(JsonValue::as_str) else {
        return fail(node, "split: missing 'field'");
    };
    let item_name = node
        .config
        .get("item_name")
        .and_then(JsonValue::as_str)
        .unwrap_or("item")
        .to_string();

    let snapshot = env.read().await.clone();
    let array_value = match crate::template::render(field_src, &snapshot) {
        Ok(v) => v,
        Err(e) => return fail(node, e.to_string()),
    };
    let Some(array) = array_value.as_array().cloned() else {
        return fail(node, "split: 'field' did not resolve to an array");
    };

    let Some(group) = shared
        .dataflow
        .groups
        .iter()
        .find(|g| g.opener == node.id)
        .cloned()
    else {
        // A split with no dependents between it and an aggregate (an
        // empty group, or one the planner never matched) still publishes
        // the array; there is simply nothing to fan out over.
        return NodeOutput::Success { value: JsonValue::Array(array) };
    };

    let mut handles = Vec::with_capacity(array.len());
    for (index, item) in array.iter().cloned().enumerate() {
        let shared = shared.clone();
        let plan = plan.clone();
        let member_ids = group.members.clone();
        let semaphore = semaphore.clone();
        let frame = LoopFrame {
            item_name: item_name.clone(),
            item,
            index,
        };
        let child_env = snapshot.with_loop_frame(frame);
        handles.push(tokio::spawn(async move {
            let results = super::run_node_set(shared, &plan, &member_ids, child_env, semaphore).await;
            (index, results)
        }));
    }

    let mut per_element: Vec<ElementResult> = vec![BTreeMap::new(); array.len()];
    for handle in handles {
        if let Ok((index, results)) = handle.await {
            per_element[index] = results;
        }
    }

    shared.fan_out.store(group.id, per_element).await;

    NodeOutput::Success { value: JsonValue::Array(array) }
}

/// `aggregate` (§4.5): closes the innermost fan-out group opened by the
/// matching `split`. Collects one value per surviving element from the
/// member node named by this node's `depends_on` (its declared source),
/// combining per `mode`. `array`/`concat` preserve original index order;
/// `object` keys by the evaluated `key` expression and errors on
/// duplicates; `sum` adds the numeric values.
pub async fn run_aggregate(
    shared: &Arc<Shared>,
    _plan: &Plan,
    node: &NodeDecl,
    env: Arc<RwLock<Environment>>,
) -> NodeOutput {
    let Some(group) = shared
        .dataflow
        .groups
        .iter()
        .find(|g| g.closer.as_deref() == Some(node.id.as_str()))
        .cloned()
    else {
        return fail(node, "aggregate: no matching split for this node");
    };

    // Prefer an explicit `source`; `depends_on` may legitimately name more
    // than the element source (e.g. the group's own `split`), so falling
    // back to it is fragile. The group's own last in-group member — the
    // node that runs immediately before this `aggregate` closes it — is a
    // safe default when `source` is omitted.
    let source = node
        .config
        .get("source")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .or_else(|| group.members.last().cloned());
    let Some(source) = source else {
        return fail(node, "aggregate: could not determine source node; set 'source'");
    };

    let per_element = shared.fan_out.take(group.id).await.unwrap_or_default();

    let mut survivors: Vec<(usize, JsonValue)> = Vec::new();
    for (index, element) in per_element.iter().enumerate() {
        if let Some(NodeOutput::Success { value }) = element.get(&source) {
            survivors.push((index, value.clone()));
        }
    }
    survivors.sort_by_key(|(index, _)| *index);

    let mode = node
        .config
        .get("mode")
        .and_then(JsonValue::as_str)
        .unwrap_or("array");

    let value = match mode {
        "array" => JsonValue::Array(survivors.iter().map(|(_, v)| v.clone()).collect()),
        "concat" => {
            let mut out = Vec::new();
            for (_, v) in &survivors {
                match v.as_array() {
                    Some(items) => out.extend(items.iter().cloned()),
                    None => out.push(v.clone()),
                }
            }
            JsonValue::Array(out)
        }
        "sum" => {
            let total: f64 = survivors.iter().filter_map(|(_, v)| v.as_f64()).sum();
            serde_json::json!(total)
        }
        "object" => {
            let key_expr = node.config.get("key").and_then(JsonValue::as_str);
            let snapshot = env.read().await.clone();
            let mut map = serde_json::Map::new();
            for (index, value) in &survivors {
                let key = match key_expr {
                    Some(expr) => {
                        let item_env = snapshot.with_loop_frame(LoopFrame {
                            item_name: group.item_name.clone(),
                            item: value.clone(),
                            index: *index,
                        });
                        match crate::template::render(expr, &item_env) {
                            Ok(k) => crate::template::stringify(&k),
                            Err(e) => return fail(node, e.to_string()),
                        }
                    }
                    None => index.to_string(),
                };
                if map.contains_key(&key) {
                    return fail(node, format!("aggregate: duplicate key '{key}'"));
                }
                map.insert(key, value.clone());
            }
            JsonValue::Object(map)
        }
        other => return fail(node, format!("aggregate: unknown mode '{other}'")),
    };

    NodeOutput::Success { value }
}

/// `foreach` (§4.5): sugar for an anonymous `split`/`aggregate` pair around
/// a single `transform`, evaluated inline with no separate member nodes or
/// [`FanOutResults`] bookkeeping. `condition` (optional) filters elements
/// before `template` renders them, mirroring `filter`'s short-circuit.
pub async fn run_foreach(
    shared: Arc<Shared>,
    _plan: &Plan,
    node: &NodeDecl,
    env: Arc<RwLock<Environment>>,
) -> NodeOutput {
    if *shared.cancel.borrow() {
        return NodeOutput::Skipped { reason: "cancelled".to_string() };
    }

    let Some(field_src) = node.config.get("field").and_then(JsonValue::as_str) else {
        return fail(node, "foreach: missing 'field'");
    };
    let Some(template_value) = node.config.get("template").cloned() else {
        return fail(node, "foreach: missing 'template'");
    };
    let item_name = node
        .config
        .get("item_name")
        .and_then(JsonValue::as_str)
        .unwrap_or("item")
        .to_string();

    let snapshot = env.read().await.clone();
    let array_value = match crate::template::render(field_src, &snapshot) {
        Ok(v) => v,
        Err(e) => return fail(node, e.to_string()),
    };
    let Some(array) = array_value.as_array().cloned() else {
        return fail(node, "foreach: 'field' did not resolve to an array");
    };

    let condition = node.config.get("condition").and_then(JsonValue::as_str);

    let mut out = Vec::with_capacity(array.len());
    for (index, item) in array.into_iter().enumerate() {
        let frame = LoopFrame { item_name: item_name.clone(), item, index };
        let item_env = snapshot.with_loop_frame(frame);

        if let Some(cond) = condition {
            let value = match crate::template::render(cond, &item_env) {
                Ok(v) => v,
                Err(e) => return fail(node, e.to_string()),
            };
            if !crate::template::truthy(&value) {
                continue;
            }
        }

        match crate::handlers::render_value(&node.id, &template_value, &item_env) {
            Ok(rendered) => out.push(rendered),
            Err(e) => return fail(node, e.to_string()),
        }
    }

    NodeOutput::Success { value: JsonValue::Array(out) }
}

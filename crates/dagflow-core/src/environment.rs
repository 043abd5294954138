//! The layered variable scope a workflow execution reads templates against.
//!
//! Precedence, lowest to highest: `env.*`, `inputs.*`, per-node outputs,
//! per-scope loop bindings. Once a layer entry is written it is never
//! mutated; loop bindings form a stack whose top wins, pushed by `split`/
//! `foreach` and popped when their sub-plan instance finishes.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::template::{truthy, Lookup, PathSegment};

/// One frame of loop bindings introduced by an enclosing `split`/`foreach`.
/// `item_name` (plus the `item` alias) and `loop.index` are both resolved
/// from the same frame.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    pub item_name: String,
    pub item: JsonValue,
    pub index: usize,
}

/// Layered environment for one execution (or one fan-out element instance,
/// which shares its parent's `env`/`inputs`/node layers and adds its own
/// loop frame).
#[derive(Debug, Clone)]
pub struct Environment {
    env_vars: BTreeMap<String, JsonValue>,
    inputs: BTreeMap<String, JsonValue>,
    nodes: BTreeMap<String, JsonValue>,
    loop_stack: Vec<LoopFrame>,
}

impl Environment {
    pub fn new(env_vars: BTreeMap<String, JsonValue>, inputs: BTreeMap<String, JsonValue>) -> Self {
        Self {
            env_vars,
            inputs,
            nodes: BTreeMap::new(),
            loop_stack: Vec::new(),
        }
    }

    /// Publish a completed node's value. Called exactly once per node per
    /// execution; overwriting an existing key would violate the
    /// single-writer invariant, but is not itself checked here — the
    /// executor only calls this once per node.
    pub fn publish(&mut self, node_id: impl Into<String>, value: JsonValue) {
        self.nodes.insert(node_id.into(), value);
    }

    pub fn node_value(&self, node_id: &str) -> Option<&JsonValue> {
        self.nodes.get(node_id)
    }

    /// A child environment sharing this one's `env`/`inputs`/node layers,
    /// with one additional loop frame pushed — used to evaluate one
    /// element of a fan-out group without mutating the parent.
    pub fn with_loop_frame(&self, frame: LoopFrame) -> Self {
        let mut child = self.clone();
        child.loop_stack.push(frame);
        child
    }

    fn lookup_env(&self, rest: &[PathSegment]) -> Option<JsonValue> {
        let name = segment_key(rest.first()?)?;
        self.env_vars.get(&name).cloned()
    }

    fn lookup_inputs(&self, rest: &[PathSegment]) -> Option<JsonValue> {
        let name = segment_key(rest.first()?)?;
        let mut current = self.inputs.get(&name)?.clone();
        current = walk(current, &rest[1..])?;
        Some(current)
    }

    fn lookup_loop(&self, segments: &[PathSegment]) -> Option<JsonValue> {
        let head = segment_key(segments.first()?)?;
        if head == "loop" {
            let key = segment_key(segments.get(1)?)?;
            let frame = self.loop_stack.last()?;
            return match key.as_str() {
                "index" => Some(JsonValue::Number((frame.index as i64).into())),
                _ => None,
            };
        }
        for frame in self.loop_stack.iter().rev() {
            if head == frame.item_name || head == "item" {
                return walk(frame.item.clone(), &segments[1..]);
            }
        }
        None
    }
}

impl Lookup for Environment {
    fn lookup(&self, segments: &[PathSegment]) -> Option<JsonValue> {
        let head = segment_key(segments.first()?)?;

        if head == "env" {
            return self.lookup_env(&segments[1..]);
        }
        if head == "inputs" {
            return self.lookup_inputs(&segments[1..]);
        }
        if let Some(value) = self.lookup_loop(segments) {
            return Some(value);
        }
        if let Some(value) = self.nodes.get(&head) {
            return walk(value.clone(), &segments[1..]);
        }
        None
    }
}

fn segment_key(segment: &PathSegment) -> Option<String> {
    match segment {
        PathSegment::Ident(name) | PathSegment::Key(name) => Some(name.clone()),
        PathSegment::Index(_) => None,
    }
}

fn walk(mut current: JsonValue, rest: &[PathSegment]) -> Option<JsonValue> {
    for seg in rest {
        current = match seg {
            PathSegment::Ident(name) | PathSegment::Key(name) => current.get(name)?.clone(),
            PathSegment::Index(i) => {
                let idx = if *i < 0 { return None } else { *i as usize };
                current.get(idx)?.clone()
            }
        };
    }
    Some(current)
}

/// Whether a path resolves to a value considered "reached" for the
/// purposes of route/filter truthiness checks — a thin convenience over
/// `Lookup::lookup` plus `template::truthy`.
pub fn path_is_truthy(env: &Environment, segments: &[PathSegment]) -> bool {
    env.lookup(segments)
        .map(|v| truthy(&v))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::render;

    fn base() -> Environment {
        let mut env_vars = BTreeMap::new();
        env_vars.insert("API_KEY".to_string(), serde_json::json!("secret"));
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "companies".to_string(),
            serde_json::json!([{"name": "Acme", "rev": 200}, {"name": "Globex", "rev": 50}]),
        );
        Environment::new(env_vars, inputs)
    }

    #[test]
    fn resolves_env_layer() {
        let env = base();
        let rendered = render("{{ env.API_KEY }}", &env).unwrap();
        assert_eq!(rendered, serde_json::json!("secret"));
    }

    #[test]
    fn resolves_inputs_layer_with_path() {
        let env = base();
        let rendered = render("{{ inputs.companies[0].name }}", &env).unwrap();
        assert_eq!(rendered, serde_json::json!("Acme"));
    }

    #[test]
    fn resolves_node_output_layer() {
        let mut env = base();
        env.publish("fetch_data", serde_json::json!({"status": 200}));
        let rendered = render("{{ fetch_data.status }}", &env).unwrap();
        assert_eq!(rendered, serde_json::json!(200));
    }

    #[test]
    fn loop_frame_shadows_and_supports_item_alias() {
        let env = base();
        let frame = LoopFrame {
            item_name: "company".to_string(),
            item: serde_json::json!({"name": "Acme", "rev": 200}),
            index: 0,
        };
        let child = env.with_loop_frame(frame);
        assert_eq!(
            render("{{ company.name }}", &child).unwrap(),
            serde_json::json!("Acme")
        );
        assert_eq!(render("{{ item.name }}", &child).unwrap(), serde_json::json!("Acme"));
        assert_eq!(render("{{ loop.index }}", &child).unwrap(), serde_json::json!(0));
    }

    #[test]
    fn nested_loop_frames_innermost_wins() {
        let env = base();
        let outer = env.with_loop_frame(LoopFrame {
            item_name: "company".to_string(),
            item: serde_json::json!({"name": "Outer"}),
            index: 0,
        });
        let inner = outer.with_loop_frame(LoopFrame {
            item_name: "division".to_string(),
            item: serde_json::json!({"name": "Inner"}),
            index: 1,
        });
        assert_eq!(
            render("{{ company.name }}", &inner).unwrap(),
            serde_json::json!("Outer")
        );
        assert_eq!(
            render("{{ division.name }}", &inner).unwrap(),
            serde_json::json!("Inner")
        );
        assert_eq!(render("{{ loop.index }}", &inner).unwrap(), serde_json::json!(1));
    }

    #[test]
    fn undefined_reference_is_null() {
        let env = base();
        let rendered = render("{{ nonexistent.field }}", &env).unwrap();
        assert_eq!(rendered, JsonValue::Null);
    }
}

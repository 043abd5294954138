//! Kind-to-handler dispatch, mirroring the teacher's `AgentAdapter` trait
//! plus `adapter::registry` lookup-by-key split: each handler owns its
//! config projection and turns `(expanded_config, environment) ->
//! NodeOutput`, while the narrow [`crate::adapters`] traits carry the
//! actual side effects so handler logic stays pure and unit-testable.

mod file;
mod http;
mod llm;
mod route;
mod script;

use serde_json::Value as JsonValue;

use crate::adapters::CancelSignal;
use crate::document::NodeKind;
use crate::environment::Environment;
use crate::error::WorkflowError;

pub use file::FileHandler;
pub use http::HttpHandler;
pub use llm::LlmHandler;
pub use route::{RouteHandler, RouteOutcome};
pub use script::ScriptHandler;

/// What a handler produced, distinct from [`crate::record::NodeOutput`]:
/// `Route` carries extra routing information the executor needs (which
/// branch was *not* taken) that doesn't belong in the persisted record.
pub enum HandlerOutcome {
    Success(JsonValue),
    Skipped(String),
    Route(RouteOutcome),
}

impl From<JsonValue> for HandlerOutcome {
    fn from(value: JsonValue) -> Self {
        HandlerOutcome::Success(value)
    }
}

/// A node kind's executable behavior: expand its already-projected config
/// against `env` and produce an outcome. Implementations must not mutate
/// `env`; the executor owns publication.
#[async_trait::async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(
        &self,
        node_id: &str,
        config: &JsonValue,
        env: &Environment,
        cancel: &CancelSignal,
    ) -> Result<HandlerOutcome, WorkflowError>;
}

/// Looks up the handler responsible for a [`NodeKind`]. `split`,
/// `aggregate`, and the opener/closer half of `foreach` are orchestrated
/// directly by the executor (they change the shape of execution, not just
/// a value) and have no entry here; `filter` and `transform` are ordinary
/// handlers.
pub struct HandlerRegistry {
    llm: LlmHandler,
    http: HttpHandler,
    route: RouteHandler,
    file: FileHandler,
    script: ScriptHandler,
    filter: TransformLikeHandler,
    transform: TransformLikeHandler,
}

impl HandlerRegistry {
    pub fn new(
        llm: LlmHandler,
        http: HttpHandler,
        file: FileHandler,
        script: ScriptHandler,
    ) -> Self {
        Self {
            llm,
            http,
            route: RouteHandler,
            file,
            script,
            filter: TransformLikeHandler,
            transform: TransformLikeHandler,
        }
    }

    pub fn get(&self, kind: NodeKind) -> Option<&dyn NodeHandler> {
        match kind {
            NodeKind::Llm => Some(&self.llm),
            NodeKind::Http => Some(&self.http),
            NodeKind::Route => Some(&self.route),
            NodeKind::File => Some(&self.file),
            NodeKind::Script => Some(&self.script),
            NodeKind::Filter => Some(&self.filter),
            NodeKind::Transform => Some(&self.transform),
            NodeKind::Split | NodeKind::Aggregate | NodeKind::Join | NodeKind::Foreach => None,
        }
    }
}

/// Shared handler for `filter` and `transform`: both evaluate a single
/// config field as a template against the environment and either pass the
/// value through (`transform`) or gate it (`filter`, which maps a falsy
/// condition to `Skipped{"filtered"}`, §4.5).
pub struct TransformLikeHandler;

#[async_trait::async_trait]
impl NodeHandler for TransformLikeHandler {
    async fn handle(
        &self,
        node_id: &str,
        config: &JsonValue,
        env: &Environment,
        _cancel: &CancelSignal,
    ) -> Result<HandlerOutcome, WorkflowError> {
        if let Some(condition) = config.get("condition").and_then(JsonValue::as_str) {
            let value = crate::template::render(condition, env)
                .map_err(|e| WorkflowError::template(node_id, e.to_string()))?;
            return Ok(if crate::template::truthy(&value) {
                HandlerOutcome::Success(value)
            } else {
                HandlerOutcome::Skipped("filtered".to_string())
            });
        }

        let template_value = config.get("template").ok_or_else(|| {
            WorkflowError::template(node_id, "missing 'template' field".to_string())
        })?;
        let rendered = render_value(node_id, template_value, env)?;
        Ok(HandlerOutcome::Success(rendered))
    }
}

/// Recursively render every string leaf of a JSON config value as a
/// template, preserving object/array shape. A mapping-shaped `template`
/// config renders each field independently.
pub fn render_value(
    node_id: &str,
    value: &JsonValue,
    env: &Environment,
) -> Result<JsonValue, WorkflowError> {
    match value {
        JsonValue::String(s) => crate::template::render(s, env)
            .map_err(|e| WorkflowError::template(node_id, e.to_string())),
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(node_id, item, env)?);
            }
            Ok(JsonValue::Array(out))
        }
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(node_id, v, env)?);
            }
            Ok(JsonValue::Object(out))
        }
        other => Ok(other.clone()),
    }
}

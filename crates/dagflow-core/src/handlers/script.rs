use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::adapters::{CancelSignal, ScriptAdapter};
use crate::environment::Environment;
use crate::error::WorkflowError;
use crate::template;

use super::{render_value, HandlerOutcome, NodeHandler};

/// `script` (alias `python`) handler (§4.4). Exposes `context` read-only to
/// the embedded script; a non-JSON-serializable return is a terminal
/// `SerializationError`.
pub struct ScriptHandler {
    adapter: Arc<dyn ScriptAdapter>,
}

impl ScriptHandler {
    pub fn new(adapter: Arc<dyn ScriptAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait::async_trait]
impl NodeHandler for ScriptHandler {
    async fn handle(
        &self,
        node_id: &str,
        config: &JsonValue,
        env: &Environment,
        cancel: &CancelSignal,
    ) -> Result<HandlerOutcome, WorkflowError> {
        let code_or_file = config
            .get("code")
            .or_else(|| config.get("file"))
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WorkflowError::handler(node_id, "script", "missing 'code'"))?;

        let context = match config.get("context") {
            Some(context) => render_value(node_id, context, env)?,
            None => JsonValue::Object(serde_json::Map::new()),
        };

        let value = self
            .adapter
            .eval(code_or_file, &context, cancel)
            .await
            .map_err(|e| match e {
                crate::adapters::AdapterError::NotSerializable(detail) => {
                    WorkflowError::Serialization { node: node_id.to_string(), message: detail }
                }
                other => WorkflowError::handler(node_id, "script", other.to_string()),
            })?;

        Ok(HandlerOutcome::Success(value))
    }
}

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::adapters::{CancelSignal, LlmAdapter};
use crate::environment::Environment;
use crate::error::WorkflowError;
use crate::template;

use super::{HandlerOutcome, NodeHandler};

/// `llm` handler (§4.4): renders `prompt`/`prompt_template`, calls the
/// configured [`LlmAdapter`], and validates the result against an optional
/// JSON-Schema-subset `schema`. One retry with exponential delay on
/// transport failure; a schema mismatch is terminal, not retried.
pub struct LlmHandler {
    adapter: Arc<dyn LlmAdapter>,
    retries: u32,
}

impl LlmHandler {
    pub fn new(adapter: Arc<dyn LlmAdapter>, retries: u32) -> Self {
        Self { adapter, retries }
    }
}

#[async_trait::async_trait]
impl NodeHandler for LlmHandler {
    async fn handle(
        &self,
        node_id: &str,
        config: &JsonValue,
        env: &Environment,
        cancel: &CancelSignal,
    ) -> Result<HandlerOutcome, WorkflowError> {
        let prompt_src = config
            .get("prompt")
            .or_else(|| config.get("prompt_template"))
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WorkflowError::handler(node_id, "llm", "missing 'prompt'"))?;

        let prompt = template::render(prompt_src, env)
            .map_err(|e| WorkflowError::template(node_id, e.to_string()))?;
        let prompt = template::stringify(&prompt);

        let model = config
            .get("model")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WorkflowError::handler(node_id, "llm", "missing 'model'"))?;

        let schema = config.get("schema");

        let mut attempt = 0;
        loop {
            match self.adapter.complete(model, &prompt, schema, cancel).await {
                Ok(value) => {
                    if let Some(schema) = schema {
                        if !matches_schema(&value, schema) {
                            return Err(WorkflowError::handler(
                                node_id,
                                "llm",
                                "output does not match the declared schema",
                            ));
                        }
                    }
                    return Ok(HandlerOutcome::Success(value));
                }
                Err(_) if attempt < self.retries => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
                    continue;
                }
                Err(e) => {
                    return Err(WorkflowError::handler(node_id, "llm", e.to_string()));
                }
            }
        }
    }
}

/// A small JSON-Schema subset: `type` and, for objects, `required` keys.
/// Enough to catch obviously malformed LLM output without pulling in a
/// full schema-validation dependency for a narrow, internal check.
fn matches_schema(value: &JsonValue, schema: &JsonValue) -> bool {
    if let Some(expected_type) = schema.get("type").and_then(JsonValue::as_str) {
        let ok = match expected_type {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    if let Some(required) = schema.get("required").and_then(JsonValue::as_array) {
        for key in required {
            if let Some(key) = key.as_str() {
                if value.get(key).is_none() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedLlmAdapter;
    use std::collections::BTreeMap;
    use tokio::sync::watch;

    fn cancel() -> CancelSignal {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn renders_prompt_and_calls_adapter() {
        let adapter = Arc::new(SimulatedLlmAdapter {
            fixed_response: Some(serde_json::json!({"summary": "ok"})),
        });
        let handler = LlmHandler::new(adapter, 1);
        let env = Environment::new(BTreeMap::new(), BTreeMap::new());
        let config = serde_json::json!({"prompt": "summarize {{ 1 + 1 }} items", "model": "test-model"});
        let outcome = handler.handle("n", &config, &env, &cancel()).await.unwrap();
        match outcome {
            HandlerOutcome::Success(value) => assert_eq!(value, serde_json::json!({"summary": "ok"})),
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn schema_mismatch_is_terminal() {
        let adapter = Arc::new(SimulatedLlmAdapter {
            fixed_response: Some(serde_json::json!({"wrong": "shape"})),
        });
        let handler = LlmHandler::new(adapter, 1);
        let env = Environment::new(BTreeMap::new(), BTreeMap::new());
        let config = serde_json::json!({
            "prompt": "x",
            "model": "test-model",
            "schema": {"type": "object", "required": ["summary"]},
        });
        let err = handler.handle("n", &config, &env, &cancel()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Handler { .. }));
    }
}

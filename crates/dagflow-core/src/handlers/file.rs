use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::adapters::{CancelSignal, FileFormat, FilesystemAdapter};
use crate::environment::Environment;
use crate::error::WorkflowError;
use crate::template;

use super::{render_value, HandlerOutcome, NodeHandler};

/// `file` handler (§4.4). `path` or `pattern` (glob) selects the target;
/// `mode` defaults to `read`.
pub struct FileHandler {
    adapter: Arc<dyn FilesystemAdapter>,
}

impl FileHandler {
    pub fn new(adapter: Arc<dyn FilesystemAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait::async_trait]
impl NodeHandler for FileHandler {
    async fn handle(
        &self,
        node_id: &str,
        config: &JsonValue,
        env: &Environment,
        cancel: &CancelSignal,
    ) -> Result<HandlerOutcome, WorkflowError> {
        let format = match config.get("format").and_then(JsonValue::as_str) {
            Some("json") => FileFormat::Json,
            Some("yaml") => FileFormat::Yaml,
            Some("bytes") => FileFormat::Bytes,
            _ => FileFormat::Text,
        };

        let mode = config.get("mode").and_then(JsonValue::as_str).unwrap_or("read");

        if let Some(pattern_src) = config.get("pattern").and_then(JsonValue::as_str) {
            let pattern = template::stringify(
                &template::render(pattern_src, env)
                    .map_err(|e| WorkflowError::template(node_id, e.to_string()))?,
            );
            let paths = self
                .adapter
                .glob(&pattern)
                .await
                .map_err(|e| WorkflowError::handler(node_id, "file", e.to_string()))?;
            return Ok(HandlerOutcome::Success(serde_json::json!(paths)));
        }

        let path_src = config
            .get("path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WorkflowError::handler(node_id, "file", "missing 'path'"))?;
        let path = template::stringify(
            &template::render(path_src, env).map_err(|e| WorkflowError::template(node_id, e.to_string()))?,
        );
        if path.is_empty() {
            return Err(WorkflowError::handler(node_id, "file", "'path' is empty"));
        }

        if mode == "write" {
            let content = config
                .get("content")
                .ok_or_else(|| WorkflowError::handler(node_id, "file", "missing 'content'"))?;
            let rendered = render_value(node_id, content, env)?;
            let info = self
                .adapter
                .write(&path, format, &rendered, cancel)
                .await
                .map_err(|e| WorkflowError::handler(node_id, "file", e.to_string()))?;
            return Ok(HandlerOutcome::Success(serde_json::json!({
                "path": info.path,
                "bytes_written": info.bytes_written,
            })));
        }

        let value = self
            .adapter
            .read(&path, format, cancel)
            .await
            .map_err(|e| WorkflowError::handler(node_id, "file", e.to_string()))?;
        Ok(HandlerOutcome::Success(value))
    }
}

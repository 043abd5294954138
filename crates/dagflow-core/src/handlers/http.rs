use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value as JsonValue;

use crate::adapters::{AuthKind, CancelSignal, HttpAdapter, HttpRequest};
use crate::environment::Environment;
use crate::error::WorkflowError;
use crate::template;

use super::{render_value, HandlerOutcome, NodeHandler};

/// `http` handler (§4.4). Network failures retry up to `retries` times
/// with jittered backoff; any response with `status >= 400` is returned as
/// a handler error and is never retried.
pub struct HttpHandler {
    adapter: Arc<dyn HttpAdapter>,
    retries: u32,
}

impl HttpHandler {
    pub fn new(adapter: Arc<dyn HttpAdapter>, retries: u32) -> Self {
        Self { adapter, retries }
    }
}

#[async_trait::async_trait]
impl NodeHandler for HttpHandler {
    async fn handle(
        &self,
        node_id: &str,
        config: &JsonValue,
        env: &Environment,
        cancel: &CancelSignal,
    ) -> Result<HandlerOutcome, WorkflowError> {
        let url_src = config
            .get("url")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WorkflowError::handler(node_id, "http", "missing 'url'"))?;
        let url = template::stringify(
            &template::render(url_src, env).map_err(|e| WorkflowError::template(node_id, e.to_string()))?,
        );
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(WorkflowError::handler(
                node_id,
                "http",
                format!("url '{url}' must start with http:// or https://"),
            ));
        }

        let method = render_optional_str(node_id, config, "method", env)?.unwrap_or_else(|| "GET".to_string());

        let headers = render_string_map(node_id, config.get("headers"), env)?;
        let params = render_string_map(node_id, config.get("params"), env)?;

        let body = match config.get("body") {
            Some(body) => Some(render_value(node_id, body, env)?),
            None => None,
        };

        let auth = match render_optional_str(node_id, config, "auth", env)?.as_deref() {
            Some("bearer") => AuthKind::Bearer,
            Some("basic") => AuthKind::Basic,
            _ => AuthKind::None,
        };

        let timeout_seconds = config.get("timeout").and_then(JsonValue::as_u64);

        let request = HttpRequest {
            method,
            url,
            headers,
            params,
            body,
            auth,
            timeout_seconds,
        };

        let mut attempt = 0;
        loop {
            match self.adapter.request(request.clone(), cancel).await {
                Ok(response) => {
                    return Ok(HandlerOutcome::Success(serde_json::json!({
                        "status": response.status,
                        "headers": response.headers,
                        "body": response.body,
                    })));
                }
                Err(crate::adapters::AdapterError::HttpStatus { status, body }) => {
                    return Err(WorkflowError::handler(
                        node_id,
                        "http",
                        format!("status {status}: {body}"),
                    ));
                }
                Err(_) if attempt < self.retries => {
                    attempt += 1;
                    let jitter_ms = rand::thread_rng().gen_range(0..100);
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt) + jitter_ms)).await;
                }
                Err(e) => return Err(WorkflowError::handler(node_id, "http", e.to_string())),
            }
        }
    }
}

fn render_optional_str(
    node_id: &str,
    config: &JsonValue,
    field: &str,
    env: &Environment,
) -> Result<Option<String>, WorkflowError> {
    match config.get(field).and_then(JsonValue::as_str) {
        Some(src) => Ok(Some(template::stringify(
            &template::render(src, env).map_err(|e| WorkflowError::template(node_id, e.to_string()))?,
        ))),
        None => Ok(None),
    }
}

fn render_string_map(
    node_id: &str,
    value: Option<&JsonValue>,
    env: &Environment,
) -> Result<BTreeMap<String, String>, WorkflowError> {
    let Some(map) = value.and_then(JsonValue::as_object) else {
        return Ok(BTreeMap::new());
    };
    let mut out = BTreeMap::new();
    for (k, v) in map {
        let rendered = match v {
            JsonValue::String(s) => template::render(s, env)
                .map_err(|e| WorkflowError::template(node_id, e.to_string()))?,
            other => other.clone(),
        };
        out.insert(k.clone(), template::stringify(&rendered));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedHttpAdapter;
    use crate::adapters::HttpResponse;
    use tokio::sync::watch;

    fn cancel() -> CancelSignal {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn rejects_non_http_scheme() {
        let adapter: Arc<dyn HttpAdapter> = Arc::new(SimulatedHttpAdapter::default());
        let handler = HttpHandler::new(adapter, 3);
        let env = Environment::new(BTreeMap::new(), BTreeMap::new());
        let config = serde_json::json!({"url": "ftp://example.com"});
        let err = handler.handle("n", &config, &env, &cancel()).await.unwrap_err();
        assert!(err.to_string().contains("http://"));
    }

    #[tokio::test]
    async fn successful_request_returns_status_and_body() {
        let sim = SimulatedHttpAdapter::default();
        sim.responses.lock().unwrap().insert(
            "https://example.com/api".to_string(),
            HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: serde_json::json!({"ok": true}),
            },
        );
        let adapter: Arc<dyn HttpAdapter> = Arc::new(sim);
        let handler = HttpHandler::new(adapter, 3);
        let env = Environment::new(BTreeMap::new(), BTreeMap::new());
        let config = serde_json::json!({"url": "https://example.com/api", "method": "GET"});
        let outcome = handler.handle("n", &config, &env, &cancel()).await.unwrap();
        match outcome {
            HandlerOutcome::Success(value) => {
                assert_eq!(value["status"], serde_json::json!(200));
                assert_eq!(value["body"]["ok"], serde_json::json!(true));
            }
            _ => panic!("expected success"),
        }
    }
}

use serde_json::Value as JsonValue;

use crate::adapters::CancelSignal;
use crate::environment::Environment;
use crate::error::WorkflowError;
use crate::template;

use super::{HandlerOutcome, NodeHandler};

/// The branch a `route` node chose, plus the targets it did *not* choose
/// (the executor marks those and their exclusive descendants
/// `Skipped{"not taken"}`, §4.4).
pub struct RouteOutcome {
    pub chosen: String,
    pub not_chosen: Vec<String>,
}

pub struct RouteHandler;

#[async_trait::async_trait]
impl NodeHandler for RouteHandler {
    async fn handle(
        &self,
        node_id: &str,
        config: &JsonValue,
        env: &Environment,
        _cancel: &CancelSignal,
    ) -> Result<HandlerOutcome, WorkflowError> {
        let routes = config
            .get("routes")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| WorkflowError::handler(node_id, "route", "missing 'routes'"))?;

        let mut chosen: Option<String> = None;
        let mut all_targets = Vec::new();

        for route in routes {
            let target = route
                .get("to")
                .or_else(|| route.get("then"))
                .and_then(JsonValue::as_str)
                .ok_or_else(|| WorkflowError::handler(node_id, "route", "route missing 'to'"))?
                .to_string();
            all_targets.push(target.clone());

            if chosen.is_some() {
                continue;
            }

            let is_default = route
                .get("is_default")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);

            if is_default {
                chosen = Some(target);
                continue;
            }

            if let Some(when) = route.get("when").and_then(JsonValue::as_str) {
                let value = template::render(when, env)
                    .map_err(|e| WorkflowError::template(node_id, e.to_string()))?;
                if template::truthy(&value) {
                    chosen = Some(target);
                }
            }
        }

        let chosen = chosen.ok_or_else(|| WorkflowError::handler(node_id, "route", "no-match"))?;
        let not_chosen = all_targets.into_iter().filter(|t| t != &chosen).collect();

        Ok(HandlerOutcome::Route(RouteOutcome { chosen, not_chosen }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::watch;

    fn cancel() -> CancelSignal {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn first_truthy_when_wins() {
        let handler = RouteHandler;
        let mut inputs = BTreeMap::new();
        inputs.insert("score".to_string(), serde_json::json!(90));
        let env = Environment::new(BTreeMap::new(), inputs);
        let config = serde_json::json!({
            "routes": [
                {"when": "inputs.score > 100", "to": "high"},
                {"when": "inputs.score > 50", "to": "medium"},
                {"is_default": true, "to": "low"},
            ]
        });
        let outcome = handler.handle("r", &config, &env, &cancel()).await.unwrap();
        match outcome {
            HandlerOutcome::Route(r) => {
                assert_eq!(r.chosen, "medium");
                assert_eq!(r.not_chosen, vec!["high".to_string(), "low".to_string()]);
            }
            _ => panic!("expected route outcome"),
        }
    }

    #[tokio::test]
    async fn no_match_is_an_error() {
        let handler = RouteHandler;
        let env = Environment::new(BTreeMap::new(), BTreeMap::new());
        let config = serde_json::json!({"routes": [{"when": "false", "to": "x"}]});
        let err = handler.handle("r", &config, &env, &cancel()).await.unwrap_err();
        assert!(err.to_string().contains("no-match"));
    }
}

//! The emitted shapes from §3 and §6: what one node produced, and what one
//! whole execution produced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What one node produced during one execution. Exactly one per declared
/// node (§3); a node never reached by the scheduler resolves to
/// `Skipped{reason: "unreached"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutput {
    Success { value: JsonValue },
    Skipped { reason: String },
    Failed {
        error: String,
        inputs_snapshot: JsonValue,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl NodeOutput {
    /// The value published into the [`crate::environment::Environment`]
    /// under this node's name: `Success` publishes its value verbatim,
    /// `Skipped` publishes `null`, `Failed` publishes `{"error": ...}` so
    /// downstream templates can inspect it (e.g. `{{ n.error | default(...) }}`)
    /// when `skip_errors` lets them run at all.
    pub fn published_value(&self) -> JsonValue {
        match self {
            NodeOutput::Success { value } => value.clone(),
            NodeOutput::Skipped { .. } => JsonValue::Null,
            NodeOutput::Failed { error, .. } => {
                serde_json::json!({ "error": error })
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutput::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NodeOutput::Failed { .. })
    }
}

/// Per-node entry in an [`ExecutionRecord`]'s `progress` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeProgress {
    pub status: NodeStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Overall execution outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

/// One error entry in an [`ExecutionRecord`]'s `errors` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEntry {
    pub error: String,
    pub inputs_snapshot: JsonValue,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// The full record of one workflow execution, returned by the executor and
/// printed by the CLI's `run` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: uuid::Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub inputs: BTreeMap<String, JsonValue>,
    pub outputs: BTreeMap<String, JsonValue>,
    pub progress: BTreeMap<String, NodeProgress>,
    pub errors: BTreeMap<String, ErrorEntry>,
}

impl ExecutionRecord {
    /// Exit code per §6: 0 completed, 2 partial, 3 failed, 130 cancelled.
    /// Validation-error (64) is handled by the CLI before an
    /// `ExecutionRecord` ever exists.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            ExecutionStatus::Completed => 0,
            ExecutionStatus::Partial => 2,
            ExecutionStatus::Failed => 3,
            ExecutionStatus::Cancelled => 130,
            ExecutionStatus::Pending | ExecutionStatus::Running => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_value_for_each_variant() {
        assert_eq!(
            NodeOutput::Success { value: serde_json::json!(1) }.published_value(),
            serde_json::json!(1)
        );
        assert_eq!(
            NodeOutput::Skipped { reason: "filtered".into() }.published_value(),
            JsonValue::Null
        );
        let failed = NodeOutput::Failed {
            error: "boom".into(),
            inputs_snapshot: JsonValue::Null,
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(failed.published_value(), serde_json::json!({"error": "boom"}));
    }

    #[test]
    fn exit_codes_match_spec() {
        let base = ExecutionRecord {
            id: uuid::Uuid::nil(),
            workflow_name: "demo".into(),
            status: ExecutionStatus::Completed,
            started_at: chrono::Utc::now(),
            completed_at: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            progress: BTreeMap::new(),
            errors: BTreeMap::new(),
        };
        assert_eq!(base.exit_code(), 0);
        assert_eq!(ExecutionRecord { status: ExecutionStatus::Partial, ..base.clone() }.exit_code(), 2);
        assert_eq!(ExecutionRecord { status: ExecutionStatus::Failed, ..base.clone() }.exit_code(), 3);
        assert_eq!(ExecutionRecord { status: ExecutionStatus::Cancelled, ..base }.exit_code(), 130);
    }
}

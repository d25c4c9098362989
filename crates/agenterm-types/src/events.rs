//! Append-only event log shape (SPEC_FULL.md §4.7's persisted Chat events)
//! and the streaming event emitted to callers of `Chat`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunCreated {
        project_id: String,
        timestamp: DateTime<Utc>,
    },
    PlanningStarted {
        project_id: String,
        timestamp: DateTime<Utc>,
    },
    SessionCreated {
        project_id: String,
        session_id: String,
        task_id: String,
        role: String,
        timestamp: DateTime<Utc>,
    },
    SessionStatusChanged {
        session_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    ApprovalRequested {
        project_id: String,
        tool: String,
        timestamp: DateTime<Utc>,
    },
    CommandDispatched {
        session_id: String,
        command_id: String,
        op: String,
        timestamp: DateTime<Utc>,
    },
    BudgetWarning {
        project_id: String,
        dimension: String,
        percentage: f64,
        timestamp: DateTime<Utc>,
    },
    ContractWarning {
        project_id: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    ContractError {
        project_id: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

/// One item of the `Chat` response stream (SPEC_FULL.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Token { text: String },
    ToolCall { name: String, args: Value },
    ToolResult { name: String, result: Value },
    Done,
    Error { reason: String },
}

/// Generic broadcast-bus payload. Permission asks/replies and anything else
/// that doesn't warrant its own enum variant publish through this shape;
/// `OrchestratorEvent`s flatten into it when forwarded to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

impl From<OrchestratorEvent> for EngineEvent {
    fn from(event: OrchestratorEvent) -> Self {
        let mut value = serde_json::to_value(&event).unwrap_or(Value::Null);
        let event_type = value
            .as_object_mut()
            .and_then(|obj| obj.remove("type"))
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            event_type,
            properties: value,
        }
    }
}

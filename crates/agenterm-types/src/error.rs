//! Error-kind hierarchy shared by every layer, per SPEC_FULL.md §7.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentermError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("policy denied ({rule}): {detail}")]
    PolicyDenied { rule: String, detail: String },

    #[error("scheduler blocked: {0}")]
    SchedulerBlocked(String),

    #[error("approval required for tool `{0}`")]
    ApprovalRequired(String),

    #[error("tool `{tool}` is not allowed in stage `{stage}`")]
    StageToolNotAllowed { tool: String, stage: String },

    #[error("role contract violation: {0}")]
    RoleContractViolation(String),

    #[error("external error ({status}): {detail}")]
    ExternalError { status: u16, detail: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("budget exhausted ({dimension}): {detail}")]
    BudgetExhausted { dimension: String, detail: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentermError {
    /// Whether this error kind is meant to be fed back to the LM as a tool
    /// result rather than surfaced to the caller as a hard failure.
    pub fn is_tool_feedback(&self) -> bool {
        matches!(
            self,
            Self::SchedulerBlocked(_)
                | Self::ApprovalRequired(_)
                | Self::StageToolNotAllowed { .. }
                | Self::PolicyDenied { .. }
        )
    }

    pub fn as_tool_result(&self) -> Value {
        match self {
            Self::SchedulerBlocked(reason) => json!({"error": "scheduler_blocked", "reason": reason}),
            Self::ApprovalRequired(tool) => json!({"error": "approval_required", "tool": tool}),
            Self::StageToolNotAllowed { tool, stage } => {
                json!({"error": "stage_tool_not_allowed", "tool": tool, "stage": stage})
            }
            Self::PolicyDenied { rule, detail } => {
                json!({"error": "policy_denied", "rule": rule, "detail": detail})
            }
            other => json!({"error": other.to_string()}),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Invalid(_) => 400,
            Self::PolicyDenied { .. }
            | Self::SchedulerBlocked(_)
            | Self::ApprovalRequired(_)
            | Self::StageToolNotAllowed { .. } => 409,
            Self::RoleContractViolation(_) => 422,
            Self::ExternalError { .. } => 502,
            Self::Cancelled(_) => 499,
            Self::BudgetExhausted { .. } => 429,
            Self::Other(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentermError>;

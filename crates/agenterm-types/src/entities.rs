//! Core data model: projects, tasks, worktrees, sessions and the orchestrator's
//! own bookkeeping entities. These are plain persistence-shaped structs; the
//! repository in `agenterm-core::storage` is the only thing that interprets
//! their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_path: String,
    pub status: String,
    #[serde(default)]
    pub playbook_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, repo_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            name: name.into(),
            repo_path: repo_path.into(),
            status: "active".to_string(),
            playbook_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planned,
    Running,
    Reviewing,
    WaitingReview,
    Blocked,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Reviewing => "reviewing",
            Self::WaitingReview => "waiting_review",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "planned" => Self::Planned,
            "running" => Self::Running,
            "reviewing" => Self::Reviewing,
            "waiting_review" => Self::WaitingReview,
            "blocked" => Self::Blocked,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Ids of other tasks in the same project this one depends on. Stored as
    /// a JSON array column; validated acyclic at creation time.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub worktree_id: Option<String>,
    #[serde(default)]
    pub spec_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            worktree_id: None,
            spec_path: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: String,
    pub project_id: String,
    pub branch: String,
    pub path: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Worktree {
    pub fn new(project_id: impl Into<String>, branch: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: crate::new_id(),
            project_id: project_id.into(),
            branch: branch.into(),
            path: path.into(),
            task_id: None,
            status: "active".to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Session lifecycle, see SPEC_FULL.md §4.3.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Working,
    Idle,
    WaitingReview,
    HumanTakeover,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Idle => "idle",
            Self::WaitingReview => "waiting_review",
            Self::HumanTakeover => "human_takeover",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "idle" => Self::Idle,
            "waiting_review" => Self::WaitingReview,
            "human_takeover" => Self::HumanTakeover,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Working,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub terminal_session_name: String,
    pub terminal_window_id: String,
    pub agent_type: String,
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    pub status: SessionStatus,
    #[serde(default)]
    pub human_attached: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        terminal_session_name: impl Into<String>,
        terminal_window_id: impl Into<String>,
        agent_type: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            task_id: None,
            terminal_session_name: terminal_session_name.into(),
            terminal_window_id: terminal_window_id.into(),
            agent_type: agent_type.into(),
            role: role.into(),
            model: None,
            status: SessionStatus::Working,
            human_attached: false,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Statuses that count against admission-control capacity (SPEC_FULL.md
    /// §4.2 step 4): everything except `idle`/`completed`/`failed`.
    /// `human_takeover` is intentionally active (see SPEC_FULL.md §9
    /// open-question resolution).
    pub fn counts_as_active(&self) -> bool {
        matches!(
            self,
            Session {
                status: SessionStatus::Working
                    | SessionStatus::WaitingReview
                    | SessionStatus::HumanTakeover,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandOp {
    SendText,
    SendKey,
    Interrupt,
    Resize,
    Close,
}

impl CommandOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendText => "send_text",
            Self::SendKey => "send_key",
            Self::Interrupt => "interrupt",
            Self::Resize => "resize",
            Self::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "send_text" => Self::SendText,
            "send_key" => Self::SendKey,
            "interrupt" => Self::Interrupt,
            "resize" => Self::Resize,
            "close" => Self::Close,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Sent,
    Acked,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCommand {
    pub id: String,
    pub session_id: String,
    pub op: CommandOp,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SessionCommand {
    pub fn new(session_id: impl Into<String>, op: CommandOp, payload: serde_json::Value) -> Self {
        Self {
            id: crate::new_id(),
            session_id: session_id.into(),
            op,
            payload,
            status: CommandStatus::Queued,
            created_at: Utc::now(),
            sent_at: None,
            acked_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// A single content block within an orchestrator message, mirroring the tool
/// dialects described in SPEC_FULL.md §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// The "demand"/"execution" split referenced by SPEC_FULL.md §4.7 step 6: each
/// persisted message belongs to one conversational lane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Demand,
    Execution,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demand => "demand",
            Self::Execution => "execution",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorMessage {
    pub id: String,
    pub project_id: String,
    pub lane: Lane,
    pub role: MessageRole,
    pub digest: String,
    pub structured: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
}

impl OrchestratorMessage {
    pub fn new(
        project_id: impl Into<String>,
        lane: Lane,
        role: MessageRole,
        structured: Vec<ContentBlock>,
    ) -> Self {
        let digest = structured
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            id: crate::new_id(),
            project_id: project_id.into(),
            lane,
            role,
            digest,
            structured,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub phase_type: String,
    pub role: String,
    pub entry_rule: String,
    pub exit_rule: String,
    pub max_parallel: u32,
    #[serde(default)]
    pub agent_selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub scope: String,
    pub builtin: bool,
    pub version: u32,
    pub phases: Vec<WorkflowPhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectOrchestrator {
    pub project_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub review_policy: String,
    #[serde(default)]
    pub notify_on_blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBinding {
    pub project_id: String,
    pub role: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAgentAssignment {
    pub project_id: String,
    pub stage: String,
    pub role: String,
    pub agent_type: String,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleLoopAttempt {
    pub task_id: String,
    pub role: String,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCycleStatus {
    Open,
    Approved,
    ChangesRequested,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub id: String,
    pub task_id: String,
    pub iteration: u32,
    pub status: ReviewCycleStatus,
    #[serde(default)]
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewIssueSeverity {
    Info,
    Minor,
    Major,
    Blocking,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewIssueStatus {
    Open,
    Resolved,
    Closed,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub id: String,
    pub cycle_id: String,
    pub severity: ReviewIssueSeverity,
    pub status: ReviewIssueStatus,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandItem {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub body: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Read-only catalog entry describing an external coding agent, loaded from
/// the agent registry (out of scope; consumed through this shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub resume_command: Option<String>,
    #[serde(default)]
    pub headless_command: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub tiers: Vec<String>,
    pub max_parallel_agents: u32,
    #[serde(default)]
    pub auto_accept_mode: Option<String>,
    #[serde(default)]
    pub supports_orchestrator: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Retry policy for a playbook role: how many times a role may be attempted
/// before the orchestrator must stop handing it more sessions, and which
/// roles to escalate to instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleRetryPolicy {
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub escalate_on: Vec<String>,
}

/// A role within a playbook stage, read-only external configuration (see
/// `Playbook` below).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookRole {
    pub name: String,
    pub mode: String,
    #[serde(default)]
    pub responsibilities: String,
    #[serde(default)]
    pub allowed_agents: Vec<String>,
    #[serde(default)]
    pub inputs_required: Vec<String>,
    #[serde(default)]
    pub actions_allowed: Vec<String>,
    #[serde(default)]
    pub suggested_prompt: String,
    #[serde(default)]
    pub handoff_to: Vec<String>,
    #[serde(default)]
    pub retry_policy: RoleRetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStage {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub roles: Vec<PlaybookRole>,
}

/// Read-only catalog entry describing a project's stage/role playbook
/// (SPEC_FULL.md §3's "Playbook (external, read-only)" entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    #[serde(default)]
    pub stages: Vec<PlaybookStage>,
}

impl Playbook {
    pub fn stage(&self, name: &str) -> Option<&PlaybookStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn role(&self, name: &str) -> Option<&PlaybookRole> {
        self.stages.iter().flat_map(|s| s.roles.iter()).find(|r| r.name == name)
    }
}

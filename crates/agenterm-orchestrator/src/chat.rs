//! Conversational Orchestrator loop (C7), SPEC_FULL.md §4.7.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agenterm_core::{AgentCatalog, PlaybookCatalog, Storage};
use agenterm_types::{
    AgentermError, ChatEvent, ContentBlock, Lane, MessageRole, OrchestratorMessage, PlaybookRole,
};
use agenterm_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use agenterm_types::ToolSchema;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::scheduler::{Scheduler, SessionCreationRequest};
use crate::session_manager::SessionManager;
use crate::stage::{derive_stage, Stage};
use crate::tools::{catalog, Toolset, MUTATING_TOOLS};

const MAX_ACTION_ROUNDS: u32 = 10;
const MAX_IDLE_POLL_ROUNDS: u32 = 240;
const MAX_HISTORY: usize = 50;
const DEFAULT_GLOBAL_MAX_PARALLEL: u32 = 32;
const LEDGER_CAP: usize = 500;

const APPROVAL_KEYWORDS: &[&str] = &[
    "confirm",
    "approved",
    "approve",
    "go ahead",
    "proceed",
    "start now",
    "run it",
    "execute",
    "continue",
];

const EXECUTION_REQUEST_KEYWORDS: &[&str] = &[
    "implement",
    "fix",
    "write code",
    "build this",
    "run tests",
    "review code",
    "open session",
    "create worktree",
    "dispatch",
    "execute",
    "go ahead",
    "proceed with build",
    "send command",
    "apply changes",
    "commit",
    "merge",
];

/// A single entry in the 500-slot command ledger (SPEC_FULL.md §4.7's
/// "Command ledger").
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: String,
    pub tool: String,
    pub session_id: String,
    pub command_text: String,
    pub issued_at: chrono::DateTime<Utc>,
    pub status: String,
}

struct LmConfig {
    provider_id: Option<String>,
    model_id: Option<String>,
}

/// Owns the shared state the chat loop needs across turns: per-project
/// serialization locks and the command ledger.
pub struct Orchestrator {
    storage: Storage,
    providers: ProviderRegistry,
    toolset: Arc<Toolset>,
    session_manager: Arc<SessionManager>,
    scheduler: Scheduler,
    agents: AgentCatalog,
    playbooks: PlaybookCatalog,
    project_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ledger: Mutex<VecDeque<LedgerEntry>>,
    role_attempts_incremented: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        storage: Storage,
        providers: ProviderRegistry,
        toolset: Arc<Toolset>,
        session_manager: Arc<SessionManager>,
        agents: AgentCatalog,
        playbooks: PlaybookCatalog,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(storage.clone(), Some(DEFAULT_GLOBAL_MAX_PARALLEL)),
            storage,
            providers,
            toolset,
            session_manager,
            agents,
            playbooks,
            project_locks: Mutex::new(HashMap::new()),
            ledger: Mutex::new(VecDeque::with_capacity(LEDGER_CAP)),
            role_attempts_incremented: Mutex::new(()),
        }
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.project_locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs one `Chat(project_id, user_message)` turn, emitting events on the
    /// returned channel as the streaming loop produces them.
    pub async fn chat(
        self: Arc<Self>,
        project_id: String,
        user_message: String,
        lane: Lane,
    ) -> mpsc::UnboundedReceiver<ChatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let lock = self.project_lock(&project_id).await;
            let _guard = lock.lock().await;
            if let Err(err) = self.run_turn(&project_id, &user_message, lane, &tx).await {
                let _ = tx.send(ChatEvent::Error { reason: err.to_string() });
            }
        });
        rx
    }

    async fn run_turn(
        &self,
        project_id: &str,
        user_message: &str,
        lane: Lane,
        tx: &mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<(), AgentermError> {
        let project = self
            .storage
            .get_project(project_id)
            .await
            .map_err(AgentermError::Other)?
            .ok_or_else(|| AgentermError::NotFound(format!("project `{project_id}`")))?;
        let tasks = self
            .storage
            .list_tasks_for_project(project_id)
            .await
            .map_err(AgentermError::Other)?;
        let worktrees = self
            .storage
            .list_worktrees_for_project(project_id)
            .await
            .map_err(AgentermError::Other)?;
        let mut sessions = self.storage.list_sessions().await.map_err(AgentermError::Other)?;
        sessions.retain(|s| s.task_id.as_deref().map(|t| tasks.iter().any(|task| task.id == t)).unwrap_or(false));
        sessions.sort_by_key(|s| s.created_at);

        let profile = self.storage.get_project_orchestrator(project_id).await.map_err(AgentermError::Other)?;
        let workflow = match &profile {
            Some(p) => self.storage.get_workflow(&p.workflow_id).await.map_err(AgentermError::Other)?,
            None => self.storage.get_default_workflow().await.map_err(AgentermError::Other)?,
        };
        let playbook = project
            .playbook_id
            .as_deref()
            .and_then(|id| self.playbooks.get(id))
            .or_else(|| self.playbooks.default_playbook());

        let lm = self.resolve_lm_config(&profile)?;

        let stage = derive_stage(&project, &tasks, &worktrees, workflow.as_ref());
        let approved = is_approved(user_message);

        let knowledge = self
            .storage
            .list_knowledge_entries_for_project(project_id, 8)
            .await
            .map_err(AgentermError::Other)?;

        let system_prompt = build_system_prompt(&project, &tasks, &sessions, &self.agents, playbook, stage, approved, &knowledge);

        let mut history = self.storage.list_messages(project_id, lane).await.map_err(AgentermError::Other)?;
        if history.len() > MAX_HISTORY {
            let drop = history.len() - MAX_HISTORY;
            history.drain(0..drop);
        }

        let user_blocks = vec![ContentBlock::Text { text: user_message.to_string() }];
        let user_entry = OrchestratorMessage::new(project_id, lane, MessageRole::User, user_blocks.clone());
        self.storage.append_message(&user_entry).await.map_err(AgentermError::Other)?;

        let mut wire_messages = vec![ChatMessage { role: "system".to_string(), content: system_prompt }];
        for entry in &history {
            wire_messages.push(content_blocks_to_wire(entry.role, &entry.structured));
        }
        wire_messages.push(content_blocks_to_wire(MessageRole::User, &user_blocks));

        let tool_schemas: Vec<ToolSchema> = catalog()
            .into_iter()
            .map(|t| ToolSchema { name: t.name.to_string(), description: t.description.to_string(), input_schema: t.schema })
            .collect();

        let mut action_rounds = 0u32;
        let mut idle_poll_rounds = 0u32;
        let mut session_round_counts: HashMap<String, u32> = HashMap::new();

        loop {
            if action_rounds >= MAX_ACTION_ROUNDS {
                return Err(AgentermError::BudgetExhausted {
                    dimension: "action_rounds".to_string(),
                    detail: format!("exceeded {MAX_ACTION_ROUNDS} tool rounds"),
                });
            }
            if idle_poll_rounds >= MAX_IDLE_POLL_ROUNDS {
                return Err(AgentermError::BudgetExhausted {
                    dimension: "idle_poll_rounds".to_string(),
                    detail: format!("exceeded {MAX_IDLE_POLL_ROUNDS} idle-poll rounds"),
                });
            }

            let cancel = CancellationToken::new();
            let mut stream = self
                .providers
                .stream_for_provider(lm.provider_id.as_deref(), lm.model_id.as_deref(), wire_messages.clone(), Some(tool_schemas.clone()), cancel)
                .await
                .map_err(AgentermError::Other)?;

            let mut text_acc = String::new();
            let mut tool_calls: Vec<(String, String, String)> = Vec::new();
            use futures::StreamExt;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(AgentermError::Other)?;
                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        text_acc.push_str(&delta);
                        let _ = tx.send(ChatEvent::Token { text: delta });
                    }
                    StreamChunk::ReasoningDelta(_) => {}
                    StreamChunk::ToolCallStart { id, name } => tool_calls.push((id, name, String::new())),
                    StreamChunk::ToolCallDelta { id, args_delta } => {
                        if let Some(call) = tool_calls.iter_mut().find(|(cid, _, _)| *cid == id) {
                            call.2.push_str(&args_delta);
                        }
                    }
                    StreamChunk::ToolCallEnd { .. } => {}
                    StreamChunk::Done { .. } => break,
                }
            }

            let mut assistant_blocks = Vec::new();
            if !text_acc.is_empty() {
                assistant_blocks.push(ContentBlock::Text { text: text_acc });
            }
            for (id, name, args_raw) in &tool_calls {
                let input: Value = serde_json::from_str(args_raw).unwrap_or(json!({}));
                assistant_blocks.push(ContentBlock::ToolUse { id: id.clone(), name: name.clone(), input });
            }
            let assistant_entry = OrchestratorMessage::new(project_id, lane, MessageRole::Assistant, assistant_blocks.clone());
            self.storage.append_message(&assistant_entry).await.map_err(AgentermError::Other)?;
            wire_messages.push(content_blocks_to_wire(MessageRole::Assistant, &assistant_blocks));

            if tool_calls.is_empty() {
                if lane == Lane::Execution && approved && requests_execution(user_message) {
                    return Err(AgentermError::Invalid("execution_requires_tool_calls".to_string()));
                }
                let _ = tx.send(ChatEvent::Done);
                return Ok(());
            }

            let mut only_idle_probe = true;
            for (id, name, args_raw) in &tool_calls {
                let args: Value = serde_json::from_str(args_raw).unwrap_or(json!({}));
                let _ = tx.send(ChatEvent::ToolCall { name: name.clone(), args: args.clone() });

                let result = self
                    .execute_gated_tool(project_id, lane, stage, playbook, name, &args, approved, &mut session_round_counts)
                    .await;

                let result_value = match result {
                    Ok(value) => value,
                    Err(err) => err.as_tool_result(),
                };
                let _ = tx.send(ChatEvent::ToolResult { name: name.clone(), result: result_value.clone() });

                let tool_result_block = ContentBlock::ToolResult { tool_use_id: id.clone(), content: result_value.clone() };
                let tool_result_entry = OrchestratorMessage::new(
                    project_id,
                    lane,
                    MessageRole::Assistant,
                    vec![tool_result_block.clone()],
                );
                self.storage.append_message(&tool_result_entry).await.map_err(AgentermError::Other)?;
                wire_messages.push(ChatMessage { role: "tool".to_string(), content: result_value.to_string() });

                if name == "create_session" && !result_value.get("error").is_some() {
                    if let (Some(task_id), Some(role)) = (args.get("task_id").and_then(Value::as_str), args.get("role").and_then(Value::as_str)) {
                        let _guard = self.role_attempts_incremented.lock().await;
                        let _ = self.storage.increment_role_loop_attempts(task_id, role).await;
                    }
                }
                if name != "is_session_idle" {
                    only_idle_probe = false;
                }
            }

            if only_idle_probe {
                idle_poll_rounds += 1;
            } else {
                action_rounds += 1;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_gated_tool(
        &self,
        project_id: &str,
        lane: Lane,
        stage: Stage,
        playbook: Option<&agenterm_types::Playbook>,
        name: &str,
        args: &Value,
        approved: bool,
        session_round_counts: &mut HashMap<String, u32>,
    ) -> Result<Value, AgentermError> {
        if MUTATING_TOOLS.contains(&name) && !approved {
            return Err(AgentermError::ApprovalRequired(name.to_string()));
        }

        if let Some(playbook) = playbook {
            self.enforce_role_contract(playbook, name, args)?;
            if lane == Lane::Execution {
                self.enforce_stage_gate(playbook, name, args, stage)?;
            }
        }

        if name == "create_session" {
            let task_id = args
                .get("task_id")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentermError::Invalid("missing required field `task_id`".to_string()))?;
            let role = args.get("role").and_then(Value::as_str).map(str::to_string);
            let agent_type = args.get("agent_type").and_then(Value::as_str).map(str::to_string);

            if let (Some(playbook), Some(role)) = (playbook, role.as_deref()) {
                self.enforce_role_retry(playbook, task_id, role).await?;
            }

            let agent = agent_type.as_deref().and_then(|id| self.agents.get(id)).cloned();
            let decision = self
                .scheduler
                .check_session_creation_allowed(&SessionCreationRequest {
                    task_id: task_id.to_string(),
                    role,
                    agent_type,
                    agent,
                })
                .await
                .map_err(AgentermError::Other)?;
            if !decision.allowed {
                return Err(AgentermError::SchedulerBlocked(decision.reason.unwrap_or_default()));
            }
        }

        if name == "send_command" {
            let session_id = args
                .get("session_id")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentermError::Invalid("missing required field `session_id`".to_string()))?
                .to_string();
            let count = session_round_counts.entry(session_id).or_insert(0);
            *count += 1;
            if *count > MAX_ACTION_ROUNDS {
                return Err(AgentermError::BudgetExhausted {
                    dimension: "session_round_limit".to_string(),
                    detail: "session_round_limit_reached".to_string(),
                });
            }
            self.record_ledger_entry(name, &args.clone()).await;
        }

        let _ = project_id;
        self.toolset.execute(name, args.clone()).await
    }

    fn enforce_role_contract(&self, playbook: &agenterm_types::Playbook, tool: &str, args: &Value) -> Result<(), AgentermError> {
        let Some(role_name) = args.get("role").and_then(Value::as_str) else {
            return Ok(());
        };
        let role = playbook
            .role(role_name)
            .ok_or_else(|| AgentermError::RoleContractViolation(format!("role `{role_name}` not in playbook")))?;

        if let Some(agent_type) = args.get("agent_type").and_then(Value::as_str) {
            if !role.allowed_agents.is_empty()
                && !role.allowed_agents.iter().any(|a| a.eq_ignore_ascii_case(agent_type))
            {
                return Err(AgentermError::RoleContractViolation(format!(
                    "agent `{agent_type}` is not permitted for role `{role_name}`"
                )));
            }
        }

        let allowlist = if role.actions_allowed.is_empty() {
            default_allowlist(&role.mode)
        } else {
            role.actions_allowed.clone()
        };
        if !allowlist.iter().any(|a| a == tool) {
            return Err(AgentermError::RoleContractViolation(format!(
                "tool `{tool}` is not permitted for role `{role_name}`"
            )));
        }

        for required in &role.inputs_required {
            if args.get(required).and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false) {
                continue;
            }
            return Err(AgentermError::RoleContractViolation(format!("missing required input `{required}`")));
        }
        Ok(())
    }

    fn enforce_stage_gate(&self, playbook: &agenterm_types::Playbook, tool: &str, args: &Value, stage: Stage) -> Result<(), AgentermError> {
        let Some(role_name) = args.get("role").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(owning_stage) = playbook.stages.iter().find(|s| s.roles.iter().any(|r| r.name == role_name)) else {
            return Ok(());
        };
        if owning_stage.name != stage.as_str() {
            return Err(AgentermError::StageToolNotAllowed { tool: tool.to_string(), stage: stage.as_str().to_string() });
        }
        Ok(())
    }

    async fn enforce_role_retry(&self, playbook: &agenterm_types::Playbook, task_id: &str, role_name: &str) -> Result<(), AgentermError> {
        let Some(role) = playbook.role(role_name) else {
            return Ok(());
        };
        let attempts = self.storage.get_role_loop_attempts(task_id, role_name).await.map_err(AgentermError::Other)?;
        if let Some(max) = role.retry_policy.max_iterations {
            if attempts >= max {
                return Err(AgentermError::SchedulerBlocked(format!(
                    "role `{role_name}` has reached its retry limit ({max}) for this task"
                )));
            }
        }
        let predecessors: Vec<&PlaybookRole> = playbook
            .stages
            .iter()
            .flat_map(|s| s.roles.iter())
            .filter(|r| r.handoff_to.iter().any(|h| h == role_name))
            .collect();
        if !predecessors.is_empty() {
            let mut any_attempted = false;
            for predecessor in &predecessors {
                let predecessor_attempts = self
                    .storage
                    .get_role_loop_attempts(task_id, &predecessor.name)
                    .await
                    .map_err(AgentermError::Other)?;
                if predecessor_attempts > 0 {
                    any_attempted = true;
                    break;
                }
            }
            if !any_attempted {
                return Err(AgentermError::SchedulerBlocked(format!(
                    "role `{role_name}` requires a predecessor role to have run first"
                )));
            }
        }
        Ok(())
    }

    async fn record_ledger_entry(&self, tool: &str, args: &Value) {
        let mut ledger = self.ledger.lock().await;
        if ledger.len() >= LEDGER_CAP {
            ledger.pop_front();
        }
        ledger.push_back(LedgerEntry {
            id: agenterm_types::new_id(),
            tool: tool.to_string(),
            session_id: args.get("session_id").and_then(Value::as_str).unwrap_or_default().to_string(),
            command_text: args.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
            issued_at: Utc::now(),
            status: "queued".to_string(),
        });
    }

    /// `RecentCommandLedger(n)`: the last `n` ledger entries.
    pub async fn recent_command_ledger(&self, n: usize) -> Vec<LedgerEntry> {
        let ledger = self.ledger.lock().await;
        ledger.iter().rev().take(n).cloned().collect()
    }

    fn resolve_lm_config(&self, profile: &Option<agenterm_types::ProjectOrchestrator>) -> Result<LmConfig, AgentermError> {
        let default_provider = profile.as_ref().and_then(|p| p.default_provider.clone());
        let default_model = profile.as_ref().and_then(|p| p.default_model.clone());

        let candidate = self
            .agents
            .orchestrator_candidates()
            .into_iter()
            .find(|a| a.provider.as_deref() == default_provider.as_deref() && a.model.as_deref() == default_model.as_deref())
            .or_else(|| self.agents.orchestrator_candidates().into_iter().next());

        let provider_id = candidate.and_then(|a| a.provider.clone()).or(default_provider);
        let model_id = candidate.and_then(|a| a.model.clone()).or(default_model);
        Ok(LmConfig { provider_id, model_id })
    }
}

fn is_approved(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    APPROVAL_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn requests_execution(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    EXECUTION_REQUEST_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn default_allowlist(mode: &str) -> Vec<String> {
    match mode {
        "planner" => vec!["create_task", "create_worktree", "write_task_spec", "get_project_status"],
        "reviewer" => vec!["read_session_output", "is_session_idle", "resolve_merge_conflict", "merge_worktree", "get_project_status"],
        "tester" => vec!["send_command", "read_session_output", "is_session_idle", "get_project_status"],
        _ => vec!["create_session", "send_command", "read_session_output", "is_session_idle", "wait_for_session_ready", "close_session"],
    }
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn content_blocks_to_wire(role: MessageRole, blocks: &[ContentBlock]) -> ChatMessage {
    let text = blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::ToolUse { name, input, .. } => format!("[tool_use {name}] {input}"),
            ContentBlock::ToolResult { content, .. } => format!("[tool_result] {content}"),
        })
        .collect::<Vec<_>>()
        .join("\n");
    ChatMessage { role: role.as_str().to_string(), content: text }
}

#[allow(clippy::too_many_arguments)]
fn build_system_prompt(
    project: &agenterm_types::Project,
    tasks: &[agenterm_types::Task],
    sessions: &[agenterm_types::Session],
    agents: &AgentCatalog,
    playbook: Option<&agenterm_types::Playbook>,
    stage: Stage,
    approved: bool,
    knowledge: &[agenterm_types::KnowledgeEntry],
) -> String {
    let mut out = String::new();
    out.push_str(
        "You are the coordinator, not a worker. Never command human-takeover sessions. \
         Prefer parallel decomposition over serial work. Use a tool for every state-changing \
         action; keep actions bounded and explain intent before acting. Execution happens only \
         through tools. Transitions into mutating actions require explicit approval. Role \
         contracts are authoritative: do not act outside a role's allowed actions. If required \
         inputs are missing, ask or read them first. `send_command` text must end with a newline \
         to submit. After `create_session`, call `wait_for_session_ready` before sending prompts.\n\n",
    );

    out.push_str("## Skills\n");
    for tool in catalog() {
        out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }

    out.push_str(&format!(
        "\n## Project\nname={} id={} repo={} status={} tasks={} worktrees={} sessions={} active_stage={}\n",
        project.name,
        project.id,
        project.repo_path,
        project.status,
        tasks.len(),
        sessions.len(),
        sessions.len(),
        stage.as_str(),
    ));
    let mut histogram: HashMap<&str, u32> = HashMap::new();
    for task in tasks {
        *histogram.entry(task.status.as_str()).or_insert(0) += 1;
    }
    out.push_str("Task status histogram: ");
    for (status, count) in &histogram {
        out.push_str(&format!("{status}={count} "));
    }
    out.push('\n');

    out.push_str("\n## Agent catalog\n");
    for agent in agents.all() {
        out.push_str(&format!(
            "- {} ({}) model={} max_parallel={} tiers={:?} capabilities={:?} languages={:?}\n",
            agent.id,
            agent.name,
            agent.model.clone().unwrap_or_default(),
            agent.max_parallel_agents,
            agent.tiers,
            agent.capabilities,
            agent.languages,
        ));
    }

    if let Some(playbook) = playbook {
        out.push_str("\n## Playbook\n");
        for pb_stage in &playbook.stages {
            out.push_str(&format!("### Stage {} (enabled={})\n", pb_stage.name, pb_stage.enabled));
            for role in &pb_stage.roles {
                out.push_str(&format!(
                    "- role={} mode={} responsibilities={} suggested_prompt={}\n",
                    role.name, role.mode, role.responsibilities, role.suggested_prompt
                ));
            }
        }
    }

    out.push_str(&format!(
        "\n## Approval gate\napproval_status={}\n",
        if approved { "confirmed" } else { "unconfirmed" }
    ));

    if !knowledge.is_empty() {
        out.push_str("\n## Recent knowledge\n");
        for entry in knowledge {
            out.push_str(&format!("- {}: {}\n", entry.title, entry.body));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_keywords_are_case_insensitive() {
        assert!(is_approved("Yes, Go Ahead and run it"));
        assert!(!is_approved("let's think about this first"));
    }

    #[test]
    fn execution_keywords_detect_implement_requests() {
        assert!(requests_execution("please implement the parser"));
        assert!(!requests_execution("what is the current status?"));
    }

    #[test]
    fn default_allowlist_covers_known_modes() {
        assert!(default_allowlist("planner").contains(&"create_task".to_string()));
        assert!(default_allowlist("reviewer").contains(&"merge_worktree".to_string()));
    }
}

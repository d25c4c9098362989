//! Session lifecycle (C4): create/destroy, the per-session FIFO command
//! queue, dispatch semantics (§4.3.1) and the ready-state probe (§4.3.2).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agenterm_core::Storage;
use agenterm_runtime::{check_command_policy, decode_auto_accept, NamedKey, TerminalBackend};
use agenterm_types::{AgentConfig, CommandOp, CommandStatus, Session, SessionCommand, SessionStatus};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::monitor::Monitor;

const MAX_SLUG_ATTEMPTS: usize = 16;

pub struct SessionManager {
    storage: Storage,
    backend: Arc<dyn TerminalBackend>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<SessionCommand>>>,
}

pub struct ReadyState {
    pub ready: bool,
    pub reason: String,
    pub status: SessionStatus,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub prompt_detected: bool,
    pub observed_output: bool,
    pub last_class: Option<String>,
    pub last_text: Option<String>,
}

impl SessionManager {
    pub fn new(storage: Storage, backend: Arc<dyn TerminalBackend>) -> Self {
        Self {
            storage,
            backend,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Implements "Create session" in SPEC_FULL.md §4.3.
    pub async fn create_session(
        &self,
        task_id: &str,
        agent: &AgentConfig,
        role: &str,
    ) -> anyhow::Result<Session> {
        let task = self
            .storage
            .get_task(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task `{task_id}` does not exist"))?;
        let project = self
            .storage
            .get_project(&task.project_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("project `{}` does not exist", task.project_id))?;

        let workdir = self.resolve_workdir(&task, &project).await?;

        let project_slug = slugify(&project.name, 36);
        let task_slug = slugify(&task.title, 36);
        let role_slug = slugify(role, 36);
        let base_name = format!("{project_slug}-{task_slug}-{role_slug}");
        let session_name = self.allocate_session_name(&base_name).await?;

        let window_id = self
            .backend
            .create(&session_name, &workdir)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create terminal session: {e}"))?;

        let result = self
            .finish_create_session(&session_name, &window_id, &task, agent, role)
            .await;

        match result {
            Ok(session) => Ok(session),
            Err(err) => {
                let _ = self.backend.destroy(&session_name).await;
                Err(err)
            }
        }
    }

    async fn finish_create_session(
        &self,
        session_name: &str,
        window_id: &str,
        task: &agenterm_types::Task,
        agent: &AgentConfig,
        role: &str,
    ) -> anyhow::Result<Session> {
        if !self.backend.exists(session_name).await? {
            anyhow::bail!("terminal session `{session_name}` has no window after creation");
        }

        let mut session = Session::new(session_name, window_id, &agent.id, role);
        session.task_id = Some(task.id.clone());
        session.model = agent.model.clone();
        self.storage.put_session(&session).await?;

        let command_line = format!("{}\n", agent.command);
        self.backend.send_text(session_name, window_id, &command_line).await?;

        if let Some(mode) = &agent.auto_accept_mode {
            if let Some(bytes) = decode_auto_accept(mode) {
                let backend = self.backend.clone();
                let session_name = session_name.to_string();
                let window_id = window_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(600)).await;
                    let _ = backend.send_raw(&session_name, &window_id, &bytes).await;
                });
            }
        }

        self.start_queue(session.id.clone());
        Monitor::spawn(self.storage.clone(), self.backend.clone(), session.id.clone());

        Ok(session)
    }

    async fn resolve_workdir(
        &self,
        task: &agenterm_types::Task,
        project: &agenterm_types::Project,
    ) -> anyhow::Result<String> {
        if let Some(worktree_id) = &task.worktree_id {
            let worktrees = self.storage.list_worktrees_for_project(&project.id).await?;
            if let Some(worktree) = worktrees.into_iter().find(|w| &w.id == worktree_id) {
                return Ok(worktree.path);
            }
        }
        Ok(project.repo_path.clone())
    }

    async fn allocate_session_name(&self, base_name: &str) -> anyhow::Result<String> {
        let mut candidate = base_name.to_string();
        for attempt in 0..MAX_SLUG_ATTEMPTS {
            if !self.backend.exists(&candidate).await.unwrap_or(false) {
                return Ok(candidate);
            }
            candidate = if attempt < 8 {
                format!("{base_name}-{}", attempt + 1)
            } else {
                format!("{base_name}-{}", &agenterm_types::new_id()[..8])
            };
        }
        anyhow::bail!("exhausted {MAX_SLUG_ATTEMPTS} attempts allocating a terminal session name")
    }

    /// Implements "Command queue" in SPEC_FULL.md §4.3: one FIFO worker per
    /// session, at most one command in flight.
    fn start_queue(&self, session_id: String) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionCommand>();
        if let Ok(mut guard) = self.queues.try_lock() {
            guard.insert(session_id.clone(), tx);
        }
        let storage = self.storage.clone();
        let backend = self.backend.clone();
        tokio::spawn(async move {
            while let Some(mut command) = rx.recv().await {
                command.status = CommandStatus::Sent;
                command.sent_at = Some(chrono::Utc::now());
                let _ = storage.put_session_command(&command).await;

                let outcome = dispatch(&backend, &storage, &session_id, &command).await;
                match outcome {
                    Ok(()) => {
                        command.status = CommandStatus::Completed;
                        command.acked_at = Some(chrono::Utc::now());
                        command.completed_at = Some(chrono::Utc::now());
                    }
                    Err(err) => {
                        command.status = CommandStatus::Failed;
                        command.error = Some(err.to_string());
                    }
                }
                let _ = storage.put_session_command(&command).await;
            }
        });
    }

    /// `EnqueueCommand`: persist as "queued" then hand to the session's
    /// worker. Fails closed if the session has no running queue.
    pub async fn enqueue_command(
        &self,
        session_id: &str,
        op: CommandOp,
        payload: Value,
    ) -> anyhow::Result<SessionCommand> {
        let command = SessionCommand::new(session_id, op, payload);
        self.storage.put_session_command(&command).await?;

        let guard = self.queues.lock().await;
        let Some(tx) = guard.get(session_id) else {
            let mut failed = command.clone();
            failed.status = CommandStatus::Failed;
            failed.error = Some("no active command queue for session".to_string());
            drop(guard);
            self.storage.put_session_command(&failed).await?;
            return Ok(failed);
        };
        tx.send(command.clone())
            .map_err(|_| anyhow::anyhow!("command queue for session `{session_id}` is closed"))?;
        Ok(command)
    }

    pub async fn get_ready_state(&self, session_id: &str, agent_command: &str) -> anyhow::Result<ReadyState> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session `{session_id}` does not exist"))?;
        let snapshot = self
            .backend
            .capture(&session.terminal_session_name, &session.terminal_window_id, 40)
            .await?;
        let last_line = snapshot.output.lines().last().unwrap_or("").to_string();

        if is_compose_mode(&last_line) {
            return Ok(ready_state(&session, false, "compose_mode_detected", &snapshot.output, &last_line));
        }

        if agent_command.to_ascii_lowercase().contains("claude") {
            if claude_landing_detected(&snapshot.output) {
                return Ok(ready_state(&session, true, "claude_landing_detected", &snapshot.output, &last_line));
            }
            if looks_like_prompt(&last_line) {
                return Ok(ready_state(&session, true, "prompt_detected", &snapshot.output, &last_line));
            }
            return Ok(ready_state(&session, false, "waiting_for_prompt", &snapshot.output, &last_line));
        }

        if looks_like_prompt(&last_line) {
            return Ok(ready_state(&session, true, "prompt_detected", &snapshot.output, &last_line));
        }
        if !snapshot.output.trim().is_empty() {
            return Ok(ready_state(&session, true, "output_observed", &snapshot.output, &last_line));
        }
        match session.status {
            SessionStatus::Idle
            | SessionStatus::WaitingReview
            | SessionStatus::HumanTakeover
            | SessionStatus::Completed
            | SessionStatus::Failed => Ok(ready_state(
                &session,
                true,
                &format!("status_{}", session.status.as_str()),
                &snapshot.output,
                &last_line,
            )),
            SessionStatus::Working => Ok(ready_state(&session, false, "booting", &snapshot.output, &last_line)),
        }
    }

    /// Latest `lines` of output for `read_session_output` / the HTTP output
    /// endpoint.
    pub async fn capture_output(&self, session_id: &str, lines: usize) -> anyhow::Result<agenterm_runtime::BackendSnapshot> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session `{session_id}` does not exist"))?;
        self.backend
            .capture(&session.terminal_session_name, &session.terminal_window_id, lines)
            .await
    }

    pub async fn destroy(&self, session_id: &str) -> anyhow::Result<()> {
        let Some(session) = self.storage.get_session(session_id).await? else {
            return Ok(());
        };
        self.backend.destroy(&session.terminal_session_name).await?;
        self.queues.lock().await.remove(session_id);
        let mut updated = session;
        updated.status = SessionStatus::Completed;
        self.storage.put_session(&updated).await?;
        Ok(())
    }
}

async fn dispatch(
    backend: &Arc<dyn TerminalBackend>,
    storage: &Storage,
    session_id: &str,
    command: &SessionCommand,
) -> anyhow::Result<()> {
    let session = storage
        .get_session(session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session `{session_id}` does not exist"))?;
    let session_name = session.terminal_session_name.as_str();
    let window_id = session.terminal_window_id.as_str();

    match command.op {
        CommandOp::SendText => {
            let text = command
                .payload
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("send_text requires non-empty `text`"))?;
            if text.is_empty() {
                anyhow::bail!("send_text requires non-empty `text`");
            }
            let workdir = command.payload.get("workdir").and_then(Value::as_str).map(Path::new);
            if let Some(denial) = check_command_policy(text, workdir) {
                if let Some(dir) = workdir {
                    agenterm_runtime::audit_denial(dir, session_id, text, &denial);
                }
                anyhow::bail!("policy denied ({}): {}", denial.rule, denial.detail);
            }
            let normalized = text.replace("\r\n", "\n");
            if let Some(prefix) = normalized.strip_suffix('\n') {
                if !prefix.is_empty() {
                    backend.send_text(session_name, window_id, prefix).await?;
                }
                backend.send_key(session_name, window_id, NamedKey::Submit).await?;
            } else {
                backend.send_text(session_name, window_id, &normalized).await?;
            }
        }
        CommandOp::SendKey => {
            let key = command
                .payload
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("send_key requires `key`"))?;
            let named = parse_named_key(key).ok_or_else(|| anyhow::anyhow!("unknown key `{key}`"))?;
            backend.send_key(session_name, window_id, named).await?;
        }
        CommandOp::Interrupt => {
            backend.send_key(session_name, window_id, NamedKey::Interrupt).await?;
        }
        CommandOp::Resize => {
            let cols = command.payload.get("cols").and_then(Value::as_u64).unwrap_or(0);
            let rows = command.payload.get("rows").and_then(Value::as_u64).unwrap_or(0);
            if cols == 0 || rows == 0 {
                anyhow::bail!("resize requires cols>0 and rows>0");
            }
            backend.resize(session_name, window_id, cols as u32, rows as u32).await?;
        }
        CommandOp::Close => {
            backend.destroy(session_name).await?;
            let mut session = session;
            session.status = SessionStatus::Completed;
            storage.put_session(&session).await?;
            return Ok(());
        }
    }

    let mut session = session;
    if !session.human_attached {
        session.status = SessionStatus::Working;
        session.last_activity_at = chrono::Utc::now();
        storage.put_session(&session).await?;
    }
    Ok(())
}

fn parse_named_key(key: &str) -> Option<NamedKey> {
    match key.to_ascii_lowercase().as_str() {
        "enter" | "return" | "\n" | "c-m" | "ctrl+m" => Some(NamedKey::Submit),
        "c-c" | "ctrl+c" => Some(NamedKey::Interrupt),
        "escape" | "esc" => Some(NamedKey::Escape),
        "tab" | "\t" => Some(NamedKey::Tab),
        _ => None,
    }
}

fn is_compose_mode(last_line: &str) -> bool {
    let lower = last_line.to_ascii_lowercase();
    lower.contains("compose mode") || lower.contains("-- insert --")
}

fn claude_landing_detected(output: &str) -> bool {
    output.contains("? for shortcuts") || output.contains("Welcome to Claude")
}

fn looks_like_prompt(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed.ends_with('$') || trimmed.ends_with('#') || trimmed.ends_with('>') || trimmed.ends_with('%')
}

fn ready_state(session: &Session, ready: bool, reason: &str, output: &str, last_line: &str) -> ReadyState {
    ReadyState {
        ready,
        reason: reason.to_string(),
        status: session.status,
        last_activity: session.last_activity_at,
        prompt_detected: looks_like_prompt(last_line),
        observed_output: !output.trim().is_empty(),
        last_class: Some(if looks_like_prompt(last_line) { "prompt".to_string() } else { "output".to_string() }),
        last_text: if last_line.is_empty() { None } else { Some(last_line.to_string()) },
    }
}

/// Lowercase alnum + dashes, truncated to `max_len`.
fn slugify(value: &str, max_len: usize) -> String {
    let mut out = String::new();
    let mut last_was_dash = false;
    for ch in value.to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("x");
    }
    out.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_lowercases_and_dashes() {
        assert_eq!(slugify("My Project!!", 36), "my-project");
    }

    #[test]
    fn slugify_truncates_to_max_len() {
        let long = "a".repeat(50);
        assert_eq!(slugify(&long, 10).len(), 10);
    }

    #[test]
    fn parses_named_keys_case_insensitively() {
        assert!(matches!(parse_named_key("Ctrl+C"), Some(NamedKey::Interrupt)));
        assert!(matches!(parse_named_key("ESC"), Some(NamedKey::Escape)));
        assert_eq!(parse_named_key("q"), None);
    }

    #[test]
    fn detects_shell_prompt_suffixes() {
        assert!(looks_like_prompt("user@host:~$ "));
        assert!(!looks_like_prompt("compiling..."));
    }
}

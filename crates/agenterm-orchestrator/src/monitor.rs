//! Session Monitor (C3): one async task per session, polling the backend and
//! the work directory's completion signals (SPEC_FULL.md §4.5).

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use agenterm_core::Storage;
use agenterm_runtime::TerminalBackend;
use agenterm_types::{Session, SessionStatus};
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;

const RING_BUFFER_CAP: usize = 500;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETION_CACHE_TTL: Duration = Duration::from_secs(5);
const READY_FOR_REVIEW_TAG: &str = "[READY_FOR_REVIEW]";

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub text: String,
    pub class: String,
    pub timestamp: DateTime<Utc>,
}

struct MonitorState {
    ring: VecDeque<ParsedEntry>,
    last_output_at: DateTime<Utc>,
    completion_cache: Option<(SessionStatus, DateTime<Utc>)>,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_BUFFER_CAP),
            last_output_at: Utc::now(),
            completion_cache: None,
        }
    }

    fn ingest(&mut self, text: String, class: String, timestamp: DateTime<Utc>) {
        if self.ring.len() >= RING_BUFFER_CAP {
            self.ring.pop_front();
        }
        self.last_output_at = timestamp;
        self.ring.push_back(ParsedEntry { text, class, timestamp });
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Mutex<MonitorState>>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Mutex<MonitorState>>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

async fn state_for(session_id: &str) -> Arc<Mutex<MonitorState>> {
    let mut guard = registry().lock().await;
    guard
        .entry(session_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(MonitorState::new())))
        .clone()
}

/// External parser feed: `IngestParsed(text, class, timestamp)` in SPEC_FULL.md
/// §4.5. The upstream parser is out of scope; this is the seam it attaches to.
pub async fn ingest_parsed(session_id: &str, text: String, class: String, timestamp: DateTime<Utc>) {
    let state = state_for(session_id).await;
    state.lock().await.ingest(text, class, timestamp);
}

pub async fn output_since(session_id: &str, since: DateTime<Utc>) -> Vec<ParsedEntry> {
    let state = state_for(session_id).await;
    let guard = state.lock().await;
    guard
        .ring
        .iter()
        .filter(|entry| entry.timestamp >= since)
        .cloned()
        .collect()
}

pub struct Monitor;

impl Monitor {
    /// Spawns the polling task for `session_id`; returns immediately.
    pub fn spawn(storage: Storage, backend: Arc<dyn TerminalBackend>, session_id: String) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                match tick(&storage, &backend, &session_id).await {
                    Ok(should_continue) => {
                        if !should_continue {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }
}

/// Runs one polling tick; returns `Ok(false)` when the monitor should stop
/// (terminal status reached).
async fn tick(storage: &Storage, backend: &Arc<dyn TerminalBackend>, session_id: &str) -> anyhow::Result<bool> {
    let Some(session) = storage.get_session(session_id).await? else {
        return Ok(false);
    };
    if session.status.is_terminal() {
        return Ok(false);
    }

    let workdir = resolve_workdir(storage, &session).await;

    // Step 1: backend gone.
    let exists = backend.exists(&session.terminal_session_name).await.unwrap_or(false);
    if !exists {
        let terminal_status = compute_terminal_status(workdir.as_deref());
        persist_status(storage, session, terminal_status).await?;
        return Ok(false);
    }

    // Step 2: refresh activity timestamp (unless human-attached, per invariant).
    let state = state_for(session_id).await;
    let snapshot = backend
        .capture(&session.terminal_session_name, &session.terminal_window_id, 20)
        .await
        .unwrap_or(agenterm_runtime::BackendSnapshot {
            exists: true,
            output: String::new(),
        });
    let last_line = snapshot.output.lines().last().unwrap_or("").to_string();
    {
        let mut guard = state.lock().await;
        let changed = guard
            .ring
            .back()
            .map(|entry| entry.text != last_line)
            .unwrap_or(!last_line.is_empty());
        if changed && !last_line.is_empty() {
            let class = if is_prompt_line(&last_line) { "prompt" } else { "output" };
            guard.ingest(last_line.clone(), class.to_string(), Utc::now());
        }
    }

    // Step 3: compute status, strict precedence.
    let guard = state.lock().await;
    let last_output_at = guard.last_output_at;
    let prompt_detected = guard
        .ring
        .back()
        .is_some_and(|entry| entry.class == "prompt" && is_prompt_line(&entry.text));
    let cached_completion = guard.completion_cache;
    drop(guard);

    let mut new_status = session.status;
    if prompt_detected {
        new_status = SessionStatus::WaitingReview;
    } else if Utc::now().signed_duration_since(last_output_at).num_seconds()
        >= DEFAULT_IDLE_TIMEOUT.as_secs() as i64
    {
        new_status = SessionStatus::Idle;
    } else {
        let cached = cached_completion.filter(|(_, ts)| {
            Utc::now().signed_duration_since(*ts).num_seconds() < COMPLETION_CACHE_TTL.as_secs() as i64
        });
        let signal = match cached {
            Some((status, _)) => status,
            None => {
                let computed = refresh_completion_signal(workdir.as_deref());
                let mut guard = state.lock().await;
                guard.completion_cache = Some((computed, Utc::now()));
                computed
            }
        };
        new_status = signal;
    }

    if new_status != session.status && !session.human_attached {
        persist_status(storage, session, new_status).await?;
    } else if !session.human_attached {
        let mut updated = session;
        updated.last_activity_at = Utc::now();
        storage.put_session(&updated).await?;
    }

    Ok(!matches!(new_status, SessionStatus::Completed))
}

async fn resolve_workdir(storage: &Storage, session: &Session) -> Option<String> {
    let task_id = session.task_id.clone()?;
    let task = storage.get_task(&task_id).await.ok()??;
    let project = storage.get_project(&task.project_id).await.ok()??;
    if let Some(worktree_id) = &task.worktree_id {
        let worktrees = storage.list_worktrees_for_project(&project.id).await.ok()?;
        if let Some(worktree) = worktrees.into_iter().find(|w| &w.id == worktree_id) {
            return Some(worktree.path);
        }
    }
    Some(project.repo_path)
}

async fn persist_status(storage: &Storage, mut session: Session, status: SessionStatus) -> anyhow::Result<()> {
    session.status = status;
    session.last_activity_at = Utc::now();
    storage.put_session(&session).await
}

/// Backend-gone computation (step 1): marker file, else ready-for-review
/// commit tag, else "failed".
fn compute_terminal_status(workdir: Option<&str>) -> SessionStatus {
    let Some(workdir) = workdir else {
        return SessionStatus::Failed;
    };
    if marker_file_exists(workdir) {
        return SessionStatus::Completed;
    }
    if ready_for_review_commit(workdir) {
        return SessionStatus::WaitingReview;
    }
    SessionStatus::Failed
}

/// Completion-signal refresh (step 3 else branch): marker → completed,
/// ready-for-review commit → waiting_review, else working.
fn refresh_completion_signal(workdir: Option<&str>) -> SessionStatus {
    let Some(workdir) = workdir else {
        return SessionStatus::Working;
    };
    if marker_file_exists(workdir) {
        return SessionStatus::Completed;
    }
    if ready_for_review_commit(workdir) {
        return SessionStatus::WaitingReview;
    }
    SessionStatus::Working
}

fn marker_file_exists(workdir: &str) -> bool {
    Path::new(workdir).join(".orchestra").join("done").exists()
}

/// Only the literal HEAD commit's body, first-parent, non-recursive.
fn ready_for_review_commit(workdir: &str) -> bool {
    std::process::Command::new("git")
        .args(["log", "-1", "--pretty=%B"])
        .current_dir(workdir)
        .output()
        .ok()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(READY_FOR_REVIEW_TAG))
        .unwrap_or(false)
}

fn prompt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[$#>%]\s*$").expect("valid regex"))
}

fn is_prompt_line(line: &str) -> bool {
    prompt_regex().is_match(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_regex_matches_common_shell_prompts() {
        assert!(is_prompt_line("user@host:~$ "));
        assert!(is_prompt_line("C:\\> "));
        assert!(!is_prompt_line("Compiling crate v0.1.0"));
    }

    #[tokio::test]
    async fn ingest_and_output_since_round_trip() {
        let session_id = "mon-test-1";
        let t0 = Utc::now();
        ingest_parsed(session_id, "hello".to_string(), "output".to_string(), t0).await;
        let entries = output_since(session_id, t0 - chrono::Duration::seconds(1)).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "hello");
    }

    #[test]
    fn marker_file_detection_is_false_for_missing_dir() {
        assert!(!marker_file_exists("/nonexistent/path/for/agenterm-test"));
    }
}

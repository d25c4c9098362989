//! Toolset (C6): the mapping from tool name to {JSON schema, executor}
//! exposed to the language model by the conversational orchestrator loop
//! (SPEC_FULL.md §4.8). Mutating tools delegate to the internal REST API
//! (§6); `write_task_spec`, `generate_progress_report` and the skills
//! subsystem run locally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agenterm_types::AgentermError;
use serde::Deserialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

const SKILL_ROOTS: &[&str] = &["skills", ".agents/skills", ".claude/skills"];
const SKILL_INSTALL_MAX_BYTES: u64 = 1024 * 1024;
const SKILL_INSTALL_TIMEOUT: Duration = Duration::from_secs(20);
const WAIT_FOR_READY_TIMEOUT: Duration = Duration::from_secs(30);
const WAIT_FOR_READY_POLL: Duration = Duration::from_millis(1000);

/// A single tool's name, description and JSON schema, as surfaced to the LM.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

/// Tools whose execution requires prior approval confirmation (SPEC_FULL.md
/// §4.7's mutating tool set).
pub const MUTATING_TOOLS: &[&str] = &[
    "create_project",
    "create_task",
    "create_worktree",
    "merge_worktree",
    "resolve_merge_conflict",
    "create_session",
    "send_command",
    "close_session",
    "write_task_spec",
];

pub fn catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "create_project",
            description: "Register a new project at an absolute repository path.",
            schema: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}, "repo_path": {"type": "string"}},
                "required": ["name", "repo_path"]
            }),
        },
        ToolSpec {
            name: "create_task",
            description: "Create a task under a project.",
            schema: json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "dependencies": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["project_id", "title"]
            }),
        },
        ToolSpec {
            name: "create_worktree",
            description: "Create a git worktree for a project, optionally bound to a task.",
            schema: json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "branch": {"type": "string"},
                    "task_id": {"type": "string"}
                },
                "required": ["project_id", "branch"]
            }),
        },
        ToolSpec {
            name: "create_session",
            description: "Open a new terminal session running an agent for a task.",
            schema: json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "agent_type": {"type": "string"},
                    "role": {"type": "string"}
                },
                "required": ["task_id", "agent_type"]
            }),
        },
        ToolSpec {
            name: "send_command",
            description: "Send text to a session's terminal. Text must end with a newline to submit.",
            schema: json!({
                "type": "object",
                "properties": {"session_id": {"type": "string"}, "text": {"type": "string"}},
                "required": ["session_id", "text"]
            }),
        },
        ToolSpec {
            name: "read_session_output",
            description: "Read the latest N lines of a session's terminal output.",
            schema: json!({
                "type": "object",
                "properties": {"session_id": {"type": "string"}, "lines": {"type": "integer"}},
                "required": ["session_id"]
            }),
        },
        ToolSpec {
            name: "is_session_idle",
            description: "Check whether a session's terminal is idle.",
            schema: json!({
                "type": "object",
                "properties": {"session_id": {"type": "string"}},
                "required": ["session_id"]
            }),
        },
        ToolSpec {
            name: "wait_for_session_ready",
            description: "Block until a newly created session's terminal has finished starting up, or time out.",
            schema: json!({
                "type": "object",
                "properties": {"session_id": {"type": "string"}},
                "required": ["session_id"]
            }),
        },
        ToolSpec {
            name: "get_project_status",
            description: "Fetch a project's status bundle: project, tasks, worktrees, sessions.",
            schema: json!({
                "type": "object",
                "properties": {"project_id": {"type": "string"}},
                "required": ["project_id"]
            }),
        },
        ToolSpec {
            name: "write_task_spec",
            description: "Write a task specification file into the project's repository.",
            schema: json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "relative_path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["project_id", "relative_path", "content"]
            }),
        },
        ToolSpec {
            name: "generate_progress_report",
            description: "Summarize a project's progress: task/session histograms, phase, queue depth, blockers.",
            schema: json!({
                "type": "object",
                "properties": {"project_id": {"type": "string"}},
                "required": ["project_id"]
            }),
        },
        ToolSpec {
            name: "merge_worktree",
            description: "Merge a worktree's branch back into the project's main branch.",
            schema: json!({
                "type": "object",
                "properties": {"worktree_id": {"type": "string"}},
                "required": ["worktree_id"]
            }),
        },
        ToolSpec {
            name: "resolve_merge_conflict",
            description: "Apply a resolution strategy to a worktree's merge conflict.",
            schema: json!({
                "type": "object",
                "properties": {"worktree_id": {"type": "string"}, "strategy": {"type": "string"}},
                "required": ["worktree_id", "strategy"]
            }),
        },
        ToolSpec {
            name: "can_close_session",
            description: "Check whether a session is safe to close.",
            schema: json!({
                "type": "object",
                "properties": {"session_id": {"type": "string"}},
                "required": ["session_id"]
            }),
        },
        ToolSpec {
            name: "close_session",
            description: "Close a session's terminal and mark it completed.",
            schema: json!({
                "type": "object",
                "properties": {"session_id": {"type": "string"}},
                "required": ["session_id"]
            }),
        },
        ToolSpec {
            name: "list_skills",
            description: "List installed skills by id, name and description.",
            schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "get_skill_details",
            description: "Fetch a skill's full body by id.",
            schema: json!({
                "type": "object",
                "properties": {"id": {"type": "string"}},
                "required": ["id"]
            }),
        },
        ToolSpec {
            name: "install_online_skill",
            description: "Download and install a skill from a GitHub URL.",
            schema: json!({
                "type": "object",
                "properties": {"url": {"type": "string"}, "overwrite": {"type": "boolean"}},
                "required": ["url"]
            }),
        },
    ]
}

/// Executes tools against the internal REST API (§6) and the local
/// filesystem.
pub struct Toolset {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    workspace_root: PathBuf,
}

impl Toolset {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>, workspace_root: PathBuf) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bearer_token,
            workspace_root,
        }
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, AgentermError> {
        match name {
            "create_project" => self.post("/api/projects", &args).await,
            "create_task" => {
                let project_id = require_str(&args, "project_id")?;
                self.post(&format!("/api/projects/{project_id}/tasks"), &args).await
            }
            "create_worktree" => {
                let project_id = require_str(&args, "project_id")?;
                self.post(&format!("/api/projects/{project_id}/worktrees"), &args).await
            }
            "create_session" => {
                let task_id = require_str(&args, "task_id")?;
                self.post(&format!("/api/tasks/{task_id}/sessions"), &args).await
            }
            "send_command" => {
                let session_id = require_str(&args, "session_id")?;
                self.post(&format!("/api/sessions/{session_id}/send"), &args).await
            }
            "read_session_output" => {
                let session_id = require_str(&args, "session_id")?;
                let lines = args.get("lines").and_then(Value::as_u64).unwrap_or(100);
                self.get(&format!("/api/sessions/{session_id}/output?lines={lines}")).await
            }
            "is_session_idle" => {
                let session_id = require_str(&args, "session_id")?;
                self.get(&format!("/api/sessions/{session_id}/idle")).await
            }
            "wait_for_session_ready" => self.wait_for_session_ready(&args).await,
            "get_project_status" => {
                let project_id = require_str(&args, "project_id")?;
                self.get(&format!("/api/projects/{project_id}")).await
            }
            "write_task_spec" => self.write_task_spec(&args).await,
            "generate_progress_report" => self.generate_progress_report(&args).await,
            "merge_worktree" => {
                let worktree_id = require_str(&args, "worktree_id")?;
                self.post(&format!("/api/worktrees/{worktree_id}/merge"), &args).await
            }
            "resolve_merge_conflict" => {
                let worktree_id = require_str(&args, "worktree_id")?;
                self.post(&format!("/api/worktrees/{worktree_id}/resolve-conflict"), &args)
                    .await
            }
            "can_close_session" => {
                let session_id = require_str(&args, "session_id")?;
                self.get(&format!("/api/sessions/{session_id}/close-check")).await
            }
            "close_session" => {
                let session_id = require_str(&args, "session_id")?;
                self.post(&format!("/api/sessions/{session_id}/close"), &args).await
            }
            "list_skills" => self.list_skills(),
            "get_skill_details" => {
                let id = require_str(&args, "id")?;
                self.get_skill_details(&id)
            }
            "install_online_skill" => self.install_online_skill(&args).await,
            other => Err(AgentermError::Invalid(format!("unknown tool `{other}`"))),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, AgentermError> {
        let mut req = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(external_error)?;
        decode_response(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, AgentermError> {
        let mut req = self.http.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(external_error)?;
        decode_response(resp).await
    }

    async fn wait_for_session_ready(&self, args: &Value) -> Result<Value, AgentermError> {
        let session_id = require_str(args, "session_id")?;
        let deadline = tokio::time::Instant::now() + WAIT_FOR_READY_TIMEOUT;
        loop {
            let status = self.get(&format!("/api/sessions/{session_id}/idle")).await?;
            let ready = status.get("ready").and_then(Value::as_bool).unwrap_or(false);
            if ready {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(json!({"ready": false, "timed_out": true}));
            }
            tokio::time::sleep(WAIT_FOR_READY_POLL).await;
        }
    }

    async fn write_task_spec(&self, args: &Value) -> Result<Value, AgentermError> {
        let project_id = require_str(args, "project_id")?;
        let relative_path = require_str(args, "relative_path")?;
        let content = require_str(args, "content")?;
        if relative_path.starts_with("..") || relative_path.split('/').any(|segment| segment == "..") {
            return Err(AgentermError::Invalid(format!(
                "relative_path `{relative_path}` must not escape the repository"
            )));
        }
        let status = self.get(&format!("/api/projects/{project_id}")).await?;
        let repo_path = status
            .get("project")
            .and_then(|p| p.get("repo_path"))
            .and_then(Value::as_str)
            .ok_or_else(|| AgentermError::NotFound(format!("project `{project_id}`")))?;
        let target = Path::new(repo_path).join(&relative_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentermError::Other(e.into()))?;
        }
        tokio::fs::write(&target, content.as_bytes())
            .await
            .map_err(|e| AgentermError::Other(e.into()))?;
        Ok(json!({"written": target.to_string_lossy()}))
    }

    async fn generate_progress_report(&self, args: &Value) -> Result<Value, AgentermError> {
        let project_id = require_str(args, "project_id")?;
        let status = self.get(&format!("/api/projects/{project_id}")).await?;
        Ok(summarize_progress(&status))
    }

    fn skill_roots(&self) -> Vec<PathBuf> {
        SKILL_ROOTS.iter().map(|r| self.workspace_root.join(r)).collect()
    }

    fn list_skills(&self) -> Result<Value, AgentermError> {
        let mut skills = Vec::new();
        for root in self.skill_roots() {
            if !root.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
                let Ok(entry) = entry else { continue };
                if entry.file_name() != "SKILL.md" {
                    continue;
                }
                let Some(folder) = entry.path().parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()) else {
                    continue;
                };
                if !is_valid_skill_id(folder) {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let Ok((frontmatter, _body)) = split_frontmatter(&content) else {
                    continue;
                };
                if frontmatter.name != folder || frontmatter.description.is_empty() {
                    continue;
                }
                skills.push(json!({
                    "id": folder,
                    "name": frontmatter.name,
                    "description": frontmatter.description
                }));
            }
        }
        skills.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(json!({"skills": skills}))
    }

    fn get_skill_details(&self, id: &str) -> Result<Value, AgentermError> {
        if !is_valid_skill_id(id) {
            return Err(AgentermError::Invalid(format!("invalid skill id `{id}`")));
        }
        for root in self.skill_roots() {
            let path = root.join(id).join("SKILL.md");
            if let Ok(content) = std::fs::read_to_string(&path) {
                let (frontmatter, body) = split_frontmatter(&content)
                    .map_err(|e| AgentermError::Invalid(format!("skill `{id}`: {e}")))?;
                return Ok(json!({
                    "id": id,
                    "name": frontmatter.name,
                    "description": frontmatter.description,
                    "body": body
                }));
            }
        }
        Err(AgentermError::NotFound(format!("skill `{id}`")))
    }

    async fn install_online_skill(&self, args: &Value) -> Result<Value, AgentermError> {
        let url = require_str(args, "url")?;
        let overwrite = args.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
        let raw_url = normalize_github_url(&url)
            .ok_or_else(|| AgentermError::Invalid(format!("unsupported skill URL `{url}`")))?;

        let resp = self
            .http
            .get(&raw_url)
            .timeout(SKILL_INSTALL_TIMEOUT)
            .send()
            .await
            .map_err(external_error)?;
        if !resp.status().is_success() {
            return Err(AgentermError::ExternalError {
                status: resp.status().as_u16(),
                detail: raw_url,
            });
        }
        if let Some(len) = resp.content_length() {
            if len > SKILL_INSTALL_MAX_BYTES {
                return Err(AgentermError::Invalid(format!(
                    "skill download exceeds {SKILL_INSTALL_MAX_BYTES} bytes"
                )));
            }
        }
        let bytes = resp.bytes().await.map_err(external_error)?;
        if bytes.len() as u64 > SKILL_INSTALL_MAX_BYTES {
            return Err(AgentermError::Invalid(format!(
                "skill download exceeds {SKILL_INSTALL_MAX_BYTES} bytes"
            )));
        }
        let content = String::from_utf8_lossy(&bytes).to_string();
        let (frontmatter, _body) = split_frontmatter(&content)
            .map_err(|e| AgentermError::Invalid(format!("skill frontmatter: {e}")))?;
        if !is_valid_skill_id(&frontmatter.name) || frontmatter.description.is_empty() {
            return Err(AgentermError::Invalid(
                "skill frontmatter must supply a valid name and non-empty description".to_string(),
            ));
        }

        let dest_dir = self.workspace_root.join("skills").join(&frontmatter.name);
        let dest_file = dest_dir.join("SKILL.md");
        if dest_file.exists() && !overwrite {
            return Err(AgentermError::Invalid(format!(
                "skill `{}` already installed; pass overwrite=true to replace it",
                frontmatter.name
            )));
        }
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| AgentermError::Other(e.into()))?;
        tokio::fs::write(&dest_file, content.as_bytes())
            .await
            .map_err(|e| AgentermError::Other(e.into()))?;
        Ok(json!({"id": frontmatter.name, "installed_at": dest_file.to_string_lossy()}))
    }
}

fn require_str(args: &Value, key: &str) -> Result<String, AgentermError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AgentermError::Invalid(format!("missing required field `{key}`")))
}

fn external_error(e: reqwest::Error) -> AgentermError {
    AgentermError::ExternalError {
        status: e.status().map(|s| s.as_u16()).unwrap_or(0),
        detail: e.to_string(),
    }
}

async fn decode_response(resp: reqwest::Response) -> Result<Value, AgentermError> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(AgentermError::ExternalError {
            status: status.as_u16(),
            detail: body.chars().take(500).collect(),
        });
    }
    serde_json::from_str(&body).map_err(|e| AgentermError::ExternalError {
        status: status.as_u16(),
        detail: format!("invalid JSON response: {e}"),
    })
}

/// Phase derivation and histograms for `generate_progress_report`, per
/// SPEC_FULL.md §4.8's first-match rules.
fn summarize_progress(status: &Value) -> Value {
    let tasks = status.get("tasks").and_then(Value::as_array).cloned().unwrap_or_default();
    let sessions = status
        .get("sessions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut task_histogram = serde_json::Map::new();
    for task in &tasks {
        if let Some(s) = task.get("status").and_then(Value::as_str) {
            *task_histogram.entry(s.to_string()).or_insert(json!(0)) =
                json!(task_histogram.get(s).and_then(Value::as_i64).unwrap_or(0) + 1);
        }
    }
    let mut session_histogram = serde_json::Map::new();
    for session in &sessions {
        if let Some(s) = session.get("status").and_then(Value::as_str) {
            *session_histogram.entry(s.to_string()).or_insert(json!(0)) =
                json!(session_histogram.get(s).and_then(Value::as_i64).unwrap_or(0) + 1);
        }
    }

    let any_blocked = tasks
        .iter()
        .any(|t| t.get("status").and_then(Value::as_str) == Some("blocked"));
    let any_failed_task = tasks
        .iter()
        .any(|t| t.get("status").and_then(Value::as_str) == Some("failed"));
    let any_failed_session = sessions
        .iter()
        .any(|s| s.get("status").and_then(Value::as_str) == Some("failed"));
    let any_waiting_review = sessions
        .iter()
        .any(|s| s.get("status").and_then(Value::as_str) == Some("waiting_review"));
    let any_working = sessions
        .iter()
        .any(|s| matches!(s.get("status").and_then(Value::as_str), Some("working") | Some("running")));
    let all_done = !tasks.is_empty()
        && tasks
            .iter()
            .all(|t| t.get("status").and_then(Value::as_str) == Some("done"));

    let phase = if any_blocked || any_failed_task || any_failed_session {
        "blocked"
    } else if any_waiting_review {
        "review"
    } else if any_working {
        "implementation"
    } else if all_done {
        "completed"
    } else {
        "planning"
    };

    let queue_depth = tasks
        .iter()
        .filter(|t| {
            matches!(
                t.get("status").and_then(Value::as_str),
                Some("pending") | Some("queued") | Some("ready") | Some("todo")
            )
        })
        .count();

    let mut blockers = Vec::new();
    let blocked_count = tasks
        .iter()
        .filter(|t| t.get("status").and_then(Value::as_str) == Some("blocked"))
        .count();
    if blocked_count > 0 {
        blockers.push(json!({"type": "blocked_task", "count": blocked_count}));
    }
    let failed_task_count = tasks
        .iter()
        .filter(|t| t.get("status").and_then(Value::as_str) == Some("failed"))
        .count();
    if failed_task_count > 0 {
        blockers.push(json!({"type": "failed_task", "count": failed_task_count}));
    }
    let failed_session_count = sessions
        .iter()
        .filter(|s| s.get("status").and_then(Value::as_str) == Some("failed"))
        .count();
    if failed_session_count > 0 {
        blockers.push(json!({"type": "failed_session", "count": failed_session_count}));
    }

    json!({
        "phase": phase,
        "task_status_histogram": task_histogram,
        "session_status_histogram": session_histogram,
        "queue_depth": queue_depth,
        "blockers": blockers,
        "total_tasks": tasks.len(),
        "total_sessions": sessions.len(),
    })
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatterYaml {
    name: String,
    description: String,
}

struct SkillFrontmatter {
    name: String,
    description: String,
}

/// Splits a `SKILL.md`'s leading `---`-delimited YAML frontmatter from its
/// body, matching the teacher's skill-loader convention.
fn split_frontmatter(content: &str) -> Result<(SkillFrontmatter, String), String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut start = None;
    let mut end = None;
    for (i, line) in lines.iter().enumerate() {
        if line.trim() == "---" {
            if start.is_none() {
                start = Some(i);
            } else if end.is_none() {
                end = Some(i);
                break;
            }
        }
    }
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => return Err("missing frontmatter".to_string()),
    };
    let yaml = lines[start + 1..end].join("\n");
    let parsed: SkillFrontmatterYaml =
        serde_yaml::from_str(&yaml).map_err(|e| format!("failed to parse frontmatter: {e}"))?;
    let body = if end + 1 < lines.len() {
        lines[end + 1..].join("\n")
    } else {
        String::new()
    };
    Ok((
        SkillFrontmatter {
            name: parsed.name,
            description: parsed.description,
        },
        body,
    ))
}

fn is_valid_skill_id(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    let mut prev_hyphen = false;
    for (i, c) in id.chars().enumerate() {
        if c == '-' {
            if i == 0 || prev_hyphen {
                return false;
            }
            prev_hyphen = true;
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prev_hyphen = false;
        } else {
            return false;
        }
    }
    !prev_hyphen
}

/// Normalizes `github.com/<owner>/<repo>/tree/<branch>/skills/<id>` (and the
/// equivalent `/blob/` form pointing directly at `SKILL.md`) to its raw
/// content URL.
fn normalize_github_url(url: &str) -> Option<String> {
    if url.starts_with("https://raw.githubusercontent.com/") {
        return Some(url.to_string());
    }
    let rest = url.strip_prefix("https://github.com/").or_else(|| url.strip_prefix("http://github.com/"))?;
    let mut parts = rest.splitn(4, '/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    let kind = parts.next()?;
    let tail = parts.next()?;
    if kind != "tree" && kind != "blob" {
        return None;
    }
    let mut tail_parts = tail.splitn(2, '/');
    let branch = tail_parts.next()?;
    let path = tail_parts.next()?;
    let path = if path.ends_with("SKILL.md") {
        path.to_string()
    } else {
        format!("{}/SKILL.md", path.trim_end_matches('/'))
    };
    Some(format!("https://raw.githubusercontent.com/{owner}/{repo}/{branch}/{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_tree_url_normalizes_to_raw_content() {
        let raw = normalize_github_url("https://github.com/acme/skills/tree/main/skills/code-review").unwrap();
        assert_eq!(raw, "https://raw.githubusercontent.com/acme/skills/main/skills/code-review/SKILL.md");
    }

    #[test]
    fn non_github_url_is_rejected() {
        assert!(normalize_github_url("https://example.com/skills/foo").is_none());
    }

    #[test]
    fn skill_id_validation_matches_slug_rules() {
        assert!(is_valid_skill_id("code-review"));
        assert!(!is_valid_skill_id("-code-review"));
        assert!(!is_valid_skill_id("code--review"));
        assert!(!is_valid_skill_id("Code_Review"));
    }

    #[test]
    fn frontmatter_splits_name_description_and_body() {
        let content = "---\nname: code-review\ndescription: Reviews diffs.\n---\nBody text.";
        let (frontmatter, body) = split_frontmatter(content).unwrap();
        assert_eq!(frontmatter.name, "code-review");
        assert_eq!(frontmatter.description, "Reviews diffs.");
        assert_eq!(body, "Body text.");
    }

    #[test]
    fn progress_summary_detects_blocked_phase_first() {
        let status = json!({
            "tasks": [{"status": "blocked"}, {"status": "done"}],
            "sessions": [{"status": "waiting_review"}]
        });
        let report = summarize_progress(&status);
        assert_eq!(report["phase"], "blocked");
    }

    #[test]
    fn progress_summary_detects_completed_when_all_tasks_done() {
        let status = json!({"tasks": [{"status": "done"}], "sessions": []});
        let report = summarize_progress(&status);
        assert_eq!(report["phase"], "completed");
    }
}

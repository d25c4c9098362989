//! SQLite-backed persistence for every entity in `agenterm_types::entities`
//! (SPEC_FULL.md §4.1). A single writer mutex plus WAL mode keeps the
//! scheduler, monitor and HTTP surface from stepping on each other without
//! needing an external database process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use agenterm_types::*;

const SCHEMA_VERSION: i64 = 1;

/// Owns the single writer connection. Reads go through the same mutex:
/// SQLite's WAL mode allows concurrent readers against a writer, but the
/// repository methods here are simple enough that serializing everything
/// through one connection keeps the locking story easy to reason about.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
            let conn = Connection::open(&path).context("opening sqlite database")?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            run_migrations(&conn)?;
            Ok(conn)
        })
        .await
        .context("sqlite open task panicked")??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Current applied schema version, for `migrate`/`check`'s reporting.
    pub async fn schema_version(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().await;
        let version: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| r.get(0))?;
        Ok(version)
    }

    pub async fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -- projects ---------------------------------------------------------

    pub async fn put_project(&self, project: &Project) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, name, repo_path, status, playbook_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               repo_path = excluded.repo_path,
               status = excluded.status,
               playbook_id = excluded.playbook_id,
               updated_at = excluded.updated_at",
            params![
                project.id,
                project.name,
                project.repo_path,
                project.status,
                project.playbook_id,
                to_rfc3339(project.created_at),
                to_rfc3339(project.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_project(&self, id: &str) -> anyhow::Result<Option<Project>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, repo_path, status, playbook_id, created_at, updated_at
             FROM projects WHERE id = ?1",
            params![id],
            row_to_project,
        )
        .optional()
        .context("get_project")
    }

    pub async fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, repo_path, status, playbook_id, created_at, updated_at
             FROM projects ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_project)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- tasks --------------------------------------------------------------

    pub async fn put_task(&self, task: &Task) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (id, project_id, title, description, status, dependencies, worktree_id, spec_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               description = excluded.description,
               status = excluded.status,
               dependencies = excluded.dependencies,
               worktree_id = excluded.worktree_id,
               spec_path = excluded.spec_path,
               updated_at = excluded.updated_at",
            params![
                task.id,
                task.project_id,
                task.title,
                task.description,
                task.status.as_str(),
                serde_json::to_string(&task.dependencies)?,
                task.worktree_id,
                task.spec_path,
                to_rfc3339(task.created_at),
                to_rfc3339(task.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, project_id, title, description, status, dependencies, worktree_id, spec_path, created_at, updated_at
             FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .context("get_task")
    }

    pub async fn list_tasks_for_project(&self, project_id: &str) -> anyhow::Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, title, description, status, dependencies, worktree_id, spec_path, created_at, updated_at
             FROM tasks WHERE project_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- worktrees ------------------------------------------------------

    pub async fn put_worktree(&self, worktree: &Worktree) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO worktrees (id, project_id, branch, path, task_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
               branch = excluded.branch,
               path = excluded.path,
               task_id = excluded.task_id,
               status = excluded.status",
            params![
                worktree.id,
                worktree.project_id,
                worktree.branch,
                worktree.path,
                worktree.task_id,
                worktree.status,
                to_rfc3339(worktree.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_worktrees_for_project(&self, project_id: &str) -> anyhow::Result<Vec<Worktree>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, branch, path, task_id, status, created_at
             FROM worktrees WHERE project_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id], row_to_worktree)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- sessions -------------------------------------------------------

    pub async fn put_session(&self, session: &Session) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (id, task_id, terminal_session_name, terminal_window_id, agent_type, role, model, status, human_attached, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               task_id = excluded.task_id,
               status = excluded.status,
               human_attached = excluded.human_attached,
               last_activity_at = excluded.last_activity_at",
            params![
                session.id,
                session.task_id,
                session.terminal_session_name,
                session.terminal_window_id,
                session.agent_type,
                session.role,
                session.model,
                session.status.as_str(),
                session.human_attached,
                to_rfc3339(session.created_at),
                to_rfc3339(session.last_activity_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, task_id, terminal_session_name, terminal_window_id, agent_type, role, model, status, human_attached, created_at, last_activity_at
             FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()
        .context("get_session")
    }

    pub async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, terminal_session_name, terminal_window_id, agent_type, role, model, status, human_attached, created_at, last_activity_at
             FROM sessions ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count of sessions whose status `counts_as_active()`, used by the
    /// scheduler's admission check (SPEC_FULL.md §4.2).
    pub async fn count_active_sessions(&self) -> anyhow::Result<usize> {
        let sessions = self.list_sessions().await?;
        Ok(sessions.iter().filter(|s| s.counts_as_active()).count())
    }

    // -- session commands -------------------------------------------------

    pub async fn put_session_command(&self, command: &SessionCommand) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO session_commands (id, session_id, op, payload, status, created_at, sent_at, acked_at, completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               sent_at = excluded.sent_at,
               acked_at = excluded.acked_at,
               completed_at = excluded.completed_at,
               error = excluded.error",
            params![
                command.id,
                command.session_id,
                command.op.as_str(),
                command.payload.to_string(),
                command_status_str(command.status),
                to_rfc3339(command.created_at),
                command.sent_at.map(to_rfc3339),
                command.acked_at.map(to_rfc3339),
                command.completed_at.map(to_rfc3339),
                command.error,
            ],
        )?;
        Ok(())
    }

    pub async fn list_queued_commands(&self, session_id: &str) -> anyhow::Result<Vec<SessionCommand>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, op, payload, status, created_at, sent_at, acked_at, completed_at, error
             FROM session_commands WHERE session_id = ?1 AND status = 'queued' ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], row_to_session_command)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- orchestrator messages -------------------------------------------

    pub async fn append_message(&self, message: &OrchestratorMessage) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orchestrator_messages (id, project_id, lane, role, digest, structured, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.project_id,
                message.lane.as_str(),
                message.role.as_str(),
                message.digest,
                serde_json::to_string(&message.structured)?,
                to_rfc3339(message.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_messages(
        &self,
        project_id: &str,
        lane: Lane,
    ) -> anyhow::Result<Vec<OrchestratorMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, lane, role, digest, structured, created_at
             FROM orchestrator_messages WHERE project_id = ?1 AND lane = ?2 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id, lane.as_str()], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- workflows & role configuration --------------------------------

    pub async fn put_workflow(&self, workflow: &Workflow) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflows (id, name, scope, builtin, version, phases)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name, scope = excluded.scope, version = excluded.version, phases = excluded.phases",
            params![
                workflow.id,
                workflow.name,
                workflow.scope,
                workflow.builtin,
                workflow.version,
                serde_json::to_string(&workflow.phases)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> anyhow::Result<Option<Workflow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, scope, builtin, version, phases FROM workflows WHERE id = ?1",
            params![id],
            row_to_workflow,
        )
        .optional()
        .context("get_workflow")
    }

    /// `EnsureDefaultForProject`-style lookup: the canonical "balanced"
    /// workflow, falling back to any builtin if absent (SPEC_FULL.md §4.1).
    pub async fn get_default_workflow(&self) -> anyhow::Result<Option<Workflow>> {
        let conn = self.conn.lock().await;
        let balanced = conn
            .query_row(
                "SELECT id, name, scope, builtin, version, phases FROM workflows WHERE name = 'balanced' AND builtin = 1",
                [],
                row_to_workflow,
            )
            .optional()?;
        if balanced.is_some() {
            return Ok(balanced);
        }
        conn.query_row(
            "SELECT id, name, scope, builtin, version, phases FROM workflows WHERE builtin = 1 ORDER BY name ASC LIMIT 1",
            [],
            row_to_workflow,
        )
        .optional()
        .context("get_default_workflow")
    }

    pub async fn put_role_binding(&self, binding: &RoleBinding) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO role_bindings (project_id, role, provider, model, max_parallel)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(project_id, role) DO UPDATE SET
               provider = excluded.provider, model = excluded.model, max_parallel = excluded.max_parallel",
            params![binding.project_id, binding.role, binding.provider, binding.model, binding.max_parallel],
        )?;
        Ok(())
    }

    pub async fn get_role_binding(&self, project_id: &str, role: &str) -> anyhow::Result<Option<RoleBinding>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT project_id, role, provider, model, max_parallel FROM role_bindings WHERE project_id = ?1 AND role = ?2",
            params![project_id, role],
            |row| {
                Ok(RoleBinding {
                    project_id: row.get(0)?,
                    role: row.get(1)?,
                    provider: row.get(2)?,
                    model: row.get(3)?,
                    max_parallel: row.get(4)?,
                })
            },
        )
        .optional()
        .context("get_role_binding")
    }

    pub async fn put_role_agent_assignment(&self, assignment: &RoleAgentAssignment) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO role_agent_assignments (project_id, stage, role, agent_type, max_parallel)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(project_id, role) DO UPDATE SET
               stage = excluded.stage, agent_type = excluded.agent_type, max_parallel = excluded.max_parallel",
            params![
                assignment.project_id,
                assignment.stage,
                assignment.role,
                assignment.agent_type,
                assignment.max_parallel
            ],
        )?;
        Ok(())
    }

    pub async fn get_role_agent_assignment(
        &self,
        project_id: &str,
        role: &str,
    ) -> anyhow::Result<Option<RoleAgentAssignment>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT project_id, stage, role, agent_type, max_parallel FROM role_agent_assignments WHERE project_id = ?1 AND role = ?2",
            params![project_id, role],
            |row| {
                Ok(RoleAgentAssignment {
                    project_id: row.get(0)?,
                    stage: row.get(1)?,
                    role: row.get(2)?,
                    agent_type: row.get(3)?,
                    max_parallel: row.get(4)?,
                })
            },
        )
        .optional()
        .context("get_role_agent_assignment")
    }

    // -- role loop attempts -----------------------------------------------

    pub async fn get_role_loop_attempts(&self, task_id: &str, role: &str) -> anyhow::Result<u32> {
        let conn = self.conn.lock().await;
        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempts FROM role_loop_attempts WHERE task_id = ?1 AND role = ?2",
                params![task_id, role],
                |r| r.get(0),
            )
            .optional()?;
        Ok(attempts.unwrap_or(0) as u32)
    }

    /// Increments the stored attempt counter. Callers only invoke this after
    /// a `create_session` call actually succeeds (SPEC_FULL.md §9).
    pub async fn increment_role_loop_attempts(&self, task_id: &str, role: &str) -> anyhow::Result<u32> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO role_loop_attempts (task_id, role, attempts, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(task_id, role) DO UPDATE SET
               attempts = attempts + 1,
               updated_at = excluded.updated_at",
            params![task_id, role, to_rfc3339(Utc::now())],
        )?;
        let attempts: i64 = conn.query_row(
            "SELECT attempts FROM role_loop_attempts WHERE task_id = ?1 AND role = ?2",
            params![task_id, role],
            |r| r.get(0),
        )?;
        Ok(attempts as u32)
    }

    // -- review cycles / issues -------------------------------------------

    pub async fn put_review_cycle(&self, cycle: &ReviewCycle) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO review_cycles (id, task_id, iteration, status, commit_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, commit_hash = excluded.commit_hash",
            params![
                cycle.id,
                cycle.task_id,
                cycle.iteration,
                review_cycle_status_str(cycle.status),
                cycle.commit_hash,
                to_rfc3339(cycle.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn put_review_issue(&self, issue: &ReviewIssue) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO review_issues (id, cycle_id, severity, status, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status",
            params![
                issue.id,
                issue.cycle_id,
                review_issue_severity_str(issue.severity),
                review_issue_status_str(issue.status),
                issue.body,
                to_rfc3339(issue.created_at),
            ],
        )?;
        Ok(())
    }

    // -- knowledge & demand -------------------------------------------------

    pub async fn put_knowledge_entry(&self, entry: &KnowledgeEntry) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO knowledge_entries (id, project_id, title, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, body = excluded.body",
            params![entry.id, entry.project_id, entry.title, entry.body, to_rfc3339(entry.created_at)],
        )?;
        Ok(())
    }

    /// Most recent entries first, capped to `limit` (system-prompt
    /// construction caps this to 8, see SPEC_FULL.md §4.7 step 4).
    pub async fn list_knowledge_entries_for_project(
        &self,
        project_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<KnowledgeEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, title, body, created_at
             FROM knowledge_entries WHERE project_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![project_id, limit as i64], row_to_knowledge_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn put_demand_item(&self, item: &DemandItem) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO demand_items (id, project_id, title, body, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status",
            params![item.id, item.project_id, item.title, item.body, item.status, to_rfc3339(item.created_at)],
        )?;
        Ok(())
    }

    // -- project orchestrator config ---------------------------------------

    pub async fn put_project_orchestrator(&self, config: &ProjectOrchestrator) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO project_orchestrators (project_id, workflow_id, default_provider, default_model, max_parallel, review_policy, notify_on_blocked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(project_id) DO UPDATE SET
               workflow_id = excluded.workflow_id,
               default_provider = excluded.default_provider,
               default_model = excluded.default_model,
               max_parallel = excluded.max_parallel,
               review_policy = excluded.review_policy,
               notify_on_blocked = excluded.notify_on_blocked",
            params![
                config.project_id,
                config.workflow_id,
                config.default_provider,
                config.default_model,
                config.max_parallel,
                config.review_policy,
                config.notify_on_blocked,
            ],
        )?;
        Ok(())
    }

    pub async fn get_project_orchestrator(&self, project_id: &str) -> anyhow::Result<Option<ProjectOrchestrator>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT project_id, workflow_id, default_provider, default_model, max_parallel, review_policy, notify_on_blocked
             FROM project_orchestrators WHERE project_id = ?1",
            params![project_id],
            |row| {
                Ok(ProjectOrchestrator {
                    project_id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    default_provider: row.get(2)?,
                    default_model: row.get(3)?,
                    max_parallel: row.get(4)?,
                    review_policy: row.get(5)?,
                    notify_on_blocked: row.get(6)?,
                })
            },
        )
        .optional()
        .context("get_project_orchestrator")
    }
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_path: row.get(2)?,
        status: row.get(3)?,
        playbook_id: row.get(4)?,
        created_at: from_rfc3339(row.get::<_, String>(5)?),
        updated_at: from_rfc3339(row.get::<_, String>(6)?),
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let dependencies: String = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: TaskStatus::parse(&row.get::<_, String>(4)?),
        dependencies: serde_json::from_str(&dependencies).unwrap_or_default(),
        worktree_id: row.get(6)?,
        spec_path: row.get(7)?,
        created_at: from_rfc3339(row.get::<_, String>(8)?),
        updated_at: from_rfc3339(row.get::<_, String>(9)?),
    })
}

fn row_to_worktree(row: &Row<'_>) -> rusqlite::Result<Worktree> {
    Ok(Worktree {
        id: row.get(0)?,
        project_id: row.get(1)?,
        branch: row.get(2)?,
        path: row.get(3)?,
        task_id: row.get(4)?,
        status: row.get(5)?,
        created_at: from_rfc3339(row.get::<_, String>(6)?),
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        task_id: row.get(1)?,
        terminal_session_name: row.get(2)?,
        terminal_window_id: row.get(3)?,
        agent_type: row.get(4)?,
        role: row.get(5)?,
        model: row.get(6)?,
        status: SessionStatus::parse(&row.get::<_, String>(7)?),
        human_attached: row.get(8)?,
        created_at: from_rfc3339(row.get::<_, String>(9)?),
        last_activity_at: from_rfc3339(row.get::<_, String>(10)?),
    })
}

fn row_to_session_command(row: &Row<'_>) -> rusqlite::Result<SessionCommand> {
    let payload: String = row.get(3)?;
    Ok(SessionCommand {
        id: row.get(0)?,
        session_id: row.get(1)?,
        op: CommandOp::parse(&row.get::<_, String>(2)?).unwrap_or(CommandOp::SendText),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: parse_command_status(&row.get::<_, String>(4)?),
        created_at: from_rfc3339(row.get::<_, String>(5)?),
        sent_at: row.get::<_, Option<String>>(6)?.map(from_rfc3339),
        acked_at: row.get::<_, Option<String>>(7)?.map(from_rfc3339),
        completed_at: row.get::<_, Option<String>>(8)?.map(from_rfc3339),
        error: row.get(9)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<OrchestratorMessage> {
    let structured: String = row.get(5)?;
    Ok(OrchestratorMessage {
        id: row.get(0)?,
        project_id: row.get(1)?,
        lane: parse_lane(&row.get::<_, String>(2)?),
        role: parse_message_role(&row.get::<_, String>(3)?),
        digest: row.get(4)?,
        structured: serde_json::from_str(&structured).unwrap_or_default(),
        created_at: from_rfc3339(row.get::<_, String>(6)?),
    })
}

fn row_to_knowledge_entry(row: &Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        created_at: from_rfc3339(row.get::<_, String>(4)?),
    })
}

fn row_to_workflow(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    let phases: String = row.get(5)?;
    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        scope: row.get(2)?,
        builtin: row.get(3)?,
        version: row.get(4)?,
        phases: serde_json::from_str(&phases).unwrap_or_default(),
    })
}

fn parse_lane(s: &str) -> Lane {
    match s {
        "execution" => Lane::Execution,
        _ => Lane::Demand,
    }
}

fn parse_message_role(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        _ => MessageRole::User,
    }
}

fn command_status_str(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Queued => "queued",
        CommandStatus::Sent => "sent",
        CommandStatus::Acked => "acked",
        CommandStatus::Completed => "completed",
        CommandStatus::Failed => "failed",
    }
}

fn parse_command_status(s: &str) -> CommandStatus {
    match s {
        "sent" => CommandStatus::Sent,
        "acked" => CommandStatus::Acked,
        "completed" => CommandStatus::Completed,
        "failed" => CommandStatus::Failed,
        _ => CommandStatus::Queued,
    }
}

fn review_cycle_status_str(status: ReviewCycleStatus) -> &'static str {
    match status {
        ReviewCycleStatus::Open => "open",
        ReviewCycleStatus::Approved => "approved",
        ReviewCycleStatus::ChangesRequested => "changes_requested",
        ReviewCycleStatus::Closed => "closed",
    }
}

fn review_issue_severity_str(severity: ReviewIssueSeverity) -> &'static str {
    match severity {
        ReviewIssueSeverity::Info => "info",
        ReviewIssueSeverity::Minor => "minor",
        ReviewIssueSeverity::Major => "major",
        ReviewIssueSeverity::Blocking => "blocking",
    }
}

fn review_issue_status_str(status: ReviewIssueStatus) -> &'static str {
    match status {
        ReviewIssueStatus::Open => "open",
        ReviewIssueStatus::Resolved => "resolved",
        ReviewIssueStatus::Closed => "closed",
        ReviewIssueStatus::Accepted => "accepted",
    }
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn from_rfc3339(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap())
}

fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER NOT NULL PRIMARY KEY, applied_at TEXT NOT NULL);",
    )?;
    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| r.get(0))
        .unwrap_or(0);
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            repo_path TEXT NOT NULL,
            status TEXT NOT NULL,
            playbook_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            dependencies TEXT NOT NULL DEFAULT '[]',
            worktree_id TEXT,
            spec_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);

        CREATE TABLE IF NOT EXISTS worktrees (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            branch TEXT NOT NULL,
            path TEXT NOT NULL,
            task_id TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_worktrees_project ON worktrees(project_id);

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            task_id TEXT,
            terminal_session_name TEXT NOT NULL,
            terminal_window_id TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            role TEXT NOT NULL,
            model TEXT,
            status TEXT NOT NULL,
            human_attached INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_task ON sessions(task_id);

        CREATE TABLE IF NOT EXISTS session_commands (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            op TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            sent_at TEXT,
            acked_at TEXT,
            completed_at TEXT,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_commands_session ON session_commands(session_id, status);

        CREATE TABLE IF NOT EXISTS orchestrator_messages (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            lane TEXT NOT NULL,
            role TEXT NOT NULL,
            digest TEXT NOT NULL,
            structured TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_project_lane ON orchestrator_messages(project_id, lane, created_at);

        CREATE TABLE IF NOT EXISTS role_loop_attempts (
            task_id TEXT NOT NULL,
            role TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (task_id, role)
        );

        CREATE TABLE IF NOT EXISTS review_cycles (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            iteration INTEGER NOT NULL,
            status TEXT NOT NULL,
            commit_hash TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_review_cycles_task ON review_cycles(task_id);

        CREATE TABLE IF NOT EXISTS review_issues (
            id TEXT PRIMARY KEY,
            cycle_id TEXT NOT NULL REFERENCES review_cycles(id),
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_review_issues_cycle ON review_issues(cycle_id);

        CREATE TABLE IF NOT EXISTS knowledge_entries (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS demand_items (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS project_orchestrators (
            project_id TEXT PRIMARY KEY REFERENCES projects(id),
            workflow_id TEXT NOT NULL,
            default_provider TEXT,
            default_model TEXT,
            max_parallel INTEGER,
            review_policy TEXT NOT NULL DEFAULT '',
            notify_on_blocked INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            scope TEXT NOT NULL,
            builtin INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            phases TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS role_bindings (
            project_id TEXT NOT NULL REFERENCES projects(id),
            role TEXT NOT NULL,
            provider TEXT,
            model TEXT,
            max_parallel INTEGER,
            PRIMARY KEY (project_id, role)
        );

        CREATE TABLE IF NOT EXISTS role_agent_assignments (
            project_id TEXT NOT NULL REFERENCES projects(id),
            stage TEXT NOT NULL,
            role TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            max_parallel INTEGER,
            PRIMARY KEY (project_id, role)
        );
        ",
    )?;

    seed_builtin_workflows(conn)?;

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, to_rfc3339(Utc::now())],
    )?;
    Ok(())
}

/// Seeds the canonical "balanced" builtin workflow plus a leaner "solo"
/// alternative, matching the plan/build/test phases and planner/coder/tester
/// roles used throughout the toolset and stage-derivation rules.
fn seed_builtin_workflows(conn: &Connection) -> anyhow::Result<()> {
    let balanced = Workflow {
        id: "builtin-balanced".to_string(),
        name: "balanced".to_string(),
        scope: "global".to_string(),
        builtin: true,
        version: 1,
        phases: vec![
            WorkflowPhase {
                phase_type: "plan".to_string(),
                role: "planner".to_string(),
                entry_rule: "always".to_string(),
                exit_rule: "plan_reviewed".to_string(),
                max_parallel: 1,
                agent_selector: None,
            },
            WorkflowPhase {
                phase_type: "build".to_string(),
                role: "coder".to_string(),
                entry_rule: "plan_reviewed".to_string(),
                exit_rule: "ready_for_review".to_string(),
                max_parallel: 3,
                agent_selector: None,
            },
            WorkflowPhase {
                phase_type: "build".to_string(),
                role: "reviewer".to_string(),
                entry_rule: "ready_for_review".to_string(),
                exit_rule: "review_approved".to_string(),
                max_parallel: 1,
                agent_selector: None,
            },
            WorkflowPhase {
                phase_type: "test".to_string(),
                role: "tester".to_string(),
                entry_rule: "review_approved".to_string(),
                exit_rule: "tests_pass".to_string(),
                max_parallel: 2,
                agent_selector: None,
            },
        ],
    };
    let solo = Workflow {
        id: "builtin-solo".to_string(),
        name: "solo".to_string(),
        scope: "global".to_string(),
        builtin: true,
        version: 1,
        phases: vec![
            WorkflowPhase {
                phase_type: "plan".to_string(),
                role: "planner".to_string(),
                entry_rule: "always".to_string(),
                exit_rule: "plan_reviewed".to_string(),
                max_parallel: 1,
                agent_selector: None,
            },
            WorkflowPhase {
                phase_type: "build".to_string(),
                role: "coder".to_string(),
                entry_rule: "plan_reviewed".to_string(),
                exit_rule: "ready_for_review".to_string(),
                max_parallel: 1,
                agent_selector: None,
            },
            WorkflowPhase {
                phase_type: "test".to_string(),
                role: "tester".to_string(),
                entry_rule: "ready_for_review".to_string(),
                exit_rule: "tests_pass".to_string(),
                max_parallel: 1,
                agent_selector: None,
            },
        ],
    };
    for workflow in [&balanced, &solo] {
        conn.execute(
            "INSERT OR IGNORE INTO workflows (id, name, scope, builtin, version, phases) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                workflow.id,
                workflow.name,
                workflow.scope,
                workflow.builtin,
                workflow.version,
                serde_json::to_string(&workflow.phases)?,
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_project_and_its_tasks() {
        let storage = Storage::in_memory().await.expect("open");
        let project = Project::new("demo", "/repos/demo");
        storage.put_project(&project).await.expect("put project");

        let mut task = Task::new(project.id.clone(), "write parser");
        task.dependencies = vec!["dep-1".to_string()];
        storage.put_task(&task).await.expect("put task");

        let fetched = storage
            .get_project(&project.id)
            .await
            .expect("get project")
            .expect("project exists");
        assert_eq!(fetched.name, "demo");

        let tasks = storage
            .list_tasks_for_project(&project.id)
            .await
            .expect("list tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].dependencies, vec!["dep-1".to_string()]);
    }

    #[tokio::test]
    async fn session_counts_as_active_includes_human_takeover() {
        let storage = Storage::in_memory().await.expect("open");
        let mut session = Session::new("ses-1", "win-1", "claude-code", "implementer");
        session.status = SessionStatus::HumanTakeover;
        storage.put_session(&session).await.expect("put session");

        assert_eq!(storage.count_active_sessions().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn role_loop_attempts_increment_monotonically() {
        let storage = Storage::in_memory().await.expect("open");
        assert_eq!(
            storage.get_role_loop_attempts("task-1", "implementer").await.expect("get"),
            0
        );
        storage
            .increment_role_loop_attempts("task-1", "implementer")
            .await
            .expect("increment");
        let attempts = storage
            .increment_role_loop_attempts("task-1", "implementer")
            .await
            .expect("increment again");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn builtin_balanced_workflow_is_seeded_on_open() {
        let storage = Storage::in_memory().await.expect("open");
        let workflow = storage
            .get_default_workflow()
            .await
            .expect("get default workflow")
            .expect("balanced workflow seeded");
        assert_eq!(workflow.name, "balanced");
        assert!(workflow.builtin);
        assert!(workflow.phases.iter().any(|p| p.role == "coder"));
    }

    #[tokio::test]
    async fn role_binding_and_agent_assignment_round_trip() {
        let storage = Storage::in_memory().await.expect("open");
        let project = Project::new("demo", "/repos/demo");
        storage.put_project(&project).await.expect("put project");

        storage
            .put_role_binding(&RoleBinding {
                project_id: project.id.clone(),
                role: "coder".to_string(),
                provider: Some("anthropic".to_string()),
                model: Some("claude-opus".to_string()),
                max_parallel: Some(2),
            })
            .await
            .expect("put role binding");
        let binding = storage
            .get_role_binding(&project.id, "coder")
            .await
            .expect("get role binding")
            .expect("binding exists");
        assert_eq!(binding.model.as_deref(), Some("claude-opus"));

        storage
            .put_role_agent_assignment(&RoleAgentAssignment {
                project_id: project.id.clone(),
                stage: "build".to_string(),
                role: "coder".to_string(),
                agent_type: "codex".to_string(),
                max_parallel: Some(2),
            })
            .await
            .expect("put role agent assignment");
        let assignment = storage
            .get_role_agent_assignment(&project.id, "coder")
            .await
            .expect("get role agent assignment")
            .expect("assignment exists");
        assert_eq!(assignment.agent_type, "codex");
    }
}

//! `axum` router implementing SPEC_FULL.md §6's REST table plus
//! `/api/healthz` and the `/api/events` websocket feed (§4.13).

use std::net::SocketAddr;
use std::process::Stdio;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use agenterm_types::{AgentermError, CommandOp, Project, Task, Worktree};

use crate::AppState;

fn err_response(err: AgentermError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": err.to_string()})))
}

fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    err_response(AgentermError::NotFound(what.to_string()))
}

fn storage_err(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    err_response(AgentermError::Other(e))
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct CreateProjectInput {
    name: String,
    repo_path: String,
    #[serde(default)]
    playbook_id: Option<String>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(input): Json<CreateProjectInput>,
) -> Result<Json<Project>, (StatusCode, Json<Value>)> {
    if input.name.trim().is_empty() || input.repo_path.trim().is_empty() {
        return Err(err_response(AgentermError::Invalid("name and repo_path are required".to_string())));
    }
    let mut project = Project::new(input.name, input.repo_path);
    project.playbook_id = input.playbook_id;
    state.storage.put_project(&project).await.map_err(storage_err)?;
    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
struct CreateTaskInput {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    worktree_id: Option<String>,
    #[serde(default)]
    spec_path: Option<String>,
}

async fn create_task(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(input): Json<CreateTaskInput>,
) -> Result<Json<Task>, (StatusCode, Json<Value>)> {
    if input.title.trim().is_empty() {
        return Err(err_response(AgentermError::Invalid("title is required".to_string())));
    }
    if state.storage.get_project(&project_id).await.map_err(storage_err)?.is_none() {
        return Err(not_found(&format!("project `{project_id}`")));
    }
    let mut task = Task::new(&project_id, input.title);
    task.description = input.description;
    task.dependencies = input.dependencies;
    task.worktree_id = input.worktree_id;
    task.spec_path = input.spec_path;
    state.storage.put_task(&task).await.map_err(storage_err)?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct CreateWorktreeInput {
    branch: String,
    path: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    base: Option<String>,
}

async fn create_worktree(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(input): Json<CreateWorktreeInput>,
) -> Result<Json<Worktree>, (StatusCode, Json<Value>)> {
    let Some(project) = state.storage.get_project(&project_id).await.map_err(storage_err)? else {
        return Err(not_found(&format!("project `{project_id}`")));
    };
    let base = input.base.unwrap_or_else(|| "HEAD".to_string());
    let output = Command::new("git")
        .args(["-C", &project.repo_path, "worktree", "add", "-b", &input.branch, &input.path, &base])
        .stdout(Stdio::null())
        .output()
        .await
        .map_err(|e| storage_err(e.into()))?;
    if !output.status.success() {
        return Err(err_response(AgentermError::ExternalError {
            status: 500,
            detail: String::from_utf8_lossy(&output.stderr).to_string(),
        }));
    }
    let mut worktree = Worktree::new(&project_id, input.branch, input.path);
    worktree.task_id = input.task_id;
    state.storage.put_worktree(&worktree).await.map_err(storage_err)?;
    Ok(Json(worktree))
}

#[derive(Debug, Deserialize)]
struct CreateSessionInput {
    agent_type: String,
    role: String,
}

async fn create_session(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(input): Json<CreateSessionInput>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(agent) = state.agents.get(&input.agent_type).cloned() else {
        return Err(not_found(&format!("agent `{}`", input.agent_type)));
    };
    let session = state
        .session_manager
        .create_session(&task_id, &agent, &input.role)
        .await
        .map_err(storage_err)?;
    Ok(Json(serde_json::to_value(session).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct SendInput {
    text: String,
}

async fn send_session_text(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(input): Json<SendInput>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if input.text.is_empty() {
        return Err(err_response(AgentermError::Invalid("text must not be empty".to_string())));
    }
    let command = state
        .session_manager
        .enqueue_command(&session_id, CommandOp::SendText, json!({"text": input.text}))
        .await
        .map_err(storage_err)?;
    Ok(Json(serde_json::to_value(command).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    lines: Option<usize>,
}

async fn session_output(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let lines = query.lines.unwrap_or(100);
    let snapshot = state.session_manager.capture_output(&session_id, lines).await.map_err(storage_err)?;
    Ok(Json(json!({"output": snapshot.output})))
}

async fn session_idle(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(session) = state.storage.get_session(&session_id).await.map_err(storage_err)? else {
        return Err(not_found(&format!("session `{session_id}`")));
    };
    let agent_command = state.agents.get(&session.agent_type).map(|a| a.command.clone()).unwrap_or_default();
    let ready = state.session_manager.get_ready_state(&session_id, &agent_command).await.map_err(storage_err)?;
    Ok(Json(json!({
        "ready": ready.ready,
        "reason": ready.reason,
        "status": ready.status.as_str(),
        "last_activity": ready.last_activity,
        "prompt_detected": ready.prompt_detected,
        "observed_output": ready.observed_output,
        "last_class": ready.last_class,
        "last_text": ready.last_text,
    })))
}

async fn session_close_check(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(session) = state.storage.get_session(&session_id).await.map_err(storage_err)? else {
        return Err(not_found(&format!("session `{session_id}`")));
    };
    let can_close = !matches!(session.status, agenterm_types::SessionStatus::Working);
    Ok(Json(json!({"can_close": can_close, "status": session.status.as_str()})))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.session_manager.destroy(&session_id).await.map_err(storage_err)?;
    Ok(Json(json!({"closed": true})))
}

async fn project_status(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(project) = state.storage.get_project(&project_id).await.map_err(storage_err)? else {
        return Err(not_found(&format!("project `{project_id}`")));
    };
    let tasks = state.storage.list_tasks_for_project(&project_id).await.map_err(storage_err)?;
    let worktrees = state.storage.list_worktrees_for_project(&project_id).await.map_err(storage_err)?;
    let mut sessions = state.storage.list_sessions().await.map_err(storage_err)?;
    sessions.retain(|s| s.task_id.as_deref().map(|t| tasks.iter().any(|task| task.id == t)).unwrap_or(false));

    let profile = state.storage.get_project_orchestrator(&project_id).await.map_err(storage_err)?;
    let workflow = match &profile {
        Some(p) => state.storage.get_workflow(&p.workflow_id).await.map_err(storage_err)?,
        None => state.storage.get_default_workflow().await.map_err(storage_err)?,
    };
    let stage = agenterm_orchestrator::derive_stage(&project, &tasks, &worktrees, workflow.as_ref());

    Ok(Json(json!({
        "project": project,
        "tasks": tasks,
        "worktrees": worktrees,
        "sessions": sessions,
        "stage": stage.as_str(),
    })))
}

#[derive(Debug, Deserialize, Default)]
struct MergeInput {
    #[serde(default)]
    target_branch: Option<String>,
}

async fn merge_worktree(
    State(state): State<AppState>,
    Path(worktree_id): Path<String>,
    Json(input): Json<MergeInput>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let worktrees = state.storage.list_projects().await.map_err(storage_err)?;
    let mut found = None;
    for project in worktrees {
        let project_worktrees = state.storage.list_worktrees_for_project(&project.id).await.map_err(storage_err)?;
        if let Some(worktree) = project_worktrees.into_iter().find(|w| w.id == worktree_id) {
            found = Some((project, worktree));
            break;
        }
    }
    let Some((project, worktree)) = found else {
        return Err(not_found(&format!("worktree `{worktree_id}`")));
    };
    let target = input.target_branch.unwrap_or_else(|| "main".to_string());
    let output = Command::new("git")
        .args(["-C", &project.repo_path, "merge", "--no-edit", &worktree.branch])
        .output()
        .await
        .map_err(|e| storage_err(e.into()))?;
    let conflicted = !output.status.success()
        && String::from_utf8_lossy(&output.stderr).contains("conflict");
    Ok(Json(json!({
        "ok": output.status.success(),
        "conflicted": conflicted,
        "target_branch": target,
        "stderr": String::from_utf8_lossy(&output.stderr).to_string(),
    })))
}

#[derive(Debug, Deserialize)]
struct ResolveConflictInput {
    /// "ours" | "theirs"
    strategy: String,
    paths: Vec<String>,
}

async fn resolve_merge_conflict(
    State(state): State<AppState>,
    Path(worktree_id): Path<String>,
    Json(input): Json<ResolveConflictInput>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if input.strategy != "ours" && input.strategy != "theirs" {
        return Err(err_response(AgentermError::Invalid("strategy must be `ours` or `theirs`".to_string())));
    }
    let projects = state.storage.list_projects().await.map_err(storage_err)?;
    let mut repo_path = None;
    for project in &projects {
        let worktrees = state.storage.list_worktrees_for_project(&project.id).await.map_err(storage_err)?;
        if worktrees.iter().any(|w| w.id == worktree_id) {
            repo_path = Some(project.repo_path.clone());
            break;
        }
    }
    let Some(repo_path) = repo_path else {
        return Err(not_found(&format!("worktree `{worktree_id}`")));
    };

    let mut args = vec!["-C".to_string(), repo_path.clone(), "checkout".to_string(), format!("--{}", input.strategy)];
    args.extend(input.paths.iter().cloned());
    let checkout = Command::new("git").args(&args).output().await.map_err(|e| storage_err(e.into()))?;
    if !checkout.status.success() {
        return Err(err_response(AgentermError::ExternalError {
            status: 500,
            detail: String::from_utf8_lossy(&checkout.stderr).to_string(),
        }));
    }
    let mut add_args = vec!["-C".to_string(), repo_path, "add".to_string()];
    add_args.extend(input.paths.iter().cloned());
    let add = Command::new("git").args(&add_args).output().await.map_err(|e| storage_err(e.into()))?;
    Ok(Json(json!({"ok": add.status.success()})))
}

async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| relay_events(socket, state))
}

async fn relay_events(mut socket: WebSocket, state: AppState) {
    let mut stream = BroadcastStream::new(state.event_bus.subscribe());
    while let Some(Ok(event)) = stream.next().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
            break;
        }
    }
}

async fn bearer_auth(State(state): State<AppState>, headers: HeaderMap, request: axum::extract::Request, next: Next) -> Response {
    let Some(expected) = &state.bearer_token else {
        return next.run(request).await;
    };
    let supplied = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if supplied == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid or missing bearer token"}))).into_response()
    }
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let authenticated = Router::new()
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}/tasks", post(create_task))
        .route("/api/projects/{id}/worktrees", post(create_worktree))
        .route("/api/projects/{id}", get(project_status))
        .route("/api/tasks/{id}/sessions", post(create_session))
        .route("/api/sessions/{id}/send", post(send_session_text))
        .route("/api/sessions/{id}/output", get(session_output))
        .route("/api/sessions/{id}/idle", get(session_idle))
        .route("/api/sessions/{id}/close-check", get(session_close_check))
        .route("/api/sessions/{id}/close", post(close_session))
        .route("/api/worktrees/{id}/merge", post(merge_worktree))
        .route("/api/worktrees/{id}/resolve-conflict", post(resolve_merge_conflict))
        .route("/api/events", get(events_ws))
        .route_layer(middleware::from_fn_with_state(state.clone(), bearer_auth));

    Router::new()
        .route("/api/healthz", get(healthz))
        .merge(authenticated)
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

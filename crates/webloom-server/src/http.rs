use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use webloom_core::{builder_agent, generate_app_info, AgentEventStream};
use webloom_storage::Storage;
use webloom_types::{
    AgentEvent, ChatRecord, Project, ProjectContext, SandboxOutcome, Session, StopOutcome,
    SANDBOX_STATUS_FAILED, SANDBOX_STATUS_INITIALIZED,
};

use crate::AppState;

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
struct ProjectCreateInput {
    description: String,
}

#[derive(Debug, Deserialize)]
struct SessionCreateInput {
    project_id: String,
    #[serde(default = "default_session_name")]
    name: String,
    messages: Option<Vec<ChatRecord>>,
}

fn default_session_name() -> String {
    "App Session".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct SessionUpdateInput {
    name: Option<String>,
    messages: Option<Vec<ChatRecord>>,
}

#[derive(Debug, Deserialize)]
struct SessionQueryInput {
    input: String,
}

#[derive(Debug, Deserialize, Default)]
struct ListSessionsQuery {
    project_id: Option<String>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "webloom api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config).patch(patch_config))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{id}", get(get_project).delete(delete_project))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/sessions/{id}/query", post(query_session))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": crate::build_id(),
        "uptime_ms": crate::now_ms().saturating_sub(state.started_at_ms),
    }))
}

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config.get_effective_value().await)
}

async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let effective = state.config.patch(patch).await.map_err(internal)?;
    Ok(Json(effective))
}

// --- projects ---

async fn list_projects(State(state): State<AppState>) -> Json<Vec<Project>> {
    Json(state.storage.list_projects().await)
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    state
        .storage
        .get_project(&id)
        .await
        .map(Json)
        .ok_or_else(not_found("Project not found"))
}

async fn create_project(
    State(state): State<AppState>,
    Json(input): Json<ProjectCreateInput>,
) -> Result<Json<Project>, ApiError> {
    let info = generate_app_info(&state.providers, &input.description).await;

    let Some(port) = state.ports.generate_available_port().await else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to generate available port".to_string(),
        ));
    };

    // The randomized draw holds no reservation; re-check for a holder right
    // before committing so two racing creations cannot share a port.
    if !state.ports.is_port_available(port).await {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Port {port} is already in use"),
        ));
    }

    let project = state
        .storage
        .save_project(Project::new(info.name, Some(info.description), port))
        .await
        .map_err(internal)?;
    state
        .storage
        .save_session(Session::new(&project.id, "Initial Session"))
        .await
        .map_err(internal)?;

    let outcome = state.sandbox.setup(&project.id, port).await;
    record_sandbox_outcome(&state.storage, &project.id, &outcome).await;

    let project = state
        .storage
        .get_project(&project.id)
        .await
        .unwrap_or(project);
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let project = state
        .storage
        .get_project(&id)
        .await
        .ok_or_else(not_found("Project not found"))?;

    teardown_project_server(&state.storage, &project).await;

    state
        .storage
        .soft_delete_project(&project.id)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Sandbox diagnostics are best-effort: a failed metadata write is logged,
/// never surfaced, and the project record stands either way.
async fn record_sandbox_outcome(storage: &Storage, project_id: &str, outcome: &SandboxOutcome) {
    let (status, pid) = match outcome {
        SandboxOutcome::Started { pid, .. } => (SANDBOX_STATUS_INITIALIZED, Some(*pid)),
        SandboxOutcome::Failed { .. } => (SANDBOX_STATUS_FAILED, None),
    };
    if let Some(pid) = pid {
        if let Err(err) = storage.set_server_pid(project_id, Some(pid)).await {
            tracing::error!(project_id, error = %err, "failed to record server pid");
        }
    }
    if let Err(err) = storage
        .set_sandbox_metadata(project_id, status, outcome.message())
        .await
    {
        tracing::error!(project_id, error = %err, "failed to record sandbox metadata");
    }
}

/// Stop a project's sandbox server if one is recorded. The pid is cleared
/// whenever termination was requested, regardless of the stop outcome, so a
/// later delete never signals a stale pid.
async fn teardown_project_server(storage: &Storage, project: &Project) -> Option<StopOutcome> {
    let pid = project.server_pid?;
    let outcome = webloom_sandbox::stop_server(pid).await;
    match &outcome {
        StopOutcome::Stopped => tracing::info!(pid, project_id = %project.id, "sandbox server stopped"),
        StopOutcome::NotFound => tracing::warn!(pid, project_id = %project.id, "sandbox server already gone"),
        StopOutcome::Failed { message } => {
            tracing::error!(pid, project_id = %project.id, %message, "sandbox server stop failed")
        }
    }
    if let Err(err) = storage.set_server_pid(&project.id, None).await {
        tracing::error!(project_id = %project.id, error = %err, "failed to clear server pid");
    }
    Some(outcome)
}

// --- sessions ---

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Json<Vec<Session>> {
    Json(
        state
            .storage
            .list_sessions(query.project_id.as_deref())
            .await,
    )
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .storage
        .get_session(&id)
        .await
        .map(Json)
        .ok_or_else(not_found("Session not found"))
}

async fn create_session(
    State(state): State<AppState>,
    Json(input): Json<SessionCreateInput>,
) -> Result<Json<Session>, ApiError> {
    if state.storage.get_project(&input.project_id).await.is_none() {
        return Err(not_found("Project not found")());
    }
    let mut session = Session::new(&input.project_id, input.name);
    if let Some(messages) = input.messages {
        session.messages = messages;
    }
    let session = state.storage.save_session(session).await.map_err(internal)?;
    Ok(Json(session))
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SessionUpdateInput>,
) -> Result<Json<Session>, ApiError> {
    let mut session = state
        .storage
        .get_session(&id)
        .await
        .ok_or_else(not_found("Session not found"))?;
    if let Some(name) = input.name {
        session.name = name;
    }
    if let Some(messages) = input.messages {
        session.messages = messages;
    }
    let session = state.storage.save_session(session).await.map_err(internal)?;
    Ok(Json(session))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .storage
        .soft_delete_session(&id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(not_found("Session not found")());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn query_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SessionQueryInput>,
) -> Result<Response, ApiError> {
    let session = state
        .storage
        .get_session(&id)
        .await
        .ok_or_else(not_found("Session not found"))?;
    let project = state
        .storage
        .get_project(&session.project_id)
        .await
        .ok_or_else(not_found("Project not found"))?;

    let context = ProjectContext::from_project(&project);
    let user_record = ChatRecord::user(&input.input);
    let mut conversation = session.messages.clone();
    conversation.push(user_record.clone());

    let events = state
        .runner
        .run_streamed(builder_agent(), conversation, context);
    let stream = query_event_stream(state.storage.clone(), session.id, user_record, events);

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response())
}

/// Forward each normalized agent event to the client as one self-contained
/// JSON record, tracking the most recent `message_output` content. The
/// transcript is appended exactly once, only after the stream drained
/// cleanly; a mid-stream failure emits a terminal error record and skips
/// the append.
fn query_event_stream(
    storage: Arc<Storage>,
    session_id: String,
    user_record: ChatRecord,
    mut events: AgentEventStream,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut final_content = String::new();
        let mut failed = false;

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if let AgentEvent::MessageOutput { content } = &event {
                        final_content = content.clone();
                    }
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().data(payload));
                }
                Err(err) => {
                    failed = true;
                    tracing::error!(session_id = %session_id, error = %err, "agent run failed mid-stream");
                    let payload = json!({
                        "type": "error",
                        "message": truncate_text(&err.to_string(), 500),
                    });
                    yield Ok(Event::default().data(payload.to_string()));
                    break;
                }
            }
        }

        if !failed {
            let records = vec![user_record, ChatRecord::assistant(final_content)];
            if let Err(err) = storage.append_messages(&session_id, records).await {
                tracing::error!(session_id = %session_id, error = %err, "failed to persist transcript");
            }
        }
    }
}

fn not_found(detail: &'static str) -> impl Fn() -> ApiError {
    move || (StatusCode::NOT_FOUND, detail.to_string())
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn truncate_text(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let cut = input
            .char_indices()
            .take_while(|(idx, _)| *idx < max_len)
            .last()
            .map(|(idx, ch)| idx + ch.len_utf8())
            .unwrap_or(0);
        format!("{}...", &input[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use webloom_types::{SANDBOX_ERROR_KEY, SANDBOX_STATUS_KEY};

    async fn storage_with_session() -> (tempfile::TempDir, Arc<Storage>, Session) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path()).await.expect("storage"));
        let session = storage
            .save_session(Session::new("project-a", "chat"))
            .await
            .expect("session");
        (dir, storage, session)
    }

    fn scripted_events(items: Vec<anyhow::Result<AgentEvent>>) -> AgentEventStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn clean_drain_appends_user_and_final_assistant_turn() {
        let (_dir, storage, session) = storage_with_session().await;
        let events = scripted_events(vec![
            Ok(AgentEvent::AgentUpdated {
                agent_name: "Assistant Agent".to_string(),
            }),
            Ok(AgentEvent::MessageOutput {
                content: "draft".to_string(),
            }),
            Ok(AgentEvent::MessageOutput {
                content: "final answer".to_string(),
            }),
        ]);

        let stream = query_event_stream(
            storage.clone(),
            session.id.clone(),
            ChatRecord::user("build it"),
            events,
        );
        let emitted = stream.collect::<Vec<_>>().await;
        assert_eq!(emitted.len(), 3);

        let session = storage.get_session(&session.id).await.expect("session");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0], ChatRecord::user("build it"));
        // Overwrite semantics: the last message_output wins.
        assert_eq!(session.messages[1], ChatRecord::assistant("final answer"));
    }

    #[tokio::test]
    async fn mid_stream_failure_leaves_transcript_unchanged() {
        let (_dir, storage, session) = storage_with_session().await;
        let events = scripted_events(vec![
            Ok(AgentEvent::MessageOutput {
                content: "half-done".to_string(),
            }),
            Err(anyhow::anyhow!("provider exploded")),
        ]);

        let stream = query_event_stream(
            storage.clone(),
            session.id.clone(),
            ChatRecord::user("build it"),
            events,
        );
        let emitted = stream.collect::<Vec<_>>().await;
        // One forwarded event plus one terminal error record.
        assert_eq!(emitted.len(), 2);

        let session = storage.get_session(&session.id).await.expect("session");
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn sandbox_outcomes_land_in_pid_and_metadata() {
        let (_dir, storage, _) = storage_with_session().await;
        let project = storage
            .save_project(Project::new("demo", None, 3300))
            .await
            .expect("project");

        record_sandbox_outcome(
            &storage,
            &project.id,
            &SandboxOutcome::Started {
                pid: 777,
                message: "Sandbox setup complete!".to_string(),
            },
        )
        .await;
        let stored = storage.get_project(&project.id).await.expect("project");
        assert_eq!(stored.server_pid, Some(777));
        assert_eq!(
            stored.metadata.get(SANDBOX_STATUS_KEY).and_then(Value::as_str),
            Some(SANDBOX_STATUS_INITIALIZED)
        );

        record_sandbox_outcome(
            &storage,
            &project.id,
            &SandboxOutcome::Failed {
                message: "Error starting server: bun not found".to_string(),
            },
        )
        .await;
        let stored = storage.get_project(&project.id).await.expect("project");
        assert_eq!(
            stored.metadata.get(SANDBOX_STATUS_KEY).and_then(Value::as_str),
            Some(SANDBOX_STATUS_FAILED)
        );
        assert!(stored
            .metadata
            .get(SANDBOX_ERROR_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .contains("bun not found"));
    }

    #[tokio::test]
    async fn teardown_clears_pid_even_when_process_is_gone() {
        let (_dir, storage, _) = storage_with_session().await;
        let mut project = storage
            .save_project(Project::new("demo", None, 3400))
            .await
            .expect("project");
        // Far above the kernel's default pid_max, still a positive pid_t:
        // termination reports NotFound without signaling anything real.
        let dead_pid: u32 = 2_000_000_000;
        storage
            .set_server_pid(&project.id, Some(dead_pid))
            .await
            .expect("pid");
        project.server_pid = Some(dead_pid);

        let outcome = teardown_project_server(&storage, &project).await;
        assert!(matches!(
            outcome,
            Some(StopOutcome::NotFound) | Some(StopOutcome::Failed { .. })
        ));

        let stored = storage.get_project(&project.id).await.expect("project");
        assert_eq!(stored.server_pid, None);
    }

    #[tokio::test]
    async fn teardown_is_a_no_op_without_a_recorded_pid() {
        let (_dir, storage, _) = storage_with_session().await;
        let project = storage
            .save_project(Project::new("demo", None, 3500))
            .await
            .expect("project");
        assert!(teardown_project_server(&storage, &project).await.is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_text("short", 10), "short");
        let truncated = truncate_text(&"é".repeat(400), 5);
        assert!(truncated.ends_with("..."));
    }
}

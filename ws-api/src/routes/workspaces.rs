use crate::{
    auth::{check_workspace_owner, AuthenticatedUser},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use ws_orchestrator::{
    CreateWorkspaceSpec, LifecyclePhase, Workspace, WorkspaceFilters, WorkspacePage,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/workspaces",
            get(list_workspaces).post(create_workspace),
        )
        .route(
            "/api/v1/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/api/v1/workspaces/{id}/start", post(start_workspace))
        .route("/api/v1/workspaces/{id}/stop", post(stop_workspace))
        .route(
            "/api/v1/workspaces/{id}/status/stream",
            get(stream_workspace_status),
        )
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    /// When true, the workspace is started as part of creation.
    #[serde(default)]
    start: bool,
}

#[derive(Debug, Deserialize)]
struct CreateWorkspaceBody {
    id: Option<String>,
    name: Option<String>,
    repo_url: Option<String>,
    template: Option<String>,
}

async fn create_workspace(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Query(query): Query<CreateQuery>,
    Json(body): Json<CreateWorkspaceBody>,
) -> ApiResult<Json<Workspace>> {
    // Owner always comes from the authenticated identity.
    let spec = CreateWorkspaceSpec {
        id: body.id,
        name: body.name,
        owner: user.username,
        repo_url: body.repo_url,
        template: body.template,
    };

    let workspace = if query.start {
        state.orchestrator.create_and_start(spec).await?
    } else {
        state.orchestrator.create(spec).await?
    };

    Ok(Json(workspace))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    page_size: Option<u32>,
    page_token: Option<String>,
    phase: Option<String>,
}

async fn list_workspaces(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<WorkspacePage>> {
    let phase = match &query.phase {
        Some(s) => Some(
            serde_json::from_str::<LifecyclePhase>(&format!("\"{}\"", s))
                .map_err(|_| ApiError::BadRequest(format!("unknown phase: {}", s)))?,
        ),
        None => None,
    };

    let filters = WorkspaceFilters {
        owner: Some(user.username),
        phase,
    };

    let page_size = query
        .page_size
        .unwrap_or(state.default_page_size)
        .clamp(1, state.max_page_size);

    let page = state
        .orchestrator
        .list(filters, page_size, query.page_token.as_deref())
        .await?;

    Ok(Json(page))
}

async fn get_workspace(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    check_workspace_owner(&state.orchestrator, &id, &user).await?;

    let workspace = state.orchestrator.get(&id).await?;

    Ok(Json(workspace))
}

async fn start_workspace(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    check_workspace_owner(&state.orchestrator, &id, &user).await?;

    let workspace = state.orchestrator.start(&id).await?;
    Ok(Json(workspace))
}

async fn stop_workspace(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    check_workspace_owner(&state.orchestrator, &id, &user).await?;

    let workspace = state.orchestrator.stop(&id).await?;
    Ok(Json(workspace))
}

async fn delete_workspace(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    check_workspace_owner(&state.orchestrator, &id, &user).await?;

    let workspace = state.orchestrator.delete(&id).await?;
    Ok(Json(workspace))
}

/// Server-sent stream of status events for one workspace.
///
/// Ends when the workspace reaches a terminal phase or the client
/// disconnects; a dropped connection releases the subscription.
async fn stream_workspace_status(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    check_workspace_owner(&state.orchestrator, &id, &user).await?;

    let stream = state.orchestrator.watch(&id).await?;

    let sse_stream = stream.map(|item| {
        let event = match item {
            Ok(status) => {
                let data = serde_json::to_string(&status).unwrap_or_default();
                Event::default().event("status").data(data)
            }
            Err(e) => Event::default().event("error").data(e.to_string()),
        };
        Ok(event)
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

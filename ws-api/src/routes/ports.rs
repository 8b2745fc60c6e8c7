use crate::{
    auth::{check_workspace_owner, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use ws_orchestrator::{ExposedPort, PortUpdate, PortVisibility};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/workspaces/{id}/ports", get(list_ports))
        .route(
            "/api/v1/workspaces/{id}/ports/{port}",
            axum::routing::put(update_port),
        )
}

#[derive(Debug, Deserialize)]
struct UpdatePortBody {
    visibility: PortVisibility,
}

async fn update_port(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path((id, port)): Path<(String, u16)>,
    Json(body): Json<UpdatePortBody>,
) -> ApiResult<Json<PortUpdate>> {
    check_workspace_owner(&state.orchestrator, &id, &user).await?;

    let ack = state.ports.update_port(&id, port, body.visibility).await?;

    Ok(Json(ack))
}

async fn list_ports(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ExposedPort>>> {
    check_workspace_owner(&state.orchestrator, &id, &user).await?;

    let ports = state.ports.list_ports(&id).await?;

    Ok(Json(ports))
}

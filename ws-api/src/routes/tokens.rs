use crate::{auth::AuthenticatedUser, error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use ws_orchestrator::OwnerToken;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/api/v1/workspaces/{id}/owner-token",
        post(issue_owner_token),
    )
}

async fn issue_owner_token(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<OwnerToken>> {
    // The issuer enforces ownership and phase itself.
    let token = state.tokens.issue(&id, &user.username).await?;

    Ok(Json(token))
}

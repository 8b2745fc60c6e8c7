use crate::error::ApiError;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use ws_orchestrator::LifecycleOrchestrator;

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub username: String,
    pub email: Option<String>,
}

/// Auth middleware - extracts the caller identity from upstream headers.
///
/// In production an auth proxy sits in front of this service and sets
/// X-WS-User after verifying the caller. For local development without a
/// proxy, the plain x-user header is accepted as a fallback.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let username = req
        .headers()
        .get("x-ws-user")
        .or_else(|| req.headers().get("x-forwarded-user")) // oauth2-proxy format
        .or_else(|| req.headers().get("x-user")) // fallback for dev
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let email = req
        .headers()
        .get("x-ws-email")
        .or_else(|| req.headers().get("x-forwarded-email"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    // If no username, return 401
    let username = username.ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut()
        .insert(AuthenticatedUser { username, email });

    Ok(next.run(req).await)
}

/// Check if the authenticated user owns the workspace
///
/// Returns Ok if the user owns the workspace, otherwise:
/// - ApiError::NotFound if the workspace doesn't exist
/// - ApiError::Forbidden if the workspace exists but belongs to someone else
pub async fn check_workspace_owner(
    orchestrator: &LifecycleOrchestrator,
    workspace_id: &str,
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    let workspace = orchestrator
        .get(workspace_id)
        .await
        .map_err(|_| ApiError::NotFound(format!("Workspace not found: {}", workspace_id)))?;

    if workspace.owner != user.username {
        return Err(ApiError::Forbidden(format!(
            "Access denied: workspace {} is owned by {}",
            workspace_id, workspace.owner
        )));
    }

    Ok(())
}

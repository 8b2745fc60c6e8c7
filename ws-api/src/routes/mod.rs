pub mod health;
pub mod operations;
pub mod ports;
pub mod tokens;
pub mod workspaces;

use crate::{auth::auth_middleware, state::AppState};
use axum::{middleware, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the router over a shared state. The same state must back the
/// watchdog task so status events land in the hub subscribers use.
pub fn create_app(state: AppState) -> Router {
    // Allow CORS for local development (frontend on different port)
    let cors = CorsLayer::permissive();

    let app = Router::new()
        .merge(health::routes()) // Health routes don't need auth
        .merge(
            workspaces::routes()
                .merge(ports::routes())
                .merge(tokens::routes())
                .merge(operations::routes())
                .layer(middleware::from_fn(auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    app
}

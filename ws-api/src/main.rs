use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use ws_api::{create_app, start_watchdog_task, AppState, Config};
use ws_orchestrator::db::{backup_database, create_pool, run_migrations};
use ws_orchestrator::LocalBackend;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("ws_api=debug,ws_orchestrator=debug,tower_http=debug")
        .init();

    info!("Starting ws-api service...");

    // Load configuration
    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}",
        config.bind_addr,
        config.db_path.display()
    );

    // Database setup
    let db_path = &config.db_path;

    // Backup before migrations
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    // The in-process backend stands in until a real scheduler integration
    // is wired up.
    let backend = Arc::new(LocalBackend::new());

    // One shared state: the watchdog must publish into the same status
    // hub the streaming handlers subscribe to.
    let state = AppState::new(pool, backend, &config)?;

    // Start watchdog task for stuck transitions
    tokio::spawn(start_watchdog_task(
        state.orchestrator.clone(),
        config.watchdog_interval_secs,
    ));
    info!(
        "Watchdog task started (interval: {}s)",
        config.watchdog_interval_secs
    );

    // Create app
    let app = create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

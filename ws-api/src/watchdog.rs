use tokio::time::{interval, Duration};
use tracing::{error, info};
use ws_orchestrator::LifecycleOrchestrator;

/// Periodically fail workspaces stuck in Starting/Stopping past their
/// deadline, so a lost backend callback cannot wedge a workspace forever.
pub async fn start_watchdog_task(orchestrator: LifecycleOrchestrator, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs));

    info!(
        "Watchdog task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        match orchestrator.fail_stale().await {
            Ok(0) => {}
            Ok(failed) => info!("Watchdog failed {} stale transition(s)", failed),
            Err(e) => error!("Watchdog sweep failed: {}", e),
        }
    }
}

use crate::config::Config;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use ws_orchestrator::{
    ComputeBackend, LifecycleConfig, LifecycleOrchestrator, OwnerTokenIssuer, PortManager,
    PortRange, StatusHub, WorkspaceRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: LifecycleOrchestrator,
    pub tokens: OwnerTokenIssuer,
    pub ports: PortManager,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        backend: Arc<dyn ComputeBackend>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let registry = WorkspaceRegistry::new(pool);

        let lifecycle_config = LifecycleConfig {
            start_deadline: Duration::from_secs(config.start_deadline_secs),
            stop_deadline: Duration::from_secs(config.stop_deadline_secs),
            ..LifecycleConfig::default()
        };

        let orchestrator = LifecycleOrchestrator::new(
            registry.clone(),
            StatusHub::default(),
            backend,
            lifecycle_config,
        );

        let tokens =
            OwnerTokenIssuer::new(registry.clone(), Duration::from_secs(config.token_ttl_secs));
        let ports = PortManager::new(registry, PortRange::parse(&config.port_range)?);

        Ok(Self {
            orchestrator,
            tokens,
            ports,
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
        })
    }
}

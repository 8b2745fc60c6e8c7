//! Lifecycle state machine driving workspaces between phases.
//!
//! Every transition is a reaction to an API call, a backend result, or the
//! watchdog; the registry CAS commits first and the status event is
//! published second, so subscribers never observe a phase the store has not
//! recorded.

use crate::backend::{BackendHealth, ComputeBackend};
use crate::error::{OrchestratorError, Result};
use crate::operation::{OperationStatus, OperationType};
use crate::registry::WorkspaceRegistry;
use crate::stream::{StatusHub, StatusStream};
use crate::workspace::{
    CreateWorkspaceSpec, LifecyclePhase, StatusEvent, Workspace, WorkspaceFilters, WorkspacePage,
};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Tuning knobs for retries, deadlines and backend polling.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// CAS attempts before surfacing Conflict to the caller.
    pub max_cas_retries: u32,
    /// Backend call attempts for transient outages.
    pub backend_attempts: u32,
    /// First backoff delay between backend attempts; doubles each retry.
    pub backend_base_delay: Duration,
    /// Interval between backend readiness probes.
    pub ready_poll_interval: Duration,
    /// Starting phase older than this is failed with a timeout.
    pub start_deadline: Duration,
    /// Stopping phase older than this is failed with a timeout.
    pub stop_deadline: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: 3,
            backend_attempts: 3,
            backend_base_delay: Duration::from_millis(250),
            ready_poll_interval: Duration::from_millis(500),
            start_deadline: Duration::from_secs(120),
            stop_deadline: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct LifecycleOrchestrator {
    registry: WorkspaceRegistry,
    hub: StatusHub,
    backend: Arc<dyn ComputeBackend>,
    config: Arc<LifecycleConfig>,
    // Serializes each workspace's CAS-then-publish pair so subscribers
    // observe events in commit order.
    commit_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl LifecycleOrchestrator {
    pub fn new(
        registry: WorkspaceRegistry,
        hub: StatusHub,
        backend: Arc<dyn ComputeBackend>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            hub,
            backend,
            config: Arc::new(config),
            commit_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &StatusHub {
        &self.hub
    }

    /// Create a workspace record in the Creating phase.
    pub async fn create(&self, spec: CreateWorkspaceSpec) -> Result<Workspace> {
        let workspace = self.registry.create(spec).await?;

        let op = self
            .registry
            .record_operation(&workspace.id, OperationType::Create)
            .await?;
        self.registry
            .update_operation(&op, OperationStatus::Succeeded, None)
            .await?;

        info!(workspace_id = %workspace.id, owner = %workspace.owner, "workspace created");
        self.emit(&workspace, None);

        Ok(workspace)
    }

    /// Create a workspace and immediately initiate its start.
    pub async fn create_and_start(&self, spec: CreateWorkspaceSpec) -> Result<Workspace> {
        let workspace = self.create(spec).await?;
        self.start(&workspace.id).await
    }

    /// Get a single workspace by ID
    pub async fn get(&self, id: &str) -> Result<Workspace> {
        self.registry.get(id).await
    }

    /// List workspaces, newest first.
    pub async fn list(
        &self,
        filters: WorkspaceFilters,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<WorkspacePage> {
        self.registry.list(filters, page_size, page_token).await
    }

    /// Move a workspace into Starting and provision compute asynchronously.
    ///
    /// Returns as soon as the Starting transition is committed; the
    /// Starting→Running (or →Failed) half happens in a spawned task.
    pub async fn start(&self, id: &str) -> Result<Workspace> {
        let (workspace, initiated) = self
            .transition(
                id,
                &[LifecyclePhase::Creating, LifecyclePhase::Stopped],
                LifecyclePhase::Starting,
                LifecyclePhase::Running,
            )
            .await?;

        // A concurrent caller won the CAS; its finalizer owns the backend
        // work, and provisioning twice would orphan an instance.
        if !initiated {
            return Ok(workspace);
        }

        let op = self
            .registry
            .record_operation(id, OperationType::Start)
            .await?;

        let this = self.clone();
        let ws = workspace.clone();
        tokio::spawn(async move {
            this.finalize_start(ws, op).await;
        });

        Ok(workspace)
    }

    /// Move a Running workspace into Stopping; backend stop finishes the
    /// transition asynchronously.
    pub async fn stop(&self, id: &str) -> Result<Workspace> {
        let (workspace, initiated) = self
            .transition(
                id,
                &[LifecyclePhase::Running],
                LifecyclePhase::Stopping,
                LifecyclePhase::Stopped,
            )
            .await?;

        if !initiated {
            return Ok(workspace);
        }

        let op = self
            .registry
            .record_operation(id, OperationType::Stop)
            .await?;

        let this = self.clone();
        let ws = workspace.clone();
        tokio::spawn(async move {
            this.finalize_stop(ws, op).await;
        });

        Ok(workspace)
    }

    /// Soft-delete: move a Stopped workspace into Deleting; backend
    /// teardown finishes the transition asynchronously.
    pub async fn delete(&self, id: &str) -> Result<Workspace> {
        let (workspace, initiated) = self
            .transition(
                id,
                &[LifecyclePhase::Stopped],
                LifecyclePhase::Deleting,
                LifecyclePhase::Deleted,
            )
            .await?;

        if !initiated {
            return Ok(workspace);
        }

        let op = self
            .registry
            .record_operation(id, OperationType::Delete)
            .await?;

        let this = self.clone();
        let ws = workspace.clone();
        tokio::spawn(async move {
            this.finalize_delete(ws, op).await;
        });

        Ok(workspace)
    }

    /// Subscribe to status events for a workspace.
    ///
    /// An already-terminal workspace yields a stream that ends immediately.
    pub async fn watch(&self, id: &str) -> Result<StatusStream> {
        let workspace = self.registry.get(id).await?;

        if workspace.phase.is_terminal() {
            return Ok(self.hub.ended());
        }

        let stream = self.hub.subscribe(id);

        // The workspace can go terminal between the phase check and the
        // subscription, with the hub close landing before it; re-check so
        // a late subscriber still gets a stream that terminates.
        if self.registry.get(id).await?.phase.is_terminal() {
            return Ok(self.hub.ended());
        }

        Ok(stream)
    }

    /// Fail workspaces stuck in Starting/Stopping beyond their deadline.
    /// Returns how many were failed. Driven by the watchdog task.
    pub async fn fail_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut failed = 0;

        for (phase, deadline) in [
            (LifecyclePhase::Starting, self.config.start_deadline),
            (LifecyclePhase::Stopping, self.config.stop_deadline),
        ] {
            let cutoff = now
                - chrono::Duration::from_std(deadline)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));

            for workspace in self.registry.stale_transitions(phase, cutoff).await? {
                let message = format!(
                    "deadline exceeded: workspace spent more than {}s in {}",
                    deadline.as_secs(),
                    phase
                );
                warn!(workspace_id = %workspace.id, %phase, "failing stale transition");

                if self.fail_workspace(&workspace.id, &message).await.is_ok() {
                    failed += 1;
                }
            }
        }

        Ok(failed)
    }

    /// Bounded-retry CAS transition.
    ///
    /// Re-reads the current phase each attempt; finding the target phase
    /// already reached is idempotent success (the concurrent caller that
    /// lost the CAS still gets an Ok). The returned flag is false on that
    /// path, so callers skip operation recording and finalizer spawning:
    /// the winner's finalizer already owns them. Exhausting the retry
    /// budget surfaces Conflict.
    async fn transition(
        &self,
        id: &str,
        allowed_from: &[LifecyclePhase],
        to: LifecyclePhase,
        desired: LifecyclePhase,
    ) -> Result<(Workspace, bool)> {
        let mut last_conflict = None;

        for _ in 0..self.config.max_cas_retries {
            let current = self.registry.get(id).await?;

            if current.phase == to {
                return Ok((current, false));
            }
            if !allowed_from.contains(&current.phase) {
                return Err(OrchestratorError::InvalidState(format!(
                    "workspace {}: cannot move from {} to {}",
                    id, current.phase, to
                )));
            }

            let lock = self.commit_lock(id);
            let _commit = lock.lock().await;

            match self
                .registry
                .update_phase(id, current.phase, to, None, None)
                .await
            {
                Ok(mut workspace) => {
                    self.registry.set_desired_phase(id, desired).await?;
                    workspace.desired_phase = desired;
                    self.emit(&workspace, None);
                    return Ok((workspace, true));
                }
                Err(OrchestratorError::Conflict(msg)) => {
                    debug!(workspace_id = %id, "transition CAS conflict, retrying");
                    last_conflict = Some(msg);
                }
                Err(e) => return Err(e),
            }
        }

        Err(OrchestratorError::Conflict(last_conflict.unwrap_or_else(
            || format!("workspace {}: concurrent update retries exhausted", id),
        )))
    }

    /// Lock held across a workspace's CAS and the publish of its event.
    fn commit_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.commit_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Publish the status event for a committed transition; terminal
    /// phases also end all subscriptions for the workspace.
    fn emit(&self, workspace: &Workspace, message: Option<String>) {
        let event = StatusEvent::new(&workspace.id, workspace.phase, message);
        self.hub.publish(&event);

        if workspace.phase.is_terminal() {
            self.hub.close(&workspace.id);
            self.commit_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&workspace.id);
        }
    }

    async fn finalize_start(&self, workspace: Workspace, op: String) {
        self.mark_operation(&op, OperationStatus::Running, None).await;

        let work = async {
            let backend_ref = self
                .retry_backend(|| self.backend.provision(&workspace))
                .await?;
            self.wait_ready(&backend_ref).await?;
            Ok::<String, OrchestratorError>(backend_ref)
        };

        let result = tokio::time::timeout(self.config.start_deadline, work).await;

        match result {
            Ok(Ok(backend_ref)) => {
                self.finalize_transition(
                    &workspace.id,
                    LifecyclePhase::Starting,
                    LifecyclePhase::Running,
                    Some(&backend_ref),
                    &op,
                )
                .await;
            }
            Ok(Err(e)) => {
                self.fail_after_backend(&workspace.id, &op, &e.to_string())
                    .await;
            }
            Err(_) => {
                let msg = format!(
                    "deadline exceeded: backend not ready within {}s",
                    self.config.start_deadline.as_secs()
                );
                self.fail_after_backend(&workspace.id, &op, &msg).await;
            }
        }
    }

    async fn finalize_stop(&self, workspace: Workspace, op: String) {
        self.mark_operation(&op, OperationStatus::Running, None).await;

        let backend_ref = workspace.backend_ref.clone().unwrap_or_default();
        let work = async {
            if !backend_ref.is_empty() {
                self.retry_backend(|| self.backend.stop(&backend_ref))
                    .await?;
            }
            Ok::<(), OrchestratorError>(())
        };

        match tokio::time::timeout(self.config.stop_deadline, work).await {
            Ok(Ok(())) => {
                self.finalize_transition(
                    &workspace.id,
                    LifecyclePhase::Stopping,
                    LifecyclePhase::Stopped,
                    None,
                    &op,
                )
                .await;
            }
            Ok(Err(e)) => {
                self.fail_after_backend(&workspace.id, &op, &e.to_string())
                    .await;
            }
            Err(_) => {
                let msg = format!(
                    "deadline exceeded: backend stop not confirmed within {}s",
                    self.config.stop_deadline.as_secs()
                );
                self.fail_after_backend(&workspace.id, &op, &msg).await;
            }
        }
    }

    async fn finalize_delete(&self, workspace: Workspace, op: String) {
        self.mark_operation(&op, OperationStatus::Running, None).await;

        let result = match &workspace.backend_ref {
            Some(backend_ref) => self.retry_backend(|| self.backend.teardown(backend_ref)).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.finalize_transition(
                    &workspace.id,
                    LifecyclePhase::Deleting,
                    LifecyclePhase::Deleted,
                    None,
                    &op,
                )
                .await;
            }
            Err(e) => {
                self.fail_after_backend(&workspace.id, &op, &e.to_string())
                    .await;
            }
        }
    }

    /// Commit the second half of an async transition. Losing the CAS means
    /// another actor (watchdog, concurrent request) moved the workspace;
    /// the finalizer stands down rather than fighting it.
    async fn finalize_transition(
        &self,
        id: &str,
        from: LifecyclePhase,
        to: LifecyclePhase,
        backend_ref: Option<&str>,
        op: &str,
    ) {
        let lock = self.commit_lock(id);
        let _commit = lock.lock().await;

        match self
            .registry
            .update_phase(id, from, to, None, backend_ref)
            .await
        {
            Ok(workspace) => {
                info!(workspace_id = %id, phase = %to, "transition finalized");
                self.emit(&workspace, None);
                self.mark_operation(op, OperationStatus::Succeeded, None).await;
            }
            Err(OrchestratorError::Conflict(msg)) => {
                debug!(workspace_id = %id, "finalization superseded: {}", msg);
                self.mark_operation(op, OperationStatus::Failed, Some(&msg))
                    .await;
            }
            Err(e) => {
                error!(workspace_id = %id, "finalization failed: {}", e);
                self.mark_operation(op, OperationStatus::Failed, Some(&e.to_string()))
                    .await;
            }
        }
    }

    async fn fail_after_backend(&self, id: &str, op: &str, message: &str) {
        error!(workspace_id = %id, "backend operation failed: {}", message);
        self.mark_operation(op, OperationStatus::Failed, Some(message))
            .await;

        if let Err(e) = self.fail_workspace(id, message).await {
            error!(workspace_id = %id, "could not record failure: {}", e);
        }
    }

    /// Move a workspace to Failed, recording the message durably. Already
    /// terminal workspaces are left alone.
    async fn fail_workspace(&self, id: &str, message: &str) -> Result<()> {
        for _ in 0..self.config.max_cas_retries {
            let current = self.registry.get(id).await?;
            if current.phase.is_terminal() {
                return Ok(());
            }

            let lock = self.commit_lock(id);
            let _commit = lock.lock().await;

            match self
                .registry
                .update_phase(id, current.phase, LifecyclePhase::Failed, Some(message), None)
                .await
            {
                Ok(workspace) => {
                    self.emit(&workspace, Some(message.to_string()));
                    return Ok(());
                }
                Err(OrchestratorError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(OrchestratorError::Conflict(format!(
            "workspace {}: could not record failure",
            id
        )))
    }

    /// Poll backend health until the instance is ready.
    async fn wait_ready(&self, backend_ref: &str) -> Result<()> {
        loop {
            match self.retry_backend(|| self.backend.health(backend_ref)).await? {
                BackendHealth::Ready => return Ok(()),
                BackendHealth::Pending => {
                    tokio::time::sleep(self.config.ready_poll_interval).await;
                }
                other => {
                    return Err(OrchestratorError::Backend(anyhow::anyhow!(
                        "backend instance {} entered unexpected state {:?} while starting",
                        backend_ref,
                        other
                    )));
                }
            }
        }
    }

    /// Retry a backend call with doubling backoff; only transient outages
    /// are retried.
    async fn retry_backend<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.config.backend_base_delay;
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.backend_attempts => {
                    warn!(attempt, "transient backend error, backing off: {}", e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mark_operation(&self, op: &str, status: OperationStatus, error: Option<&str>) {
        if let Err(e) = self.registry.update_operation(op, status, error).await {
            error!(operation = %op, "failed to update operation: {}", e);
        }
    }
}

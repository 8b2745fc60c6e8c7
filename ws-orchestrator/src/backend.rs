//! Compute backend collaborator.
//!
//! The real scheduler integration lives outside this service; the
//! orchestrator only needs provision/stop/teardown plus a health probe.

use crate::error::{OrchestratorError, Result};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// What the backend reports about a provisioned instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHealth {
    /// Provisioned but not yet serving.
    Pending,
    Ready,
    Stopped,
    /// The backend no longer knows this reference.
    Gone,
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Request compute for a workspace. Returns the backend's reference
    /// for the new instance; readiness is reported via [`Self::health`].
    async fn provision(&self, workspace: &Workspace) -> Result<String>;

    /// Stop a running instance, keeping its resources reattachable.
    async fn stop(&self, backend_ref: &str) -> Result<()>;

    /// Tear an instance down permanently.
    async fn teardown(&self, backend_ref: &str) -> Result<()>;

    /// Probe current instance health.
    async fn health(&self, backend_ref: &str) -> Result<BackendHealth>;
}

/// Failure to inject into the next [`LocalBackend`] call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Retryable outage (Unavailable).
    Transient(String),
    /// Permanent failure.
    Fatal(String),
}

impl Fault {
    fn into_error(self) -> OrchestratorError {
        match self {
            Self::Transient(msg) => OrchestratorError::Unavailable(msg),
            Self::Fatal(msg) => OrchestratorError::Backend(anyhow::anyhow!(msg)),
        }
    }
}

/// In-process backend used by default wiring and tests.
///
/// Instances become ready immediately after provisioning. Faults can be
/// queued per call site to exercise the orchestrator's retry and failure
/// paths.
#[derive(Default)]
pub struct LocalBackend {
    instances: Mutex<HashMap<String, BackendHealth>>,
    seq: AtomicU64,
    provision_faults: Mutex<VecDeque<Fault>>,
    stop_faults: Mutex<VecDeque<Fault>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next provision call.
    pub fn inject_provision_fault(&self, fault: Fault) {
        self.provision_faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(fault);
    }

    /// Queue a fault for the next stop call.
    pub fn inject_stop_fault(&self, fault: Fault) {
        self.stop_faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(fault);
    }

    fn take_fault(queue: &Mutex<VecDeque<Fault>>) -> Option<Fault> {
        queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    async fn provision(&self, workspace: &Workspace) -> Result<String> {
        if let Some(fault) = Self::take_fault(&self.provision_faults) {
            return Err(fault.into_error());
        }

        let backend_ref = format!(
            "local-{}-{}",
            workspace.id,
            self.seq.fetch_add(1, Ordering::Relaxed)
        );

        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(backend_ref.clone(), BackendHealth::Ready);

        Ok(backend_ref)
    }

    async fn stop(&self, backend_ref: &str) -> Result<()> {
        if let Some(fault) = Self::take_fault(&self.stop_faults) {
            return Err(fault.into_error());
        }

        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        match instances.get_mut(backend_ref) {
            Some(health) => {
                *health = BackendHealth::Stopped;
                Ok(())
            }
            None => Err(OrchestratorError::Backend(anyhow::anyhow!(
                "unknown backend ref: {}",
                backend_ref
            ))),
        }
    }

    async fn teardown(&self, backend_ref: &str) -> Result<()> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(backend_ref);
        Ok(())
    }

    async fn health(&self, backend_ref: &str) -> Result<BackendHealth> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        Ok(instances
            .get(backend_ref)
            .cloned()
            .unwrap_or(BackendHealth::Gone))
    }
}

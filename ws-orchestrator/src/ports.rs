use crate::error::{OrchestratorError, Result};
use crate::registry::WorkspaceRegistry;
use crate::workspace::{ExposedPort, LifecyclePhase, PortVisibility};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Inclusive range of ports workspaces may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(OrchestratorError::InvalidInput(format!(
                "invalid port range: start ({}) must be less than end ({})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse a `START-END` range string.
    pub fn parse(range_str: &str) -> Result<Self> {
        let invalid = || {
            OrchestratorError::InvalidInput(format!(
                "invalid port range format: {} (expected START-END, e.g. 1024-65535)",
                range_str
            ))
        };

        let (start, end) = range_str.split_once('-').ok_or_else(invalid)?;
        let start: u16 = start.parse().map_err(|_| invalid())?;
        let end: u16 = end.parse().map_err(|_| invalid())?;

        Self::new(start, end)
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Acknowledgement for a port update.
#[derive(Debug, Clone, Serialize)]
pub struct PortUpdate {
    pub workspace_id: String,
    pub port: u16,
    pub visibility: PortVisibility,
    /// False when the port already carried this visibility.
    pub changed: bool,
}

/// Tracks exposed ports and their visibility per workspace.
#[derive(Clone)]
pub struct PortManager {
    registry: WorkspaceRegistry,
    allowed: PortRange,
}

impl PortManager {
    pub fn new(registry: WorkspaceRegistry, allowed: PortRange) -> Self {
        Self { registry, allowed }
    }

    /// Set the visibility of an exposed port.
    ///
    /// The port must fall inside the allowed range and the workspace must
    /// be Running. Re-issuing the current visibility is a no-op success.
    pub async fn update_port(
        &self,
        workspace_id: &str,
        port: u16,
        visibility: PortVisibility,
    ) -> Result<PortUpdate> {
        if !self.allowed.contains(port) {
            return Err(OrchestratorError::InvalidInput(format!(
                "port {} outside allowed range {}",
                port, self.allowed
            )));
        }

        let workspace = self.registry.get(workspace_id).await?;
        if workspace.phase != LifecyclePhase::Running {
            return Err(OrchestratorError::InvalidState(format!(
                "workspace {} is {}, ports can only be updated while running",
                workspace_id, workspace.phase
            )));
        }

        let changed = self
            .registry
            .upsert_port(workspace_id, port, visibility)
            .await?;

        if changed {
            info!(workspace_id = %workspace_id, port, ?visibility, "port visibility updated");
        }

        Ok(PortUpdate {
            workspace_id: workspace_id.to_string(),
            port,
            visibility,
            changed,
        })
    }

    /// Exposed ports for a workspace.
    pub async fn list_ports(&self, workspace_id: &str) -> Result<Vec<ExposedPort>> {
        // Surface NotFound for unknown workspaces rather than an empty list.
        self.registry.get(workspace_id).await?;
        self.registry.get_ports(workspace_id).await
    }
}

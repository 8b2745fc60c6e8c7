use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a workspace.
///
/// `Deleted` and `Failed` are terminal; everything else can still move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Failed,
}

impl LifecyclePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::Failed)
    }

    /// Legal phase transitions. Any non-terminal phase may additionally
    /// fail; no other edge exists.
    pub fn can_transition_to(self, next: LifecyclePhase) -> bool {
        if next == Self::Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Self::Creating, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopped, Self::Starting)
                | (Self::Stopped, Self::Deleting)
                | (Self::Deleting, Self::Deleted)
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Visibility policy for an exposed workspace port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PortVisibility {
    Private,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    pub visibility: PortVisibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: Option<String>,
    pub owner: String,
    pub repo_url: Option<String>,
    pub template: Option<String>,

    /// Phase the registry has durably recorded.
    pub phase: LifecyclePhase,
    /// Phase the most recent user request asked for.
    pub desired_phase: LifecyclePhase,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    /// Time of the last phase transition.
    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,

    /// Identifier handed back by the compute backend once provisioned.
    pub backend_ref: Option<String>,
    pub error_message: Option<String>,
}

/// Status change notification, one per committed phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub workspace_id: String,
    pub phase: LifecyclePhase,

    #[serde(serialize_with = "serialize_datetime")]
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    pub fn new(workspace_id: &str, phase: LifecyclePhase, message: Option<String>) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            phase,
            timestamp: Utc::now(),
            message,
        }
    }
}

/// Short-lived owner credential for a single workspace. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerToken {
    pub token: String,
    pub workspace_id: String,

    #[serde(serialize_with = "serialize_datetime")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceSpec {
    /// Caller-supplied id; generated when absent. A collision fails with
    /// AlreadyExists.
    pub id: Option<String>,
    pub name: Option<String>,
    pub owner: String,
    pub repo_url: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilters {
    pub owner: Option<String>,
    pub phase: Option<LifecyclePhase>,
}

/// One page of a workspace listing, ordered by creation time descending.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspacePage {
    pub items: Vec<Workspace>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
pub(crate) fn serialize_datetime<S>(
    dt: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_have_no_outgoing_edges() {
        for next in [
            LifecyclePhase::Creating,
            LifecyclePhase::Starting,
            LifecyclePhase::Running,
            LifecyclePhase::Stopping,
            LifecyclePhase::Stopped,
            LifecyclePhase::Deleting,
            LifecyclePhase::Deleted,
            LifecyclePhase::Failed,
        ] {
            assert!(!LifecyclePhase::Deleted.can_transition_to(next));
            assert!(!LifecyclePhase::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn stopped_cannot_skip_to_running() {
        assert!(!LifecyclePhase::Stopped.can_transition_to(LifecyclePhase::Running));
        assert!(LifecyclePhase::Stopped.can_transition_to(LifecyclePhase::Starting));
    }

    #[test]
    fn every_non_terminal_phase_can_fail() {
        for phase in [
            LifecyclePhase::Creating,
            LifecyclePhase::Starting,
            LifecyclePhase::Running,
            LifecyclePhase::Stopping,
            LifecyclePhase::Stopped,
            LifecyclePhase::Deleting,
        ] {
            assert!(phase.can_transition_to(LifecyclePhase::Failed));
        }
    }
}

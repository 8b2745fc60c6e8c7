//! Owner token issuance.
//!
//! Tokens are opaque bearer values with a short fixed expiry, scoped to one
//! workspace. They are handed to the caller and never persisted.

use crate::error::{OrchestratorError, Result};
use crate::registry::WorkspaceRegistry;
use crate::workspace::{LifecyclePhase, OwnerToken};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::Duration;
use tracing::info;

/// Length of the random token payload in bytes.
const TOKEN_BYTES: usize = 32;

#[derive(Clone)]
pub struct OwnerTokenIssuer {
    registry: WorkspaceRegistry,
    ttl: Duration,
}

impl OwnerTokenIssuer {
    pub fn new(registry: WorkspaceRegistry, ttl: Duration) -> Self {
        Self { registry, ttl }
    }

    /// Issue an owner token for a workspace.
    ///
    /// The requester must be the workspace owner; Deleted workspaces are
    /// NotFound, a workspace mid-deletion is InvalidState. Issuance never
    /// touches workspace state.
    pub async fn issue(&self, workspace_id: &str, requester: &str) -> Result<OwnerToken> {
        let workspace = self.registry.get(workspace_id).await?;

        match workspace.phase {
            LifecyclePhase::Deleted => {
                return Err(OrchestratorError::NotFound(workspace_id.to_string()))
            }
            LifecyclePhase::Deleting => {
                return Err(OrchestratorError::InvalidState(format!(
                    "workspace {} is being deleted",
                    workspace_id
                )))
            }
            _ => {}
        }

        if workspace.owner != requester {
            return Err(OrchestratorError::PermissionDenied(format!(
                "workspace {} is owned by {}",
                workspace_id, workspace.owner
            )));
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));

        info!(workspace_id = %workspace_id, owner = %requester, "owner token issued");

        Ok(OwnerToken {
            token: generate_token(),
            workspace_id: workspace_id.to_string(),
            expires_at,
        })
    }
}

/// Generate a secure random bearer token.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("wso_{}", URL_SAFE_NO_PAD.encode(bytes))
}

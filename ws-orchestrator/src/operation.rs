use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workspace::serialize_datetime;

/// Audit record for a lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub workspace_id: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,

    #[serde(serialize_with = "serialize_datetime")]
    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Start,
    Stop,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

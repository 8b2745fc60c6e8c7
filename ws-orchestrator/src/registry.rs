use crate::error::{OrchestratorError, Result};
use crate::operation::{Operation, OperationStatus, OperationType};
use crate::workspace::{
    CreateWorkspaceSpec, ExposedPort, LifecyclePhase, PortVisibility, Workspace, WorkspaceFilters,
    WorkspacePage,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Durable store of workspace records. Single source of truth for phase;
/// all phase mutations go through [`WorkspaceRegistry::update_phase`].
#[derive(Clone)]
pub struct WorkspaceRegistry {
    pool: SqlitePool,
}

impl WorkspaceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new workspace record in the Creating phase.
    pub async fn create(&self, spec: CreateWorkspaceSpec) -> Result<Workspace> {
        if spec.owner.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "workspace owner must not be empty".to_string(),
            ));
        }

        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, owner, repo_url, template, phase, desired_phase, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&spec.name)
        .bind(&spec.owner)
        .bind(&spec.repo_url)
        .bind(&spec.template)
        .bind(LifecyclePhase::Creating)
        .bind(LifecyclePhase::Creating)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get(&id).await,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(OrchestratorError::AlreadyExists(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a single workspace by ID
    pub async fn get(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    /// List workspaces ordered by creation time descending, keyset-paginated.
    ///
    /// The page token encodes the last-seen `(created_at, id)` pair, so
    /// replaying a token returns the same page. Deleted workspaces are
    /// hidden unless explicitly filtered for.
    pub async fn list(
        &self,
        filters: WorkspaceFilters,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<WorkspacePage> {
        let cursor = page_token.map(PageToken::decode).transpose()?;

        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.owner.is_some() {
            query.push_str(" AND owner = ?");
        }
        match filters.phase {
            Some(_) => query.push_str(" AND phase = ?"),
            None => query.push_str(" AND phase != 'deleted'"),
        }
        if cursor.is_some() {
            query.push_str(" AND (created_at < ? OR (created_at = ? AND id < ?))");
        }

        query.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(owner) = &filters.owner {
            q = q.bind(owner);
        }
        if let Some(phase) = &filters.phase {
            q = q.bind(phase);
        }
        if let Some(cursor) = &cursor {
            q = q
                .bind(cursor.created_at_millis)
                .bind(cursor.created_at_millis)
                .bind(&cursor.id);
        }

        // Fetch one extra row to learn whether another page exists.
        let rows = q.bind(page_size as i64 + 1).fetch_all(&self.pool).await?;

        let mut items: Vec<Workspace> = rows.into_iter().map(|row| row.into()).collect();
        let next_page_token = if items.len() > page_size as usize {
            items.truncate(page_size as usize);
            items.last().map(|last| {
                PageToken {
                    created_at_millis: last.created_at.timestamp_millis(),
                    id: last.id.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(WorkspacePage {
            items,
            next_page_token,
        })
    }

    /// Compare-and-swap phase update.
    ///
    /// Succeeds only if the stored phase still equals `expected`; otherwise
    /// nothing is mutated and the caller gets Conflict (or NotFound if the
    /// record is gone). Edges outside the lifecycle state machine are
    /// rejected with InvalidState before touching the store.
    ///
    /// `backend_ref` replaces the stored reference when `Some`; `message`
    /// always replaces the stored error message, so a successful transition
    /// clears stale failures.
    pub async fn update_phase(
        &self,
        id: &str,
        expected: LifecyclePhase,
        new: LifecyclePhase,
        message: Option<&str>,
        backend_ref: Option<&str>,
    ) -> Result<Workspace> {
        if !expected.can_transition_to(new) {
            return Err(OrchestratorError::InvalidState(format!(
                "workspace {}: no transition {} -> {}",
                id, expected, new
            )));
        }

        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE workspaces
             SET phase = ?, updated_at = ?, error_message = ?,
                 backend_ref = COALESCE(?, backend_ref)
             WHERE id = ? AND phase = ?",
        )
        .bind(new)
        .bind(now.timestamp_millis())
        .bind(message)
        .bind(backend_ref)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing record.
            let current = self.get(id).await?;
            return Err(OrchestratorError::Conflict(format!(
                "workspace {}: expected phase {}, found {}",
                id, expected, current.phase
            )));
        }

        self.get(id).await
    }

    /// Record what the latest user request asked for.
    pub async fn set_desired_phase(&self, id: &str, desired: LifecyclePhase) -> Result<()> {
        let result = sqlx::query("UPDATE workspaces SET desired_phase = ? WHERE id = ?")
            .bind(desired)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Get all workspaces with a specific phase
    pub async fn workspaces_in_phase(&self, phase: LifecyclePhase) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE phase = ?")
            .bind(phase)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Workspaces sitting in `phase` whose last transition is older than
    /// `older_than`. Used by the watchdog to time out Starting/Stopping.
    pub async fn stale_transitions(
        &self,
        phase: LifecyclePhase,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces WHERE phase = ? AND updated_at < ?",
        )
        .bind(phase)
        .bind(older_than.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Exposed ports for a workspace, ascending by port number.
    pub async fn get_ports(&self, workspace_id: &str) -> Result<Vec<ExposedPort>> {
        let rows = sqlx::query_as::<_, PortRow>(
            "SELECT * FROM workspace_ports WHERE workspace_id = ? ORDER BY port ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Idempotent port upsert. Returns whether anything changed; re-issuing
    /// the same visibility is a no-op success.
    pub async fn upsert_port(
        &self,
        workspace_id: &str,
        port: u16,
        visibility: PortVisibility,
    ) -> Result<bool> {
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO workspace_ports (workspace_id, port, visibility, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(workspace_id, port) DO UPDATE
             SET visibility = excluded.visibility, updated_at = excluded.updated_at
             WHERE workspace_ports.visibility != excluded.visibility",
        )
        .bind(workspace_id)
        .bind(port as i64)
        .bind(visibility)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record an operation for tracking
    pub async fn record_operation(
        &self,
        workspace_id: &str,
        operation_type: OperationType,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO operations (id, workspace_id, operation_type, status, started_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(operation_type)
        .bind(OperationStatus::Pending)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Move an operation to a new status; terminal statuses stamp
    /// `completed_at`.
    pub async fn update_operation(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let completed_at = matches!(
            status,
            OperationStatus::Succeeded | OperationStatus::Failed
        )
        .then(|| Utc::now().timestamp_millis());

        sqlx::query("UPDATE operations SET status = ?, completed_at = ?, error = ? WHERE id = ?")
            .bind(status)
            .bind(completed_at)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get a single operation by ID
    pub async fn get_operation(&self, id: &str) -> Result<Operation> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    /// Get all operations with optional filters
    pub async fn list_operations(
        &self,
        workspace_id: Option<String>,
        operation_type: Option<OperationType>,
        status: Option<OperationStatus>,
    ) -> Result<Vec<Operation>> {
        let mut query = "SELECT * FROM operations WHERE 1=1".to_string();

        if workspace_id.is_some() {
            query.push_str(" AND workspace_id = ?");
        }
        if operation_type.is_some() {
            query.push_str(" AND operation_type = ?");
        }
        if status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY started_at DESC");

        let mut q = sqlx::query_as::<_, OperationRow>(&query);

        if let Some(wid) = &workspace_id {
            q = q.bind(wid);
        }
        if let Some(ot) = &operation_type {
            q = q.bind(ot);
        }
        if let Some(s) = &status {
            q = q.bind(s);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }
}

/// Keyset cursor baked into an opaque page token.
struct PageToken {
    created_at_millis: i64,
    id: String,
}

impl PageToken {
    fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.created_at_millis, self.id))
    }

    fn decode(token: &str) -> Result<Self> {
        let invalid = || OrchestratorError::InvalidInput(format!("invalid page token: {}", token));

        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (millis, id) = raw.split_once(':').ok_or_else(invalid)?;

        Ok(Self {
            created_at_millis: millis.parse().map_err(|_| invalid())?,
            id: id.to_string(),
        })
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    name: Option<String>,
    owner: String,
    repo_url: Option<String>,
    template: Option<String>,
    phase: LifecyclePhase,
    desired_phase: LifecyclePhase,
    created_at: i64,
    updated_at: i64,
    backend_ref: Option<String>,
    error_message: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PortRow {
    #[allow(dead_code)]
    workspace_id: String,
    port: i64,
    visibility: PortVisibility,
    #[allow(dead_code)]
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    workspace_id: String,
    operation_type: OperationType,
    status: OperationStatus,
    started_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            owner: row.owner,
            repo_url: row.repo_url,
            template: row.template,
            phase: row.phase,
            desired_phase: row.desired_phase,
            created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(row.updated_at).unwrap_or_default(),
            backend_ref: row.backend_ref,
            error_message: row.error_message,
        }
    }
}

impl From<PortRow> for ExposedPort {
    fn from(row: PortRow) -> Self {
        Self {
            port: row.port as u16,
            visibility: row.visibility,
        }
    }
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            operation_type: row.operation_type,
            status: row.status,
            started_at: DateTime::from_timestamp_millis(row.started_at).unwrap_or_default(),
            completed_at: row.completed_at.and_then(DateTime::from_timestamp_millis),
            error: row.error,
        }
    }
}

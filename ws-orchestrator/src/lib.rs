//! Workspace lifecycle management business logic
//!
//! This crate contains the core of the workspace service: the durable
//! registry, the lifecycle state machine, status streaming, owner tokens
//! and port management. It is consumed by the ws-api HTTP service but has
//! no HTTP types of its own.

pub mod backend;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod operation;
pub mod ports;
pub mod registry;
pub mod stream;
pub mod test_utils;
pub mod token;
pub mod workspace;

pub use backend::{BackendHealth, ComputeBackend, LocalBackend};
pub use error::{OrchestratorError, Result};
pub use lifecycle::{LifecycleConfig, LifecycleOrchestrator};
pub use operation::{Operation, OperationStatus, OperationType};
pub use ports::{PortManager, PortRange, PortUpdate};
pub use registry::WorkspaceRegistry;
pub use stream::{StatusHub, StatusStream};
pub use token::OwnerTokenIssuer;
pub use workspace::{
    CreateWorkspaceSpec, ExposedPort, LifecyclePhase, OwnerToken, PortVisibility, StatusEvent,
    Workspace, WorkspaceFilters, WorkspacePage,
};

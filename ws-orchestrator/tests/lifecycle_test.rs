//! Integration tests for the lifecycle orchestrator: phase transitions,
//! async finalization, status streaming, tokens and ports.

use std::sync::Arc;
use std::time::Duration;
use ws_orchestrator::test_utils::create_test_db;
use ws_orchestrator::{
    backend::Fault, CreateWorkspaceSpec, LifecycleConfig, LifecycleOrchestrator, LifecyclePhase,
    LocalBackend, OperationStatus, OperationType, OrchestratorError, OwnerTokenIssuer,
    PortManager, PortRange, PortVisibility, StatusHub, Workspace, WorkspaceRegistry,
};

fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        max_cas_retries: 3,
        backend_attempts: 3,
        backend_base_delay: Duration::from_millis(5),
        ready_poll_interval: Duration::from_millis(5),
        start_deadline: Duration::from_secs(5),
        stop_deadline: Duration::from_secs(5),
    }
}

async fn setup() -> (LifecycleOrchestrator, Arc<LocalBackend>) {
    let pool = create_test_db().await;
    let backend = Arc::new(LocalBackend::new());
    let orchestrator = LifecycleOrchestrator::new(
        WorkspaceRegistry::new(pool),
        StatusHub::default(),
        backend.clone(),
        fast_config(),
    );
    (orchestrator, backend)
}

fn spec(owner: &str) -> CreateWorkspaceSpec {
    CreateWorkspaceSpec {
        id: None,
        name: Some("dev-env".to_string()),
        owner: owner.to_string(),
        repo_url: None,
        template: None,
    }
}

/// Poll until the workspace reaches `phase` or two seconds pass.
async fn wait_for_phase(
    orchestrator: &LifecycleOrchestrator,
    id: &str,
    phase: LifecyclePhase,
) -> Workspace {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);

    loop {
        let workspace = orchestrator.get(id).await.expect("workspace disappeared");
        if workspace.phase == phase {
            return workspace;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "workspace {} never reached {}, stuck in {}",
                id, phase, workspace.phase
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn create_and_start_reaches_running() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create_and_start(spec("alice")).await.unwrap();
    assert_eq!(workspace.phase, LifecyclePhase::Starting);
    assert_eq!(workspace.desired_phase, LifecyclePhase::Running);

    let running = wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;
    assert!(running.backend_ref.is_some());
    assert!(running.error_message.is_none());
}

#[tokio::test]
async fn subscriber_sees_starting_then_running() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create(spec("alice")).await.unwrap();
    let mut stream = orchestrator.watch(&workspace.id).await.unwrap();

    orchestrator.start(&workspace.id).await.unwrap();

    let first = stream.recv().await.unwrap().expect("stream ended early");
    assert_eq!(first.phase, LifecyclePhase::Starting);

    // The event is published only after the registry committed the phase.
    let at_event = orchestrator.get(&workspace.id).await.unwrap();
    assert_ne!(at_event.phase, LifecyclePhase::Creating);

    let second = stream.recv().await.unwrap().expect("stream ended early");
    assert_eq!(second.phase, LifecyclePhase::Running);
    assert!(first.timestamp <= second.timestamp);
}

#[tokio::test]
async fn concurrent_stops_are_idempotent() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create_and_start(spec("alice")).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;

    // Exactly one CAS wins Running -> Stopping; the loser observes the
    // target phase already reached and reports success too.
    let (a, b) = tokio::join!(
        orchestrator.stop(&workspace.id),
        orchestrator.stop(&workspace.id)
    );
    assert!(a.is_ok(), "first stop failed: {:?}", a.err());
    assert!(b.is_ok(), "second stop failed: {:?}", b.err());

    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Stopped).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Only the CAS winner records an operation and runs a finalizer.
    let operations = orchestrator
        .registry()
        .list_operations(Some(workspace.id.clone()), Some(OperationType::Stop), None)
        .await
        .unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].status, OperationStatus::Succeeded);
}

#[tokio::test]
async fn concurrent_starts_record_one_operation() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create(spec("alice")).await.unwrap();

    // Exactly one caller wins Creating -> Starting; the loser must not
    // provision a second backend instance or log another operation.
    let (a, b) = tokio::join!(
        orchestrator.start(&workspace.id),
        orchestrator.start(&workspace.id)
    );
    assert!(a.is_ok(), "first start failed: {:?}", a.err());
    assert!(b.is_ok(), "second start failed: {:?}", b.err());

    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let operations = orchestrator
        .registry()
        .list_operations(Some(workspace.id.clone()), Some(OperationType::Start), None)
        .await
        .unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].status, OperationStatus::Succeeded);
}

#[tokio::test]
async fn stop_requires_running_phase() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create(spec("alice")).await.unwrap();

    assert!(matches!(
        orchestrator.stop(&workspace.id).await,
        Err(OrchestratorError::InvalidState(_))
    ));
}

#[tokio::test]
async fn delete_requires_stopped_phase() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create_and_start(spec("alice")).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;

    assert!(matches!(
        orchestrator.delete(&workspace.id).await,
        Err(OrchestratorError::InvalidState(_))
    ));
}

#[tokio::test]
async fn full_lifecycle_ends_deleted_and_stream_terminates() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create_and_start(spec("alice")).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;

    let mut stream = orchestrator.watch(&workspace.id).await.unwrap();

    orchestrator.stop(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Stopped).await;
    orchestrator.delete(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Deleted).await;

    let mut phases = Vec::new();
    while let Some(event) = stream.recv().await.unwrap() {
        phases.push(event.phase);
    }
    assert_eq!(
        phases,
        vec![
            LifecyclePhase::Stopping,
            LifecyclePhase::Stopped,
            LifecyclePhase::Deleting,
            LifecyclePhase::Deleted,
        ]
    );

    // Subscribing to a deleted workspace yields an already-ended stream.
    let mut after = orchestrator.watch(&workspace.id).await.unwrap();
    assert!(after.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn watch_during_terminal_transition_still_terminates() {
    let (orchestrator, backend) = setup().await;
    backend.inject_provision_fault(Fault::Fatal("boot loop".to_string()));

    let workspace = orchestrator.create(spec("alice")).await.unwrap();
    orchestrator.start(&workspace.id).await.unwrap();

    // Subscribe while the failing finalizer races us to the terminal
    // phase; whichever side wins, the stream must end.
    let mut stream = orchestrator.watch(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Failed).await;

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while stream.recv().await.unwrap_or(None).is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "stream never terminated");
}

#[tokio::test]
async fn events_follow_commit_order_across_start_and_stop() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create(spec("alice")).await.unwrap();
    let mut stream = orchestrator.watch(&workspace.id).await.unwrap();

    orchestrator.start(&workspace.id).await.unwrap();
    // Stop the moment the store shows Running, racing the Running publish.
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;
    orchestrator.stop(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Stopped).await;

    let mut phases = Vec::new();
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(2), stream.recv()).await {
            Ok(Ok(Some(event))) => phases.push(event.phase),
            _ => break,
        }
    }
    assert_eq!(
        phases,
        vec![
            LifecyclePhase::Starting,
            LifecyclePhase::Running,
            LifecyclePhase::Stopping,
            LifecyclePhase::Stopped,
        ]
    );
}

#[tokio::test]
async fn transient_provisioning_fault_is_retried() {
    let (orchestrator, backend) = setup().await;
    backend.inject_provision_fault(Fault::Transient("scheduler hiccup".to_string()));

    let workspace = orchestrator.create_and_start(spec("alice")).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;
}

#[tokio::test]
async fn fatal_provisioning_fault_records_failure() {
    let (orchestrator, backend) = setup().await;
    backend.inject_provision_fault(Fault::Fatal("image pull failed".to_string()));

    let workspace = orchestrator.create(spec("alice")).await.unwrap();
    let mut stream = orchestrator.watch(&workspace.id).await.unwrap();
    orchestrator.start(&workspace.id).await.unwrap();

    let failed = wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Failed).await;
    let message = failed.error_message.expect("failure must be recorded");
    assert!(message.contains("image pull failed"));

    // Starting, then the Failed event carrying the message.
    let first = stream.recv().await.unwrap().unwrap();
    assert_eq!(first.phase, LifecyclePhase::Starting);
    let second = stream.recv().await.unwrap().unwrap();
    assert_eq!(second.phase, LifecyclePhase::Failed);
    assert!(second.message.unwrap().contains("image pull failed"));

    // Terminal phase closed the stream.
    assert!(stream.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn watchdog_fails_stale_starting_workspaces() {
    let pool = create_test_db().await;
    let registry = WorkspaceRegistry::new(pool);
    let mut config = fast_config();
    config.start_deadline = Duration::from_millis(1);

    let orchestrator = LifecycleOrchestrator::new(
        registry.clone(),
        StatusHub::default(),
        Arc::new(LocalBackend::new()),
        config,
    );

    // Wedge a workspace in Starting without a finalizer task.
    let workspace = registry.create(spec("alice")).await.unwrap();
    registry
        .update_phase(
            &workspace.id,
            LifecyclePhase::Creating,
            LifecyclePhase::Starting,
            None,
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    let failed = orchestrator.fail_stale().await.unwrap();
    assert_eq!(failed, 1);

    let workspace = registry.get(&workspace.id).await.unwrap();
    assert_eq!(workspace.phase, LifecyclePhase::Failed);
    assert!(workspace
        .error_message
        .unwrap()
        .contains("deadline exceeded"));
}

#[tokio::test]
async fn operations_are_recorded_for_the_whole_lifecycle() {
    let (orchestrator, _) = setup().await;

    let workspace = orchestrator.create_and_start(spec("alice")).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;
    orchestrator.stop(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Stopped).await;

    // Finalizers mark their operation after the phase lands; give the
    // bookkeeping a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let operations = orchestrator
        .registry()
        .list_operations(Some(workspace.id.clone()), None, None)
        .await
        .unwrap();

    let mut types: Vec<_> = operations.iter().map(|op| op.operation_type).collect();
    types.sort_by_key(|t| format!("{:?}", t));
    assert_eq!(
        types,
        vec![
            OperationType::Create,
            OperationType::Start,
            OperationType::Stop
        ]
    );
    assert!(operations
        .iter()
        .all(|op| op.status == OperationStatus::Succeeded));
}

#[tokio::test]
async fn owner_token_checks_ownership_and_phase() {
    let (orchestrator, _) = setup().await;
    let issuer = OwnerTokenIssuer::new(orchestrator.registry().clone(), Duration::from_secs(600));

    let workspace = orchestrator.create(spec("alice")).await.unwrap();

    let token = issuer.issue(&workspace.id, "alice").await.unwrap();
    assert_eq!(token.workspace_id, workspace.id);
    assert!(token.expires_at > chrono::Utc::now());

    assert!(matches!(
        issuer.issue(&workspace.id, "mallory").await,
        Err(OrchestratorError::PermissionDenied(_))
    ));

    // Walk the workspace to Deleted and check the phase gate.
    orchestrator.start(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;
    orchestrator.stop(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Stopped).await;
    orchestrator.delete(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Deleted).await;

    assert!(matches!(
        issuer.issue(&workspace.id, "alice").await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn port_updates_require_running_phase() {
    let (orchestrator, _) = setup().await;
    let ports = PortManager::new(
        orchestrator.registry().clone(),
        PortRange::new(1024, 65535).unwrap(),
    );

    let workspace = orchestrator.create(spec("alice")).await.unwrap();

    // Not running yet: rejected.
    assert!(matches!(
        ports
            .update_port(&workspace.id, 8080, PortVisibility::Public)
            .await,
        Err(OrchestratorError::InvalidState(_))
    ));

    orchestrator.start(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;

    let ack = ports
        .update_port(&workspace.id, 8080, PortVisibility::Public)
        .await
        .unwrap();
    assert!(ack.changed);

    // Same visibility again is a no-op success.
    let ack = ports
        .update_port(&workspace.id, 8080, PortVisibility::Public)
        .await
        .unwrap();
    assert!(!ack.changed);

    // Out-of-range port is rejected outright.
    assert!(matches!(
        ports
            .update_port(&workspace.id, 80, PortVisibility::Public)
            .await,
        Err(OrchestratorError::InvalidInput(_))
    ));

    // Stopped rejects too; back in Running the same call succeeds.
    orchestrator.stop(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Stopped).await;
    assert!(matches!(
        ports
            .update_port(&workspace.id, 9090, PortVisibility::Private)
            .await,
        Err(OrchestratorError::InvalidState(_))
    ));

    orchestrator.start(&workspace.id).await.unwrap();
    wait_for_phase(&orchestrator, &workspace.id, LifecyclePhase::Running).await;
    let ack = ports
        .update_port(&workspace.id, 9090, PortVisibility::Private)
        .await
        .unwrap();
    assert!(ack.changed);
}

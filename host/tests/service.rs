//! Tests for the submission service: validation, the safety gate, and the
//! hand-off to the orchestrator.

use std::{sync::Arc, time::Duration};

use oscar_engine::{EventBroadcaster, Orchestrator, OrchestratorConfig};
use oscar_host::{
    error::HostError,
    service::{CreateConnectionRequest, ExecutionRequest, ExecutionService},
};
use oscar_lib::{DdlType, Environment, ExecutionStatus, RiskClassifier, RiskLevel};
use oscar_sandbox::{MockDriver, MockScript};
use oscar_store::{CredentialVault, InMemoryStore, ListFilter, Page, RecordStore};

struct Harness {
    store: Arc<InMemoryStore>,
    service: ExecutionService,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let vault = Arc::new(CredentialVault::new("host-tests"));
    let driver = Arc::new(MockDriver::new(MockScript::default()));
    let broadcaster = Arc::new(EventBroadcaster::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        store.clone(),
        vault.clone(),
        driver,
        broadcaster,
        OrchestratorConfig::default(),
    );
    orchestrator.serve().await;

    let service = ExecutionService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        vault,
        orchestrator,
        RiskClassifier::new(vec!["payments".to_string()]),
    );
    Harness { store, service }
}

async fn seed_connection(h: &Harness, environment: Environment) -> String {
    let request = CreateConnectionRequest {
        name: format!("{environment:?} db"),
        environment,
        host: "db.example".to_string(),
        port: 3306,
        username: "root".to_string(),
        password: "p@ss".to_string(),
        database_name: "app".to_string(),
        connect_timeout: None,
        charset: None,
        use_ssl: None,
    };
    h.service
        .create_connection(&request, "alice")
        .await
        .unwrap()
        .id
}

fn fragment_request(connection_id: &str) -> ExecutionRequest {
    ExecutionRequest {
        connection_id: connection_id.to_string(),
        database_name: "app".to_string(),
        table_name: "orders".to_string(),
        ddl_type: DdlType::Fragment,
        original_ddl: None,
        execution_params: None,
        ticket_id: None,
        table_rows: Some(1000),
    }
}

async fn record_count(store: &InMemoryStore) -> u64 {
    let (_, total) = RecordStore::list(store, &ListFilter::default(), Page::default())
        .await
        .unwrap();
    total
}

#[tokio::test]
async fn preview_masks_the_password_and_reports_risk() {
    let h = harness().await;
    let connection_id = seed_connection(&h, Environment::Dev).await;

    let mut request = fragment_request(&connection_id);
    request.table_rows = Some(500_000);
    let preview = h.service.preview(&request, "alice").await.unwrap();

    assert_eq!(preview.command.matches("--password=***").count(), 1);
    assert_eq!(preview.command.matches("--alter=\"ENGINE=INNODB\"").count(), 1);
    assert_eq!(preview.command.matches("D=app,t=orders").count(), 1);
    assert!(!preview.command.contains("p@ss"));
    assert_eq!(preview.recommended_chunk_size, 2000);
    assert_eq!(preview.risk.level, RiskLevel::Low);
    assert!(preview.risk.is_safe);

    // Previews never create records.
    assert_eq!(record_count(&h.store).await, 0);
}

#[tokio::test]
async fn forbidden_ddl_is_rejected_without_a_record() {
    let h = harness().await;
    let connection_id = seed_connection(&h, Environment::Dev).await;

    let mut request = fragment_request(&connection_id);
    request.ddl_type = DdlType::Other;
    request.original_ddl = Some("ALTER TABLE x DROP TABLE x".to_string());

    let err = h.service.submit(&request, "alice").await.unwrap_err();
    match err {
        HostError::Validation(message) => assert_eq!(message, "DROP TABLE not allowed"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(record_count(&h.store).await, 0);
}

#[tokio::test]
async fn missing_custom_ddl_is_rejected() {
    let h = harness().await;
    let connection_id = seed_connection(&h, Environment::Dev).await;

    let mut request = fragment_request(&connection_id);
    request.ddl_type = DdlType::AddColumn;
    request.original_ddl = None;

    assert!(matches!(
        h.service.submit(&request, "alice").await.unwrap_err(),
        HostError::Validation(_)
    ));
}

#[tokio::test]
async fn production_changes_without_a_ticket_are_blocked() {
    let h = harness().await;
    let connection_id = seed_connection(&h, Environment::Prod).await;

    let err = h
        .service
        .submit(&fragment_request(&connection_id), "alice")
        .await
        .unwrap_err();
    match err {
        HostError::Blocked(reason) => assert!(reason.contains("ticket")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(record_count(&h.store).await, 0);
}

#[tokio::test]
async fn production_changes_with_a_ticket_run() {
    let h = harness().await;
    let connection_id = seed_connection(&h, Environment::Prod).await;

    let mut request = fragment_request(&connection_id);
    request.ticket_id = Some("CHG-1234".to_string());
    let record = h.service.submit(&request, "alice").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Pending);
    assert_eq!(record.created_by, "alice");
}

#[tokio::test]
async fn submitted_executions_run_to_completion() {
    let h = harness().await;
    let connection_id = seed_connection(&h, Environment::Dev).await;

    let record = h
        .service
        .submit(&fragment_request(&connection_id), "alice")
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = RecordStore::get(h.store.as_ref(), &record.id).await.unwrap();
        if stored.status == ExecutionStatus::Completed {
            assert_eq!(stored.processed_rows, 1000);
            assert!(stored.execution_logs.is_some());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution never completed, status: {}",
            stored.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let logs = h.service.logs(&record.id).await.unwrap().unwrap();
    assert!(logs.contains("Successfully altered"));
    assert!(!logs.contains("p@ss"));
}

#[tokio::test]
async fn unknown_connections_are_not_found() {
    let h = harness().await;
    let err = h
        .service
        .submit(&fragment_request("missing"), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NotFound(_)));
}

use mockito::{Matcher, Server, ServerGuard};
use std::sync::Arc;

use ticketportal::core::config::{AppConfig, RemoteConfig};
use ticketportal::core::shared::state::AppState;
use ticketportal::email::{EmailQueue, RecordingMailer};
use ticketportal::notifications::NotificationKind;
use ticketportal::tickets::memory_store::MemoryStore;
use ticketportal::tickets::remote::HttpRemoteClient;
use ticketportal::tickets::{TicketStatus, TicketStore};

const PATH: &str = "/maximo/api/os/mxapisr";

async fn remote_serving(records: serde_json::Value) -> ServerGuard {
    let mut server = Server::new_async().await;
    server
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "member": records }).to_string())
        .create_async()
        .await;
    server
}

fn portal(store: &Arc<MemoryStore>, mailer: &Arc<RecordingMailer>, server: &ServerGuard) -> AppState {
    let mut config = AppConfig::default();
    config.server.base_url = "https://portal.example".to_string();
    config.remote = RemoteConfig {
        api_url: format!("{}{PATH}", server.url()),
        api_key: "test-key".to_string(),
        backoff_base_ms: 1,
        ..RemoteConfig::default()
    };
    let remote = HttpRemoteClient::new(&config.remote).unwrap();
    AppState::new(
        config,
        store.clone(),
        Arc::new(remote),
        mailer.clone(),
        Arc::new(EmailQueue::inline(mailer.clone())),
    )
}

#[tokio::test]
async fn test_new_ticket_is_linked_and_follows_remote_status() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let owner = store.add_user("ana", "ana@example.com", false, &[]);
    let ticket = store.seed_ticket(owner.id, "Printer jam", None, TicketStatus::New);

    let server = remote_serving(serde_json::json!([
        {"ticketid": "100", "status": "INPROG", "description": "Printer jam"}
    ]))
    .await;
    let state = portal(&store, &mailer, &server);

    let report = state.reconciliation_job().run().await;
    assert!(!report.aborted());
    assert_eq!(report.fetched, 1);
    assert_eq!(report.newly_linked, 1);
    assert_eq!(report.status_changed, 1);

    let stored = store.ticket(ticket.id).unwrap().unwrap();
    assert_eq!(stored.external_id.as_deref(), Some("100"));
    assert_eq!(stored.status, TicketStatus::InProgress);
    assert_eq!(store.all_notifications().len(), 1);
    assert_eq!(mailer.sent().len(), 1);

    // Same remote data again: nothing is rewritten or announced.
    let writes = store.ticket_writes();
    let again = state.reconciliation_job().run().await;
    assert_eq!(again.newly_linked, 0);
    assert_eq!(again.status_changed, 0);
    assert_eq!(store.ticket_writes(), writes);
    assert_eq!(store.all_notifications().len(), 1);
    assert_eq!(mailer.sent().len(), 1);

    let resolved = remote_serving(serde_json::json!([
        {"ticketid": "100", "status": "RESOLVED", "description": "Printer jam"}
    ]))
    .await;
    let report = portal(&store, &mailer, &resolved).reconciliation_job().run().await;
    assert_eq!(report.status_changed, 1);
    assert_eq!(report.newly_linked, 0);

    let notifications = store.all_notifications();
    assert_eq!(notifications.len(), 2);
    let latest = notifications.iter().max_by_key(|n| n.id).unwrap();
    assert_eq!(latest.kind, NotificationKind::Status);
    assert_eq!(latest.recipient_id, owner.id);
    assert_eq!(latest.link, format!("https://portal.example/tickets/{}", ticket.id));

    let sent = mailer.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].to, vec!["ana@example.com".to_string()]);
    assert!(sent[1].subject.contains("Resolved"));
}

#[tokio::test]
async fn test_one_remote_record_links_every_matching_ticket() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let owner = store.add_user("ana", "ana@example.com", false, &[]);
    let first = store.seed_ticket(owner.id, "Printer jam", None, TicketStatus::New);
    let second = store.seed_ticket(owner.id, "  printer JAM ", None, TicketStatus::New);
    let unrelated = store.seed_ticket(owner.id, "VPN down", None, TicketStatus::New);

    let server = remote_serving(serde_json::json!([
        {"ticketid": "100", "status": "QUEUED", "description": "Printer jam"}
    ]))
    .await;
    let report = portal(&store, &mailer, &server).reconciliation_job().run().await;
    assert_eq!(report.newly_linked, 2);

    for id in [first.id, second.id] {
        let ticket = store.ticket(id).unwrap().unwrap();
        assert_eq!(ticket.external_id.as_deref(), Some("100"));
        assert_eq!(ticket.status, TicketStatus::Queued);
    }
    assert!(!store.ticket(unrelated.id).unwrap().unwrap().is_linked());
}

#[tokio::test]
async fn test_partial_match_needs_more_than_five_characters() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let owner = store.add_user("ana", "ana@example.com", false, &[]);
    let five = store.seed_ticket(owner.id, "Print", None, TicketStatus::New);
    let six = store.seed_ticket(owner.id, "Printe", None, TicketStatus::New);

    let server = remote_serving(serde_json::json!([
        {"ticketid": "100", "status": "NEW", "description": "Printer jam on floor 2"}
    ]))
    .await;
    let report = portal(&store, &mailer, &server).reconciliation_job().run().await;
    assert_eq!(report.newly_linked, 1);
    assert!(!store.ticket(five.id).unwrap().unwrap().is_linked());
    assert_eq!(
        store.ticket(six.id).unwrap().unwrap().external_id.as_deref(),
        Some("100")
    );
}

#[tokio::test]
async fn test_unknown_remote_status_never_overwrites_linked_ticket() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let owner = store.add_user("ana", "ana@example.com", false, &[]);
    let ticket = store.seed_ticket(owner.id, "Printer jam", Some("100"), TicketStatus::InProgress);

    let server = remote_serving(serde_json::json!([
        {"ticketid": "100", "status": "WAPPR", "description": "Printer jam"}
    ]))
    .await;
    let report = portal(&store, &mailer, &server).reconciliation_job().run().await;
    assert!(!report.aborted());
    assert_eq!(report.matched, 1);
    assert_eq!(report.unrecognized_statuses, 1);
    assert_eq!(report.newly_linked, 0);
    assert_eq!(report.status_changed, 0);

    let stored = store.ticket(ticket.id).unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::InProgress);
    assert_eq!(stored.external_id.as_deref(), Some("100"));
    assert_eq!(store.ticket_writes(), 0);
    assert!(store.all_notifications().is_empty());
    assert!(mailer.sent().is_empty());
}

#[tokio::test]
async fn test_terminal_tickets_are_left_alone() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let owner = store.add_user("ana", "ana@example.com", false, &[]);
    let closed = store.seed_ticket(owner.id, "Printer jam", Some("100"), TicketStatus::Closed);
    let cancelled = store.seed_ticket(owner.id, "VPN down", None, TicketStatus::Cancelled);

    let server = remote_serving(serde_json::json!([
        {"ticketid": "100", "status": "INPROG", "description": "Printer jam"},
        {"ticketid": "200", "status": "INPROG", "description": "VPN down"}
    ]))
    .await;
    let report = portal(&store, &mailer, &server).reconciliation_job().run().await;
    assert_eq!(report.matched, 0);
    assert_eq!(store.ticket_writes(), 0);
    assert_eq!(
        store.ticket(closed.id).unwrap().unwrap().status,
        TicketStatus::Closed
    );
    assert!(!store.ticket(cancelled.id).unwrap().unwrap().is_linked());
    assert!(store.all_notifications().is_empty());
}

#[tokio::test]
async fn test_unreachable_remote_aborts_without_writes() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let owner = store.add_user("ana", "ana@example.com", false, &[]);
    store.seed_ticket(owner.id, "Printer jam", None, TicketStatus::New);

    let mut server = Server::new_async().await;
    let failing = server
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(4)
        .create_async()
        .await;

    let report = portal(&store, &mailer, &server).reconciliation_job().run().await;
    failing.assert_async().await;
    assert!(report.aborted());
    assert_eq!(store.ticket_writes(), 0);
    assert!(!store.is_job_locked("remote_reconciliation"));
}

#[tokio::test]
async fn test_rejected_or_malformed_fetch_aborts_without_writes() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let owner = store.add_user("ana", "ana@example.com", false, &[]);
    store.seed_ticket(owner.id, "Printer jam", None, TicketStatus::New);

    let mut rejecting = Server::new_async().await;
    let forbidden = rejecting
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(403)
        .expect(1)
        .create_async()
        .await;
    let report = portal(&store, &mailer, &rejecting).reconciliation_job().run().await;
    forbidden.assert_async().await;
    assert!(report.aborted());

    let mut garbled = Server::new_async().await;
    garbled
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("not json")
        .create_async()
        .await;
    let report = portal(&store, &mailer, &garbled).reconciliation_job().run().await;
    assert!(report.aborted());

    assert_eq!(store.ticket_writes(), 0);
    assert!(!store.is_job_locked("remote_reconciliation"));
}

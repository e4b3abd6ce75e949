use std::sync::Arc;

use pretty_assertions::assert_eq;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wgfeed_sync::store::memory::{MemoryRuntime, MemoryStore};
use wgfeed_sync::{
    ApplyService, PollingSyncer, Reconciler, Subscription, SubscriptionStore, SyncMode,
    SyncOutcome,
};
use wgfeed_types::PROTOCOL_VERSION;

const FEED_ID: &str = "0b3f9a7e-4c2d-4e8f-9a1b-2c3d4e5f6a7b";

fn success_envelope_body(revision: &str) -> String {
    serde_json::to_string(&serde_json::json!({
        "version": PROTOCOL_VERSION,
        "success": true,
        "revision": revision,
        "ttl_seconds": 600,
        "supports_sse": false,
        "encrypted": false,
        "data": {
            "id": FEED_ID,
            "endpoints": ["https://a.example/f"],
            "display_info": {"title": "My Feed"},
            "tunnels": [
                {
                    "id": "t1",
                    "name": "office",
                    "display_info": {"title": "Office"},
                    "wg_quick_config": "[Interface]\nPrivateKey = abc\n"
                }
            ]
        }
    }))
    .unwrap()
}

fn error_envelope_body(message: &str, retriable: bool) -> String {
    serde_json::to_string(&serde_json::json!({
        "version": PROTOCOL_VERSION,
        "success": false,
        "message": message,
        "retriable": retriable,
    }))
    .unwrap()
}

fn encrypted_envelope_body() -> String {
    serde_json::to_string(&serde_json::json!({
        "version": PROTOCOL_VERSION,
        "success": true,
        "revision": "r1",
        "ttl_seconds": 600,
        "encrypted": true,
        "encrypted_data": "-----BEGIN AGE ENCRYPTED FILE-----\nabc\n-----END AGE ENCRYPTED FILE-----",
    }))
    .unwrap()
}

fn new_subscription(endpoints: &[String]) -> Subscription {
    Subscription {
        id: 0,
        feed_id: String::new(),
        endpoints_json: serde_json::to_string(endpoints).unwrap(),
        age_secret_key: None,
        ignore_server_state: false,
        sync_mode: SyncMode::Polling,
        last_checked_at_ms: 0,
        last_synced_at_ms: 0,
        last_known_revision: None,
        ttl_seconds: 300,
        supports_sse: false,
        display_title: String::new(),
        display_description: None,
        display_icon_url: None,
        warning_message: None,
        last_error: None,
        is_sync_terminal: false,
    }
}

fn wire() -> (Arc<MemoryStore>, Arc<ApplyService>, PollingSyncer) {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(MemoryRuntime::new());
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        store.clone(),
        runtime.clone(),
    ));
    let apply = Arc::new(ApplyService::new(store.clone(), reconciler));
    let syncer = PollingSyncer::new(reqwest::Client::new(), store.clone(), apply.clone())
        .with_insecure_endpoints();
    (store, apply, syncer)
}

// ── Early returns ───────────────────────────────────────────────

#[tokio::test]
async fn manual_mode_is_disabled_unless_explicit() {
    let (store, _apply, syncer) = wire();
    let mut sub = new_subscription(&[]);
    sub.sync_mode = SyncMode::Manual;
    let sub = store.insert(sub).await.unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    assert!(matches!(outcome, SyncOutcome::Disabled { .. }));
}

#[tokio::test]
async fn terminal_subscription_short_circuits() {
    let (store, _apply, syncer) = wire();
    let mut sub = new_subscription(&[]);
    sub.is_sync_terminal = true;
    sub.last_error = Some("Feed ID changed".to_string());
    let sub = store.insert(sub).await.unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    let SyncOutcome::Terminal { message, .. } = outcome else {
        panic!("expected Terminal");
    };
    assert_eq!(message, "Feed ID changed");
}

#[tokio::test]
async fn empty_endpoint_list_persists_error() {
    let (store, _apply, syncer) = wire();
    let sub = store.insert(new_subscription(&[])).await.unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    let SyncOutcome::Error { message, .. } = outcome else {
        panic!("expected Error");
    };
    assert_eq!(message, "No endpoints");

    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.last_error.as_deref(), Some("No endpoints"));
}

// ── 200 OK ──────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_applies_document_and_persists_revision() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("accept", "application/json"))
        .and(header("cache-control", "no-cache"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(success_envelope_body("r1")),
        )
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let sub = store
        .insert(new_subscription(&[format!("{}/feed", server.uri())]))
        .await
        .unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    let SyncOutcome::Success { changed, .. } = outcome else {
        panic!("expected Success");
    };
    assert!(changed);

    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.last_known_revision.as_deref(), Some("r1"));
    assert_eq!(stored.feed_id, FEED_ID);
    assert_eq!(stored.display_title, "My Feed");
    assert_eq!(stored.last_error, None);

    // Reconciliation created the declared tunnel.
    assert_eq!(store.tunnel_names(), vec!["office".to_string()]);
}

#[tokio::test]
async fn repeat_fetch_with_same_revision_does_not_reconcile_again() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(success_envelope_body("r1")),
        )
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let mut sub = new_subscription(&[format!("{}/feed", server.uri())]);
    sub.last_known_revision = Some("r1".to_string());
    let sub = store.insert(sub).await.unwrap();

    let outcome = syncer.sync_once(&sub, true).await;
    let SyncOutcome::Success { changed, .. } = outcome else {
        panic!("expected Success");
    };
    assert!(!changed);
}

// ── Conditional requests ────────────────────────────────────────

#[tokio::test]
async fn conditional_get_sends_quoted_if_none_match() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("if-none-match", "\"r1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let mut sub = new_subscription(&[format!("{}/feed", server.uri())]);
    sub.last_known_revision = Some("r1".to_string());
    sub.last_error = Some("previous failure".to_string());
    let sub = store.insert(sub).await.unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    let SyncOutcome::Success { changed, .. } = outcome else {
        panic!("expected Success");
    };
    assert!(!changed);

    // 304 clears the error and leaves the revision alone.
    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.last_known_revision.as_deref(), Some("r1"));
    assert_eq!(stored.last_error, None);
    assert!(stored.last_checked_at_ms > 0);
}

#[tokio::test]
async fn already_quoted_revision_is_not_double_quoted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("if-none-match", "\"r1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let mut sub = new_subscription(&[format!("{}/feed", server.uri())]);
    sub.last_known_revision = Some("\"r1\"".to_string());
    let sub = store.insert(sub).await.unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    assert!(matches!(outcome, SyncOutcome::Success { .. }));
}

#[tokio::test]
async fn explicit_sync_bypasses_conditional_caching() {
    let server = MockServer::start().await;
    // A conditional request would hit this mock and fail the attempt.
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header_exists("if-none-match"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(success_envelope_body("r2")),
        )
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let mut sub = new_subscription(&[format!("{}/feed", server.uri())]);
    sub.last_known_revision = Some("r1".to_string());
    let sub = store.insert(sub).await.unwrap();

    let outcome = syncer.sync_once(&sub, true).await;
    let SyncOutcome::Success { changed, .. } = outcome else {
        panic!("expected Success");
    };
    assert!(changed);
}

// ── Endpoint fallback ───────────────────────────────────────────

#[tokio::test]
async fn failed_endpoint_falls_back_and_is_demoted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let bad = format!("{}/bad", server.uri());
    let good = format!("{}/good", server.uri());

    let (store, _apply, syncer) = wire();
    let mut sub = new_subscription(&[bad.clone(), good.clone()]);
    sub.last_known_revision = Some("r1".to_string());
    let sub = store.insert(sub).await.unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    assert!(matches!(outcome, SyncOutcome::Success { .. }));

    // The endpoint that failed this attempt moved to the back.
    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.endpoint_list(), vec![good, bad]);
}

#[tokio::test]
async fn invalid_success_body_falls_back_to_next_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/garbage"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(success_envelope_body("r1")),
        )
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let sub = store
        .insert(new_subscription(&[
            format!("{}/garbage", server.uri()),
            format!("{}/good", server.uri()),
        ]))
        .await
        .unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    assert!(matches!(outcome, SyncOutcome::Success { changed: true, .. }));
}

#[tokio::test]
async fn all_endpoints_failing_persists_most_recent_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_string(error_envelope_body("feed overloaded", true)),
        )
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let sub = store
        .insert(new_subscription(&[format!("{}/feed", server.uri())]))
        .await
        .unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    let SyncOutcome::Error { message, .. } = outcome else {
        panic!("expected Error");
    };
    assert_eq!(message, "feed overloaded");

    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.last_error.as_deref(), Some("feed overloaded"));
    assert!(!stored.is_sync_terminal);
}

// ── Terminal rules ──────────────────────────────────────────────

#[tokio::test]
async fn only_non_retriable_errors_make_subscription_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(410).set_body_string(error_envelope_body("feed revoked", false)),
        )
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let sub = store
        .insert(new_subscription(&[format!("{}/feed", server.uri())]))
        .await
        .unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    let SyncOutcome::Terminal { message, .. } = outcome else {
        panic!("expected Terminal");
    };
    assert_eq!(message, "feed revoked");

    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert!(stored.is_sync_terminal);
}

#[tokio::test]
async fn non_retriable_mixed_with_transport_failure_stays_nonterminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/revoked"))
        .respond_with(
            ResponseTemplate::new(410).set_body_string(error_envelope_body("feed revoked", false)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let sub = store
        .insert(new_subscription(&[
            format!("{}/revoked", server.uri()),
            format!("{}/broken", server.uri()),
        ]))
        .await
        .unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    assert!(matches!(outcome, SyncOutcome::Error { .. }));

    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert!(!stored.is_sync_terminal);
}

#[tokio::test]
async fn missing_decryption_key_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(encrypted_envelope_body()))
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();
    let sub = store
        .insert(new_subscription(&[format!("{}/feed", server.uri())]))
        .await
        .unwrap();

    let outcome = syncer.sync_once(&sub, false).await;
    let SyncOutcome::Terminal { message, .. } = outcome else {
        panic!("expected Terminal");
    };
    assert_eq!(message, "Missing encryption key");

    let stored = store.get(sub.id).await.unwrap().unwrap();
    assert!(stored.is_sync_terminal);
    assert_eq!(stored.last_error.as_deref(), Some("Missing encryption key"));
}

// ── Preview ─────────────────────────────────────────────────────

#[tokio::test]
async fn preview_parses_without_touching_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(success_envelope_body("r7")),
        )
        .mount(&server)
        .await;

    let (store, _apply, syncer) = wire();

    let parsed = syncer.preview(&format!("{}/feed", server.uri())).await.unwrap();
    assert_eq!(parsed.revision, "r7");
    assert_eq!(parsed.document.id, FEED_ID);

    // Nothing was persisted.
    assert!(store.list_polling().await.unwrap().is_empty());
    assert!(store.tunnel_names().is_empty());
}

#[tokio::test]
async fn preview_surfaces_error_envelope_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(403).set_body_string(error_envelope_body("not authorized", false)),
        )
        .mount(&server)
        .await;

    let (_store, _apply, syncer) = wire();
    let err = syncer
        .preview(&format!("{}/feed", server.uri()))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "not authorized");
}

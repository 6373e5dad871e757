//! Privacy tests for credential material in logs.
//!
//! Plaintext API keys and the admin token must never appear in log output,
//! even at TRACE level. Only the SHA-256 digest of a key may be recorded.
//!
//! # Test Approach
//!
//! 1. Use a custom tracing subscriber Layer to capture all log messages
//! 2. Exercise key issuance, verification, WebSocket submission, and the
//!    admin endpoint
//! 3. Verify that the secrets do NOT appear in captured logs

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use mainframe_hub::auth::{CredentialService, Permissions, TokenType};
use mainframe_hub::config::Config;
use mainframe_hub::rate_limit::RateLimiter;
use mainframe_hub::roster::RosterStore;
use mainframe_hub::router::{EventRouter, Inbound};
use mainframe_hub::routes::{create_router, AppState, IssueKeyResponse};
use mainframe_hub::session::{ConnectRequest, SessionRegistry};
use mainframe_hub::store::MemoryStore;
use mainframe_hub::types::Envelope;

// ============================================================================
// Log Capture Infrastructure
// ============================================================================

/// A buffer for capturing log output during tests.
#[derive(Clone, Default)]
struct LogCapture {
    logs: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    fn get_logs(&self) -> String {
        self.logs.lock().unwrap().join("\n")
    }
}

/// A tracing Layer that captures log events for inspection.
struct CaptureLayer {
    capture: LogCapture,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);

        let message = format!(
            "[{}] {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.parts.join(" ")
        );

        self.capture.logs.lock().unwrap().push(message);
    }
}

/// A visitor that collects all event fields into a string.
#[derive(Default)]
struct StringVisitor {
    parts: Vec<String>,
}

impl tracing::field::Visit for StringVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.parts.push(format!("{}={:?}", field.name(), value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.parts.push(format!("{}={}", field.name(), value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.parts.push(format!("{}={}", field.name(), value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.parts.push(format!("{}={}", field.name(), value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.parts.push(format!("{}={}", field.name(), value));
    }
}

/// Runs an async test body with TRACE-level log capture.
///
/// Returns the body's output together with the captured logs.
async fn with_log_capture_async<F, Fut, T>(test_fn: F) -> (T, String)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let capture = LogCapture::default();
    let layer = CaptureLayer {
        capture: capture.clone(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(layer.with_filter(tracing_subscriber::filter::LevelFilter::TRACE));

    let _guard = tracing::subscriber::set_default(subscriber);
    let output = test_fn().await;

    (output, capture.get_logs())
}

/// Asserts that the given sensitive value does not appear in logs.
fn assert_sensitive_not_in_logs(logs: &str, value: &str, value_name: &str, context: &str) {
    assert!(
        !logs.contains(value),
        "{value_name} found in logs during {context}!\nValue: {value}\nLogs:\n{logs}"
    );
}

// ============================================================================
// Test Cases
// ============================================================================

#[tokio::test]
async fn api_key_not_logged_on_issue() {
    let (secret, logs) = with_log_capture_async(|| async {
        let service = CredentialService::new(Arc::new(MemoryStore::new()));
        service
            .issue(
                Permissions::read_write(),
                "ops@example.com",
                100,
                TokenType::BotClient,
            )
            .await
            .expect("should issue key")
    })
    .await;

    assert!(logs.contains("Issued API key"), "issuance should be logged");
    assert_sensitive_not_in_logs(&logs, secret.expose(), "API key", "issuance");
}

#[tokio::test]
async fn api_key_not_logged_on_verify() {
    let service = CredentialService::new(Arc::new(MemoryStore::new()));
    let secret = service
        .issue(Permissions::read_only(), "ops@example.com", 0, TokenType::Client)
        .await
        .unwrap();

    let unknown = "unknown-key-that-should-not-be-logged";
    let ((), logs) = with_log_capture_async(|| async {
        // Cache hit, then a miss that reaches the store.
        assert!(service.verify(secret.expose()).await.unwrap().is_some());
        assert!(service.verify(unknown).await.unwrap().is_none());
    })
    .await;

    assert_sensitive_not_in_logs(&logs, secret.expose(), "API key", "verification");
    assert_sensitive_not_in_logs(&logs, unknown, "Unknown key", "verification");
}

#[tokio::test]
async fn api_key_not_logged_when_submitted_over_websocket_action() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(SessionRegistry::new(16));
    let credentials = Arc::new(CredentialService::new(store.clone()));
    let router = EventRouter::new(
        registry.clone(),
        Arc::new(RosterStore::new()),
        credentials.clone(),
        store,
        RateLimiter::new(),
        "https://mc-heads.net/avatar/",
    );

    let secret = credentials
        .issue(Permissions::read_write(), "ops@example.com", 0, TokenType::BotClient)
        .await
        .unwrap();
    let bad_key = "bad-key-submitted-by-a-careless-bot";

    let rejected = registry.open(ConnectRequest::client(None)).unwrap();
    let accepted = registry.open(ConnectRequest::bot("survival")).unwrap();

    let ((), logs) = with_log_capture_async(|| async {
        router
            .process(Inbound::new(
                rejected.id.clone(),
                Envelope::new(rejected.id.as_str(), "x-api-key", json!(bad_key)),
            ))
            .await;
        router
            .process(Inbound::new(
                accepted.id.clone(),
                Envelope::new(accepted.id.as_str(), "x-api-key", json!(secret.expose())),
            ))
            .await;
    })
    .await;

    assert!(logs.contains("Session authenticated"));
    assert_eq!(registry.authenticated_count(), 1);
    assert_sensitive_not_in_logs(&logs, secret.expose(), "API key", "submission");
    assert_sensitive_not_in_logs(&logs, bad_key, "Rejected key", "submission");
}

#[tokio::test]
async fn admin_token_and_issued_key_not_logged_by_http_layer() {
    let admin_token = "admin-token-that-must-stay-private";
    let wrong_token = "wrong-admin-token-also-private";

    let (issued, logs) = with_log_capture_async(|| async {
        let config = Config {
            admin_token: Some(admin_token.to_string()),
            ..Config::default()
        };
        let app = create_router(AppState::new(config, Arc::new(MemoryStore::new())));
        let body = r#"{"contact_email":"ops@example.com","permissions":{"read":true}}"#;

        let rejected = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/keys")
                    .header("X-Admin-Token", wrong_token)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/keys")
                    .header("X-Admin-Token", admin_token)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice::<IssueKeyResponse>(&bytes).unwrap()
    })
    .await;

    assert_sensitive_not_in_logs(&logs, admin_token, "Admin token", "key issuance");
    assert_sensitive_not_in_logs(&logs, wrong_token, "Wrong admin token", "key issuance");
    assert_sensitive_not_in_logs(&logs, &issued.key, "Issued key", "key issuance");
}

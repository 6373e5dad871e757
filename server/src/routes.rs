//! HTTP and WebSocket route handlers for the Mainframe hub.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /api/v1/websocket/connect` - WebSocket endpoint for bots and clients
//! - `GET /api/v1/roster` - Online players for one server
//! - `GET /api/v1/online` - Whether a player is online anywhere
//! - `POST /api/v1/keys` - Issue an API key (admin only)
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The session registry, roster, and credential service
//! - The ingress queue feeding the single [`EventRouter`] task
//! - Server start time for uptime reporting
//!
//! Each WebSocket connection runs two tasks. The reader parses frames and
//! awaits space on the ingress queue; the writer drains the session's egress
//! queue onto the socket. They share nothing but those queues.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mainframe_hub::config::Config;
//! use mainframe_hub::routes::{create_router, AppState};
//! use mainframe_hub::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config, Arc::new(MemoryStore::new()));
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{validate_admin_token, CredentialService, Permissions, TokenType};
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::error::HubError;
use crate::rate_limit::RateLimiter;
use crate::roster::RosterStore;
use crate::router::{EventRouter, Inbound};
use crate::session::{ConnectRequest, OpenedSession, SessionRegistry};
use crate::store::Store;
use crate::types::{Envelope, SessionId};

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the admin token for key issuance.
const HEADER_ADMIN_TOKEN: &str = "X-Admin-Token";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Live connections.
    pub registry: Arc<SessionRegistry>,

    /// Online players per server.
    pub roster: Arc<RosterStore>,

    /// API key issuance and verification.
    pub credentials: Arc<CredentialService>,

    /// Fan-out over the registry, used for connection-level errors.
    pub broadcaster: Broadcaster,

    /// Per-credential quotas.
    pub rate_limiter: RateLimiter,

    /// Sending half of the router's inbound queue.
    pub ingress: mpsc::Sender<Inbound>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Builds the hub's components and spawns the router task.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.egress_capacity));
        let roster = Arc::new(RosterStore::new());
        let credentials = Arc::new(CredentialService::new(store.clone()));
        let rate_limiter = RateLimiter::new();

        let (ingress, rx) = mpsc::channel(config.ingress_capacity);
        EventRouter::new(
            registry.clone(),
            roster.clone(),
            credentials.clone(),
            store,
            rate_limiter.clone(),
            config.avatar_base_url.clone(),
        )
        .spawn(rx);

        Self {
            config: Arc::new(config),
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            roster,
            credentials,
            rate_limiter,
            ingress,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("sessions", &self.registry.len())
            .field("rate_limiter", &self.rate_limiter)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the axum router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/websocket/connect", get(get_ws_connect))
        .route("/api/v1/roster", get(get_roster))
        .route("/api/v1/online", get(get_online))
        .route("/api/v1/keys", post(post_keys))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// Standard error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(ErrorResponse::new(message).with_code(code))).into_response()
}

// ============================================================================
// GET /api/v1/websocket/connect - WebSocket Sessions
// ============================================================================

/// Query parameters for the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Minecraft server the connection speaks for.
    pub server: Option<String>,

    /// `"true"` (any case) marks the connection as a bot.
    #[serde(rename = "is-bot-client")]
    pub is_bot_client: Option<String>,
}

impl ConnectParams {
    fn into_request(self) -> ConnectRequest {
        let is_bot = self
            .is_bot_client
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        ConnectRequest {
            server: self.server,
            is_bot,
        }
    }
}

async fn get_ws_connect(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let request = params.into_request();
    debug!(
        server = request.server.as_deref().unwrap_or("<none>"),
        is_bot = request.is_bot,
        "WebSocket client connecting"
    );

    ws.on_upgrade(move |socket| handle_websocket(socket, state, request))
}

async fn handle_websocket(socket: WebSocket, state: AppState, request: ConnectRequest) {
    let (mut sink, mut stream) = socket.split();

    let OpenedSession {
        id,
        egress,
        shutdown,
    } = match state.registry.open(request) {
        Ok(opened) => opened,
        Err(err) => {
            warn!(error = %err, "WebSocket connection refused");
            let frame = Envelope::error("", err.client_message());
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = sink.send(Message::Text(json.into())).await;
            }
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let writer = tokio::spawn(write_egress(sink, egress, id.clone()));

    read_ingress(&mut stream, &state, &id, &shutdown).await;

    state.registry.remove(&id);
    if let Err(err) = writer.await {
        error!(session_id = %id, error = %err, "Writer task failed");
    }
    info!(session_id = %id, "WebSocket client disconnected");
}

/// Drains the session's egress queue onto the socket until the registry
/// drops the session's sender, then closes the socket.
async fn write_egress(
    mut sink: SplitSink<WebSocket, Message>,
    mut egress: mpsc::Receiver<Envelope>,
    id: SessionId,
) {
    while let Some(envelope) = egress.recv().await {
        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(err) => {
                error!(session_id = %id, error = %err, "Failed to serialize envelope");
                continue;
            }
        };

        if let Err(err) = sink.send(Message::Text(json.into())).await {
            let err = HubError::transport(err.to_string());
            debug!(
                session_id = %id,
                category = err.category().as_str(),
                error = %err,
                "Failed to send to WebSocket client"
            );
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

async fn read_ingress(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    id: &SessionId,
    shutdown: &Notify,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.notified() => {
                debug!(session_id = %id, "Session closed by hub");
                return;
            }
            message = stream.next() => message,
        };

        let accepted = match message {
            Some(Ok(Message::Text(text))) => forward(state, id, text.as_str().as_bytes()).await,
            Some(Ok(Message::Binary(bytes))) => forward(state, id, &bytes).await,
            Some(Ok(Message::Close(_))) | None => {
                debug!(session_id = %id, "WebSocket client closed connection");
                return;
            }
            Some(Ok(Message::Ping(data))) => {
                trace!(data_len = data.len(), "Received ping");
                true
            }
            Some(Ok(Message::Pong(_))) => true,
            Some(Err(err)) => {
                let err = HubError::transport(err.to_string());
                debug!(
                    session_id = %id,
                    category = err.category().as_str(),
                    error = %err,
                    "WebSocket error"
                );
                return;
            }
        };

        if !accepted {
            return;
        }
    }
}

/// Parses one frame and queues it for the router.
///
/// Returns false when the router has gone away.
async fn forward(state: &AppState, id: &SessionId, bytes: &[u8]) -> bool {
    let envelope: Envelope = match serde_json::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(session_id = %id, error = %err, "Malformed envelope");
            let err = HubError::MalformedEnvelope;
            state
                .broadcaster
                .unicast(id, Envelope::error(id.as_str(), err.client_message()));
            return true;
        }
    };

    if state
        .ingress
        .send(Inbound::new(id.clone(), envelope))
        .await
        .is_err()
    {
        let err = HubError::internal("event router is not running");
        error!(
            session_id = %id,
            category = err.category().as_str(),
            error = %err,
            "Dropping connection"
        );
        state
            .broadcaster
            .unicast(id, Envelope::error(id.as_str(), err.client_message()));
        return false;
    }
    true
}

// ============================================================================
// GET /api/v1/roster - Server Roster
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RosterParams {
    pub server: String,
}

async fn get_roster(State(state): State<AppState>, Query(params): Query<RosterParams>) -> Response {
    match state.roster.snapshot(&params.server).await {
        Some(players) => Json(players).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "no active roster for server",
            "unknown_server",
        ),
    }
}

// ============================================================================
// GET /api/v1/online - Player Lookup
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OnlineParams {
    pub username: String,
}

/// Response body for the online check.
#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineResponse {
    pub online: bool,
    pub server: Option<String>,
}

async fn get_online(
    State(state): State<AppState>,
    Query(params): Query<OnlineParams>,
) -> Json<OnlineResponse> {
    let entry = state.roster.find_by_username(&params.username).await;
    Json(OnlineResponse {
        online: entry.is_some(),
        server: entry.map(|e| e.server),
    })
}

// ============================================================================
// POST /api/v1/keys - Key Issuance
// ============================================================================

/// Request body for key issuance.
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueKeyRequest {
    pub contact_email: String,
    #[serde(default)]
    pub permissions: Permissions,
    /// Actions per hour; zero is unlimited.
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub token_type: TokenType,
}

/// Response body carrying the plaintext key, shown exactly once.
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueKeyResponse {
    pub key: String,
}

async fn post_keys(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        debug!("Key issuance requested but no admin token is configured");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "key issuance is disabled",
            "issuance_disabled",
        );
    };

    let provided = headers
        .get(HEADER_ADMIN_TOKEN)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = validate_admin_token(provided, expected) {
        debug!(error = %err, "Key issuance rejected");
        return error_response(StatusCode::UNAUTHORIZED, &err.to_string(), "unauthorized");
    }

    let request: IssueKeyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "Failed to parse key issuance request");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {err}"),
                "invalid_format",
            );
        }
    };

    match state
        .credentials
        .issue(
            request.permissions,
            &request.contact_email,
            request.rate_limit,
            request.token_type,
        )
        .await
    {
        Ok(secret) => (
            StatusCode::CREATED,
            Json(IssueKeyResponse {
                key: secret.into_inner(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Failed to issue API key");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to persist api key",
                "persistence_error",
            )
        }
    }
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Health check response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,

    /// Live WebSocket sessions.
    pub connections: usize,

    /// Sessions with a credential attached.
    pub authenticated: usize,

    /// Servers with an active roster, sorted by name.
    pub servers: Vec<String>,

    /// Players online across every server.
    pub online_players: usize,

    /// Seconds since the server started.
    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.len(),
        authenticated: state.registry.authenticated_count(),
        servers: state.roster.servers().await,
        online_players: state.roster.total_players().await,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

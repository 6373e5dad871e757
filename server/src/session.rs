//! Session registry for live WebSocket connections.
//!
//! Every accepted connection is a [`Session`]: a generated id, an optional
//! Minecraft server binding, an optional attached [`Credential`], and the
//! sending half of a bounded egress queue drained by the connection's writer
//! task.
//!
//! # Bot bindings
//!
//! A bot connection names the Minecraft server it speaks for. At most one
//! live session may hold a given server; a second bot for the same server is
//! refused until the first disconnects. The check and the insert happen under
//! one write lock, so two concurrent opens for the same server can never both
//! succeed.
//!
//! # Thread Safety
//!
//! The registry uses a [`std::sync::RwLock`]; no guard is ever held across an
//! `.await`. Egress sends are `try_send`, so a slow peer never blocks the
//! caller.
//!
//! # Example
//!
//! ```rust
//! use mainframe_hub::session::{ConnectRequest, SessionRegistry};
//!
//! let registry = SessionRegistry::new(16);
//! let mut opened = registry.open(ConnectRequest::bot("survival")).unwrap();
//!
//! // The first queued frame announces the id.
//! let first = opened.egress.try_recv().unwrap();
//! assert_eq!(first.action, "id");
//! assert_eq!(registry.bound_session("survival"), Some(opened.id.clone()));
//!
//! registry.remove(&opened.id);
//! assert!(registry.bound_session("survival").is_none());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::auth::Credential;
use crate::types::{Envelope, SessionId};

/// Errors from registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A bot connection did not name a server.
    #[error("bot connections must specify a server")]
    BotServerRequired,

    /// Another live bot already holds the server binding.
    #[error("server '{0}' already has a bot connected")]
    ServerAlreadyBound(String),

    /// The session id is not registered.
    #[error("session not found")]
    NotFound,

    /// A credential is already attached to the session.
    #[error("session already has a credential")]
    AlreadyAuthenticated,
}

impl RegistryError {
    /// Text sent to a peer whose connection was refused.
    pub fn client_message(&self) -> String {
        match self {
            Self::BotServerRequired => {
                "When registering as a bot-client, you must provide a server your bot associates with."
                    .to_string()
            }
            Self::ServerAlreadyBound(server) => {
                format!("A bot is already connected for server '{server}'")
            }
            Self::NotFound => "The client_id you gave is not valid.".to_string(),
            Self::AlreadyAuthenticated => "You are already authenticated.".to_string(),
        }
    }
}

/// Parameters of an incoming connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectRequest {
    /// Minecraft server name from the query string, if any.
    pub server: Option<String>,
    /// Whether the peer declared itself a bot.
    pub is_bot: bool,
}

impl ConnectRequest {
    /// A dashboard or Discord-side client.
    pub fn client(server: Option<String>) -> Self {
        Self {
            server,
            is_bot: false,
        }
    }

    /// A Minecraft bot speaking for `server`.
    pub fn bot(server: impl Into<String>) -> Self {
        Self {
            server: Some(server.into()),
            is_bot: true,
        }
    }
}

/// One live connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub server: Option<String>,
    pub is_bot: bool,
    pub credential: Option<Credential>,
    pub egress: mpsc::Sender<Envelope>,
    /// Wakes the connection's reader so it can close the socket.
    pub shutdown: Arc<Notify>,
}

impl Session {
    /// Returns true once a credential is attached.
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }

    /// Returns true if the attached credential grants read permission.
    pub fn can_read(&self) -> bool {
        self.credential
            .as_ref()
            .is_some_and(|credential| credential.permissions.read)
    }

    /// The server this session is bound to, for bot sessions only.
    pub fn bound_server(&self) -> Option<&str> {
        if self.is_bot {
            self.server.as_deref()
        } else {
            None
        }
    }
}

/// Handles returned to the connection task when a session is opened.
#[derive(Debug)]
pub struct OpenedSession {
    pub id: SessionId,
    /// Receiving half of the egress queue. The id frame is already queued.
    pub egress: mpsc::Receiver<Envelope>,
    pub shutdown: Arc<Notify>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    /// Server name to the bot session holding it.
    bindings: HashMap<String, SessionId>,
}

/// Thread-safe registry of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    egress_capacity: usize,
}

impl SessionRegistry {
    /// Creates an empty registry whose sessions get egress queues of
    /// `egress_capacity` frames.
    pub fn new(egress_capacity: usize) -> Self {
        debug!(egress_capacity, "Creating session registry");
        Self {
            inner: RwLock::new(RegistryInner::default()),
            egress_capacity: egress_capacity.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new connection.
    ///
    /// Generates a unique id, queues the `id` announcement as the first
    /// egress frame, and for bots claims the server binding.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::BotServerRequired`] for a bot without a server
    /// - [`RegistryError::ServerAlreadyBound`] if another bot holds the server
    pub fn open(&self, request: ConnectRequest) -> Result<OpenedSession, RegistryError> {
        let server = request.server.filter(|s| !s.is_empty());
        if request.is_bot && server.is_none() {
            return Err(RegistryError::BotServerRequired);
        }

        let mut inner = self.write();

        if request.is_bot {
            if let Some(server) = server.as_deref() {
                if inner.bindings.contains_key(server) {
                    warn!(server = %server, "Rejecting duplicate bot connection");
                    return Err(RegistryError::ServerAlreadyBound(server.to_string()));
                }
            }
        }

        let mut id = SessionId::generate();
        while inner.sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        let (tx, rx) = mpsc::channel(self.egress_capacity);
        // Fresh channel with capacity >= 1, so the first send cannot fail.
        let _ = tx.try_send(Envelope::assigned_id(&id));

        let shutdown = Arc::new(Notify::new());
        let session = Session {
            id: id.clone(),
            server: server.clone(),
            is_bot: request.is_bot,
            credential: None,
            egress: tx,
            shutdown: shutdown.clone(),
        };

        if request.is_bot {
            if let Some(server) = server.clone() {
                inner.bindings.insert(server, id.clone());
            }
        }
        inner.sessions.insert(id.clone(), session);

        info!(
            session_id = %id,
            server = server.as_deref().unwrap_or("<none>"),
            is_bot = request.is_bot,
            sessions = inner.sessions.len(),
            "Session opened"
        );

        Ok(OpenedSession {
            id,
            egress: rx,
            shutdown,
        })
    }

    /// Removes a session and releases its server binding.
    ///
    /// Idempotent: removing an unknown id returns `None`. The session's
    /// shutdown signal is fired so its reader stops.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let mut inner = self.write();
        let session = inner.sessions.remove(id)?;

        if let Some(server) = session.bound_server() {
            if inner.bindings.get(server) == Some(id) {
                inner.bindings.remove(server);
            }
        }

        info!(
            session_id = %id,
            sessions = inner.sessions.len(),
            "Session removed"
        );
        drop(inner);

        session.shutdown.notify_one();
        Some(session)
    }

    /// Returns a snapshot of the session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.read().sessions.get(id).cloned()
    }

    /// Returns true if `id` is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.read().sessions.contains_key(id)
    }

    /// Attaches a credential to a session.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] if the session is gone
    /// - [`RegistryError::AlreadyAuthenticated`] if one is already attached
    pub fn attach_credential(
        &self,
        id: &SessionId,
        credential: Credential,
    ) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let session = inner.sessions.get_mut(id).ok_or(RegistryError::NotFound)?;
        if session.credential.is_some() {
            return Err(RegistryError::AlreadyAuthenticated);
        }
        session.credential = Some(credential);
        trace!(session_id = %id, "Credential attached");
        Ok(())
    }

    /// The bot session bound to `server`, if any.
    pub fn bound_session(&self, server: &str) -> Option<SessionId> {
        self.read().bindings.get(server).cloned()
    }

    /// Egress senders of every session whose credential grants read.
    pub fn read_permitted(&self) -> Vec<(SessionId, mpsc::Sender<Envelope>)> {
        self.read()
            .sessions
            .values()
            .filter(|session| session.can_read())
            .map(|session| (session.id.clone(), session.egress.clone()))
            .collect()
    }

    /// Egress sender for one session.
    pub fn sender(&self, id: &SessionId) -> Option<mpsc::Sender<Envelope>> {
        self.read()
            .sessions
            .get(id)
            .map(|session| session.egress.clone())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    /// Returns true if no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    /// Number of sessions with a credential attached.
    pub fn authenticated_count(&self) -> usize {
        self.read()
            .sessions
            .values()
            .filter(|session| session.is_authenticated())
            .count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

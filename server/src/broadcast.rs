//! Broadcast and unicast fan-out to live sessions.
//!
//! The hub's fan-out is per-session rather than a shared channel: each
//! session owns a bounded egress queue, and the [`Broadcaster`] pushes into
//! those queues with `try_send`. A peer that stops reading fills its own
//! queue and starts losing frames; nobody else is slowed down.
//!
//! # Delivery rules
//!
//! - [`Broadcaster::broadcast`] targets every session whose credential grants
//!   read, the sender included
//! - [`Broadcaster::unicast`] targets one session regardless of permission
//! - Both snapshot the recipients first and send outside the registry lock
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mainframe_hub::broadcast::Broadcaster;
//! use mainframe_hub::session::{ConnectRequest, SessionRegistry};
//! use mainframe_hub::types::Envelope;
//!
//! let registry = Arc::new(SessionRegistry::new(8));
//! let broadcaster = Broadcaster::new(registry.clone());
//!
//! let mut opened = registry.open(ConnectRequest::client(None)).unwrap();
//! let _id_frame = opened.egress.try_recv().unwrap();
//!
//! assert!(broadcaster.unicast(&opened.id, Envelope::error(opened.id.as_str(), "nope")));
//! assert!(opened.egress.try_recv().unwrap().is_error());
//! ```

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tracing::{debug, trace, warn};

use crate::session::SessionRegistry;
use crate::types::{Envelope, SessionId};

/// Pushes envelopes into session egress queues.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
}

impl Broadcaster {
    /// Creates a broadcaster over `registry`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Delivers `envelope` to every read-permitted session.
    ///
    /// Returns how many queues accepted it. Never blocks.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        let recipients = self.registry.read_permitted();
        let total = recipients.len();

        let delivered = recipients
            .iter()
            .filter(|(id, sender)| deliver(id, sender, envelope.clone()))
            .count();

        trace!(
            action = %envelope.action,
            recipients = total,
            delivered,
            "Broadcast envelope"
        );
        delivered
    }

    /// Delivers `envelope` to one session. Returns false if the session is
    /// gone or its queue could not take the frame.
    pub fn unicast(&self, id: &SessionId, envelope: Envelope) -> bool {
        match self.registry.sender(id) {
            Some(sender) => deliver(id, &sender, envelope),
            None => {
                debug!(session_id = %id, "Unicast target not registered");
                false
            }
        }
    }
}

fn deliver(id: &SessionId, sender: &Sender<Envelope>, envelope: Envelope) -> bool {
    match sender.try_send(envelope) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!(
                session_id = %id,
                action = %dropped.action,
                "Egress queue full, dropping frame"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(session_id = %id, "Egress queue closed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, Permissions, TokenType};
    use crate::session::{ConnectRequest, OpenedSession};
    use serde_json::json;

    fn credential(read: bool) -> Credential {
        Credential {
            key_hash: "h".into(),
            owner_contact: "o".into(),
            created_at: 0,
            updated_at: 0,
            permissions: Permissions { read, write: true },
            rate_limit: 0,
            token_type: TokenType::BotClient,
        }
    }

    fn open(registry: &SessionRegistry, read: Option<bool>) -> OpenedSession {
        let mut opened = registry.open(ConnectRequest::client(None)).unwrap();
        opened.egress.try_recv().unwrap();
        if let Some(read) = read {
            registry
                .attach_credential(&opened.id, credential(read))
                .unwrap();
        }
        opened
    }

    fn chat() -> Envelope {
        Envelope::new("x", "inbound_discord_chat", json!({"message": "hi"}))
    }

    #[test]
    fn broadcast_reaches_only_read_permitted_sessions() {
        let registry = Arc::new(SessionRegistry::new(8));
        let broadcaster = Broadcaster::new(registry.clone());

        let mut reader_a = open(&registry, Some(true));
        let mut reader_b = open(&registry, Some(true));
        let mut no_read = open(&registry, Some(false));
        let mut anonymous = open(&registry, None);

        assert_eq!(broadcaster.broadcast(chat()), 2);
        assert_eq!(reader_a.egress.try_recv().unwrap(), chat());
        assert_eq!(reader_b.egress.try_recv().unwrap(), chat());
        assert!(no_read.egress.try_recv().is_err());
        assert!(anonymous.egress.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_affecting_others() {
        let registry = Arc::new(SessionRegistry::new(1));
        let broadcaster = Broadcaster::new(registry.clone());

        let _stalled = open(&registry, Some(true));
        let mut healthy = open(&registry, Some(true));

        assert_eq!(broadcaster.broadcast(chat()), 2);
        let _ = healthy.egress.try_recv().unwrap();

        // Stalled queue is full; healthy one has room again.
        assert_eq!(broadcaster.broadcast(chat()), 1);
        assert_eq!(healthy.egress.try_recv().unwrap(), chat());
    }

    #[test]
    fn unicast_ignores_permissions() {
        let registry = Arc::new(SessionRegistry::new(8));
        let broadcaster = Broadcaster::new(registry.clone());
        let mut anonymous = open(&registry, None);

        assert!(broadcaster.unicast(&anonymous.id, Envelope::error("", "boom")));
        assert!(anonymous.egress.try_recv().unwrap().is_error());
    }

    #[test]
    fn unicast_to_unknown_session_is_false() {
        let registry = Arc::new(SessionRegistry::new(8));
        let broadcaster = Broadcaster::new(registry);
        assert!(!broadcaster.unicast(&SessionId::from("ghost"), chat()));
    }

    #[test]
    fn closed_receiver_is_not_counted() {
        let registry = Arc::new(SessionRegistry::new(8));
        let broadcaster = Broadcaster::new(registry.clone());
        let gone = open(&registry, Some(true));
        drop(gone.egress);

        assert_eq!(broadcaster.broadcast(chat()), 0);
    }
}

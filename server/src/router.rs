//! Event router: the single consumer of inbound envelopes.
//!
//! Every connection's reader pushes [`Inbound`] items onto one bounded queue.
//! Exactly one task drains that queue, so envelopes are handled in arrival
//! order and the per-session order a peer sent them in is preserved.
//!
//! # Pipeline
//!
//! Each envelope passes these gates in order. The first failure produces one
//! `error` envelope addressed to the physical connection, and the envelope is
//! dropped:
//!
//! 1. **Identity**: the claimed `client_id` must be a live session
//! 2. **Consistency**: the claimed id must be the sender's own id
//! 3. **Authentication**: only `x-api-key` is accepted before a credential
//!    is attached
//! 4. **Write permission**: every other action needs `write`
//! 5. **Quota**: the credential's hourly rate limit
//! 6. **Dispatch**: the closed [`Action`] table; unknown actions and payload
//!    decode failures are rejected here
//!
//! Store failures inside a handler are logged and reported to the sender,
//! but never stop the broadcast that follows.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::CredentialService;
use crate::broadcast::Broadcaster;
use crate::error::{HubError, Result};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::roster::{avatar_url, RosterEntry, RosterStore};
use crate::session::{RegistryError, Session, SessionRegistry};
use crate::store::{JoinAction, JoinOutcome, Store};
use crate::types::{
    Action, AdvancementMessage, DiscordChatMessage, Envelope, MinecraftChatMessage,
    PlayerDeathMessage, PlayerJoinMessage, PlayerLeaveMessage, RosterRefresh, SessionId,
    ACTION_KEY_ACCEPTED,
};

/// Text sent with a successful `key-accepted` response.
pub const KEY_ACCEPTED_MESSAGE: &str = "Authenticated successfully. Welcome to the Mainframe hub";

const CHAT_SAVE_FAILED: &str = "Error saving minecraft chat message to database";
const ADVANCEMENT_SAVE_FAILED: &str = "Error saving minecraft advancement message to database";
const JOIN_SAVE_FAILED: &str = "Error saving minecraft player join message to database";
const LEAVE_SAVE_FAILED: &str = "Error saving minecraft player leave message to database";
const DEATH_SAVE_FAILED: &str = "Error saving minecraft player death message to database";
const PLAYTIME_SAVE_FAILED: &str = "Error updating player playtime in database";

/// An envelope together with the connection it physically arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub sender: SessionId,
    pub envelope: Envelope,
}

impl Inbound {
    pub fn new(sender: SessionId, envelope: Envelope) -> Self {
        Self { sender, envelope }
    }
}

/// Routes inbound envelopes to handlers.
#[derive(Clone)]
pub struct EventRouter {
    registry: Arc<SessionRegistry>,
    roster: Arc<RosterStore>,
    credentials: Arc<CredentialService>,
    store: Arc<dyn Store>,
    broadcaster: Broadcaster,
    rate_limiter: RateLimiter,
    avatar_base_url: String,
}

impl EventRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        roster: Arc<RosterStore>,
        credentials: Arc<CredentialService>,
        store: Arc<dyn Store>,
        rate_limiter: RateLimiter,
        avatar_base_url: impl Into<String>,
    ) -> Self {
        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            roster,
            credentials,
            store,
            rate_limiter,
            avatar_base_url: avatar_base_url.into(),
        }
    }

    /// Spawns the router task draining `rx`.
    pub fn spawn(self, rx: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    /// Processes envelopes until every sender half of the queue is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<Inbound>) {
        info!("Event router started");
        while let Some(inbound) = rx.recv().await {
            self.process(inbound).await;
        }
        info!("Event router stopped");
    }

    /// Routes one envelope. Never fails: rejections become error frames.
    pub async fn process(&self, inbound: Inbound) {
        let Inbound { sender, envelope } = inbound;
        let action = envelope.action.clone();

        if let Err(err) = self.route(&sender, envelope).await {
            if err.is_client_error() {
                debug!(
                    session_id = %sender,
                    action = %action,
                    category = err.category().as_str(),
                    error = %err,
                    "Envelope rejected"
                );
            } else {
                error!(
                    session_id = %sender,
                    action = %action,
                    category = err.category().as_str(),
                    error = %err,
                    "Envelope failed"
                );
            }
            self.notify(&sender, &err);
        }
    }

    fn notify(&self, sender: &SessionId, err: &HubError) {
        let frame = Envelope::error(sender.as_str(), err.client_message());
        self.broadcaster.unicast(sender, frame);
    }

    async fn route(&self, sender: &SessionId, envelope: Envelope) -> Result<()> {
        let claimed = SessionId::from(envelope.client_id.as_str());
        if !self.registry.contains(&claimed) {
            return Err(HubError::UnknownSession(envelope.client_id));
        }
        if claimed != *sender {
            return Err(HubError::SessionMismatch {
                claimed: envelope.client_id,
                actual: sender.to_string(),
            });
        }

        let session = self
            .registry
            .get(sender)
            .ok_or_else(|| HubError::UnknownSession(sender.to_string()))?;

        let parsed = envelope.action.parse::<Action>();
        // Unknown actions are held to the write gate before dispatch rejects them.
        let requires_write = parsed.as_ref().map_or(true, |action| action.requires_write());

        let Some(credential) = session.credential.as_ref() else {
            if !requires_write {
                return self.handle_submit_secret(&session, &envelope.data).await;
            }
            return Err(HubError::NotAuthenticated);
        };

        if requires_write {
            if !credential.permissions.write {
                return Err(HubError::PermissionDenied("write"));
            }
            if let RateLimitResult::Limited { retry_after_secs } = self
                .rate_limiter
                .check_quota(&credential.key_hash, credential.rate_limit)
                .await
            {
                return Err(HubError::RateLimited { retry_after_secs });
            }
        }

        match parsed? {
            Action::SubmitSecret => Err(HubError::AlreadyAuthenticated),
            Action::DiscordChat => self.handle_discord_chat(envelope),
            Action::MinecraftChat => self.handle_minecraft_chat(&session, envelope).await,
            Action::Advancement => self.handle_advancement(&session, envelope).await,
            Action::PlayerJoin => self.handle_player_join(&session, envelope).await,
            Action::PlayerLeave => self.handle_player_leave(&session, envelope).await,
            Action::PlayerDeath => self.handle_player_death(&session, envelope).await,
            Action::RosterRefresh => self.handle_roster_refresh(&session, &envelope).await,
        }
    }

    async fn handle_submit_secret(&self, session: &Session, data: &Value) -> Result<()> {
        let secret = data
            .as_str()
            .ok_or_else(|| HubError::decode(Action::SubmitSecret.as_str()))?;

        let credential = match self.credentials.verify(secret).await {
            Ok(Some(credential)) => credential,
            Ok(None) => return Err(HubError::InvalidCredential),
            Err(err) => {
                error!(session_id = %session.id, error = %err, "Credential lookup failed");
                return Err(HubError::InvalidCredential);
            }
        };

        let permissions = credential.permissions;
        self.registry
            .attach_credential(&session.id, credential)
            .map_err(|err| match err {
                RegistryError::AlreadyAuthenticated => HubError::AlreadyAuthenticated,
                _ => HubError::UnknownSession(session.id.to_string()),
            })?;

        info!(
            session_id = %session.id,
            read = permissions.read,
            write = permissions.write,
            "Session authenticated"
        );

        self.broadcaster.unicast(
            &session.id,
            Envelope::new(
                session.id.as_str(),
                ACTION_KEY_ACCEPTED,
                Value::String(KEY_ACCEPTED_MESSAGE.to_string()),
            ),
        );
        Ok(())
    }

    fn handle_discord_chat(&self, envelope: Envelope) -> Result<()> {
        let message: DiscordChatMessage = decode(Action::DiscordChat, &envelope.data)?;
        debug!(guild = %message.guild_name, "Discord chat received");
        self.broadcaster.broadcast(envelope);
        Ok(())
    }

    async fn handle_minecraft_chat(&self, session: &Session, envelope: Envelope) -> Result<()> {
        let mut message: MinecraftChatMessage = decode(Action::MinecraftChat, &envelope.data)?;
        message.mc_server = target_server(session, &message.mc_server).to_string();
        debug!(server = %message.mc_server, "Minecraft chat received");

        if let Err(err) = self.store.save_chat_message(&message).await {
            self.persistence_failed(session, Action::MinecraftChat, &err, CHAT_SAVE_FAILED);
        }

        self.broadcaster.broadcast(envelope);
        Ok(())
    }

    async fn handle_advancement(&self, session: &Session, envelope: Envelope) -> Result<()> {
        let mut message: AdvancementMessage = decode(Action::Advancement, &envelope.data)?;
        message.mc_server = target_server(session, &message.mc_server).to_string();
        debug!(server = %message.mc_server, "Advancement received");

        if let Err(err) = self.store.save_advancement(&message).await {
            self.persistence_failed(session, Action::Advancement, &err, ADVANCEMENT_SAVE_FAILED);
        }

        self.broadcaster.broadcast(envelope);
        Ok(())
    }

    async fn handle_player_join(&self, session: &Session, envelope: Envelope) -> Result<()> {
        let mut message: PlayerJoinMessage = decode(Action::PlayerJoin, &envelope.data)?;
        message.server = target_server(session, &message.server).to_string();

        let outcome = match self.store.save_player_join(&message).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.persistence_failed(session, Action::PlayerJoin, &err, JOIN_SAVE_FAILED);
                JoinOutcome::none()
            }
        };

        let server = message.server;
        self.roster
            .upsert(RosterEntry {
                head_url: avatar_url(&self.avatar_base_url, &message.username),
                username: message.username,
                uuid: message.uuid,
                latency: message.latency,
                server: server.clone(),
            })
            .await;

        debug!(server = %server, outcome = outcome.action.as_str(), "Player joined");

        match outcome.action {
            JoinAction::None => {
                self.broadcaster.broadcast(envelope);
            }
            action => {
                self.broadcaster.broadcast(Envelope::new(
                    session.id.as_str(),
                    action.as_str(),
                    json!({ "user": outcome.data, "server": server }),
                ));
            }
        }
        Ok(())
    }

    async fn handle_player_leave(&self, session: &Session, envelope: Envelope) -> Result<()> {
        let mut message: PlayerLeaveMessage = decode(Action::PlayerLeave, &envelope.data)?;
        message.server = target_server(session, &message.server).to_string();

        if let Err(err) = self.store.save_player_leave(&message).await {
            self.persistence_failed(session, Action::PlayerLeave, &err, LEAVE_SAVE_FAILED);
        }

        let server = message.server.as_str();
        if !self.roster.remove(server, &message.username).await {
            debug!(server = %server, "Leave for player not on roster");
        }

        self.broadcaster.broadcast(envelope);
        Ok(())
    }

    async fn handle_player_death(&self, session: &Session, envelope: Envelope) -> Result<()> {
        let mut message: PlayerDeathMessage = decode(Action::PlayerDeath, &envelope.data)?;
        message.mc_server = target_server(session, &message.mc_server).to_string();
        debug!(
            server = %message.mc_server,
            pvp = message.is_pvp(),
            "Player death received"
        );

        if let Err(err) = self.store.save_player_death(&message).await {
            self.persistence_failed(session, Action::PlayerDeath, &err, DEATH_SAVE_FAILED);
        }

        self.broadcaster.broadcast(envelope);
        Ok(())
    }

    async fn handle_roster_refresh(&self, session: &Session, envelope: &Envelope) -> Result<()> {
        let refresh: RosterRefresh = decode(Action::RosterRefresh, &envelope.data)?;

        let mut failures = 0usize;
        for player in refresh.players {
            let server = target_server(session, &player.server).to_string();

            if let Err(err) = self.store.update_playtime(&player.uuid, &server).await {
                warn!(server = %server, error = %err, "Playtime update failed");
                failures += 1;
            }

            self.roster
                .upsert(RosterEntry {
                    head_url: avatar_url(&self.avatar_base_url, &player.username),
                    username: player.username,
                    uuid: player.uuid,
                    latency: player.latency,
                    server,
                })
                .await;
        }

        if failures > 0 {
            self.notify(&session.id, &HubError::persistence(PLAYTIME_SAVE_FAILED));
        }
        Ok(())
    }

    fn persistence_failed(
        &self,
        session: &Session,
        action: Action,
        err: &crate::store::StoreError,
        notice: &str,
    ) {
        error!(
            session_id = %session.id,
            action = %action,
            error = %err,
            "Store write failed"
        );
        self.notify(&session.id, &HubError::persistence(notice));
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("avatar_base_url", &self.avatar_base_url)
            .finish_non_exhaustive()
    }
}

/// A bot's bound server wins over whatever the payload says. Store writes
/// and roster updates for one envelope all use this server.
fn target_server<'a>(session: &'a Session, payload_server: &'a str) -> &'a str {
    session.bound_server().unwrap_or(payload_server)
}

fn decode<T: DeserializeOwned>(action: Action, data: &Value) -> Result<T> {
    T::deserialize(data).map_err(|_| HubError::decode(action.as_str()))
}

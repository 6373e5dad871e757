//! Persistence collaborator for the hub.
//!
//! The router never talks to a database directly. Every write it triggers
//! goes through the [`Store`] trait, which mirrors the query contracts of the
//! statistics backend: chat, advancements, joins, leaves, deaths, playtime,
//! and API key records.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! by tests. It keeps the same bookkeeping rules a SQL backend applies (join
//! and leave counters, name changes, PVP/PVE classification) without any
//! schema.
//!
//! # Example
//!
//! ```rust
//! use mainframe_hub::store::{JoinAction, MemoryStore, Store};
//! use mainframe_hub::types::PlayerJoinMessage;
//!
//! # tokio_test_block_on(async {
//! let store = MemoryStore::new();
//! let join = PlayerJoinMessage {
//!     username: "Steve".into(),
//!     uuid: "uuid-1".into(),
//!     timestamp: "1700000000000".into(),
//!     server: "survival".into(),
//!     latency: 0,
//! };
//! let outcome = store.save_player_join(&join).await.unwrap();
//! assert_eq!(outcome.action, JoinAction::NewUser);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, trace};

use crate::auth::Credential;
use crate::types::{
    AdvancementMessage, MinecraftChatMessage, PlayerDeathMessage, PlayerJoinMessage,
    PlayerLeaveMessage,
};

/// Playtime credited to each online player per roster refresh (one minute).
pub const PLAYTIME_INCREMENT_MS: i64 = 60_000;

/// Errors returned by a [`Store`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record with the same key already exists.
    #[error("duplicate record: {0}")]
    Duplicate(String),
}

impl StoreError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// What a player join meant to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinAction {
    /// First time this uuid was seen on the server.
    NewUser,
    /// Known uuid, different username than last time.
    NewName,
    /// Nothing noteworthy.
    None,
}

impl JoinAction {
    /// Returns the wire name, which doubles as the re-tagged broadcast action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewUser => "new_user",
            Self::NewName => "new_name",
            Self::None => "none",
        }
    }
}

/// Result of [`Store::save_player_join`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOutcome {
    pub action: JoinAction,
    pub data: Value,
}

impl JoinOutcome {
    /// A join with nothing to announce.
    pub fn none() -> Self {
        Self {
            action: JoinAction::None,
            data: json!({}),
        }
    }
}

/// The persistence contract consumed by the event router and the credential
/// service.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_chat_message(&self, message: &MinecraftChatMessage) -> Result<(), StoreError>;

    async fn save_advancement(&self, message: &AdvancementMessage) -> Result<(), StoreError>;

    /// Records a join and reports whether the player is new or renamed.
    async fn save_player_join(
        &self,
        message: &PlayerJoinMessage,
    ) -> Result<JoinOutcome, StoreError>;

    async fn save_player_leave(&self, message: &PlayerLeaveMessage) -> Result<(), StoreError>;

    /// Records a death, crediting a kill to the murderer when present.
    async fn save_player_death(&self, message: &PlayerDeathMessage) -> Result<(), StoreError>;

    /// Adds [`PLAYTIME_INCREMENT_MS`] to the player's playtime on `server`.
    async fn update_playtime(&self, uuid: &str, server: &str) -> Result<(), StoreError>;

    /// Looks up a credential by the hex SHA-256 of its secret.
    async fn find_credential(&self, key_hash: &str) -> Result<Option<Credential>, StoreError>;

    async fn persist_credential(&self, credential: &Credential) -> Result<(), StoreError>;
}

/// Per-player statistics, keyed by (uuid, server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerRecord {
    pub username: String,
    pub uuid: String,
    pub server: String,
    pub join_date: String,
    pub last_seen: String,
    pub joins: u64,
    pub leaves: u64,
    pub kills: u64,
    pub deaths: u64,
    pub playtime_ms: i64,
    pub last_death_message: Option<String>,
    pub last_death_time: Option<i64>,
}

/// Whether a recorded death was caused by another player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeathKind {
    Pvp,
    Pve,
}

/// A row of the death log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeathRecord {
    pub victim: String,
    pub victim_uuid: String,
    pub murderer: Option<String>,
    pub murderer_uuid: Option<String>,
    pub death_message: String,
    pub time: i64,
    pub kind: DeathKind,
    pub server: String,
}

/// A login recorded for a returning player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginActivity {
    pub uuid: String,
    pub username: String,
    pub server: String,
    pub date_ms: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    players: HashMap<(String, String), PlayerRecord>,
    chat_messages: Vec<MinecraftChatMessage>,
    advancements: Vec<AdvancementMessage>,
    deaths: Vec<DeathRecord>,
    logins: Vec<LoginActivity>,
    credentials: HashMap<String, Credential>,
}

impl MemoryState {
    fn player_by_name_mut(&mut self, username: &str, server: &str) -> Option<&mut PlayerRecord> {
        self.players
            .values_mut()
            .find(|record| record.username == username && record.server == server)
    }
}

/// In-memory [`Store`] implementation.
///
/// All state sits behind one mutex that is never held across an await.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, StoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::unavailable("memory store lock poisoned"))?;
        Ok(f(&mut state))
    }

    /// Returns a copy of the player record for `uuid` on `server`.
    pub fn player(&self, uuid: &str, server: &str) -> Option<PlayerRecord> {
        self.with_state(|state| {
            state
                .players
                .get(&(uuid.to_string(), server.to_string()))
                .cloned()
        })
        .ok()
        .flatten()
    }

    /// Number of stored chat messages.
    pub fn chat_message_count(&self) -> usize {
        self.with_state(|state| state.chat_messages.len()).unwrap_or(0)
    }

    /// Number of stored advancements.
    pub fn advancement_count(&self) -> usize {
        self.with_state(|state| state.advancements.len()).unwrap_or(0)
    }

    /// Copy of the death log.
    pub fn deaths(&self) -> Vec<DeathRecord> {
        self.with_state(|state| state.deaths.clone()).unwrap_or_default()
    }

    /// Copy of the login activity log.
    pub fn logins(&self) -> Vec<LoginActivity> {
        self.with_state(|state| state.logins.clone()).unwrap_or_default()
    }

    /// Number of stored credentials.
    pub fn credential_count(&self) -> usize {
        self.with_state(|state| state.credentials.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_chat_message(&self, message: &MinecraftChatMessage) -> Result<(), StoreError> {
        self.with_state(|state| state.chat_messages.push(message.clone()))
    }

    async fn save_advancement(&self, message: &AdvancementMessage) -> Result<(), StoreError> {
        self.with_state(|state| state.advancements.push(message.clone()))
    }

    async fn save_player_join(
        &self,
        message: &PlayerJoinMessage,
    ) -> Result<JoinOutcome, StoreError> {
        self.with_state(|state| {
            let key = (message.uuid.clone(), message.server.clone());

            let Some(record) = state.players.get_mut(&key) else {
                state.players.insert(
                    key,
                    PlayerRecord {
                        username: message.username.clone(),
                        uuid: message.uuid.clone(),
                        server: message.server.clone(),
                        join_date: message.timestamp.clone(),
                        last_seen: message.timestamp.clone(),
                        joins: 1,
                        leaves: 0,
                        kills: 0,
                        deaths: 0,
                        playtime_ms: 0,
                        last_death_message: None,
                        last_death_time: None,
                    },
                );
                debug!(server = %message.server, "Recorded first join for player");
                return JoinOutcome {
                    action: JoinAction::NewUser,
                    data: json!({ "username": message.username }),
                };
            };

            record.joins += 1;
            record.last_seen = message.timestamp.clone();
            let previous_name = std::mem::replace(&mut record.username, message.username.clone());

            state.logins.push(LoginActivity {
                uuid: message.uuid.clone(),
                username: message.username.clone(),
                server: message.server.clone(),
                date_ms: chrono::Utc::now().timestamp_millis(),
            });

            if previous_name != message.username {
                return JoinOutcome {
                    action: JoinAction::NewName,
                    data: json!({
                        "old_name": previous_name,
                        "new_name": message.username,
                    }),
                };
            }

            JoinOutcome::none()
        })
    }

    async fn save_player_leave(&self, message: &PlayerLeaveMessage) -> Result<(), StoreError> {
        self.with_state(|state| {
            let key = (message.uuid.clone(), message.server.clone());
            if let Some(record) = state.players.get_mut(&key) {
                record.leaves += 1;
                record.last_seen = message.timestamp.clone();
            } else {
                trace!(server = %message.server, "Leave for unknown player ignored");
            }
        })
    }

    async fn save_player_death(&self, message: &PlayerDeathMessage) -> Result<(), StoreError> {
        self.with_state(|state| {
            if let Some(victim) = state.player_by_name_mut(&message.victim, &message.mc_server) {
                victim.deaths += 1;
                victim.last_death_message = Some(message.death_message.clone());
                victim.last_death_time = Some(message.time);
            }

            let kind = match message.murderer() {
                Some(murderer) => {
                    if let Some(killer) = state.player_by_name_mut(murderer, &message.mc_server) {
                        killer.kills += 1;
                    }
                    DeathKind::Pvp
                }
                None => DeathKind::Pve,
            };

            state.deaths.push(DeathRecord {
                victim: message.victim.clone(),
                victim_uuid: message.victim_uuid.clone(),
                murderer: message.murderer().map(str::to_string),
                murderer_uuid: match kind {
                    DeathKind::Pvp => message.murderer_uuid.clone(),
                    DeathKind::Pve => None,
                },
                death_message: message.death_message.clone(),
                time: message.time,
                kind,
                server: message.mc_server.clone(),
            });
        })
    }

    async fn update_playtime(&self, uuid: &str, server: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            if let Some(record) = state
                .players
                .get_mut(&(uuid.to_string(), server.to_string()))
            {
                record.playtime_ms += PLAYTIME_INCREMENT_MS;
            }
        })
    }

    async fn find_credential(&self, key_hash: &str) -> Result<Option<Credential>, StoreError> {
        self.with_state(|state| state.credentials.get(key_hash).cloned())
    }

    async fn persist_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        self.with_state(|state| {
            if state.credentials.contains_key(&credential.key_hash) {
                return Err(StoreError::Duplicate("api key".to_string()));
            }
            state
                .credentials
                .insert(credential.key_hash.clone(), credential.clone());
            Ok(())
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(username: &str, uuid: &str) -> PlayerJoinMessage {
        PlayerJoinMessage {
            username: username.to_string(),
            uuid: uuid.to_string(),
            timestamp: "1700000000000".to_string(),
            server: "survival".to_string(),
            latency: 30,
        }
    }

    fn death(victim: &str, murderer: Option<&str>) -> PlayerDeathMessage {
        PlayerDeathMessage {
            victim: victim.to_string(),
            death_message: format!("{victim} died"),
            murderer: murderer.map(str::to_string),
            time: 42,
            kind: None,
            mc_server: "survival".to_string(),
            victim_uuid: format!("{victim}-uuid"),
            murderer_uuid: murderer.map(|m| format!("{m}-uuid")),
        }
    }

    #[tokio::test]
    async fn first_join_is_new_user() {
        let store = MemoryStore::new();
        let outcome = store.save_player_join(&join("Steve", "u-1")).await.unwrap();
        assert_eq!(outcome.action, JoinAction::NewUser);
        assert_eq!(outcome.data, json!({"username": "Steve"}));
        assert_eq!(store.player("u-1", "survival").unwrap().joins, 1);
    }

    #[tokio::test]
    async fn returning_player_with_same_name_is_none() {
        let store = MemoryStore::new();
        store.save_player_join(&join("Steve", "u-1")).await.unwrap();
        let outcome = store.save_player_join(&join("Steve", "u-1")).await.unwrap();
        assert_eq!(outcome, JoinOutcome::none());
        assert_eq!(store.player("u-1", "survival").unwrap().joins, 2);
        assert_eq!(store.logins().len(), 1);
    }

    #[tokio::test]
    async fn returning_player_with_new_name_is_new_name() {
        let store = MemoryStore::new();
        store.save_player_join(&join("Steve", "u-1")).await.unwrap();
        let outcome = store
            .save_player_join(&join("Steve2", "u-1"))
            .await
            .unwrap();
        assert_eq!(outcome.action, JoinAction::NewName);
        assert_eq!(
            outcome.data,
            json!({"old_name": "Steve", "new_name": "Steve2"})
        );
        assert_eq!(store.player("u-1", "survival").unwrap().username, "Steve2");
    }

    #[tokio::test]
    async fn same_uuid_on_another_server_is_new_user() {
        let store = MemoryStore::new();
        store.save_player_join(&join("Steve", "u-1")).await.unwrap();
        let mut elsewhere = join("Steve", "u-1");
        elsewhere.server = "creative".to_string();
        let outcome = store.save_player_join(&elsewhere).await.unwrap();
        assert_eq!(outcome.action, JoinAction::NewUser);
    }

    #[tokio::test]
    async fn leave_updates_counters() {
        let store = MemoryStore::new();
        store.save_player_join(&join("Steve", "u-1")).await.unwrap();
        store
            .save_player_leave(&PlayerLeaveMessage {
                username: "Steve".into(),
                uuid: "u-1".into(),
                timestamp: "1700000009999".into(),
                server: "survival".into(),
            })
            .await
            .unwrap();
        let record = store.player("u-1", "survival").unwrap();
        assert_eq!(record.leaves, 1);
        assert_eq!(record.last_seen, "1700000009999");
    }

    #[tokio::test]
    async fn death_with_murderer_is_pvp_and_credits_kill() {
        let store = MemoryStore::new();
        store.save_player_join(&join("Alex", "Alex-uuid")).await.unwrap();
        store.save_player_join(&join("Steve", "Steve-uuid")).await.unwrap();

        store
            .save_player_death(&death("Alex", Some("Steve")))
            .await
            .unwrap();

        let deaths = store.deaths();
        assert_eq!(deaths.len(), 1);
        assert_eq!(deaths[0].kind, DeathKind::Pvp);
        assert_eq!(deaths[0].murderer_uuid.as_deref(), Some("Steve-uuid"));
        assert_eq!(store.player("Alex-uuid", "survival").unwrap().deaths, 1);
        assert_eq!(store.player("Steve-uuid", "survival").unwrap().kills, 1);
    }

    #[tokio::test]
    async fn death_without_murderer_is_pve() {
        let store = MemoryStore::new();
        store.save_player_join(&join("Alex", "Alex-uuid")).await.unwrap();
        store.save_player_death(&death("Alex", None)).await.unwrap();

        let deaths = store.deaths();
        assert_eq!(deaths[0].kind, DeathKind::Pve);
        assert!(deaths[0].murderer.is_none());
        assert_eq!(
            store
                .player("Alex-uuid", "survival")
                .unwrap()
                .last_death_message
                .as_deref(),
            Some("Alex died")
        );
    }

    #[tokio::test]
    async fn playtime_increments_by_fixed_amount() {
        let store = MemoryStore::new();
        store.save_player_join(&join("Steve", "u-1")).await.unwrap();
        store.update_playtime("u-1", "survival").await.unwrap();
        store.update_playtime("u-1", "survival").await.unwrap();
        assert_eq!(
            store.player("u-1", "survival").unwrap().playtime_ms,
            2 * PLAYTIME_INCREMENT_MS
        );
    }

    #[tokio::test]
    async fn playtime_for_unknown_player_is_ignored() {
        let store = MemoryStore::new();
        assert!(store.update_playtime("ghost", "survival").await.is_ok());
        assert!(store.player("ghost", "survival").is_none());
    }

    #[test]
    fn join_action_wire_names() {
        assert_eq!(JoinAction::NewUser.as_str(), "new_user");
        assert_eq!(JoinAction::NewName.as_str(), "new_name");
        assert_eq!(JoinAction::None.as_str(), "none");
    }
}

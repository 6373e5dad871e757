//! Wire types for the Mainframe hub.
//!
//! This module defines the envelope exchanged over every connection, the
//! closed table of inbound actions, and the payload shapes each action
//! carries. Payload field names follow the JSON contract the bots already
//! speak, including the historical `victimUUID` style keys.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HubError;

/// Outbound action announcing the generated session id.
pub const ACTION_ID: &str = "id";

/// Outbound action carrying an error message.
pub const ACTION_ERROR: &str = "error";

/// Outbound action confirming a successful `x-api-key` submission.
pub const ACTION_KEY_ACCEPTED: &str = "key-accepted";

/// Identifier assigned to a connection when it is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The unit of exchange on every connection.
///
/// Inbound, `client_id` is whatever the peer claims; the router checks it
/// against the physical connection. Outbound envelopes share the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub client_id: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Creates an envelope with an arbitrary action and payload.
    pub fn new(client_id: impl Into<String>, action: impl Into<String>, data: Value) -> Self {
        Self {
            client_id: client_id.into(),
            action: action.into(),
            data,
        }
    }

    /// The first frame a new connection receives.
    pub fn assigned_id(id: &SessionId) -> Self {
        Self::new("", ACTION_ID, Value::String(id.to_string()))
    }

    /// An error frame addressed to `client_id`.
    pub fn error(client_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(client_id, ACTION_ERROR, Value::String(message.into()))
    }

    /// Returns `true` if this is an error frame.
    pub fn is_error(&self) -> bool {
        self.action == ACTION_ERROR
    }
}

/// The closed set of inbound actions the router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Submit a plaintext API key (`x-api-key`).
    SubmitSecret,
    /// Chat relayed from Discord (`inbound_discord_chat`).
    DiscordChat,
    /// Chat observed in a Minecraft server (`inbound_minecraft_chat`).
    MinecraftChat,
    /// Advancement earned in a Minecraft server.
    Advancement,
    /// Player joined a Minecraft server.
    PlayerJoin,
    /// Player left a Minecraft server.
    PlayerLeave,
    /// Player died, possibly at the hands of another player.
    PlayerDeath,
    /// Full player list from a bot (`send_update_player_list`).
    RosterRefresh,
}

impl Action {
    /// Every action, in dispatch-table order.
    pub const ALL: [Action; 8] = [
        Action::SubmitSecret,
        Action::DiscordChat,
        Action::MinecraftChat,
        Action::Advancement,
        Action::PlayerJoin,
        Action::PlayerLeave,
        Action::PlayerDeath,
        Action::RosterRefresh,
    ];

    /// Returns the wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitSecret => "x-api-key",
            Self::DiscordChat => "inbound_discord_chat",
            Self::MinecraftChat => "inbound_minecraft_chat",
            Self::Advancement => "minecraft_advancement",
            Self::PlayerJoin => "minecraft_player_join",
            Self::PlayerLeave => "minecraft_player_leave",
            Self::PlayerDeath => "minecraft_player_death",
            Self::RosterRefresh => "send_update_player_list",
        }
    }

    /// Returns `true` for actions that need write permission.
    ///
    /// Everything except authentication itself.
    pub fn requires_write(&self) -> bool {
        !matches!(self, Self::SubmitSecret)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| HubError::UnknownAction(s.to_string()))
    }
}

/// Chat relayed from a Discord channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordChatMessage {
    pub message: String,
    pub username: String,
    pub timestamp: String,
    pub server: String,
    pub channel_id: String,
    pub guild_id: String,
    pub guild_name: String,
}

/// Chat observed in a Minecraft server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinecraftChatMessage {
    #[serde(alias = "username")]
    pub name: String,
    pub message: String,
    #[serde(alias = "timestamp")]
    pub date: String,
    #[serde(alias = "server")]
    pub mc_server: String,
    pub uuid: String,
}

/// An advancement earned by a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancementMessage {
    pub username: String,
    pub advancement: String,
    /// Milliseconds since the Unix epoch. Bots send it as `timestamp`,
    /// usually as a decimal string.
    #[serde(default, alias = "timestamp", deserialize_with = "epoch_millis")]
    pub time: i64,
    #[serde(alias = "server")]
    pub mc_server: String,
    pub uuid: String,
}

/// A player joining a Minecraft server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoinMessage {
    pub username: String,
    pub uuid: String,
    pub timestamp: String,
    pub server: String,
    #[serde(default)]
    pub latency: i64,
}

/// A player leaving a Minecraft server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeaveMessage {
    pub username: String,
    pub uuid: String,
    pub timestamp: String,
    pub server: String,
}

/// A player death. A present, non-empty `murderer` makes it a PVP death.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDeathMessage {
    pub victim: String,
    pub death_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub murderer: Option<String>,
    #[serde(default, alias = "timestamp", deserialize_with = "epoch_millis")]
    pub time: i64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(alias = "server")]
    pub mc_server: String,
    #[serde(rename = "victimUUID")]
    pub victim_uuid: String,
    #[serde(
        rename = "murdererUUID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub murderer_uuid: Option<String>,
}

impl PlayerDeathMessage {
    /// Returns the murderer's name if this was a PVP death.
    pub fn murderer(&self) -> Option<&str> {
        self.murderer.as_deref().filter(|name| !name.is_empty())
    }

    /// Returns `true` if another player caused the death.
    pub fn is_pvp(&self) -> bool {
        self.murderer().is_some()
    }
}

/// Accepts a millisecond timestamp as a JSON number or a numeric string.
fn epoch_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(i64),
        Text(String),
    }

    match Millis::deserialize(deserializer)? {
        Millis::Number(millis) => Ok(millis),
        Millis::Text(text) => text.trim().parse().map_err(de::Error::custom),
    }
}

/// One player in a bot's periodic player-list report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub username: String,
    pub uuid: String,
    #[serde(default)]
    pub latency: i64,
    #[serde(default)]
    pub server: String,
}

/// Payload of `send_update_player_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRefresh {
    pub players: Vec<PlayerSnapshot>,
}

//! Per-server online player roster.
//!
//! Tracks which players each Minecraft server currently reports as online.
//! Entries are keyed by username within a server: a second upsert for the
//! same name replaces the first in place, so each server's list holds a name
//! at most once.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::trace;

/// One online player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub username: String,
    pub uuid: String,
    pub latency: i64,
    pub server: String,
    pub head_url: String,
}

/// Builds the avatar URL for `username` from the configured base.
pub fn avatar_url(base: &str, username: &str) -> String {
    format!("{base}{username}/16")
}

/// Online players grouped by server.
#[derive(Debug, Default)]
pub struct RosterStore {
    servers: RwLock<HashMap<String, Vec<RosterEntry>>>,
}

impl RosterStore {
    /// Creates an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `entry` into its server's list, replacing any entry with the
    /// same username.
    pub async fn upsert(&self, entry: RosterEntry) {
        let mut servers = self.servers.write().await;
        let players = servers.entry(entry.server.clone()).or_default();

        match players.iter_mut().find(|p| p.username == entry.username) {
            Some(existing) => *existing = entry,
            None => {
                trace!(server = %entry.server, "Player added to roster");
                players.push(entry);
            }
        }
    }

    /// Removes `username` from `server`. Returns true if it was present.
    pub async fn remove(&self, server: &str, username: &str) -> bool {
        let mut servers = self.servers.write().await;
        let Some(players) = servers.get_mut(server) else {
            return false;
        };
        let before = players.len();
        players.retain(|p| p.username != username);
        before != players.len()
    }

    /// Copy of `server`'s list, or `None` if the server was never seen.
    pub async fn snapshot(&self, server: &str) -> Option<Vec<RosterEntry>> {
        self.servers.read().await.get(server).cloned()
    }

    /// Finds `username` on any server.
    pub async fn find_by_username(&self, username: &str) -> Option<RosterEntry> {
        self.servers
            .read()
            .await
            .values()
            .flatten()
            .find(|p| p.username == username)
            .cloned()
    }

    /// Names of every server with a roster.
    pub async fn servers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Online players on `server`.
    pub async fn player_count(&self, server: &str) -> usize {
        self.servers.read().await.get(server).map_or(0, Vec::len)
    }

    /// Online players across all servers.
    pub async fn total_players(&self) -> usize {
        self.servers.read().await.values().map(Vec::len).sum()
    }
}

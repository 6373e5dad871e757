//! Mainframe Hub - Real-time session and event-routing hub.
//!
//! This crate joins Minecraft bots, a Discord bot, and dashboard clients over
//! WebSocket. It is responsible for:
//! - Assigning session ids and enforcing one bot per Minecraft server
//! - Authenticating sessions with hashed API keys
//! - Routing game and chat events through persistence and fan-out
//! - Tracking which players each server reports online
//!
//! # Architecture
//!
//! Connections feed a single ordered queue consumed by the
//! [`router::EventRouter`]. The router applies the identity, authentication,
//! permission, and quota gates, calls the [`store::Store`], updates the
//! [`roster::RosterStore`], and fans results out through each session's
//! bounded egress queue.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod roster;
pub mod router;
pub mod routes;
pub mod session;
pub mod store;
pub mod types;

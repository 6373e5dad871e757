//! Server configuration module.
//!
//! Parses configuration from environment variables for the Mainframe hub.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 8080 | HTTP server port |
//! | `MAINFRAME_ADMIN_TOKEN` | No | - | Enables `POST /api/v1/keys` when set |
//! | `MAINFRAME_AVATAR_URL` | No | `https://mc-heads.net/avatar/` | Base of roster avatar URLs |
//! | `MAINFRAME_EGRESS_CAPACITY` | No | 256 | Outbound frames queued per session |
//! | `MAINFRAME_INGRESS_CAPACITY` | No | 1024 | Inbound envelopes queued for the router |

use std::env;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default avatar service base URL.
pub const DEFAULT_AVATAR_URL: &str = "https://mc-heads.net/avatar/";

const DEFAULT_EGRESS_CAPACITY: usize = 256;

const DEFAULT_INGRESS_CAPACITY: usize = 1024;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Token required by the key issuance endpoint. `None` disables it.
    pub admin_token: Option<String>,

    /// Prefix for roster avatar URLs.
    pub avatar_base_url: String,

    /// Per-session outbound queue depth.
    pub egress_capacity: usize,

    /// Router inbound queue depth.
    pub ingress_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            admin_token: None,
            avatar_base_url: DEFAULT_AVATAR_URL.to_string(),
            egress_capacity: DEFAULT_EGRESS_CAPACITY,
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Port number is not a valid u16
    /// - A capacity is not a positive integer
    /// - The avatar URL is empty
    ///
    /// # Example
    ///
    /// ```no_run
    /// use mainframe_hub::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            admin_token: env::var("MAINFRAME_ADMIN_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            avatar_base_url: env::var("MAINFRAME_AVATAR_URL")
                .unwrap_or_else(|_| DEFAULT_AVATAR_URL.to_string()),
            egress_capacity: parse_capacity("MAINFRAME_EGRESS_CAPACITY", DEFAULT_EGRESS_CAPACITY)?,
            ingress_capacity: parse_capacity(
                "MAINFRAME_INGRESS_CAPACITY",
                DEFAULT_INGRESS_CAPACITY,
            )?,
        };

        config.validate()?;

        if config.admin_token.is_none() {
            warn!("MAINFRAME_ADMIN_TOKEN is not set - API key issuance is disabled");
        }

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.avatar_base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "MAINFRAME_AVATAR_URL must not be empty".to_string(),
            ));
        }

        if self.egress_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "MAINFRAME_EGRESS_CAPACITY must be greater than zero".to_string(),
            ));
        }

        if self.ingress_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "MAINFRAME_INGRESS_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_capacity(name: &str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: format!("expected a positive integer, got '{value}'"),
            }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

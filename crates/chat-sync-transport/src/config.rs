//! Client configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ReconnectPolicy};

/// Everything a [`ChatClient`](crate::ChatClient) needs to connect.
///
/// Loaded from JSON; every field except `url` has a default.
///
/// ```json
/// { "url": "ws://localhost:3000/ws", "reconnect": { "max_attempts": 8 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket endpoint.
    pub url: String,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Thread attached to outgoing chat messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl ClientConfig {
    /// Config for `url` with default reconnect behaviour.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            thread_id: None,
        }
    }

    /// Parse and validate a JSON config.
    ///
    /// # Errors
    /// Returns error if the JSON is invalid or fails validation.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading client config");
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check the config for internal consistency.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if the URL is not a WebSocket URL or
    /// the reconnect policy is inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "url must start with ws:// or wss://, got {}",
                self.url
            )));
        }
        self.reconnect.validate()
    }
}

//! Client configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) yields
//! a client pointed at `http://localhost:8000`.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Half-open window `[min_ms, max_ms)` from which a poll delay is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollWindow {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PollWindow {
    pub const MESSAGES: PollWindow = PollWindow { min_ms: 2_000, max_ms: 5_000 };
    pub const ROSTER: PollWindow = PollWindow { min_ms: 5_000, max_ms: 10_000 };

    /// Draw a fresh delay. Callers re-sample every cycle. An empty or
    /// inverted window yields `min_ms`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rng.gen_range(self.min_ms..self.max_ms))
    }

    fn validate(&self, name: &str) -> Result<(), ChatError> {
        if self.min_ms >= self.max_ms {
            return Err(ChatError::Config(format!(
                "{name}: min_ms ({}) must be below max_ms ({})",
                self.min_ms, self.max_ms
            )));
        }
        Ok(())
    }
}

/// Configuration for the synchronization core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the chat server's HTTP API.
    pub base_url: String,
    /// WebSocket endpoint. Derived from `base_url` when absent.
    pub ws_url: Option<String>,
    /// Open the realtime connection right after join instead of on the
    /// first private chat.
    pub connect_on_join: bool,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub message_poll: PollWindow,
    pub roster_poll: PollWindow,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            ws_url: None,
            connect_on_join: true,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            message_poll: PollWindow::MESSAGES,
            roster_poll: PollWindow::ROSTER,
        }
    }
}

impl ClientConfig {
    /// Defaults aimed at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ChatError> {
        let config: ClientConfig =
            toml::from_str(text).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.base_url.trim().is_empty() {
            return Err(ChatError::Config("base_url must not be empty".into()));
        }
        self.message_poll.validate("message_poll")?;
        self.roster_poll.validate("roster_poll")
    }

    /// The WebSocket endpoint: `ws_url` if set, else `base_url` with its
    /// scheme swapped and `/chats/ws` appended.
    pub fn websocket_url(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let swapped = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{swapped}/chats/ws")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

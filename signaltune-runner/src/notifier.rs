//! Outbound messaging channel.
//!
//! Sending is best-effort: [`send_notification`] truncates overlong text and
//! logs failures instead of returning them, so a dead channel never stops
//! the loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use signaltune_core::config::{NotifierConfig, NotifierKind};
use signaltune_core::store::truncate_chars;
use thiserror::Error;
use tracing::{info, warn};

/// Longest message the channel accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier is not configured: {0}")]
    NotConfigured(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel rejected message with status {0}")]
    Rejected(u16),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str) -> Result<(), NotifyError>;
}

/// Send `text`, truncated to [`MAX_MESSAGE_CHARS`]. Failures are logged.
pub fn send_notification(notifier: &dyn Notifier, text: &str) {
    let text = truncate_chars(text, MAX_MESSAGE_CHARS);
    if let Err(e) = notifier.notify(text) {
        warn!(error = %e, "notification failed");
    }
}

/// Writes messages to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, text: &str) -> Result<(), NotifyError> {
        info!(target: "signaltune::notify", "{text}");
        Ok(())
    }
}

/// Keeps every message in memory. Useful for dry runs and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, text: &str) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
        Ok(())
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Bot-style HTTP API: `POST <api_base>/bot<token>/sendMessage`.
pub struct HttpNotifier {
    client: reqwest::blocking::Client,
    url: String,
    chat_id: String,
}

impl std::fmt::Debug for HttpNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL embeds the bot token.
        f.debug_struct("HttpNotifier")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

impl HttpNotifier {
    pub fn new(
        api_base: &str,
        token: &str,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
            chat_id: chat_id.into(),
        })
    }

    pub fn from_config(config: &NotifierConfig) -> Result<Self, NotifyError> {
        let token = config
            .bot_token
            .as_deref()
            .ok_or_else(|| NotifyError::NotConfigured("missing bot_token".into()))?;
        let chat_id = config
            .chat_id
            .clone()
            .ok_or_else(|| NotifyError::NotConfigured("missing chat_id".into()))?;
        Self::new(&config.api_base, token, chat_id, config.timeout())
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, text: &str) -> Result<(), NotifyError> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| NotifyError::Http(e.without_url()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Build the notifier selected by the config.
pub fn notifier_from_config(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    match config.kind {
        NotifierKind::Log => Ok(Arc::new(LogNotifier)),
        NotifierKind::Http => Ok(Arc::new(HttpNotifier::from_config(config)?)),
    }
}

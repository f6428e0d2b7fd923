//! The chat transport as seen by the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::TransportError;
use crate::store::{MediaKind, MessageRecord, SenderRole};

/// Whether a thread is a direct conversation or a group-like chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Direct,
    /// Groups, supergroups and channels.
    Group,
}

/// A message delivered by the transport.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub thread_id: i64,
    pub thread_kind: ThreadKind,
    #[serde(default)]
    pub thread_title: Option<String>,
    pub message_id: i64,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub photo: bool,
    /// Media other than a photo, when present.
    #[serde(default)]
    pub media_kind: Option<MediaKind>,
    #[serde(default)]
    pub is_forward: bool,
    #[serde(default)]
    pub forward_source: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<i64>,
}

impl InboundMessage {
    /// Non-empty text, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn has_media(&self) -> bool {
        self.photo || self.media_kind.is_some()
    }

    /// Convert to the stored form. `self_id` marks the persona's own messages.
    pub fn to_record(&self, self_id: Option<i64>) -> MessageRecord {
        let sender = match (self.sender_id, self_id) {
            (Some(sender), Some(me)) if sender == me => SenderRole::Persona,
            _ => match self.thread_kind {
                ThreadKind::Direct => SenderRole::Contact,
                ThreadKind::Group => SenderRole::Other,
            },
        };
        MessageRecord {
            message_id: self.message_id,
            sender,
            timestamp: self.timestamp,
            text: self.text.clone().unwrap_or_default(),
            is_forward: self.is_forward,
            forward_source: self.forward_source.clone(),
            reply_to_id: self.reply_to_id,
            media_attached: self.has_media(),
            photo_attached: self.photo,
            media_kind: if self.photo {
                Some(MediaKind::Photo)
            } else {
                self.media_kind
            },
        }
    }
}

/// Confirmation of a delivered message.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// A conversation known to the transport.
#[derive(Debug, Clone, Deserialize)]
pub struct DialogInfo {
    pub thread_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    /// One-to-one conversation with a user account.
    pub is_user: bool,
    #[serde(default)]
    pub is_bot: bool,
    /// The account behind the dialog was deleted.
    #[serde(default)]
    pub deactivated: bool,
}

/// Past messages of one thread.
#[derive(Debug, Clone)]
pub struct ThreadHistory {
    pub title: Option<String>,
    pub messages: Vec<InboundMessage>,
}

/// Delivery and lookup operations the engine needs from the chat transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Make sure the thread can be addressed.
    async fn resolve(&self, thread_id: i64) -> Result<(), TransportError>;

    /// Show a typing indicator. Callers ignore failures.
    async fn set_typing(&self, thread_id: i64) -> Result<(), TransportError>;

    async fn send_text(&self, thread_id: i64, text: &str) -> Result<SentMessage, TransportError>;

    /// Raw bytes of the photo attached to a message.
    async fn download_photo(&self, thread_id: i64, message_id: i64)
        -> Result<Vec<u8>, TransportError>;

    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, TransportError>;

    /// Up to `limit` most recent messages of a thread.
    async fn fetch_history(&self, thread_id: i64, limit: usize)
        -> Result<ThreadHistory, TransportError>;

    /// Message the persona's operator out of band.
    async fn notify_operator(&self, text: &str) -> Result<(), TransportError>;
}

//! JSON protocol types for communication with the transport bridge.
//!
//! The bridge sends JSON-line events to stdout and receives commands via stdin.
//! Request/response pairs carry a `request_id` chosen by this side.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::transport::{DialogInfo, InboundMessage};

/// Events sent from the bridge (via stdout)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Logged in; carries the persona's own account id
    Connected { self_id: i64, name: Option<String> },

    /// Received a message
    Message(InboundMessage),

    /// Result of a send request
    SendResult {
        request_id: i32,
        success: bool,
        message_id: Option<i64>,
        /// Unix seconds
        timestamp: Option<i64>,
        failure: Option<FailureInfo>,
    },

    /// Result of a resolve request
    Resolved {
        request_id: i32,
        success: bool,
        failure: Option<FailureInfo>,
    },

    /// Conversation list
    Dialogs {
        request_id: i32,
        dialogs: Vec<DialogInfo>,
    },

    /// Downloaded media
    Media {
        request_id: i32,
        /// Base64 encoded bytes
        data: Option<String>,
        failure: Option<FailureInfo>,
    },

    /// Past messages of a thread
    History {
        request_id: i32,
        title: Option<String>,
        #[serde(default)]
        messages: Vec<InboundMessage>,
        failure: Option<FailureInfo>,
    },

    /// Error occurred
    Error { code: String, message: String },

    /// Informational log message
    Log { level: String, message: String },

    /// Session logged out
    LoggedOut { reason: String },
}

impl BridgeEvent {
    /// Request id for events answering a command.
    pub fn request_id(&self) -> Option<i32> {
        match self {
            BridgeEvent::SendResult { request_id, .. }
            | BridgeEvent::Resolved { request_id, .. }
            | BridgeEvent::Dialogs { request_id, .. }
            | BridgeEvent::Media { request_id, .. }
            | BridgeEvent::History { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// Why a request failed on the bridge side
#[derive(Debug, Clone, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    #[serde(default)]
    pub message: String,
    /// Present for rate limits
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unresolvable,
    Blocked,
    Forbidden,
    RateLimited,
    Other,
}

impl FailureInfo {
    pub fn into_error(self, thread_id: i64) -> TransportError {
        match self.kind {
            FailureKind::Unresolvable => TransportError::Unresolvable(thread_id),
            FailureKind::Blocked | FailureKind::Forbidden => {
                TransportError::Forbidden(format!("{:?}: {}", self.kind, self.message))
            }
            FailureKind::RateLimited => {
                TransportError::RateLimited(Duration::from_secs(self.retry_after_secs.unwrap_or(1)))
            }
            FailureKind::Other => TransportError::Other(self.message),
        }
    }
}

/// Commands sent to the bridge (via stdin)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    /// Send a text message
    Send {
        request_id: i32,
        to: i64,
        text: String,
    },

    /// Show the typing indicator
    Typing { to: i64 },

    /// Make sure a peer is addressable
    Resolve { request_id: i32, to: i64 },

    /// List known conversations
    ListDialogs { request_id: i32 },

    /// Download the photo attached to a message
    DownloadMedia {
        request_id: i32,
        chat: i64,
        message_id: i64,
    },

    /// Fetch the most recent messages of a thread
    FetchHistory {
        request_id: i32,
        chat: i64,
        limit: usize,
    },

    /// Disconnect and exit
    Disconnect,
}

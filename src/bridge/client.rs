//! [`Transport`] over the bridge's command/event protocol.
//!
//! Commands that expect an answer carry a request id. The dispatcher hands
//! every answering event to [`BridgeTransport::complete`], which wakes the
//! request waiting for that id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{TimeZone, Utc};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, warn};

use super::protocol::{BridgeCommand, BridgeEvent, FailureInfo};
use crate::error::TransportError;
use crate::transport::{DialogInfo, SentMessage, ThreadHistory, Transport};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BridgeTransport {
    commands: mpsc::Sender<BridgeCommand>,
    pending: RwLock<HashMap<i32, oneshot::Sender<BridgeEvent>>>,
    request_id_counter: AtomicI32,
    operator_thread: Option<i64>,
    response_timeout: Duration,
}

impl BridgeTransport {
    pub fn new(
        commands: mpsc::Sender<BridgeCommand>,
        operator_thread: Option<i64>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            commands,
            pending: RwLock::new(HashMap::new()),
            request_id_counter: AtomicI32::new(1),
            operator_thread,
            response_timeout,
        }
    }

    fn next_request_id(&self) -> i32 {
        self.request_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_command(&self, cmd: BridgeCommand) -> Result<(), TransportError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| TransportError::Other("bridge is not running".to_string()))
    }

    /// Send a command built with a fresh request id and wait for its answer.
    async fn request<F>(&self, build: F) -> Result<BridgeEvent, TransportError>
    where
        F: FnOnce(i32) -> BridgeCommand,
    {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id, tx);

        if let Err(e) = self.send_command(build(request_id)).await {
            self.pending.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(TransportError::Other("response channel closed".to_string())),
            Err(_) => {
                self.pending.write().await.remove(&request_id);
                warn!("Bridge request {} timed out", request_id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Deliver an answering event to its request. Returns the event when
    /// nothing is waiting for it.
    pub async fn complete(&self, event: BridgeEvent) -> Option<BridgeEvent> {
        let Some(request_id) = event.request_id() else {
            return Some(event);
        };
        let waiter = self.pending.write().await.remove(&request_id);
        match waiter {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Request {} was abandoned before its answer", request_id);
                }
                None
            }
            None => Some(event),
        }
    }
}

fn failure(failure: Option<FailureInfo>, thread_id: i64, what: &str) -> TransportError {
    match failure {
        Some(info) => info.into_error(thread_id),
        None => TransportError::Other(format!("{} failed without details", what)),
    }
}

fn unexpected(event: BridgeEvent) -> TransportError {
    error!("Unexpected bridge response: {:?}", event);
    TransportError::Other("unexpected bridge response".to_string())
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn resolve(&self, thread_id: i64) -> Result<(), TransportError> {
        match self
            .request(|request_id| BridgeCommand::Resolve {
                request_id,
                to: thread_id,
            })
            .await?
        {
            BridgeEvent::Resolved { success: true, .. } => Ok(()),
            BridgeEvent::Resolved { failure: info, .. } => {
                Err(info.map_or(TransportError::Unresolvable(thread_id), |i| {
                    i.into_error(thread_id)
                }))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn set_typing(&self, thread_id: i64) -> Result<(), TransportError> {
        self.send_command(BridgeCommand::Typing { to: thread_id }).await
    }

    async fn send_text(&self, thread_id: i64, text: &str) -> Result<SentMessage, TransportError> {
        let event = self
            .request(|request_id| BridgeCommand::Send {
                request_id,
                to: thread_id,
                text: text.to_string(),
            })
            .await?;

        match event {
            BridgeEvent::SendResult {
                success: true,
                message_id: Some(message_id),
                timestamp,
                ..
            } => {
                let timestamp = timestamp
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                    .unwrap_or_else(Utc::now);
                Ok(SentMessage {
                    message_id,
                    timestamp,
                })
            }
            BridgeEvent::SendResult { failure: info, .. } => Err(failure(info, thread_id, "send")),
            other => Err(unexpected(other)),
        }
    }

    async fn download_photo(
        &self,
        thread_id: i64,
        message_id: i64,
    ) -> Result<Vec<u8>, TransportError> {
        let event = self
            .request(|request_id| BridgeCommand::DownloadMedia {
                request_id,
                chat: thread_id,
                message_id,
            })
            .await?;

        match event {
            BridgeEvent::Media {
                data: Some(data), ..
            } => STANDARD
                .decode(data.as_bytes())
                .map_err(|e| TransportError::Other(format!("invalid media encoding: {}", e))),
            BridgeEvent::Media { failure: info, .. } => {
                Err(failure(info, thread_id, "media download"))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, TransportError> {
        match self
            .request(|request_id| BridgeCommand::ListDialogs { request_id })
            .await?
        {
            BridgeEvent::Dialogs { dialogs, .. } => Ok(dialogs),
            other => Err(unexpected(other)),
        }
    }

    async fn fetch_history(
        &self,
        thread_id: i64,
        limit: usize,
    ) -> Result<ThreadHistory, TransportError> {
        let event = self
            .request(|request_id| BridgeCommand::FetchHistory {
                request_id,
                chat: thread_id,
                limit,
            })
            .await?;

        match event {
            BridgeEvent::History {
                failure: Some(info),
                ..
            } => Err(info.into_error(thread_id)),
            BridgeEvent::History {
                title, messages, ..
            } => Ok(ThreadHistory { title, messages }),
            other => Err(unexpected(other)),
        }
    }

    async fn notify_operator(&self, text: &str) -> Result<(), TransportError> {
        let Some(operator) = self.operator_thread else {
            warn!("No operator thread configured, notification dropped:\n{}", text);
            return Ok(());
        };
        self.send_text(operator, text).await.map(|_| ())
    }
}

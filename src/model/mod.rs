//! Language model access.
//!
//! Providers implement [`LanguageModelClient`] and report failures as
//! [`ProviderError`]. The engine never talks to a provider directly: it goes
//! through [`ReliableModel`], which retries transient failures with jittered
//! exponential backoff and collapses the outcome into `Option<String>`.

pub mod claude;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::error::ProviderError;
use crate::store::{MessageRecord, SenderRole};

pub use claude::ClaudeClient;

/// Image attached to the inbound message.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub thread_id: i64,
    /// Persona instructions, possibly followed by a task-specific instruction.
    pub instructions: String,
    /// Recent messages, oldest first.
    pub context: Vec<MessageRecord>,
    /// Text of the message being answered. `None` for initiations.
    pub input_text: Option<String>,
    pub image: Option<ImageInput>,
    /// The operator lifted content restrictions for this thread.
    pub relaxed_safety: bool,
}

/// A text generation backend.
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// Retry parameters for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Provider wrapper that applies the retry policy.
pub struct ReliableModel {
    inner: Arc<dyn LanguageModelClient>,
    retry: RetryConfig,
}

impl ReliableModel {
    pub fn new(inner: Arc<dyn LanguageModelClient>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    /// Generate text, or `None` when the provider refused or kept failing.
    pub async fn generate(&self, request: &GenerationRequest) -> Option<String> {
        let thread = request.thread_id;
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            debug!(
                "[generate {}] attempt {}/{}",
                thread,
                attempt + 1,
                attempts
            );
            match self.inner.generate(request).await {
                Ok(text) => {
                    info!("[generate {}] response received", thread);
                    return Some(text);
                }
                Err(ProviderError::ContentPolicy(reason)) => {
                    warn!("[generate {}] blocked by content policy: {}", thread, reason);
                    return None;
                }
                Err(e) if e.is_retryable() => {
                    if attempt + 1 == attempts {
                        error!(
                            "[generate {}] giving up after {} attempts: {}",
                            thread, attempts, e
                        );
                        return None;
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "[generate {}] {} - retrying in {:.2}s",
                        thread,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("[generate {}] {}", thread, e);
                    return None;
                }
            }
        }
        None
    }
}

/// Render recent messages as a transcript for the prompt.
pub fn format_context(context: &[MessageRecord]) -> String {
    if context.is_empty() {
        return "There is no earlier message history in this conversation.".to_string();
    }

    let mut lines = vec!["Here are the latest messages in this conversation:".to_string()];
    for msg in context {
        let prefix = match msg.sender {
            SenderRole::Persona => "You:",
            SenderRole::Contact => "Contact:",
            SenderRole::Other => "Participant:",
        };
        let text = if msg.text.is_empty() {
            "[message without text]"
        } else {
            msg.text.as_str()
        };

        let mut meta = Vec::new();
        if let Some(reply_to) = msg.reply_to_id {
            meta.push(format!("(reply to {})", reply_to));
        }
        if msg.is_forward {
            meta.push(format!(
                "(forwarded from {})",
                msg.forward_source.as_deref().unwrap_or("?")
            ));
        }
        if msg.media_attached {
            meta.push("(with media)".to_string());
        }

        let line = format!("{} {} {}", prefix, text, meta.join(" "));
        lines.push(line.trim_end().to_string());
    }
    lines.join("\n")
}

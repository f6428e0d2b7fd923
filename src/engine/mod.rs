//! Interaction engine: turns inbound messages into persona replies.
//!
//! Each inbound event passes the gating checks, the detection state machine
//! and the per-kind reply policy. Every generate+send, whether a reply, a
//! deflection or an initiation, holds a permit from one shared pool.

pub mod prompts;
pub mod state;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::TransportError;
use crate::model::{GenerationRequest, ImageInput, ReliableModel};
use crate::scheduler::{InitiationScheduler, SchedulerHandle};
use crate::scoring::ScoringEngine;
use crate::settings::{Settings, SettingsManager};
use crate::store::{ConversationStore, MessageRecord};
use crate::transport::{InboundMessage, SentMessage, ThreadKind, Transport};

use state::{ConversationRuntimeState, DetectionOutcome};
#[cfg(test)]
use state::Phase;

/// Phrases that suggest the other side suspects automation. Matched as
/// lowercase substrings.
pub const DEFAULT_DETECTION_KEYWORDS: &[&str] = &[
    "are you a bot",
    "you are a bot",
    "you're a bot",
    "are you an ai",
    "are you ai",
    "chatgpt",
    "autoresponder",
    "ты бот",
    "ты ии",
    "ты ai",
    "автоответчик",
];

/// Policy constants of the engine and the initiation loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deflections before a thread is suppressed.
    pub detection_threshold: u32,
    pub detection_keywords: Vec<String>,
    /// Size of the shared generation permit pool.
    pub max_concurrent_replies: usize,
    pub permit_timeout: Duration,
    pub direct_context: usize,
    pub group_context: usize,
    pub reply_delay_min: Duration,
    pub reply_delay_max: Duration,
    /// Silence required before the persona reopens a thread.
    pub quiet_period: chrono::Duration,
    /// Minimum time between two initiations in one thread.
    pub initiation_spacing: chrono::Duration,
    pub initiation_context: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 3,
            detection_keywords: DEFAULT_DETECTION_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            max_concurrent_replies: 5,
            permit_timeout: Duration::from_secs(60),
            direct_context: 10,
            group_context: 30,
            reply_delay_min: Duration::from_millis(500),
            reply_delay_max: Duration::from_millis(2500),
            quiet_period: chrono::Duration::hours(12),
            initiation_spacing: chrono::Duration::hours(24),
            initiation_context: 5,
        }
    }
}

impl EngineConfig {
    fn sample_reply_delay(&self) -> Duration {
        let (lo, hi) = (self.reply_delay_min, self.reply_delay_max);
        if hi <= lo {
            return lo;
        }
        let secs = rand::thread_rng().gen_range(lo.as_secs_f64()..=hi.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Drives replies, deflections and the initiation loop for one persona.
pub struct InteractionEngine {
    config: EngineConfig,
    store: Arc<ConversationStore>,
    scoring: Arc<ScoringEngine>,
    model: Arc<ReliableModel>,
    transport: Arc<dyn Transport>,
    settings: SettingsManager,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    self_id: RwLock<Option<i64>>,
    running: AtomicBool,
    runtime: Mutex<HashMap<i64, ConversationRuntimeState>>,
    scheduler: tokio::sync::Mutex<Option<SchedulerHandle>>,
}

impl InteractionEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<ConversationStore>,
        scoring: Arc<ScoringEngine>,
        model: Arc<ReliableModel>,
        transport: Arc<dyn Transport>,
        settings: SettingsManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_replies.max(1)));
        Self {
            config,
            store,
            scoring,
            model,
            transport,
            settings,
            clock,
            permits,
            self_id: RwLock::new(None),
            running: AtomicBool::new(false),
            runtime: Mutex::new(HashMap::new()),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn scoring(&self) -> &Arc<ScoringEngine> {
        &self.scoring
    }

    pub fn model(&self) -> &ReliableModel {
        &self.model
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn settings(&self) -> &SettingsManager {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ========== Lifecycle ==========

    /// Record the persona's own account id, as reported by the transport.
    pub fn set_self_id(&self, id: i64) {
        let mut guard = match self.self_id.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(id);
        info!("Operating as account {}", id);
    }

    pub fn self_id(&self) -> Option<i64> {
        match self.self_id.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Whether events are being handled: started and still enabled in settings.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.settings.is_persona_active()
    }

    /// Turn the persona on and start the initiation loop.
    pub async fn activate(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            warn!("Persona is already active");
            return Ok(());
        }
        if self.self_id().is_none() {
            self.settings.update(|s| s.persona_active = false).await?;
            bail!("Cannot activate persona: own account id is not known yet");
        }

        self.settings.update(|s| s.persona_active = true).await?;
        self.running.store(true, Ordering::SeqCst);
        *scheduler = Some(InitiationScheduler::spawn(Arc::clone(self)));
        info!("Persona activated");
        Ok(())
    }

    /// Turn the persona off. Waits for the initiation loop to finish and
    /// forgets all runtime state.
    pub async fn deactivate(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if self.settings.is_persona_active() {
            self.settings.update(|s| s.persona_active = false).await?;
        }
        self.stop().await;
        info!("Persona deactivated");
        Ok(())
    }

    /// Stop handling events without touching the persisted active flag, so
    /// the next start resumes the persona.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop().await;
    }

    async fn stop(&self) {
        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.runtime_states().clear();
    }

    // ========== Runtime state ==========

    fn runtime_states(&self) -> MutexGuard<'_, HashMap<i64, ConversationRuntimeState>> {
        match self.runtime.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Detection phase of a thread, if it has runtime state.
    #[cfg(test)]
    pub fn phase(&self, thread_id: i64) -> Option<Phase> {
        self.runtime_states().get(&thread_id).map(|s| s.phase())
    }

    pub fn is_suppressed(&self, thread_id: i64, now: DateTime<Utc>) -> bool {
        self.runtime_states()
            .get(&thread_id)
            .is_some_and(|s| s.is_suppressed_at(now))
    }

    pub fn last_initiation(&self, thread_id: i64) -> Option<DateTime<Utc>> {
        self.runtime_states()
            .get(&thread_id)
            .and_then(|s| s.last_initiation)
    }

    pub fn record_initiation(&self, thread_id: i64, at: DateTime<Utc>) {
        self.runtime_states()
            .entry(thread_id)
            .or_default()
            .last_initiation = Some(at);
    }

    // ========== Inbound events ==========

    /// Handle one inbound message. Failures are logged and the event dropped.
    pub async fn handle_event(&self, msg: InboundMessage) {
        let thread = msg.thread_id;
        let Some(self_id) = self.accepts(&msg) else {
            return;
        };
        let settings = self.settings.snapshot();
        let now = self.clock.now();

        // Lazy cooldown expiry, then the detection check, under one lock
        let detection = {
            let mut states = self.runtime_states();
            let state = states.entry(thread).or_default();
            if state.reconcile(now) {
                debug!("[event {}] suppressed, ignoring message {}", thread, msg.message_id);
                return;
            }
            debug!("[event {}] phase {:?}", thread, state.phase());

            let matched = self.matched_keywords(&msg);
            if matched.is_empty() {
                None
            } else {
                let cooldown = settings
                    .detection_cooldown_hours
                    .sample(&mut rand::thread_rng());
                let outcome =
                    state.register_detection(now, self.config.detection_threshold, cooldown);
                Some((outcome, matched))
            }
        };

        if let Some((outcome, matched)) = detection {
            warn!(
                "[event {}] possible automation suspicion from {:?}: {:?}",
                thread, msg.sender_id, matched
            );
            self.persist_inbound(&msg, self_id);
            match outcome {
                DetectionOutcome::Deflect(hits) => {
                    info!("[event {}] deflecting, attempt {}", thread, hits);
                    self.deflect(&msg, &matched, &settings).await;
                }
                DetectionOutcome::Suppress(until) => {
                    warn!("[event {}] threshold exceeded, silent until {}", thread, until);
                    self.notify_suppression(&msg, until).await;
                }
            }
            return;
        }

        let should_reply = match msg.thread_kind {
            ThreadKind::Group => {
                let frequency = settings.group_reply_frequency;
                self.runtime_states()
                    .entry(thread)
                    .or_default()
                    .count_group_message(frequency)
            }
            ThreadKind::Direct => msg.text().is_some() || msg.photo,
        };

        if should_reply {
            self.reply(&msg, self_id, &settings).await;
        } else {
            debug!("[event {}] storing message {} without reply", thread, msg.message_id);
            self.persist_inbound(&msg, self_id);
        }
    }

    /// Gating checks. Returns the persona's own id when the message should be handled.
    fn accepts(&self, msg: &InboundMessage) -> Option<i64> {
        let thread = msg.thread_id;
        if !self.is_running() {
            debug!("[event {}] persona inactive", thread);
            return None;
        }
        let Some(self_id) = self.self_id() else {
            warn!("[event {}] own account id unknown", thread);
            return None;
        };
        match msg.sender_id {
            Some(sender) if sender != self_id => {}
            other => {
                debug!("[event {}] ignoring message from {:?}", thread, other);
                return None;
            }
        }
        if self.settings.snapshot().excluded_threads.contains(&thread) {
            debug!("[event {}] thread excluded", thread);
            return None;
        }
        Some(self_id)
    }

    fn matched_keywords<'a>(&'a self, msg: &InboundMessage) -> Vec<&'a str> {
        let Some(text) = msg.text() else {
            return Vec::new();
        };
        let lower = text.to_lowercase();
        self.config
            .detection_keywords
            .iter()
            .filter(|k| lower.contains(k.as_str()))
            .map(String::as_str)
            .collect()
    }

    fn persist_inbound(&self, msg: &InboundMessage, self_id: i64) {
        self.spawn_append(msg.thread_id, msg.to_record(Some(self_id)));
    }

    /// Append a message in the background.
    fn spawn_append(&self, thread_id: i64, record: MessageRecord) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let message_id = record.message_id;
            if let Err(e) = store.append(thread_id, record).await {
                error!("[store {}] failed to append message {}: {}", thread_id, message_id, e);
            }
        });
    }

    /// Take a generation permit, or `None` if none frees up in time.
    pub async fn acquire_permit(&self, thread_id: i64) -> Option<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        match tokio::time::timeout(self.config.permit_timeout, acquire).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => {
                error!("[permit {}] permit pool closed", thread_id);
                None
            }
            Err(_) => {
                error!(
                    "[permit {}] no free permit within {:?}, dropping event",
                    thread_id, self.config.permit_timeout
                );
                None
            }
        }
    }

    // ========== Replies ==========

    async fn reply(&self, msg: &InboundMessage, self_id: i64, settings: &Settings) {
        let thread = msg.thread_id;
        let Some(_permit) = self.acquire_permit(thread).await else {
            return;
        };
        let started = std::time::Instant::now();

        let context_size = match msg.thread_kind {
            ThreadKind::Direct => self.config.direct_context,
            ThreadKind::Group => self.config.group_context,
        };
        // Context is read before the message itself is stored
        let context = self.store.load(thread).await.tail(context_size).to_vec();
        self.persist_inbound(msg, self_id);

        let text = match settings.instructions() {
            Some(instructions) => {
                let image = if msg.photo {
                    self.fetch_image(thread, msg.message_id).await
                } else {
                    None
                };
                let input_text = msg.text().map(String::from);
                if input_text.is_none() && image.is_none() {
                    warn!("[reply {}] nothing to answer to after media failure", thread);
                    None
                } else {
                    let request = GenerationRequest {
                        thread_id: thread,
                        instructions: instructions.to_string(),
                        context,
                        input_text,
                        image,
                        relaxed_safety: settings.restricted_threads.contains(&thread),
                    };
                    self.model.generate(&request).await
                }
            }
            None => {
                error!("[reply {}] persona instructions are missing", thread);
                None
            }
        };

        self.send_or_fallback(thread, text, settings).await;
        debug!(
            "[reply {}] finished in {:.2}s",
            thread,
            started.elapsed().as_secs_f64()
        );
    }

    async fn fetch_image(&self, thread_id: i64, message_id: i64) -> Option<ImageInput> {
        match self.transport.download_photo(thread_id, message_id).await {
            Ok(bytes) => {
                debug!("[reply {}] downloaded photo ({} bytes)", thread_id, bytes.len());
                Some(ImageInput {
                    bytes,
                    mime_type: "image/jpeg".to_string(),
                })
            }
            Err(e) => {
                warn!("[reply {}] photo download failed: {}", thread_id, e);
                None
            }
        }
    }

    async fn deflect(&self, msg: &InboundMessage, matched: &[&str], settings: &Settings) {
        let thread = msg.thread_id;
        let Some(_permit) = self.acquire_permit(thread).await else {
            return;
        };

        let text = match settings.instructions() {
            Some(instructions) => {
                let request = GenerationRequest {
                    thread_id: thread,
                    instructions: prompts::with_task(instructions, &prompts::deflection(matched)),
                    context: Vec::new(),
                    input_text: msg.text().map(String::from),
                    image: None,
                    relaxed_safety: settings.restricted_threads.contains(&thread),
                };
                self.model.generate(&request).await
            }
            None => {
                error!("[deflect {}] persona instructions are missing", thread);
                None
            }
        };
        self.send_or_fallback(thread, text, settings).await;
    }

    /// Send generated text, or a canned reply when generation produced nothing.
    async fn send_or_fallback(&self, thread_id: i64, generated: Option<String>, settings: &Settings) {
        let text = match generated {
            Some(text) => text,
            None => match settings.random_canned_reply() {
                Some(canned) => {
                    warn!("[send {}] generation failed, using canned reply", thread_id);
                    canned
                }
                None => {
                    error!("[send {}] generation failed and no canned replies configured", thread_id);
                    return;
                }
            },
        };

        if let Err(e) = self.deliver(thread_id, &text).await {
            error!("[send {}] delivery failed: {}", thread_id, e);
        }
    }

    async fn notify_suppression(&self, msg: &InboundMessage, until: DateTime<Utc>) {
        let thread = msg.thread_id;
        let title = msg.thread_title.as_deref().unwrap_or("unknown thread");
        let sender = msg.sender_name.as_deref().unwrap_or("unknown sender");
        let text = format!(
            "Possible automation suspicion!\n\
             Thread: {} (id {})\n\
             Sender: {} (id {})\n\
             Message: '{}'\n\
             The persona is silent in this thread until {}",
            title,
            thread,
            sender,
            msg.sender_id.unwrap_or_default(),
            msg.text().unwrap_or_default(),
            until.format("%Y-%m-%d %H:%M:%S UTC")
        );
        match self.transport.notify_operator(&text).await {
            Ok(()) => info!("[notify {}] operator notified", thread),
            Err(e) => error!("[notify {}] failed to notify operator: {}", thread, e),
        }
    }

    // ========== Delivery ==========

    /// Send a message the way a person would: typing indicator, a short
    /// pause, then the text. The sent message is stored in the background.
    ///
    /// A rate limit is waited out once, then the send is abandoned.
    pub async fn deliver(&self, thread_id: i64, text: &str) -> Result<SentMessage, TransportError> {
        if text.trim().is_empty() {
            return Err(TransportError::Other("refusing to send an empty message".into()));
        }
        self.transport.resolve(thread_id).await?;

        if let Err(e) = self.transport.set_typing(thread_id).await {
            debug!("[send {}] typing indicator unavailable: {}", thread_id, e);
        }
        tokio::time::sleep(self.config.sample_reply_delay()).await;

        match self.transport.send_text(thread_id, text).await {
            Ok(sent) => {
                info!(
                    "[send {}] sent message {}: '{}'",
                    thread_id,
                    sent.message_id,
                    text.chars().take(50).collect::<String>()
                );
                self.spawn_append(
                    thread_id,
                    MessageRecord::outgoing(sent.message_id, sent.timestamp, text),
                );
                Ok(sent)
            }
            Err(TransportError::RateLimited(wait)) => {
                warn!("[send {}] rate limited for {:?}, abandoning after the wait", thread_id, wait);
                tokio::time::sleep(wait + Duration::from_secs(1)).await;
                Err(TransportError::RateLimited(wait))
            }
            Err(e) => Err(e),
        }
    }
}

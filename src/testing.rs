//! Test doubles for the external collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::clock::Clock;
use crate::engine::{EngineConfig, InteractionEngine};
use crate::error::{ProviderError, TransportError};
use crate::model::{GenerationRequest, LanguageModelClient, ReliableModel, RetryConfig};
use crate::scoring::{ScoringConfig, ScoringEngine};
use crate::settings::{Settings, SettingsManager};
use crate::store::ConversationStore;
use crate::transport::{
    DialogInfo, InboundMessage, SentMessage, ThreadHistory, ThreadKind, Transport,
};

/// Model that plays back a fixed script, then a fallback reply.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `text`.
    pub fn always(text: &str) -> Self {
        Self {
            fallback: Some(text.to_string()),
            ..Self::new(vec![])
        }
    }

    /// Hold every call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModelClient for ScriptedModel {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(ProviderError::Other("script exhausted".into())),
            },
        }
    }
}

/// Transport that records everything it is asked to do.
pub struct MockTransport {
    sent: Mutex<Vec<(i64, String)>>,
    typing: Mutex<Vec<i64>>,
    notifications: Mutex<Vec<String>>,
    dialogs: Mutex<Vec<DialogInfo>>,
    histories: Mutex<HashMap<i64, ThreadHistory>>,
    send_failures: Mutex<VecDeque<TransportError>>,
    unresolvable: Mutex<HashSet<i64>>,
    photo: Mutex<Option<Vec<u8>>>,
    typing_fails: bool,
    send_attempts: AtomicUsize,
    next_id: AtomicI64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            dialogs: Mutex::new(Vec::new()),
            histories: Mutex::new(HashMap::new()),
            send_failures: Mutex::new(VecDeque::new()),
            unresolvable: Mutex::new(HashSet::new()),
            photo: Mutex::new(None),
            typing_fails: false,
            send_attempts: AtomicUsize::new(0),
            next_id: AtomicI64::new(1000),
        }
    }

    /// Typing indicator requests fail.
    pub fn with_failing_typing(mut self) -> Self {
        self.typing_fails = true;
        self
    }

    pub fn set_dialogs(&self, dialogs: Vec<DialogInfo>) {
        *self.dialogs.lock().unwrap() = dialogs;
    }

    pub fn set_history(&self, thread_id: i64, history: ThreadHistory) {
        self.histories.lock().unwrap().insert(thread_id, history);
    }

    pub fn set_photo(&self, bytes: Vec<u8>) {
        *self.photo.lock().unwrap() = Some(bytes);
    }

    /// The next send fails with `error`.
    pub fn fail_next_send(&self, error: TransportError) {
        self.send_failures.lock().unwrap().push_back(error);
    }

    pub fn mark_unresolvable(&self, thread_id: i64) {
        self.unresolvable.lock().unwrap().insert(thread_id);
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, thread_id: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| *id == thread_id)
            .map(|(_, text)| text)
            .collect()
    }

    pub fn typing_calls(&self) -> Vec<i64> {
        self.typing.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn resolve(&self, thread_id: i64) -> Result<(), TransportError> {
        if self.unresolvable.lock().unwrap().contains(&thread_id) {
            return Err(TransportError::Unresolvable(thread_id));
        }
        Ok(())
    }

    async fn set_typing(&self, thread_id: i64) -> Result<(), TransportError> {
        self.typing.lock().unwrap().push(thread_id);
        if self.typing_fails {
            return Err(TransportError::Other("typing unavailable".into()));
        }
        Ok(())
    }

    async fn send_text(&self, thread_id: i64, text: &str) -> Result<SentMessage, TransportError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push((thread_id, text.to_string()));
        Ok(SentMessage {
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
        })
    }

    async fn download_photo(
        &self,
        _thread_id: i64,
        message_id: i64,
    ) -> Result<Vec<u8>, TransportError> {
        self.photo
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportError::Other(format!("no media for message {}", message_id)))
    }

    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, TransportError> {
        Ok(self.dialogs.lock().unwrap().clone())
    }

    async fn fetch_history(
        &self,
        thread_id: i64,
        limit: usize,
    ) -> Result<ThreadHistory, TransportError> {
        let history = self.histories.lock().unwrap().get(&thread_id).cloned();
        let mut history = history.ok_or(TransportError::Unresolvable(thread_id))?;
        let start = history.messages.len().saturating_sub(limit);
        history.messages.drain(..start);
        Ok(history)
    }

    async fn notify_operator(&self, text: &str) -> Result<(), TransportError> {
        self.notifications.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// An inbound text message.
pub fn inbound(
    thread_id: i64,
    kind: ThreadKind,
    message_id: i64,
    sender_id: i64,
    text: &str,
) -> InboundMessage {
    InboundMessage {
        thread_id,
        thread_kind: kind,
        thread_title: Some(format!("Thread {}", thread_id)),
        message_id,
        sender_id: Some(sender_id),
        sender_name: Some(format!("User {}", sender_id)),
        timestamp: Utc::now(),
        text: (!text.is_empty()).then(|| text.to_string()),
        photo: false,
        media_kind: None,
        is_forward: false,
        forward_source: None,
        reply_to_id: None,
    }
}

/// A one-to-one dialog with a user account.
pub fn user_dialog(thread_id: i64) -> DialogInfo {
    DialogInfo {
        thread_id,
        title: Some(format!("User {}", thread_id)),
        is_user: true,
        is_bot: false,
        deactivated: false,
    }
}

pub const SELF_ID: i64 = 1;

/// Engine config without artificial delays.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        reply_delay_min: Duration::ZERO,
        reply_delay_max: Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub fn test_settings() -> Settings {
    Settings {
        persona_instructions: "You are Alex, 27. Key interests: chess, hiking".into(),
        canned_replies: vec!["canned".into()],
        ..Settings::default()
    }
}

/// A fully wired engine over test doubles.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<ConversationStore>,
    pub settings: SettingsManager,
    pub model: Arc<ScriptedModel>,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<ManualClock>,
    pub engine: Arc<InteractionEngine>,
}

impl Harness {
    pub fn new(settings: Settings, model: ScriptedModel, config: EngineConfig) -> Self {
        Self::with_transport(settings, model, config, MockTransport::new())
    }

    pub fn with_transport(
        settings: Settings,
        model: ScriptedModel,
        config: EngineConfig,
        transport: MockTransport,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConversationStore::new(dir.path()));
        let settings = SettingsManager::in_memory(settings);
        let scoring = Arc::new(ScoringEngine::new(
            Arc::clone(&store),
            settings.clone(),
            ScoringConfig::default(),
        ));
        let model = Arc::new(model);
        let reliable = Arc::new(ReliableModel::new(
            Arc::clone(&model) as Arc<dyn LanguageModelClient>,
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                jitter: Duration::ZERO,
            },
        ));
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let engine = Arc::new(InteractionEngine::new(
            config,
            Arc::clone(&store),
            scoring,
            reliable,
            Arc::clone(&transport) as Arc<dyn Transport>,
            settings.clone(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        Self {
            dir,
            store,
            settings,
            model,
            transport,
            clock,
            engine,
        }
    }

    /// Learn the own id and activate the persona.
    pub async fn start(&self) {
        self.engine.set_self_id(SELF_ID);
        self.engine.activate().await.unwrap();
    }

    /// Poll the store until the message shows up, for background appends.
    pub async fn wait_for_stored(&self, thread_id: i64, message_id: i64) -> bool {
        for _ in 0..100 {
            let record = self.store.load(thread_id).await;
            if record.messages.iter().any(|m| m.message_id == message_id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

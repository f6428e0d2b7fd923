//! Proactive initiation loop.
//!
//! While the persona is active, the loop wakes up at random intervals, ranks
//! the eligible one-to-one threads and reopens the best one if it has been
//! quiet long enough.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{prompts, InteractionEngine};
use crate::model::GenerationRequest;

/// Whether a thread may be initiated at `now`.
///
/// The thread must have no history or have been silent for `quiet_period`,
/// and the persona's own last initiation must be at least `spacing` ago.
pub fn should_initiate(
    now: DateTime<Utc>,
    last_message: Option<DateTime<Utc>>,
    last_initiation: Option<DateTime<Utc>>,
    quiet_period: chrono::Duration,
    spacing: chrono::Duration,
) -> bool {
    let quiet = last_message.map_or(true, |at| now - at >= quiet_period);
    let spaced = last_initiation.map_or(true, |at| now - at >= spacing);
    quiet && spaced
}

/// Handle to a running initiation loop.
pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancel the loop and wait for it. An initiation in progress completes first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Initiation loop ended abnormally: {}", e);
        }
    }
}

pub struct InitiationScheduler {
    engine: Arc<InteractionEngine>,
    token: CancellationToken,
}

impl InitiationScheduler {
    pub fn new(engine: Arc<InteractionEngine>, token: CancellationToken) -> Self {
        Self { engine, token }
    }

    /// Start the loop in the background.
    pub fn spawn(engine: Arc<InteractionEngine>) -> SchedulerHandle {
        let token = CancellationToken::new();
        let scheduler = Self::new(engine, token.clone());
        let task = tokio::spawn(scheduler.run());
        SchedulerHandle { token, task }
    }

    async fn run(self) {
        info!("Initiation loop started");
        loop {
            let interval = self.next_interval();
            debug!("Next initiation check in {:.1} min", interval.as_secs_f64() / 60.0);

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if !self.engine.is_running() {
                continue;
            }
            self.run_cycle().await;
            self.engine.scoring().clear_cache().await;
        }
        info!("Initiation loop stopped");
    }

    fn next_interval(&self) -> Duration {
        let range = self.engine.settings().snapshot().initiation_interval_hours;
        let sampled = range.sample(&mut rand::thread_rng());
        sampled
            .to_std()
            .unwrap_or_else(|_| Duration::from_secs(3600))
    }

    /// One check: pick the best eligible thread and try to reopen it.
    /// Returns the thread that received an opener.
    pub async fn run_cycle(&self) -> Option<i64> {
        info!("Checking for initiation opportunities");
        let candidates = self.eligible_threads().await?;
        if candidates.is_empty() {
            info!("No eligible threads for initiation");
            return None;
        }

        let winner = self.engine.scoring().rank(&candidates).await?;
        info!("Initiation candidate: thread {}", winner);
        self.try_initiate(winner).await.then_some(winner)
    }

    /// One-to-one threads with real users that are neither excluded nor suppressed.
    async fn eligible_threads(&self) -> Option<Vec<i64>> {
        let dialogs = match self.engine.transport().list_dialogs().await {
            Ok(dialogs) => dialogs,
            Err(e) => {
                error!("[initiate] failed to list dialogs: {}", e);
                return None;
            }
        };

        let self_id = self.engine.self_id();
        let excluded = self.engine.settings().snapshot().excluded_threads;
        let now = self.engine.now();
        let eligible = dialogs
            .into_iter()
            .filter(|d| Some(d.thread_id) != self_id && d.is_user && !d.is_bot && !d.deactivated)
            .filter(|d| !excluded.contains(&d.thread_id))
            .filter(|d| {
                let suppressed = self.engine.is_suppressed(d.thread_id, now);
                if suppressed {
                    debug!("[initiate {}] skipped, suppressed", d.thread_id);
                }
                !suppressed
            })
            .map(|d| d.thread_id)
            .collect();
        Some(eligible)
    }

    async fn try_initiate(&self, thread: i64) -> bool {
        let engine = &self.engine;
        let settings = engine.settings().snapshot();
        let record = match engine.store().try_load(thread).await {
            Ok(record) => record,
            Err(e) => {
                error!("[initiate {}] failed to load history: {}", thread, e);
                return false;
            }
        };

        let has_history = !record.messages.is_empty();
        if !has_history && !settings.priority_threads.contains(&thread) {
            info!("[initiate {}] no history and not a priority thread", thread);
            return false;
        }

        let now = engine.now();
        let config = engine.config();
        if !should_initiate(
            now,
            record.last_message().map(|m| m.timestamp),
            engine.last_initiation(thread),
            config.quiet_period,
            config.initiation_spacing,
        ) {
            info!("[initiate {}] too soon since the last message or initiation", thread);
            return false;
        }

        let Some(instructions) = settings.instructions() else {
            error!("[initiate {}] persona instructions are missing", thread);
            return false;
        };
        let (task, context) = if has_history {
            (prompts::INITIATION, record.tail(config.initiation_context).to_vec())
        } else {
            info!("[initiate {}] priority thread without history, using a generic opener", thread);
            (prompts::GENERIC_OPENER, Vec::new())
        };

        // Stopping may cut the wait for a permit, never a send in progress
        let permit = tokio::select! {
            _ = self.token.cancelled() => {
                info!("[initiate {}] stopped while waiting for a permit", thread);
                return false;
            }
            permit = engine.acquire_permit(thread) => permit,
        };
        let Some(_permit) = permit else {
            return false;
        };
        let request = GenerationRequest {
            thread_id: thread,
            instructions: prompts::with_task(instructions, task),
            context,
            input_text: None,
            image: None,
            relaxed_safety: settings.restricted_threads.contains(&thread),
        };
        let Some(text) = engine.model().generate(&request).await else {
            error!("[initiate {}] failed to generate an opener", thread);
            return false;
        };

        match engine.deliver(thread, &text).await {
            Ok(_) => {
                engine.record_initiation(thread, engine.now());
                info!("[initiate {}] conversation initiated", thread);
                true
            }
            Err(e) => {
                warn!("[initiate {}] delivery failed: {}", thread, e);
                false
            }
        }
    }
}

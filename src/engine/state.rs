//! Per-thread runtime state: group counter, detection hits and cooldown.
//!
//! Nothing here is persisted. Cooldown expiry is reconciled lazily, when the
//! next event for the thread arrives.

use chrono::{DateTime, Utc};

/// Detection phase of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Normal,
    /// Detection hits so far, never above the threshold.
    Suspected(u32),
    Suppressed(DateTime<Utc>),
}

/// What to do about a detection-keyword message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Answer with a deflection. Carries the hit count.
    Deflect(u32),
    /// Go silent in this thread until the given time.
    Suppress(DateTime<Utc>),
}

#[derive(Debug, Clone, Default)]
pub struct ConversationRuntimeState {
    pub group_counter: u32,
    pub detection_hits: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_initiation: Option<DateTime<Utc>>,
}

impl ConversationRuntimeState {
    pub fn phase(&self) -> Phase {
        match (self.cooldown_until, self.detection_hits) {
            (Some(until), _) => Phase::Suppressed(until),
            (None, 0) => Phase::Normal,
            (None, hits) => Phase::Suspected(hits),
        }
    }

    /// Whether the thread is suppressed at `now`, without touching the state.
    pub fn is_suppressed_at(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Apply an elapsed cooldown and report whether the thread is still suppressed.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.cooldown_until = None;
                self.detection_hits = 0;
                self.group_counter = 0;
                false
            }
            None => false,
        }
    }

    /// Count a detection hit. Past `threshold` hits the thread is suppressed
    /// for `cooldown`.
    pub fn register_detection(
        &mut self,
        now: DateTime<Utc>,
        threshold: u32,
        cooldown: chrono::Duration,
    ) -> DetectionOutcome {
        self.detection_hits += 1;
        if self.detection_hits <= threshold {
            return DetectionOutcome::Deflect(self.detection_hits);
        }
        let until = now
            .checked_add_signed(cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.cooldown_until = Some(until);
        DetectionOutcome::Suppress(until)
    }

    /// Count a group message. Returns true, and resets the counter, when the
    /// counter reaches `frequency`.
    pub fn count_group_message(&mut self, frequency: u32) -> bool {
        self.group_counter += 1;
        if self.group_counter >= frequency.max(1) {
            self.group_counter = 0;
            return true;
        }
        false
    }
}

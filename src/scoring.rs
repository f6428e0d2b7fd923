//! Priority scores for proactive contact.
//!
//! A thread's score is the sum of a history score (log-damped message counts
//! per kind), an interest bonus (persona interest keywords mentioned by the
//! other side) and a manual boost for priority threads. Scores are cached per
//! thread until [`ScoringEngine::clear_cache`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::settings::SettingsManager;
use crate::store::{AggregateStats, ConversationStore, MessageRecord, SenderRole};

/// Weights and bonuses of the score formula.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub text_weight: f64,
    pub photo_weight: f64,
    pub video_weight: f64,
    pub voice_weight: f64,
    pub other_media_weight: f64,
    pub interest_bonus_per_match: f64,
    pub max_interest_bonus: f64,
    pub priority_boost: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            text_weight: 0.5,
            photo_weight: 1.0,
            video_weight: 1.2,
            voice_weight: 1.5,
            other_media_weight: 0.2,
            interest_bonus_per_match: 5.0,
            max_interest_bonus: 100.0,
            priority_boost: 500.0,
        }
    }
}

impl ScoringConfig {
    /// Σ weight(k) · ln(count_k + 1)
    pub fn history_score(&self, stats: &AggregateStats) -> f64 {
        [
            (self.text_weight, stats.text),
            (self.photo_weight, stats.photo),
            (self.video_weight, stats.video),
            (self.voice_weight, stats.voice),
            (self.other_media_weight, stats.other_media),
        ]
        .iter()
        .map(|(weight, count)| weight * (*count as f64 + 1.0).ln())
        .sum()
    }

    /// Bonus for `matches` keyword hits, clamped to the maximum.
    pub fn interest_bonus(&self, matches: usize) -> f64 {
        (matches as f64 * self.interest_bonus_per_match).min(self.max_interest_bonus)
    }
}

/// Marker line in the persona instructions that lists interests.
const INTEREST_MARKER: &str = r"(?i)(?:key interests|ключевые интересы)\s*:\s*";

/// Parse the comma separated interest list that follows the marker. The list
/// ends at the first blank line.
pub fn parse_interests(instructions: &str) -> Vec<String> {
    let Ok(marker) = Regex::new(INTEREST_MARKER) else {
        return Vec::new();
    };
    let Some(found) = marker.find(instructions) else {
        warn!("No interest marker in persona instructions; interest bonus disabled");
        return Vec::new();
    };

    let rest = &instructions[found.end()..];
    let list = rest.split("\n\n").next().unwrap_or_default();
    let mut interests: Vec<String> = list
        .split([',', '\n'])
        .map(|s| s.trim().trim_end_matches('.').trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    interests.sort();
    interests.dedup();
    debug!("Persona interests: {:?}", interests);
    interests
}

/// Whole-word, case-insensitive keyword matchers.
fn compile_interests(interests: &[String]) -> Vec<Regex> {
    interests
        .iter()
        .filter_map(|interest| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(interest));
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Skipping interest '{}': {}", interest, e);
                    None
                }
            }
        })
        .collect()
}

/// Keyword hits across everything the other side wrote.
fn count_interest_matches(messages: &[MessageRecord], matchers: &[Regex]) -> usize {
    if matchers.is_empty() {
        return 0;
    }
    messages
        .iter()
        .filter(|m| m.sender != SenderRole::Persona && !m.text.is_empty())
        .map(|m| {
            matchers
                .iter()
                .map(|re| re.find_iter(&m.text).count())
                .sum::<usize>()
        })
        .sum()
}

/// Ranks threads for proactive contact
pub struct ScoringEngine {
    store: Arc<ConversationStore>,
    settings: SettingsManager,
    config: ScoringConfig,
    cache: Mutex<HashMap<i64, f64>>,
    interests: Mutex<Option<Arc<Vec<Regex>>>>,
}

impl ScoringEngine {
    pub fn new(store: Arc<ConversationStore>, settings: SettingsManager, config: ScoringConfig) -> Self {
        Self {
            store,
            settings,
            config,
            cache: Mutex::new(HashMap::new()),
            interests: Mutex::new(None),
        }
    }

    /// Interest matchers, parsed from the instructions on first use.
    async fn interest_matchers(&self) -> Arc<Vec<Regex>> {
        let mut guard = self.interests.lock().await;
        if let Some(matchers) = guard.as_ref() {
            return Arc::clone(matchers);
        }
        let settings = self.settings.snapshot();
        let interests = settings
            .instructions()
            .map(parse_interests)
            .unwrap_or_default();
        let matchers = Arc::new(compile_interests(&interests));
        *guard = Some(Arc::clone(&matchers));
        matchers
    }

    /// Score one thread, using the cached value when present.
    pub async fn score(&self, id: i64) -> Result<f64, StoreError> {
        if let Some(score) = self.cache.lock().await.get(&id) {
            debug!("[score {}] cached {:.2}", id, score);
            return Ok(*score);
        }

        let record = self.store.try_load(id).await?;
        let history = self.config.history_score(&record.aggregate);
        let matchers = self.interest_matchers().await;
        let matches = count_interest_matches(&record.messages, &matchers);
        let interest = self.config.interest_bonus(matches);
        let boost = if self.settings.snapshot().priority_threads.contains(&id) {
            self.config.priority_boost
        } else {
            0.0
        };

        let score = history + interest + boost;
        debug!(
            "[score {}] history {:.2} + interest {:.2} ({} matches) + boost {:.0} = {:.2}",
            id, history, interest, matches, boost, score
        );
        self.cache.lock().await.insert(id, score);
        Ok(score)
    }

    /// The highest scoring thread, or `None` when no score is positive.
    ///
    /// A thread whose score cannot be computed counts as 0. Ties go to the
    /// thread listed first.
    pub async fn rank(&self, ids: &[i64]) -> Option<i64> {
        if ids.is_empty() {
            info!("No candidates to rank");
            return None;
        }

        let scores = join_all(ids.iter().map(|&id| self.score(id))).await;

        let mut best: Option<(i64, f64)> = None;
        for (&id, result) in ids.iter().zip(scores) {
            let score = match result {
                Ok(score) => score,
                Err(e) => {
                    error!("[score {}] failed to compute score: {}", id, e);
                    0.0
                }
            };
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((id, score));
            }
        }

        match best {
            Some((id, score)) if score > 0.0 => {
                info!("Top thread {} with score {:.2}", id, score);
                Some(id)
            }
            _ => {
                info!("No thread with a positive score among {} candidates", ids.len());
                None
            }
        }
    }

    /// Drop cached scores and the parsed interests.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        *self.interests.lock().await = None;
        debug!("Score cache cleared");
    }
}

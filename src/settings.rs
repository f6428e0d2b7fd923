//! Runtime settings shared with the administrative surface.
//!
//! Settings live in a JSON file. Missing keys take their defaults, and the
//! merged result is written back so the file always lists every key. The
//! engine only ever reads [`SettingsManager::snapshot`]; whoever administers
//! the persona edits the file and triggers [`SettingsManager::reload`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Upper bound of a sampled duration, about a thousand years.
const MAX_RANGE_MILLIS: i64 = 1000 * 366 * 24 * 3_600_000;

/// Inclusive range of hours a random duration is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoursRange {
    pub min: f64,
    pub max: f64,
}

impl HoursRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Draw a uniform duration from the range. A reversed range is swapped.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> chrono::Duration {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        let hours = if hi > lo && (hi - lo).is_finite() {
            rng.gen_range(lo..=hi)
        } else {
            lo
        };
        let millis = (hours * 3_600_000.0).clamp(0.0, MAX_RANGE_MILLIS as f64);
        chrono::Duration::milliseconds(millis as i64)
    }
}

/// Everything the administrative surface can change at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub persona_active: bool,
    /// Upper bound on messages fetched when collecting a thread's history.
    pub history_limit: usize,
    /// Reply once every N messages in group-like threads.
    pub group_reply_frequency: u32,
    pub detection_cooldown_hours: HoursRange,
    pub excluded_threads: HashSet<i64>,
    /// Threads where the provider's content restrictions are relaxed.
    pub restricted_threads: HashSet<i64>,
    pub priority_threads: HashSet<i64>,
    pub canned_replies: Vec<String>,
    pub initiation_interval_hours: HoursRange,
    pub persona_instructions: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            persona_active: false,
            history_limit: 1000,
            group_reply_frequency: 50,
            detection_cooldown_hours: HoursRange::new(2.0, 24.0),
            excluded_threads: HashSet::new(),
            restricted_threads: HashSet::new(),
            priority_threads: HashSet::new(),
            canned_replies: vec![
                "haha".to_string(),
                "lol".to_string(),
                "and what's that".to_string(),
                "))".to_string(),
                ")))".to_string(),
            ],
            initiation_interval_hours: HoursRange::new(1.0, 4.0),
            persona_instructions: String::new(),
        }
    }
}

impl Settings {
    /// Pick a random canned reply, if the pool is not empty.
    pub fn random_canned_reply(&self) -> Option<String> {
        if self.canned_replies.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.canned_replies.len());
        Some(self.canned_replies[idx].clone())
    }

    /// Base instructions, or `None` when they have not been written yet.
    pub fn instructions(&self) -> Option<&str> {
        let trimmed = self.persona_instructions.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// Shared handle to the current settings.
#[derive(Clone)]
pub struct SettingsManager {
    path: Option<PathBuf>,
    current: Arc<RwLock<Settings>>,
}

impl SettingsManager {
    /// In-memory settings, never persisted.
    #[cfg(test)]
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(settings)),
        }
    }

    /// Load settings from `path`, creating the file with defaults when missing.
    ///
    /// A malformed file falls back to defaults and is rewritten.
    pub async fn load(path: &Path) -> Result<Self> {
        let manager = Self {
            path: Some(path.to_path_buf()),
            current: Arc::new(RwLock::new(Settings::default())),
        };

        let settings = match read_settings_file(path).await? {
            SettingsFile::Parsed(settings) => {
                info!("Settings loaded from {:?}", path);
                settings
            }
            SettingsFile::Malformed(e) => {
                warn!("Failed to parse settings {:?}: {}. Using defaults.", path, e);
                Settings::default()
            }
            SettingsFile::Missing => {
                warn!("Settings file {:?} not found. Creating with defaults.", path);
                Settings::default()
            }
        };
        manager.replace(settings.clone());
        manager.persist(&settings).await?;
        Ok(manager)
    }

    /// Re-read the settings file. Returns the previous and the new value.
    ///
    /// A malformed file is an error and leaves the current settings and the
    /// file untouched. A deleted file is recreated from the current settings.
    pub async fn reload(&self) -> Result<(Settings, Settings)> {
        let Some(path) = &self.path else {
            let current = self.snapshot();
            return Ok((current.clone(), current));
        };

        match read_settings_file(path).await? {
            SettingsFile::Parsed(loaded) => {
                info!("Settings reloaded from {:?}", path);
                let previous = self.replace(loaded.clone());
                self.persist(&loaded).await?;
                Ok((previous, loaded))
            }
            SettingsFile::Malformed(e) => Err(anyhow::Error::new(e).context(format!(
                "Settings file {:?} is malformed, keeping current settings",
                path
            ))),
            SettingsFile::Missing => {
                warn!("Settings file {:?} disappeared. Writing current settings.", path);
                let current = self.snapshot();
                self.persist(&current).await?;
                Ok((current.clone(), current))
            }
        }
    }

    /// The current settings.
    pub fn snapshot(&self) -> Settings {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply a change and write it back to disk.
    pub async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let mut next = self.snapshot();
        change(&mut next);
        self.replace(next.clone());
        self.persist(&next).await
    }

    pub fn is_persona_active(&self) -> bool {
        self.snapshot().persona_active
    }

    fn replace(&self, settings: Settings) -> Settings {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, settings)
    }

    async fn persist(&self, settings: &Settings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_vec_pretty(settings).context("Failed to serialize settings")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write settings {:?}", path))?;
        debug!("Settings saved to {:?}", path);
        Ok(())
    }
}

enum SettingsFile {
    Parsed(Settings),
    Malformed(serde_json::Error),
    Missing,
}

async fn read_settings_file(path: &Path) -> Result<SettingsFile> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(match serde_json::from_slice::<Settings>(&bytes) {
            Ok(settings) => SettingsFile::Parsed(settings),
            Err(e) => SettingsFile::Malformed(e),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SettingsFile::Missing),
        Err(e) => Err(e).with_context(|| format!("Failed to read settings {:?}", path)),
    }
}

//! Durable per-thread conversation store.
//!
//! Each thread is one JSON document at `<data_dir>/<id>/<id>.json`. Every
//! access to a document goes through that thread's lock, so mutations of one
//! thread are totally ordered while unrelated threads never wait on each
//! other. Locks are created once per id and looked up afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Who wrote a message, from the persona's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The persona itself.
    #[serde(rename = "self")]
    Persona,
    /// The other side of a one-to-one thread.
    Contact,
    /// Any other participant (group members, channels).
    Other,
}

/// Kind of media attached to a message, used for the aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Voice,
    Other,
}

/// One stored message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: i64,
    pub sender: SenderRole,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_forward: bool,
    #[serde(default)]
    pub forward_source: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<i64>,
    #[serde(default)]
    pub media_attached: bool,
    #[serde(default)]
    pub photo_attached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_kind: Option<MediaKind>,
}

impl MessageRecord {
    /// A plain text message sent by the persona.
    pub fn outgoing(message_id: i64, timestamp: DateTime<Utc>, text: &str) -> Self {
        Self {
            message_id,
            sender: SenderRole::Persona,
            timestamp,
            text: text.to_string(),
            is_forward: false,
            forward_source: None,
            reply_to_id: None,
            media_attached: false,
            photo_attached: false,
            media_kind: None,
        }
    }

    fn effective_media_kind(&self) -> Option<MediaKind> {
        if self.photo_attached {
            return Some(MediaKind::Photo);
        }
        match self.media_kind {
            Some(kind) => Some(kind),
            None if self.media_attached => Some(MediaKind::Other),
            None => None,
        }
    }
}

/// Message counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    #[serde(default)]
    pub text: u64,
    #[serde(default)]
    pub photo: u64,
    #[serde(default)]
    pub video: u64,
    #[serde(default)]
    pub voice: u64,
    #[serde(default)]
    pub other_media: u64,
}

impl AggregateStats {
    /// Recompute the counters from scratch over a message list.
    pub fn from_messages(messages: &[MessageRecord]) -> Self {
        let mut stats = Self::default();
        for msg in messages {
            stats.add(msg);
        }
        stats
    }

    fn add(&mut self, msg: &MessageRecord) {
        if !msg.text.is_empty() {
            self.text += 1;
        }
        match msg.effective_media_kind() {
            Some(MediaKind::Photo) => self.photo += 1,
            Some(MediaKind::Video) => self.video += 1,
            Some(MediaKind::Voice) => self.voice += 1,
            Some(MediaKind::Other) => self.other_media += 1,
            None => {}
        }
    }
}

/// Everything stored for a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub aggregate: AggregateStats,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

impl ConversationRecord {
    /// Empty record for a thread with no stored history.
    pub fn empty(id: i64) -> Self {
        Self {
            id,
            title: format!("Unknown thread {}", id),
            aggregate: AggregateStats::default(),
            messages: Vec::new(),
        }
    }

    /// Empty record replacing a document that could not be read.
    pub fn recovered(id: i64) -> Self {
        Self {
            title: format!("Recovered thread {}", id),
            ..Self::empty(id)
        }
    }

    /// The last `n` messages, oldest first.
    pub fn tail(&self, n: usize) -> &[MessageRecord] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn last_message(&self) -> Option<&MessageRecord> {
        self.messages.last()
    }

    /// Insert keeping ascending id order. Returns false if the id is already present.
    fn insert(&mut self, message: MessageRecord) -> bool {
        match self
            .messages
            .binary_search_by_key(&message.message_id, |m| m.message_id)
        {
            Ok(_) => false,
            Err(pos) => {
                self.aggregate.add(&message);
                self.messages.insert(pos, message);
                true
            }
        }
    }

    /// Restore the ordering, uniqueness and counter invariants.
    fn normalize(&mut self) {
        self.messages.sort_by_key(|m| m.message_id);
        self.messages.dedup_by_key(|m| m.message_id);
        self.aggregate = AggregateStats::from_messages(&self.messages);
    }
}

/// Thread-safe conversation store backed by one JSON document per thread
pub struct ConversationStore {
    data_dir: PathBuf,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ConversationStore {
    /// Create a store rooted at `data_dir`. Directories are created lazily.
    pub fn new(data_dir: &Path) -> Self {
        info!("Conversation store at {:?}", data_dir);
        Self {
            data_dir: data_dir.to_path_buf(),
            locks: DashMap::new(),
        }
    }

    fn thread_dir(&self, id: i64) -> PathBuf {
        self.data_dir.join(id.to_string())
    }

    fn document_path(&self, id: i64) -> PathBuf {
        self.thread_dir(id).join(format!("{}.json", id))
    }

    fn lock_for(&self, id: i64) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(&id) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(id).or_default().value())
    }

    /// Load a thread. Missing documents yield an empty record, unreadable
    /// ones a recovered record; this never fails.
    pub async fn load(&self, id: i64) -> ConversationRecord {
        match self.try_load(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("[store {}] {}; using recovered record", id, e);
                ConversationRecord::recovered(id)
            }
        }
    }

    /// Load a thread, reporting corruption and I/O failures instead of repairing them.
    pub async fn try_load(&self, id: i64) -> Result<ConversationRecord, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.read_unlocked(id).await
    }

    /// Append a message. Returns false without writing when the id is already stored.
    pub async fn append(&self, id: i64, message: MessageRecord) -> Result<bool, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.read_or_recover_unlocked(id).await?;
        let message_id = message.message_id;
        if !record.insert(message) {
            debug!("[store {}] message {} already stored", id, message_id);
            return Ok(false);
        }
        self.write_unlocked(id, &record).await?;
        debug!("[store {}] appended message {}", id, message_id);
        Ok(true)
    }

    /// Overwrite the whole document.
    pub async fn save(&self, id: i64, record: &ConversationRecord) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = record.clone();
        record.id = id;
        record.normalize();
        self.write_unlocked(id, &record).await
    }

    /// Change the title, keeping stored messages.
    pub async fn update_title(&self, id: i64, title: &str) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.read_or_recover_unlocked(id).await?;
        if record.title == title {
            debug!("[store {}] title already '{}'", id, title);
            return Ok(());
        }
        record.title = title.to_string();
        self.write_unlocked(id, &record).await?;
        info!("[store {}] title updated to '{}'", id, title);
        Ok(())
    }

    /// Read for a mutation. Only an unparseable document is replaced; any
    /// other failure aborts the mutation so nothing is overwritten.
    async fn read_or_recover_unlocked(&self, id: i64) -> Result<ConversationRecord, StoreError> {
        match self.read_unlocked(id).await {
            Err(e @ StoreError::Corrupt { .. }) => {
                warn!("[store {}] {}; re-initializing document", id, e);
                Ok(ConversationRecord::recovered(id))
            }
            other => other,
        }
    }

    async fn read_unlocked(&self, id: i64) -> Result<ConversationRecord, StoreError> {
        let path = self.document_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[store {}] no document at {:?}", id, path);
                return Ok(ConversationRecord::empty(id));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let mut record: ConversationRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        record.id = id;
        if record.title.trim().is_empty() {
            record.title = ConversationRecord::empty(id).title;
        }
        record.normalize();
        Ok(record)
    }

    async fn write_unlocked(&self, id: i64, record: &ConversationRecord) -> Result<(), StoreError> {
        let dir = self.thread_dir(id);
        let path = self.document_path(id);
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };

        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        let json = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Serialize(id, e))?;

        // Write-then-rename so a crash never leaves a half-written document
        let tmp = dir.join(format!("{}.json.tmp", id));
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn text_message(id: i64, text: &str) -> MessageRecord {
        MessageRecord {
            message_id: id,
            sender: SenderRole::Contact,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            text: text.to_string(),
            is_forward: false,
            forward_source: None,
            reply_to_id: None,
            media_attached: false,
            photo_attached: false,
            media_kind: None,
        }
    }

    #[tokio::test]
    async fn test_load_missing_thread_returns_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());

        let record = store.load(42).await;
        assert_eq!(record.id, 42);
        assert!(record.messages.is_empty());
        assert_eq!(record.aggregate, AggregateStats::default());
        assert_eq!(record.title, "Unknown thread 42");
    }

    #[tokio::test]
    async fn test_load_corrupt_document_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("7")).unwrap();
        std::fs::write(dir.path().join("7").join("7.json"), b"{not json").unwrap();

        assert!(matches!(
            store.try_load(7).await,
            Err(StoreError::Corrupt { .. })
        ));
        let record = store.load(7).await;
        assert_eq!(record.title, "Recovered thread 7");
        assert!(record.messages.is_empty());

        // Appending over a corrupt document starts from the recovered record
        assert!(store.append(7, text_message(1, "hi")).await.unwrap());
        assert_eq!(store.load(7).await.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_keys_are_filled_without_losing_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let messages: Vec<MessageRecord> = (1..=3).map(|id| text_message(id, "kept")).collect();
        let doc = serde_json::json!({ "id": 5, "aggregate": {}, "messages": messages });
        std::fs::create_dir_all(dir.path().join("5")).unwrap();
        std::fs::write(dir.path().join("5").join("5.json"), doc.to_string()).unwrap();

        let record = store.load(5).await;
        assert_eq!(record.title, "Unknown thread 5");
        assert_eq!(record.aggregate.text, 3);

        assert!(store.append(5, text_message(4, "new")).await.unwrap());
        let record = store.load(5).await;
        let ids: Vec<i64> = record.messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(record.title, "Unknown thread 5");
    }

    #[tokio::test]
    async fn test_read_failure_aborts_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        // A directory where the document should be: reading fails with a non-parse error
        let doc_path = dir.path().join("6").join("6.json");
        std::fs::create_dir_all(&doc_path).unwrap();

        assert!(matches!(
            store.append(6, text_message(1, "hi")).await,
            Err(StoreError::Io { .. })
        ));
        assert!(matches!(
            store.update_title(6, "Carol").await,
            Err(StoreError::Io { .. })
        ));
        assert!(doc_path.is_dir());
        assert!(!dir.path().join("6").join("6.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_append_is_idempotent_by_message_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());

        assert!(store.append(1, text_message(10, "hello")).await.unwrap());
        assert!(!store.append(1, text_message(10, "hello again")).await.unwrap());

        let record = store.load(1).await;
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].text, "hello");
        assert_eq!(record.aggregate.text, 1);
    }

    #[tokio::test]
    async fn test_append_keeps_ids_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());

        for id in [5, 2, 9, 3] {
            store.append(1, text_message(id, "x")).await.unwrap();
        }
        let ids: Vec<i64> = store
            .load(1)
            .await
            .messages
            .iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 5, 9]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_counters_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConversationStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..40i64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let thread = i % 2;
                // Each id lands twice per thread, exercising deduplication under contention
                let id = i / 4;
                let mut msg = text_message(id, if id % 3 == 0 { "" } else { "text" });
                if id % 4 == 0 {
                    msg.photo_attached = true;
                    msg.media_attached = true;
                }
                store.append(thread, msg).await.unwrap();
            }));
        }
        futures::future::join_all(handles).await;

        for thread in 0..2 {
            let record = store.load(thread).await;
            let mut ids: Vec<i64> = record.messages.iter().map(|m| m.message_id).collect();
            let before = ids.len();
            ids.dedup();
            assert_eq!(ids.len(), before, "duplicate ids in thread {}", thread);
            assert_eq!(record.aggregate, AggregateStats::from_messages(&record.messages));
        }
    }

    #[tokio::test]
    async fn test_update_title_preserves_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());

        store.append(3, text_message(1, "one")).await.unwrap();
        store.append(3, text_message(2, "two")).await.unwrap();
        store.update_title(3, "Alice").await.unwrap();

        let record = store.load(3).await;
        assert_eq!(record.title, "Alice");
        assert_eq!(record.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_save_overwrites_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.append(4, text_message(1, "old")).await.unwrap();

        let mut record = ConversationRecord::empty(4);
        record.title = "Bob".into();
        record.messages = vec![text_message(3, "c"), text_message(2, "b")];
        record.aggregate.voice = 99;
        store.save(4, &record).await.unwrap();

        let loaded = store.load(4).await;
        let ids: Vec<i64> = loaded.messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(loaded.aggregate.text, 2);
        assert_eq!(loaded.aggregate.voice, 0);
    }

    #[test]
    fn test_aggregate_counts_media_kinds() {
        let mut voice = text_message(1, "");
        voice.media_attached = true;
        voice.media_kind = Some(MediaKind::Voice);
        let mut sticker = text_message(2, "");
        sticker.media_attached = true;
        let mut photo = text_message(3, "look");
        photo.photo_attached = true;
        photo.media_attached = true;

        let stats = AggregateStats::from_messages(&[voice, sticker, photo]);
        assert_eq!(
            stats,
            AggregateStats {
                text: 1,
                photo: 1,
                video: 0,
                voice: 1,
                other_media: 1,
            }
        );
    }

    #[test]
    fn test_persisted_document_shape() {
        let mut record = ConversationRecord::empty(9);
        record.insert(MessageRecord::outgoing(
            1,
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            "hey",
        ));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["aggregate"]["other_media"], 0);
        let msg = &json["messages"][0];
        assert_eq!(msg["sender"], "self");
        assert_eq!(msg["timestamp"], "2024-01-02T03:04:05Z");
        assert!(msg["forward_source"].is_null());
        assert!(msg["reply_to_id"].is_null());
        assert!(msg.get("media_kind").is_none());
    }
}

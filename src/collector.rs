//! One-shot import of past messages into the store, for one thread or for
//! every dialog of the account.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::store::ConversationStore;
use crate::transport::{InboundMessage, Transport};

/// Outcome of one collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSummary {
    pub fetched: usize,
    /// Messages that were not stored before.
    pub stored: usize,
    pub skipped: usize,
}

/// Outcome of a run over all dialogs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkCollectionSummary {
    pub dialogs: usize,
    pub collected: usize,
    /// Deactivated accounts and threads whose history could not be fetched.
    pub failed: usize,
    /// The persona's own dialog and excluded threads.
    pub skipped: usize,
    pub messages_stored: usize,
}

pub struct HistoryCollector {
    store: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
    pause_min: Duration,
    pause_max: Duration,
}

impl HistoryCollector {
    pub fn new(store: Arc<ConversationStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            pause_min: Duration::from_secs(2),
            pause_max: Duration::from_secs(5),
        }
    }

    /// Pause range between two dialogs of [`collect_all`](Self::collect_all).
    pub fn with_pause(mut self, min: Duration, max: Duration) -> Self {
        self.pause_min = min;
        self.pause_max = max.max(min);
        self
    }

    fn sample_pause(&self) -> Duration {
        if self.pause_max <= self.pause_min {
            return self.pause_min;
        }
        let secs = rand::thread_rng()
            .gen_range(self.pause_min.as_secs_f64()..=self.pause_max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Collect every dialog except the persona's own and the excluded ones.
    ///
    /// A failing thread is counted and skipped; only a failure to list the
    /// dialogs aborts the run.
    pub async fn collect_all(
        &self,
        limit: usize,
        self_id: i64,
        excluded: &HashSet<i64>,
    ) -> Result<BulkCollectionSummary> {
        info!("Starting history collection for all dialogs");
        let started = Instant::now();
        let dialogs = self
            .transport
            .list_dialogs()
            .await
            .context("Failed to list dialogs")?;

        let mut summary = BulkCollectionSummary::default();
        for dialog in dialogs {
            summary.dialogs += 1;
            let thread = dialog.thread_id;
            let name = dialog.title.as_deref().unwrap_or("untitled");

            if thread == self_id {
                debug!("[collect {}] skipping own dialog", thread);
                summary.skipped += 1;
                continue;
            }
            if excluded.contains(&thread) {
                info!("[collect {}] skipping excluded dialog '{}'", thread, name);
                summary.skipped += 1;
                continue;
            }
            if dialog.deactivated {
                warn!("[collect {}] skipping deactivated account '{}'", thread, name);
                summary.failed += 1;
                continue;
            }

            match self.collect(thread, limit, Some(self_id)).await {
                Ok(one) => {
                    summary.collected += 1;
                    summary.messages_stored += one.stored;
                }
                Err(e) => {
                    error!("[collect {}] {:#}", thread, e);
                    summary.failed += 1;
                }
            }
            tokio::time::sleep(self.sample_pause()).await;
        }

        info!(
            "History collection finished in {:.2}s: {} dialogs, {} collected, {} failed, {} skipped, {} new messages",
            started.elapsed().as_secs_f64(),
            summary.dialogs,
            summary.collected,
            summary.failed,
            summary.skipped,
            summary.messages_stored
        );
        Ok(summary)
    }

    /// Fetch up to `limit` past messages of `thread_id` and store them.
    ///
    /// Appends are idempotent, so running this twice stores nothing new.
    pub async fn collect(
        &self,
        thread_id: i64,
        limit: usize,
        self_id: Option<i64>,
    ) -> Result<CollectionSummary> {
        info!("[collect {}] fetching up to {} messages", thread_id, limit);
        let history = self
            .transport
            .fetch_history(thread_id, limit)
            .await
            .with_context(|| format!("Failed to fetch history of thread {}", thread_id))?;

        let mut summary = CollectionSummary {
            fetched: history.messages.len(),
            stored: 0,
            skipped: 0,
        };
        for msg in &history.messages {
            if !is_storable(msg) {
                debug!("[collect {}] skipping message {}", thread_id, msg.message_id);
                summary.skipped += 1;
                continue;
            }
            if self.store.append(thread_id, msg.to_record(self_id)).await? {
                summary.stored += 1;
            }
        }

        if let Some(title) = history.title.as_deref().filter(|t| !t.is_empty()) {
            self.store.update_title(thread_id, title).await?;
        }

        info!(
            "[collect {}] fetched {}, stored {} new, skipped {}",
            thread_id, summary.fetched, summary.stored, summary.skipped
        );
        Ok(summary)
    }
}

/// Service messages carry nothing worth keeping.
fn is_storable(msg: &InboundMessage) -> bool {
    msg.text().is_some() || msg.has_media() || msg.is_forward
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SenderRole;
    use crate::testing::{inbound, MockTransport, SELF_ID};
    use crate::testing::user_dialog;
    use crate::transport::{DialogInfo, ThreadHistory, ThreadKind};

    fn collector(dir: &std::path::Path) -> (Arc<ConversationStore>, Arc<MockTransport>, HistoryCollector) {
        let store = Arc::new(ConversationStore::new(dir));
        let transport = Arc::new(MockTransport::new());
        let collector = HistoryCollector::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        (store, transport, collector)
    }

    #[tokio::test]
    async fn test_collect_stores_history_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transport, collector) = collector(dir.path());
        let mut messages: Vec<InboundMessage> = (1..=5)
            .map(|id| inbound(9, ThreadKind::Direct, id, 9, "hello"))
            .collect();
        messages.push(inbound(9, ThreadKind::Direct, 6, SELF_ID, "hi back"));
        messages.push(inbound(9, ThreadKind::Direct, 7, 9, ""));
        transport.set_history(
            9,
            ThreadHistory {
                title: Some("Maria".into()),
                messages,
            },
        );

        let summary = collector.collect(9, 1000, Some(SELF_ID)).await.unwrap();
        assert_eq!(
            summary,
            CollectionSummary {
                fetched: 7,
                stored: 6,
                skipped: 1,
            }
        );

        let record = store.load(9).await;
        assert_eq!(record.title, "Maria");
        assert_eq!(record.messages.len(), 6);
        assert_eq!(record.messages[5].sender, SenderRole::Persona);
        assert_eq!(record.aggregate.text, 6);

        // A second run finds nothing new
        let again = collector.collect(9, 1000, Some(SELF_ID)).await.unwrap();
        assert_eq!(again.stored, 0);
    }

    #[tokio::test]
    async fn test_collect_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transport, collector) = collector(dir.path());
        transport.set_history(
            3,
            ThreadHistory {
                title: None,
                messages: (1..=10)
                    .map(|id| inbound(3, ThreadKind::Direct, id, 3, "x"))
                    .collect(),
            },
        );

        let summary = collector.collect(3, 4, None).await.unwrap();
        assert_eq!(summary.stored, 4);
        let ids: Vec<i64> = store.load(3).await.messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_collect_all_skips_self_excluded_and_deactivated() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transport, collector) = collector(dir.path());
        let collector = collector.with_pause(Duration::ZERO, Duration::ZERO);
        let history = |thread: i64| ThreadHistory {
            title: Some(format!("User {}", thread)),
            messages: (1..=3)
                .map(|id| inbound(thread, ThreadKind::Direct, id, thread, "hey"))
                .collect(),
        };
        for thread in [SELF_ID, 10, 11, 12] {
            transport.set_history(thread, history(thread));
        }
        let gone = DialogInfo {
            deactivated: true,
            ..user_dialog(12)
        };
        // 13 has no history behind it and fails to fetch
        transport.set_dialogs(vec![
            user_dialog(SELF_ID),
            user_dialog(10),
            user_dialog(11),
            gone,
            user_dialog(13),
        ]);
        let excluded: HashSet<i64> = [11].into_iter().collect();

        let summary = collector.collect_all(100, SELF_ID, &excluded).await.unwrap();
        assert_eq!(
            summary,
            BulkCollectionSummary {
                dialogs: 5,
                collected: 1,
                failed: 2,
                skipped: 2,
                messages_stored: 3,
            }
        );
        assert_eq!(store.load(10).await.messages.len(), 3);
        assert_eq!(store.load(10).await.title, "User 10");
        for untouched in [SELF_ID, 11, 12, 13] {
            assert!(store.load(untouched).await.messages.is_empty());
        }
    }

    #[tokio::test]
    async fn test_collect_unknown_thread_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _transport, collector) = collector(dir.path());
        assert!(collector.collect(404, 10, None).await.is_err());
    }
}

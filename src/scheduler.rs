// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Channel;
use crate::error::FailureKind;
use crate::fetch::SharedFetcher;
use crate::listing::Item;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::retry::{RetryOutcome, RetryPolicy, fetch_with_retry};
use crate::state::{CommitOutcome, ProgressStore};

/// Why an item was not committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Every attempt failed transiently
    TransientExhausted,
    /// A failure that retrying cannot fix
    Fatal,
    /// The fetch succeeded but recording it in the progress store did not
    CommitFailed,
}

impl FailureClass {
    /// Failure kind as seen by the user: everything but `Fatal` comes back next run
    pub fn kind(self) -> FailureKind {
        match self {
            FailureClass::Fatal => FailureKind::Fatal,
            FailureClass::TransientExhausted | FailureClass::CommitFailed => {
                FailureKind::Transient
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub class: FailureClass,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    /// Fetched and committed
    Downloaded,
    /// Another task committed the item first
    AlreadySeen,
    Failed(ItemFailure),
    /// The run was cancelled before the item completed
    Cancelled,
}

/// Result for one scheduled item
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub item_id: String,
    pub title: String,
    pub status: ItemStatus,
}

/// Runs fetches under a global concurrency limit and commits successes
///
/// One scheduler is shared by every channel of a run; each call to
/// [`DownloadScheduler::run_channel`] additionally bounds that channel's
/// own concurrency when `per_channel` is set.
pub struct DownloadScheduler {
    global: Arc<Semaphore>,
    per_channel: Option<usize>,
    store: Arc<ProgressStore>,
    fetcher: SharedFetcher,
    retry: RetryPolicy,
    reporter: SharedProgressReporter,
    cancel: CancellationToken,
}

impl DownloadScheduler {
    pub fn new(
        max_concurrent: usize,
        store: Arc<ProgressStore>,
        fetcher: SharedFetcher,
        retry: RetryPolicy,
        reporter: SharedProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrent.max(1))),
            per_channel: None,
            store,
            fetcher,
            retry,
            reporter,
            cancel,
        }
    }

    /// Bound the number of concurrent fetches within a single channel
    pub fn with_per_channel(mut self, per_channel: Option<usize>) -> Self {
        self.per_channel = per_channel.map(|n| n.max(1));
        self
    }

    /// Fetch `items` for `channel`, returning one outcome per item in input order
    ///
    /// Items are started in order. A successful fetch is committed before its
    /// task finishes; failures and cancellations are never committed.
    pub async fn run_channel(
        &self,
        channel: Arc<Channel>,
        items: Vec<Item>,
    ) -> Vec<ItemOutcome> {
        let channel_slots = self.per_channel.map(|n| Arc::new(Semaphore::new(n)));

        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let task = ItemTask {
                channel: channel.clone(),
                channel_slots: channel_slots.clone(),
                global: self.global.clone(),
                store: self.store.clone(),
                fetcher: self.fetcher.clone(),
                retry: self.retry.clone(),
                reporter: self.reporter.clone(),
                cancel: self.cancel.clone(),
            };
            let item_id = item.item_id.clone();
            let title = item.title.clone();
            handles.push((item_id, title, tokio::spawn(task.run(item))));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (item_id, title, handle) in handles {
            let status = match handle.await {
                Ok(status) => status,
                Err(e) => {
                    let reason = format!("Download task failed: {}", e);
                    tracing::error!(channel = %channel.id, item = %item_id, %reason);
                    self.reporter.report(ProgressEvent::DownloadFailed {
                        channel_id: channel.id.clone(),
                        item_id: item_id.clone(),
                        title: title.clone(),
                        error: reason.clone(),
                        kind: FailureKind::Transient,
                    });
                    ItemStatus::Failed(ItemFailure {
                        class: FailureClass::TransientExhausted,
                        reason,
                        attempts: 0,
                    })
                }
            };
            outcomes.push(ItemOutcome {
                item_id,
                title,
                status,
            });
        }
        outcomes
    }
}

/// Everything one spawned item task owns
struct ItemTask {
    channel: Arc<Channel>,
    channel_slots: Option<Arc<Semaphore>>,
    global: Arc<Semaphore>,
    store: Arc<ProgressStore>,
    fetcher: SharedFetcher,
    retry: RetryPolicy,
    reporter: SharedProgressReporter,
    cancel: CancellationToken,
}

impl ItemTask {
    async fn run(self, item: Item) -> ItemStatus {
        let Some(_permits) = self.acquire_permits().await else {
            return ItemStatus::Cancelled;
        };

        let channel_id = self.channel.id.as_str();
        if self.store.contains(channel_id, &item.item_id).await {
            return ItemStatus::AlreadySeen;
        }

        let outcome = fetch_with_retry(
            &self.retry,
            &self.cancel,
            |notice| {
                self.reporter.report(ProgressEvent::RetryScheduled {
                    channel_id: channel_id.to_string(),
                    item_id: item.item_id.clone(),
                    title: item.title.clone(),
                    attempt: notice.attempt,
                    max_attempts: notice.max_attempts,
                    delay: notice.delay,
                    error: notice.error.to_string(),
                })
            },
            |attempt| {
                self.reporter.report(ProgressEvent::DownloadStarting {
                    channel_id: channel_id.to_string(),
                    item_id: item.item_id.clone(),
                    title: item.title.clone(),
                    attempt,
                });
                self.fetcher.fetch(&self.channel, &item)
            },
        )
        .await;

        let status = match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                match self.store.commit(channel_id, &item.item_id).await {
                    Ok(CommitOutcome::Committed) => ItemStatus::Downloaded,
                    Ok(CommitOutcome::AlreadySeen) => ItemStatus::AlreadySeen,
                    Err(e) => ItemStatus::Failed(ItemFailure {
                        class: FailureClass::CommitFailed,
                        reason: e.to_string(),
                        attempts,
                    }),
                }
            }
            RetryOutcome::Failed { error, attempts } => {
                let class = if error.kind() == FailureKind::Fatal {
                    FailureClass::Fatal
                } else {
                    FailureClass::TransientExhausted
                };
                ItemStatus::Failed(ItemFailure {
                    class,
                    reason: error.to_string(),
                    attempts,
                })
            }
            RetryOutcome::Cancelled => ItemStatus::Cancelled,
        };

        match &status {
            ItemStatus::Downloaded => self.reporter.report(ProgressEvent::DownloadCompleted {
                channel_id: channel_id.to_string(),
                item_id: item.item_id.clone(),
                title: item.title.clone(),
            }),
            ItemStatus::Failed(failure) => self.reporter.report(ProgressEvent::DownloadFailed {
                channel_id: channel_id.to_string(),
                item_id: item.item_id.clone(),
                title: item.title.clone(),
                error: failure.reason.clone(),
                kind: failure.class.kind(),
            }),
            ItemStatus::AlreadySeen | ItemStatus::Cancelled => {}
        }

        status
    }

    /// Channel slot first, then a global slot; `None` when cancelled while waiting
    async fn acquire_permits(
        &self,
    ) -> Option<(Option<OwnedSemaphorePermit>, OwnedSemaphorePermit)> {
        let channel_permit = match &self.channel_slots {
            Some(slots) => Some(self.acquire(slots.clone()).await?),
            None => None,
        };
        let global_permit = self.acquire(self.global.clone()).await?;
        Some((channel_permit, global_permit))
    }

    async fn acquire(&self, semaphore: Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::error::FetchError;
    use crate::fetch::{Artifact, FetchAdapter};
    use crate::progress::NoopReporter;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Fails each item a scripted number of times with the given status
    #[derive(Default)]
    struct ScriptedFetcher {
        failures: HashMap<String, (usize, u16)>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn failing(mut self, item_id: &str, times: usize, status: u16) -> Self {
            self.failures.insert(item_id.to_string(), (times, status));
            self
        }

        fn calls(&self, item_id: &str) -> usize {
            self.calls.lock().unwrap().get(item_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl FetchAdapter for ScriptedFetcher {
        async fn fetch(&self, _channel: &Channel, item: &Item) -> Result<Artifact, FetchError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(item.item_id.clone()).or_default();
                *count += 1;
                *count
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.failures.get(&item.item_id) {
                Some((times, status)) if call <= *times => Err(FetchError::HttpStatus {
                    url: item.url.clone(),
                    status: *status,
                }),
                _ => Ok(Artifact {
                    files: Vec::new(),
                    bytes: 0,
                }),
            }
        }
    }

    fn make_channel() -> Arc<Channel> {
        Arc::new(Channel {
            id: "chan".to_string(),
            label: "Chan".to_string(),
            source_locator: "https://example.com/feed".to_string(),
            destination: "/tmp/unused".into(),
            since: None,
            kind: SourceKind::Feed,
        })
    }

    fn make_items(ids: &[&str]) -> Vec<Item> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| Item {
                item_id: id.to_string(),
                ordering_key: i,
                published: None,
                title: format!("Item {id}"),
                url: format!("https://example.com/{id}"),
                media: None,
            })
            .collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
            attempt_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn setup(
        fetcher: Arc<ScriptedFetcher>,
        max_concurrent: usize,
    ) -> (TempDir, Arc<ProgressStore>, DownloadScheduler) {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProgressStore::empty(&dir.path().join("progress.json")));
        let scheduler = DownloadScheduler::new(
            max_concurrent,
            store.clone(),
            fetcher,
            fast_retry(),
            NoopReporter::shared(),
            CancellationToken::new(),
        );
        (dir, store, scheduler)
    }

    #[tokio::test]
    async fn successful_items_are_committed_in_order() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (_dir, store, scheduler) = setup(fetcher, 2);

        let outcomes = scheduler
            .run_channel(make_channel(), make_items(&["a", "b", "c"]))
            .await;

        let ids: Vec<_> = outcomes.iter().map(|o| o.item_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(outcomes.iter().all(|o| o.status == ItemStatus::Downloaded));
        for id in ["a", "b", "c"] {
            assert!(store.contains("chan", id).await);
        }
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_budget() {
        let fetcher = Arc::new(ScriptedFetcher::default().failing("a", 2, 503));
        let (_dir, store, scheduler) = setup(fetcher.clone(), 1);

        let outcomes = scheduler.run_channel(make_channel(), make_items(&["a"])).await;

        assert_eq!(outcomes[0].status, ItemStatus::Downloaded);
        assert_eq!(fetcher.calls("a"), 3);
        assert!(store.contains("chan", "a").await);
    }

    #[tokio::test]
    async fn exhausted_retries_are_not_committed() {
        let fetcher = Arc::new(ScriptedFetcher::default().failing("a", 10, 503));
        let (_dir, store, scheduler) = setup(fetcher.clone(), 1);

        let outcomes = scheduler
            .run_channel(make_channel(), make_items(&["a", "b"]))
            .await;

        match &outcomes[0].status {
            ItemStatus::Failed(failure) => {
                assert_eq!(failure.class, FailureClass::TransientExhausted);
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(outcomes[1].status, ItemStatus::Downloaded);
        assert_eq!(fetcher.calls("a"), 3);
        assert!(!store.contains("chan", "a").await);
        assert!(store.contains("chan", "b").await);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let fetcher = Arc::new(ScriptedFetcher::default().failing("a", 10, 404));
        let (_dir, store, scheduler) = setup(fetcher.clone(), 1);

        let outcomes = scheduler.run_channel(make_channel(), make_items(&["a"])).await;

        assert!(matches!(
            &outcomes[0].status,
            ItemStatus::Failed(ItemFailure { class: FailureClass::Fatal, attempts: 1, .. })
        ));
        assert_eq!(fetcher.calls("a"), 1);
        assert!(!store.contains("chan", "a").await);
    }

    #[tokio::test]
    async fn item_committed_meanwhile_is_not_fetched() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (_dir, store, scheduler) = setup(fetcher.clone(), 1);
        store.commit("chan", "a").await.unwrap();

        let outcomes = scheduler.run_channel(make_channel(), make_items(&["a"])).await;

        assert_eq!(outcomes[0].status, ItemStatus::AlreadySeen);
        assert_eq!(fetcher.calls("a"), 0);
    }

    #[tokio::test]
    async fn global_limit_bounds_concurrency() {
        let fetcher = Arc::new(ScriptedFetcher {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let (_dir, _store, scheduler) = setup(fetcher.clone(), 2);

        scheduler
            .run_channel(make_channel(), make_items(&["a", "b", "c", "d", "e"]))
            .await;

        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn per_channel_limit_bounds_concurrency() {
        let fetcher = Arc::new(ScriptedFetcher {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let (_dir, _store, scheduler) = setup(fetcher.clone(), 4);
        let scheduler = scheduler.with_per_channel(Some(1));

        scheduler
            .run_channel(make_channel(), make_items(&["a", "b", "c"]))
            .await;

        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_run_commits_nothing() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let dir = tempdir().unwrap();
        let store = Arc::new(ProgressStore::empty(&dir.path().join("progress.json")));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scheduler = DownloadScheduler::new(
            2,
            store.clone(),
            fetcher.clone(),
            fast_retry(),
            NoopReporter::shared(),
            cancel,
        );

        let outcomes = scheduler
            .run_channel(make_channel(), make_items(&["a", "b"]))
            .await;

        assert!(outcomes.iter().all(|o| o.status == ItemStatus::Cancelled));
        assert_eq!(fetcher.calls("a") + fetcher.calls("b"), 0);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_attempt_commits_nothing() {
        let fetcher = Arc::new(ScriptedFetcher {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("progress.json");
        let store = Arc::new(ProgressStore::empty(&state_path));
        let cancel = CancellationToken::new();
        let scheduler = DownloadScheduler::new(
            1,
            store.clone(),
            fetcher.clone(),
            fast_retry(),
            NoopReporter::shared(),
            cancel.clone(),
        );

        let watcher = fetcher.clone();
        tokio::spawn(async move {
            while watcher.in_flight.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        });

        let outcomes = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run_channel(make_channel(), make_items(&["a", "b"])),
        )
        .await
        .unwrap();

        assert!(outcomes.iter().all(|o| o.status == ItemStatus::Cancelled));
        assert_eq!(fetcher.calls("a") + fetcher.calls("b"), 1);
        assert!(store.snapshot().await.is_empty());
        assert!(!state_path.exists());
    }
}

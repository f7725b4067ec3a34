// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{Channel, ChannelRegistry};
use crate::error::{FailureKind, ListingError, RunError};
use crate::fetch::{SharedFetcher, prepare_destination};
use crate::listing::{Item, SharedLister};
use crate::plan::create_channel_plan;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::retry::RetryPolicy;
use crate::scheduler::{DownloadScheduler, ItemOutcome, ItemStatus};
use crate::state::ProgressStore;

/// Options for one run over all channels
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of concurrent fetches (and listings) across all channels
    pub max_concurrent: usize,
    /// Maximum number of concurrent fetches within one channel (None = only the global limit)
    pub per_channel: Option<usize>,
    pub retry: RetryPolicy,
    /// Maximum number of items to fetch per channel (None = all)
    pub limit: Option<usize>,
    /// Date window for channels that do not configure their own
    pub since: Option<NaiveDate>,
    /// List and plan only
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            per_channel: None,
            retry: RetryPolicy::default(),
            limit: None,
            since: None,
            dry_run: false,
        }
    }
}

/// Files the run loads before doing anything else
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub config: PathBuf,
    /// Base directory for channels without an explicit destination
    pub download_dir: PathBuf,
    pub state: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Completed,
    /// The channel could not be listed; none of its items were touched
    ListingFailed { kind: FailureKind, reason: String },
    /// The channel could not be processed for another reason
    Failed { reason: String },
    Cancelled,
}

/// What happened to one channel during a run
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub channel_id: String,
    pub label: String,
    pub status: ChannelStatus,
    pub listed: usize,
    pub already_seen: usize,
    /// Listed items not in the seen set
    pub new_items: usize,
    /// Items selected for fetching (or that would be fetched in a dry run)
    pub planned: usize,
    pub partial_files_cleaned: usize,
    pub items: Vec<ItemOutcome>,
}

impl ChannelReport {
    fn new(channel: &Channel, status: ChannelStatus) -> Self {
        Self {
            channel_id: channel.id.clone(),
            label: channel.label.clone(),
            status,
            listed: 0,
            already_seen: 0,
            new_items: 0,
            planned: 0,
            partial_files_cleaned: 0,
            items: Vec::new(),
        }
    }

    pub fn downloaded(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Downloaded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&ItemStatus) -> bool) -> usize {
        self.items.iter().filter(|o| predicate(&o.status)).count()
    }
}

/// Result of a run
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// One report per configured channel, in registry order
    pub channels: Vec<ChannelReport>,
    pub cancelled: bool,
}

impl RunResult {
    pub fn downloaded(&self) -> usize {
        self.channels.iter().map(ChannelReport::downloaded).sum()
    }

    pub fn failed(&self) -> usize {
        self.channels.iter().map(ChannelReport::failed).sum()
    }

    /// Channels that did not complete (listing or processing failed)
    pub fn failed_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| {
                matches!(
                    c.status,
                    ChannelStatus::ListingFailed { .. } | ChannelStatus::Failed { .. }
                )
            })
            .count()
    }

    /// Whether anything the user asked for did not happen
    pub fn has_failures(&self) -> bool {
        self.cancelled || self.failed() > 0 || self.failed_channels() > 0
    }
}

/// Load the registry and progress state, then run
///
/// Loading happens before any listing or fetching, so a configuration or
/// state problem aborts the run without touching the network or the
/// state file.
pub async fn run_from_paths(
    paths: &RunPaths,
    lister: SharedLister,
    fetcher: SharedFetcher,
    options: &RunOptions,
    reporter: SharedProgressReporter,
    cancel: CancellationToken,
) -> Result<RunResult, RunError> {
    let registry = ChannelRegistry::load(&paths.config, &paths.download_dir)?;
    let store = Arc::new(ProgressStore::load(&paths.state)?);

    Ok(run(&registry, store, lister, fetcher, options, reporter, cancel).await)
}

/// Process every channel of `registry` once
///
/// Channels run concurrently and independently: a listing failure or an
/// item failure in one channel never affects another. All channel tasks
/// are awaited before the result is returned.
pub async fn run(
    registry: &ChannelRegistry,
    store: Arc<ProgressStore>,
    lister: SharedLister,
    fetcher: SharedFetcher,
    options: &RunOptions,
    reporter: SharedProgressReporter,
    cancel: CancellationToken,
) -> RunResult {
    reporter.report(ProgressEvent::RunStarted {
        channels: registry.len(),
    });

    let scheduler = Arc::new(
        DownloadScheduler::new(
            options.max_concurrent,
            store.clone(),
            fetcher,
            options.retry.clone(),
            reporter.clone(),
            cancel.clone(),
        )
        .with_per_channel(options.per_channel),
    );
    let listing_slots = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
    let mut prepared = if options.dry_run {
        HashMap::new()
    } else {
        prepare_destinations(registry).await
    };

    let mut handles = Vec::with_capacity(registry.len());
    for channel in registry.channels() {
        let channel = Arc::new(channel.clone());
        let task = ChannelTask {
            prepared: prepared.remove(&channel.id).unwrap_or(Ok(0)),
            channel: channel.clone(),
            store: store.clone(),
            lister: lister.clone(),
            scheduler: scheduler.clone(),
            listing_slots: listing_slots.clone(),
            options: options.clone(),
            reporter: reporter.clone(),
            cancel: cancel.clone(),
        };
        handles.push((channel, tokio::spawn(task.run())));
    }

    let mut channels = Vec::with_capacity(handles.len());
    for (channel, handle) in handles {
        let report = handle.await.unwrap_or_else(|e| {
            tracing::error!(channel = %channel.id, error = %e, "Channel task failed");
            ChannelReport::new(
                &channel,
                ChannelStatus::Failed {
                    reason: format!("Channel task failed: {}", e),
                },
            )
        });
        channels.push(report);
    }

    let result = RunResult {
        channels,
        cancelled: cancel.is_cancelled(),
    };

    reporter.report(ProgressEvent::RunCompleted {
        downloaded_count: result.downloaded(),
        failed_count: result.failed(),
        failed_channels: result.failed_channels(),
        cancelled: result.cancelled,
    });

    result
}

/// Remove leftovers of interrupted downloads once per destination
///
/// Runs before any channel task starts, so channels sharing a destination
/// never delete each other's in-flight downloads. The removed count is
/// attributed to the first channel using a destination; a failure is
/// reported for every channel using it.
async fn prepare_destinations(
    registry: &ChannelRegistry,
) -> HashMap<String, Result<usize, String>> {
    let mut by_destination: HashMap<PathBuf, Result<(), String>> = HashMap::new();
    let mut prepared = HashMap::with_capacity(registry.len());

    for channel in registry.channels() {
        let outcome = match by_destination.get(&channel.destination) {
            Some(Ok(())) => Ok(0),
            Some(Err(reason)) => Err(reason.clone()),
            None => {
                let outcome = prepare_destination(&channel.destination)
                    .await
                    .map_err(|e| {
                        tracing::error!(channel = %channel.id, error = %e, "Cannot prepare destination");
                        e.to_string()
                    });
                by_destination.insert(
                    channel.destination.clone(),
                    outcome.as_ref().map(|_| ()).map_err(Clone::clone),
                );
                outcome
            }
        };
        prepared.insert(channel.id.clone(), outcome);
    }

    prepared
}

/// Everything one spawned channel task owns
struct ChannelTask {
    /// Partial files removed from the destination, or why it is unusable
    prepared: Result<usize, String>,
    channel: Arc<Channel>,
    store: Arc<ProgressStore>,
    lister: SharedLister,
    scheduler: Arc<DownloadScheduler>,
    listing_slots: Arc<Semaphore>,
    options: RunOptions,
    reporter: SharedProgressReporter,
    cancel: CancellationToken,
}

impl ChannelTask {
    async fn run(self) -> ChannelReport {
        let channel = &self.channel;
        let mut report = ChannelReport::new(channel, ChannelStatus::Completed);

        match &self.prepared {
            Ok(0) => {}
            Ok(count) => {
                report.partial_files_cleaned = *count;
                self.reporter.report(ProgressEvent::PartialFilesCleanedUp {
                    channel_id: channel.id.clone(),
                    count: *count,
                });
            }
            Err(reason) => {
                report.status = ChannelStatus::Failed {
                    reason: reason.clone(),
                };
                return report;
            }
        }

        let Some(listing) = self.list().await else {
            report.status = ChannelStatus::Cancelled;
            return report;
        };

        let items = match listing {
            Ok(items) => items,
            Err(e) => {
                let kind = e.kind();
                let reason = e.to_string();
                self.reporter.report(ProgressEvent::ListingFailed {
                    channel_id: channel.id.clone(),
                    label: channel.label.clone(),
                    error: reason.clone(),
                    kind,
                });
                report.status = ChannelStatus::ListingFailed { kind, reason };
                return report;
            }
        };

        let seen = self.store.seen(&channel.id).await;
        let since = channel.since.or(self.options.since);
        let plan = create_channel_plan(items, &seen, since, self.options.limit);

        report.listed = plan.total_listed;
        report.already_seen = plan.already_seen;
        report.new_items = plan.novel;
        report.planned = plan.to_download.len();

        tracing::debug!(
            channel = %channel.id,
            listed = plan.total_listed,
            seen = plan.already_seen,
            novel = plan.novel,
            outside_window = plan.outside_window,
            limited = plan.limited,
            "Channel planned"
        );
        self.reporter.report(ProgressEvent::ChannelPlanned {
            channel_id: channel.id.clone(),
            label: channel.label.clone(),
            listed: plan.total_listed,
            new_items: plan.novel,
            to_download: plan.to_download.len(),
        });

        if self.options.dry_run {
            for item in &plan.to_download {
                self.reporter.report(ProgressEvent::WouldDownload {
                    channel_id: channel.id.clone(),
                    item_id: item.item_id.clone(),
                    title: item.title.clone(),
                });
            }
            return report;
        }

        report.items = self
            .scheduler
            .run_channel(channel.clone(), plan.to_download)
            .await;

        if report
            .items
            .iter()
            .any(|o| o.status == ItemStatus::Cancelled)
        {
            report.status = ChannelStatus::Cancelled;
        }

        report
    }

    /// List the channel under the shared listing limit; `None` when cancelled
    async fn list(&self) -> Option<Result<Vec<Item>, ListingError>> {
        self.reporter.report(ProgressEvent::ListingChannel {
            channel_id: self.channel.id.clone(),
            label: self.channel.label.clone(),
        });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            listing = async {
                let _permit = self.listing_slots.acquire().await.ok()?;
                Some(self.lister.list_items(&self.channel).await)
            } => listing,
        }
    }
}

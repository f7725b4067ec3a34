// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use crate::error::FailureKind;

/// Events emitted during a run for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The registry and progress state are loaded and channels are about to be processed
    RunStarted { channels: usize },

    /// A channel is being listed
    ListingChannel { channel_id: String, label: String },

    /// Listing finished and the novelty filter produced a plan
    ChannelPlanned {
        channel_id: String,
        label: String,
        listed: usize,
        new_items: usize,
        to_download: usize,
    },

    /// Listing a channel failed; the channel is skipped for this run
    ListingFailed {
        channel_id: String,
        label: String,
        error: String,
        kind: FailureKind,
    },

    /// Leftovers from interrupted downloads were removed from a destination
    PartialFilesCleanedUp { channel_id: String, count: usize },

    /// An item would be fetched (dry run only)
    WouldDownload {
        channel_id: String,
        item_id: String,
        title: String,
    },

    /// A fetch attempt is starting
    DownloadStarting {
        channel_id: String,
        item_id: String,
        title: String,
        /// 1-based attempt number
        attempt: u32,
    },

    /// A transient failure will be retried after `delay`
    RetryScheduled {
        channel_id: String,
        item_id: String,
        title: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },

    /// An item was fetched and committed
    DownloadCompleted {
        channel_id: String,
        item_id: String,
        title: String,
    },

    /// An item was not committed this run
    DownloadFailed {
        channel_id: String,
        item_id: String,
        title: String,
        error: String,
        /// Transient means the item will be retried next run
        kind: FailureKind,
    },

    /// Merging was requested but no media conversion tool is installed
    MediaToolMissing,

    /// Run finished
    RunCompleted {
        downloaded_count: usize,
        failed_count: usize,
        failed_channels: usize,
        cancelled: bool,
    },
}

/// Trait for reporting progress events during a run.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Reporter that forwards every event to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl TracingReporter {
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

impl ProgressReporter for TracingReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::ListingFailed {
                channel_id,
                error,
                kind,
                ..
            } => tracing::warn!(channel = %channel_id, ?kind, %error, "Listing failed"),
            ProgressEvent::RetryScheduled {
                channel_id,
                item_id,
                attempt,
                delay,
                error,
                ..
            } => tracing::warn!(
                channel = %channel_id,
                item = %item_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "Fetch failed, retrying"
            ),
            ProgressEvent::DownloadFailed {
                channel_id,
                item_id,
                error,
                kind,
                ..
            } => tracing::error!(channel = %channel_id, item = %item_id, ?kind, %error, "Fetch failed"),
            ProgressEvent::MediaToolMissing => {
                tracing::warn!("ffmpeg/avconv not found, merged formats will fail")
            }
            other => tracing::info!(event = ?other),
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod adapters;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod listing;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod sync;
pub mod ytdlp;

// Re-export main types for convenience
pub use adapters::{AdapterOptions, SourceAdapters};
pub use config::{Channel, ChannelRegistry, SourceKind, parse_since};
pub use error::{ConfigError, FailureKind, FetchError, ListingError, RunError, StateError};
pub use fetch::{Artifact, FetchAdapter, SharedFetcher};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use listing::{Item, ListingAdapter, SharedLister};
pub use plan::{ChannelPlan, create_channel_plan, filter_novel};
pub use progress::{
    NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter, TracingReporter,
};
pub use retry::RetryPolicy;
pub use scheduler::{FailureClass, ItemOutcome, ItemStatus};
pub use state::{CommitOutcome, ProgressStore};
pub use sync::{ChannelReport, ChannelStatus, RunOptions, RunPaths, RunResult, run, run_from_paths};
pub use ytdlp::YtDlp;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Channel, SourceKind};
use crate::error::{FetchError, ListingError};
use crate::fetch::{Artifact, FetchAdapter, HttpFetcher, YtDlpFetcher};
use crate::http::ReqwestClient;
use crate::listing::{FeedLister, Item, ListingAdapter, YtDlpLister};
use crate::ytdlp::YtDlp;

/// Settings for the built-in adapters
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub ytdlp: YtDlp,
    /// yt-dlp format selector
    pub format: String,
    /// Merge container, or `keep`
    pub merge_format: String,
    pub listing_timeout: Option<Duration>,
}

/// Lists and fetches each channel with the adapter matching its [`SourceKind`]
pub struct SourceAdapters {
    ytdlp_lister: YtDlpLister,
    ytdlp_fetcher: YtDlpFetcher,
    feed_lister: FeedLister<ReqwestClient>,
    http_fetcher: HttpFetcher<ReqwestClient>,
}

impl SourceAdapters {
    pub fn new(options: AdapterOptions, client: Arc<ReqwestClient>) -> Self {
        let mut ytdlp_lister = YtDlpLister::new(options.ytdlp.clone());
        if let Some(timeout) = options.listing_timeout {
            ytdlp_lister = ytdlp_lister.with_timeout(timeout);
        }

        Self {
            ytdlp_lister,
            ytdlp_fetcher: YtDlpFetcher::new(options.ytdlp)
                .with_format(options.format)
                .with_merge_format(&options.merge_format),
            feed_lister: FeedLister::new(client.clone()),
            http_fetcher: HttpFetcher::new(client),
        }
    }

    /// Whether yt-dlp fetches may need ffmpeg to merge streams
    pub fn needs_merging_tool(&self) -> bool {
        self.ytdlp_fetcher.needs_merging_tool()
    }
}

#[async_trait]
impl ListingAdapter for SourceAdapters {
    async fn list_items(&self, channel: &Channel) -> Result<Vec<Item>, ListingError> {
        match channel.kind {
            SourceKind::YtDlp => self.ytdlp_lister.list_items(channel).await,
            SourceKind::Feed => self.feed_lister.list_items(channel).await,
        }
    }
}

#[async_trait]
impl FetchAdapter for SourceAdapters {
    async fn fetch(&self, channel: &Channel, item: &Item) -> Result<Artifact, FetchError> {
        match channel.kind {
            SourceKind::YtDlp => self.ytdlp_fetcher.fetch(channel, item).await,
            SourceKind::Feed => self.http_fetcher.fetch(channel, item).await,
        }
    }
}

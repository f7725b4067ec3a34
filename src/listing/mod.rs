// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod feed;
mod ytdlp;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use url::Url;

use crate::config::Channel;
use crate::error::ListingError;

pub use feed::{FeedLister, is_url, parse_feed};
pub use ytdlp::{YtDlpLister, parse_listing};

/// One piece of content currently offered by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Identity, unique within the channel
    pub item_id: String,
    /// Position in the producer's listing (0 = first listed)
    pub ordering_key: usize,
    pub published: Option<NaiveDate>,
    pub title: String,
    /// Page or media address handed to the fetch adapter
    pub url: String,
    /// Direct media file, when the listing exposes one
    pub media: Option<Media>,
}

/// A directly downloadable media file attached to an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub url: Url,
    pub mime_type: Option<String>,
    pub length: Option<u64>,
}

/// Enumerates the items a channel currently offers, in producer order
#[async_trait]
pub trait ListingAdapter: Send + Sync {
    async fn list_items(&self, channel: &Channel) -> Result<Vec<Item>, ListingError>;
}

/// A shared reference to a listing adapter
pub type SharedLister = Arc<dyn ListingAdapter>;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::config::Channel;
use crate::error::ListingError;
use crate::http::HttpClient;

use super::{Item, ListingAdapter, Media};

/// Lists the items of an RSS feed that carry an enclosure
pub struct FeedLister<C> {
    client: Arc<C>,
}

impl<C: HttpClient> FeedLister<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    async fn fetch_feed_bytes(&self, url: &str) -> Result<Vec<u8>, ListingError> {
        let response = self
            .client
            .get_bytes(url)
            .await
            .map_err(|e| ListingError::FetchFailed {
                url: url.to_string(),
                source: e,
            })?;

        if response.status >= 400 {
            return Err(ListingError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        Ok(response.body.to_vec())
    }
}

#[async_trait]
impl<C: HttpClient + 'static> ListingAdapter for FeedLister<C> {
    async fn list_items(&self, channel: &Channel) -> Result<Vec<Item>, ListingError> {
        let source = channel.source_locator.as_str();

        let bytes = if is_url(source) {
            Url::parse(source)?;
            self.fetch_feed_bytes(source).await?
        } else {
            read_feed_file(Path::new(source))?
        };

        parse_feed(&bytes)
    }
}

/// Read raw feed bytes from a local file
fn read_feed_file(path: &Path) -> Result<Vec<u8>, ListingError> {
    std::fs::read(path).map_err(|e| ListingError::FileReadFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Determine if a string is a URL or a file path
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Parse RSS feed XML into items, skipping entries without an enclosure
pub fn parse_feed(xml_bytes: &[u8]) -> Result<Vec<Item>, ListingError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let mut items = Vec::new();
    for entry in channel.items() {
        if let Some(item) = parse_item(entry, items.len()) {
            items.push(item);
        }
    }

    Ok(items)
}

fn parse_item(entry: &rss::Item, ordering_key: usize) -> Option<Item> {
    let enclosure = entry.enclosure()?;
    let media_url = Url::parse(enclosure.url()).ok()?;

    let item_id = entry
        .guid()
        .map(|g| g.value().to_string())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| media_url.to_string());

    let published = entry.pub_date().and_then(|date_str| {
        DateTime::parse_from_rfc2822(date_str)
            .ok()
            .or_else(|| parse_relaxed_date(date_str))
            .map(|dt| dt.date_naive())
    });

    Some(Item {
        item_id,
        ordering_key,
        published,
        title: entry
            .title()
            .map(String::from)
            .unwrap_or_else(|| "Untitled".to_string()),
        url: entry
            .link()
            .map(String::from)
            .unwrap_or_else(|| media_url.to_string()),
        media: Some(Media {
            url: media_url,
            mime_type: Some(enclosure.mime_type().to_string()).filter(|s| !s.is_empty()),
            length: enclosure.length().parse().ok(),
        }),
    })
}

/// Try dates that don't strictly conform to RFC 2822
fn parse_relaxed_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    const FORMATS: [&str; 3] = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str.trim(), format).ok())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::Channel;
use crate::error::ListingError;
use crate::ytdlp::{RunFailure, YtDlp, classify_listing_failure};

use super::{Item, ListingAdapter};

/// Leaf entry as printed by `--flat-playlist --dump-single-json`
#[derive(Debug, Deserialize)]
struct Entry {
    id: Option<Value>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    upload_date: Option<String>,
    timestamp: Option<f64>,
}

/// Lists channels and playlists through yt-dlp without resolving formats
#[derive(Debug, Clone)]
pub struct YtDlpLister {
    ytdlp: YtDlp,
    timeout: Option<Duration>,
}

impl YtDlpLister {
    pub fn new(ytdlp: YtDlp) -> Self {
        Self {
            ytdlp,
            timeout: None,
        }
    }

    /// Give up on a listing that takes longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ListingAdapter for YtDlpLister {
    async fn list_items(&self, channel: &Channel) -> Result<Vec<Item>, ListingError> {
        let output = self
            .ytdlp
            .run(listing_args(&channel.source_locator), self.timeout)
            .await
            .map_err(|failure| match failure {
                RunFailure::NotFound => ListingError::ToolMissing {
                    program: self.ytdlp.program_name(),
                },
                RunFailure::Spawn(source) => ListingError::SpawnFailed {
                    program: self.ytdlp.program_name(),
                    source,
                },
                RunFailure::TimedOut(limit) => ListingError::Timeout(limit),
            })?;

        if !output.status.success() {
            return Err(ListingError::CommandFailed {
                status: output.status.code(),
                kind: classify_listing_failure(&output.stderr),
                stderr: output.stderr,
            });
        }

        parse_listing(&output.stdout)
    }
}

fn listing_args(locator: &str) -> [&str; 7] {
    [
        "--flat-playlist",
        "--dump-single-json",
        "--no-warnings",
        "--extractor-args",
        "youtubetab:approximate_date",
        "--",
        locator,
    ]
}

/// Parse yt-dlp's single-JSON listing into items in producer order
///
/// Nested playlists (channel tabs) are flattened depth first. A URL that
/// points at a single video yields that video as the only item. Entries
/// that cannot be read are skipped so one odd entry does not hide the rest
/// of the channel.
pub fn parse_listing(json: &[u8]) -> Result<Vec<Item>, ListingError> {
    let root: Map<String, Value> =
        serde_json::from_slice(json).map_err(ListingError::InvalidOutput)?;

    let mut items = Vec::new();
    collect_object(root, &mut items);

    Ok(items)
}

fn collect_object(mut fields: Map<String, Value>, items: &mut Vec<Item>) {
    if let Some(Value::Array(entries)) = fields.remove("entries") {
        for entry in entries {
            if let Value::Object(nested) = entry {
                collect_object(nested, items);
            }
        }
        return;
    }

    match serde_json::from_value::<Entry>(Value::Object(fields)) {
        Ok(entry) => push_item(entry, items),
        Err(e) => tracing::warn!(error = %e, "Skipping unreadable listing entry"),
    }
}

fn entry_id(id: Option<Value>) -> Option<String> {
    match id? {
        Value::String(id) if !id.is_empty() => Some(id),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn push_item(entry: Entry, items: &mut Vec<Item>) {
    let Some(item_id) = entry_id(entry.id) else {
        return;
    };

    let published = entry
        .upload_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok())
        .or_else(|| {
            entry
                .timestamp
                .and_then(|ts| DateTime::from_timestamp(ts.floor() as i64, 0))
                .map(|dt| dt.date_naive())
        });

    let url = entry
        .url
        .or(entry.webpage_url)
        .unwrap_or_else(|| item_id.clone());

    items.push(Item {
        ordering_key: items.len(),
        title: entry.title.unwrap_or_default(),
        item_id,
        published,
        url,
        media: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use std::path::PathBuf;

    const CHANNEL_LISTING: &str = r#"{
        "_type": "playlist",
        "id": "UC123",
        "title": "Example - Videos",
        "entries": [
            {"_type": "url", "id": "vid-3", "title": "Third", "url": "https://www.youtube.com/watch?v=vid-3", "timestamp": 1706745600},
            {"_type": "url", "id": "vid-2", "title": "Second", "url": "https://www.youtube.com/watch?v=vid-2", "upload_date": "20240115"},
            null,
            {"_type": "url", "id": "vid-1", "title": "First"}
        ]
    }"#;

    #[test]
    fn parses_entries_in_producer_order() {
        let items = parse_listing(CHANNEL_LISTING.as_bytes()).unwrap();

        let ids: Vec<_> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["vid-3", "vid-2", "vid-1"]);
        assert_eq!(
            items.iter().map(|i| i.ordering_key).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[test]
    fn extracts_dates_and_urls() {
        let items = parse_listing(CHANNEL_LISTING.as_bytes()).unwrap();

        assert_eq!(items[0].published, NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(items[1].published, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(items[2].published, None);
        assert_eq!(items[1].url, "https://www.youtube.com/watch?v=vid-2");
        // Bare ids are accepted by yt-dlp as fetch targets
        assert_eq!(items[2].url, "vid-1");
    }

    #[test]
    fn flattens_channel_tabs() {
        let listing = r#"{
            "id": "UC123",
            "entries": [
                {"_type": "playlist", "id": "UC123-videos", "entries": [{"id": "a"}, {"id": "b"}]},
                {"_type": "playlist", "id": "UC123-shorts", "entries": [{"id": "c"}]}
            ]
        }"#;

        let items = parse_listing(listing.as_bytes()).unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn single_video_lists_itself() {
        let listing = r#"{"id": "solo", "title": "Solo", "webpage_url": "https://www.youtube.com/watch?v=solo"}"#;
        let items = parse_listing(listing.as_bytes()).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "solo");
        assert_eq!(items[0].url, "https://www.youtube.com/watch?v=solo");
    }

    #[test]
    fn unreadable_entry_does_not_hide_its_siblings() {
        let listing = r#"{
            "id": "UC123",
            "entries": [
                {"id": "ok-1", "title": "Fine", "timestamp": 1706745600},
                {"id": "odd-2", "title": "Fractional", "timestamp": 1706745600.5},
                {"id": "odd-3", "title": ["not", "a", "string"]},
                {"id": 42, "title": "Numeric id"},
                "garbage"
            ]
        }"#;

        let items = parse_listing(listing.as_bytes()).unwrap();

        let ids: Vec<_> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["ok-1", "odd-2", "42"]);
        assert_eq!(items[1].published, NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(
            items.iter().map(|i| i.ordering_key).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[test]
    fn locator_is_never_read_as_an_option() {
        let args = listing_args("-rf-looking-locator");
        assert_eq!(&args[5..], ["--", "-rf-looking-locator"]);
    }

    #[test]
    fn invalid_output_is_transient() {
        let err = parse_listing(b"{not json").unwrap_err();
        assert!(matches!(err, ListingError::InvalidOutput(_)));
        assert_eq!(err.kind(), crate::error::FailureKind::Transient);
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let lister = YtDlpLister::new(YtDlp::new("/nonexistent/yt-dlp"));
        let channel = Channel {
            id: "c".to_string(),
            label: "C".to_string(),
            source_locator: "https://www.youtube.com/@c".to_string(),
            destination: PathBuf::from("/tmp/c"),
            since: None,
            kind: SourceKind::YtDlp,
        };

        let err = lister.list_items(&channel).await.unwrap_err();
        assert!(matches!(err, ListingError::ToolMissing { .. }));
        assert_eq!(err.kind(), crate::error::FailureKind::Fatal);
    }
}

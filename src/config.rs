// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{Days, Local, NaiveDate};
use serde::Deserialize;

use crate::error::ConfigError;

/// Which adapter pair lists and fetches a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SourceKind {
    /// Any site yt-dlp understands (channels, playlists)
    #[default]
    #[serde(rename = "yt-dlp", alias = "youtube")]
    YtDlp,
    /// An RSS feed whose items carry an enclosure
    #[serde(rename = "feed", alias = "rss")]
    Feed,
}

/// A configured content source, immutable for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Stable identifier, unique within the registry
    pub id: String,
    /// Human readable name
    pub label: String,
    /// Address handed to the listing and fetch adapters
    pub source_locator: String,
    /// Directory receiving this channel's artifacts
    pub destination: PathBuf,
    /// Ignore items published before this date
    pub since: Option<NaiveDate>,
    pub kind: SourceKind,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    channels: Option<Vec<ChannelEntry>>,
}

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    url: Option<String>,
    label: Option<String>,
    id: Option<String>,
    destination: Option<PathBuf>,
    since: Option<String>,
    #[serde(default)]
    kind: SourceKind,
}

/// All channels configured for one run
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    /// Load the registry from a JSON config file
    ///
    /// Channels without a `destination` override land in
    /// `<download_dir>/<slug of label>`.
    pub fn load(path: &Path, download_dir: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path, download_dir)
    }

    /// Parse config JSON; `path` is only used in error messages
    pub fn parse(json: &str, path: &Path, download_dir: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        let entries = file
            .channels
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ConfigError::NoChannels(path.to_path_buf()))?;

        let today = Local::now().date_naive();
        let mut channels = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            let url = entry
                .url
                .filter(|u| !u.trim().is_empty())
                .ok_or(ConfigError::MissingUrl { index })?;

            let label = infer_label(entry.label.as_deref(), &url);
            let slug = slugify(&label);

            let since = entry
                .since
                .as_deref()
                .map(|raw| parse_since(raw, today))
                .transpose()?;

            channels.push(Channel {
                id: entry.id.unwrap_or_else(|| slug.clone()),
                label,
                source_locator: url,
                destination: entry
                    .destination
                    .unwrap_or_else(|| download_dir.join(&slug)),
                since,
                kind: entry.kind,
            });
        }

        Self::from_channels(channels)
    }

    /// Build a registry, rejecting duplicate channel ids
    pub fn from_channels(channels: Vec<Channel>) -> Result<Self, ConfigError> {
        let mut ids = HashSet::new();
        for channel in &channels {
            if !ids.insert(channel.id.as_str()) {
                return Err(ConfigError::DuplicateChannel {
                    id: channel.id.clone(),
                });
            }
        }

        Ok(Self { channels })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Convert an arbitrary label into a safe folder/file name
pub fn slugify(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut last_was_underscore = false;

    for c in value.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '_'
        };

        if c == '_' {
            if !last_was_underscore {
                result.push('_');
            }
            last_was_underscore = true;
        } else {
            result.push(c);
            last_was_underscore = false;
        }
    }

    let trimmed = result.trim_matches('_');
    if trimmed.is_empty() {
        "channel".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Pick a display label: the configured one, else the last URL path segment
pub fn infer_label(label: Option<&str>, url: &str) -> String {
    if let Some(label) = label.filter(|l| !l.is_empty()) {
        return label.to_string();
    }

    url.trim_end_matches('/')
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string()
}

/// Parse `YYYY-MM-DD`, `today` or `yesterday` relative to `today`
pub fn parse_since(value: &str, today: NaiveDate) -> Result<NaiveDate, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "today" => Ok(today),
        "yesterday" => today
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| ConfigError::InvalidDate {
                value: value.to_string(),
            }),
        _ => NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
            ConfigError::InvalidDate {
                value: value.to_string(),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(json: &str) -> Result<ChannelRegistry, ConfigError> {
        ChannelRegistry::parse(json, Path::new("channels.json"), Path::new("downloads"))
    }

    #[test]
    fn slugify_replaces_unsafe_runs() {
        assert_eq!(slugify("My Channel!!"), "My_Channel");
        assert_eq!(slugify("  @Example/Videos "), "Example_Videos");
        assert_eq!(slugify("a__b"), "a_b");
        assert_eq!(slugify("keep.dots-and_dashes"), "keep.dots-and_dashes");
    }

    #[test]
    fn slugify_falls_back_to_channel() {
        assert_eq!(slugify("???"), "channel");
        assert_eq!(slugify(""), "channel");
    }

    #[test]
    fn infer_label_prefers_configured_label() {
        assert_eq!(
            infer_label(Some("News"), "https://www.youtube.com/@Example"),
            "News"
        );
        assert_eq!(
            infer_label(None, "https://www.youtube.com/@Example/"),
            "@Example"
        );
        assert_eq!(infer_label(Some(""), "https://example.com/feed"), "feed");
    }

    #[test]
    fn parse_since_accepts_keywords_and_dates() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_since("today", today).unwrap(), today);
        assert_eq!(
            parse_since("Yesterday", today).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            parse_since("2023-12-24", today).unwrap(),
            NaiveDate::from_ymd_opt(2023, 12, 24).unwrap()
        );
        assert!(matches!(
            parse_since("last week", today),
            Err(ConfigError::InvalidDate { .. })
        ));
    }

    #[test]
    fn parse_builds_channels_with_defaults() {
        let registry = parse(
            r#"{"channels": [
                {"url": "https://www.youtube.com/@Example"},
                {"url": "https://example.com/feed.xml", "label": "Pod Cast", "kind": "feed",
                 "id": "pod", "destination": "/media/pod", "since": "2024-01-01"}
            ], "notifications": {}}"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);

        let first = &registry.channels()[0];
        assert_eq!(first.id, "Example");
        assert_eq!(first.label, "@Example");
        assert_eq!(first.destination, PathBuf::from("downloads/Example"));
        assert_eq!(first.kind, SourceKind::YtDlp);
        assert!(first.since.is_none());

        let second = &registry.channels()[1];
        assert_eq!(second.id, "pod");
        assert_eq!(second.destination, PathBuf::from("/media/pod"));
        assert_eq!(second.kind, SourceKind::Feed);
        assert_eq!(second.since, NaiveDate::from_ymd_opt(2024, 1, 1));
    }

    #[test]
    fn duplicate_ids_fail_the_load() {
        let result = parse(
            r#"{"channels": [
                {"url": "https://a.example/x", "id": "same"},
                {"url": "https://b.example/y", "id": "same"}
            ]}"#,
        );

        match result {
            Err(ConfigError::DuplicateChannel { id }) => assert_eq!(id, "same"),
            other => panic!("Expected DuplicateChannel, got {:?}", other),
        }
    }

    #[test]
    fn labels_that_slug_identically_collide() {
        let result = parse(
            r#"{"channels": [
                {"url": "https://a.example/x", "label": "My Show"},
                {"url": "https://b.example/y", "label": "My/Show"}
            ]}"#,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateChannel { .. })));
    }

    #[test]
    fn missing_url_is_rejected() {
        let result = parse(r#"{"channels": [{"url": "https://a.example"}, {"label": "x"}]}"#);
        assert!(matches!(result, Err(ConfigError::MissingUrl { index: 1 })));
    }

    #[test]
    fn empty_or_missing_channel_list_is_rejected() {
        assert!(matches!(parse(r#"{"channels": []}"#), Err(ConfigError::NoChannels(_))));
        assert!(matches!(parse(r#"{}"#), Err(ConfigError::NoChannels(_))));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            parse(r#"{"channels": [ "#),
            Err(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        let result = ChannelRegistry::load(&dir.path().join("nope.json"), dir.path());
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(&path, r#"{"channels": [{"url": "https://a.example/chan"}]}"#).unwrap();

        let registry = ChannelRegistry::load(&path, dir.path()).unwrap();
        assert_eq!(registry.channels()[0].destination, dir.path().join("chan"));
    }
}

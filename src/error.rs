// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Whether a failure may go away on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Expected to potentially succeed on retry (network, timing, rate limits)
    Transient,
    /// Not expected to succeed on retry
    Fatal,
}

impl FailureKind {
    /// Classify an HTTP status code
    pub fn from_http_status(status: u16) -> Self {
        match status {
            403 | 404 | 410 | 451 => FailureKind::Fatal,
            _ => FailureKind::Transient,
        }
    }
}

/// Errors that can occur when loading the channel configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file {0} not found")]
    NotFound(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config file {0} must contain a non-empty 'channels' list")]
    NoChannels(PathBuf),

    #[error("Channel entry #{index} is missing the required 'url' field")]
    MissingUrl { index: usize },

    #[error("Cannot parse date '{value}'. Use YYYY-MM-DD, 'today', or 'yesterday'")]
    InvalidDate { value: String },

    #[error("Channel id '{id}' is configured more than once")]
    DuplicateChannel { id: String },
}

/// Errors that can occur when loading or committing progress state
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Progress state {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Progress state {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("Failed to read progress state {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write progress state {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize progress state: {0}")]
    SerializeFailed(#[from] serde_json::Error),
}

/// Errors that can occur when listing a channel's items
#[derive(Error, Debug)]
pub enum ListingError {
    #[error("{program} not found on PATH")]
    ToolMissing { program: String },

    #[error("Failed to launch {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listing command failed with status {status:?}: {stderr}")]
    CommandFailed {
        status: Option<i32>,
        stderr: String,
        kind: FailureKind,
    },

    #[error("Listing timed out after {0:?}")]
    Timeout(Duration),

    #[error("Listing output could not be read: {0}")]
    InvalidOutput(#[source] serde_json::Error),

    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid source URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ListingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ListingError::ToolMissing { .. } => FailureKind::Fatal,
            ListingError::SpawnFailed { .. } => FailureKind::Transient,
            ListingError::CommandFailed { kind, .. } => *kind,
            ListingError::Timeout(_) => FailureKind::Transient,
            ListingError::InvalidOutput(_) => FailureKind::Transient,
            ListingError::FetchFailed { .. } => FailureKind::Transient,
            ListingError::HttpStatus { status, .. } => FailureKind::from_http_status(*status),
            ListingError::FileReadFailed { source, .. } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    FailureKind::Fatal
                } else {
                    FailureKind::Transient
                }
            }
            ListingError::ParseFailed(_) => FailureKind::Fatal,
            ListingError::InvalidUrl(_) => FailureKind::Fatal,
        }
    }
}

/// Errors that can occur while fetching a single item
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{program} not found on PATH")]
    ToolMissing { program: String },

    #[error("Media conversion tool missing: {stderr}")]
    MissingMediaTool { stderr: String },

    #[error("Failed to launch {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Fetch command failed with status {status:?}: {stderr}")]
    CommandFailed {
        status: Option<i32>,
        stderr: String,
        kind: FailureKind,
    },

    #[error("Fetch attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Item '{item_id}' produced no media file")]
    NoArtifact { item_id: String },

    #[error("Item '{item_id}' has no downloadable media")]
    NoMedia { item_id: String },

    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to prepare {path}: {source}")]
    PrepareFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} into place: {source}")]
    FinalizeFailed {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::ToolMissing { .. }
            | FetchError::MissingMediaTool { .. }
            | FetchError::NoMedia { .. } => FailureKind::Fatal,
            FetchError::CommandFailed { kind, .. } => *kind,
            FetchError::HttpStatus { status, .. } => FailureKind::from_http_status(*status),
            FetchError::SpawnFailed { .. }
            | FetchError::Timeout(_)
            | FetchError::NoArtifact { .. }
            | FetchError::HttpFailed { .. }
            | FetchError::StreamFailed { .. }
            | FetchError::PrepareFailed { .. }
            | FetchError::FileWriteFailed { .. }
            | FetchError::FinalizeFailed { .. } => FailureKind::Transient,
        }
    }
}

/// Errors that abort a whole run before any fetch begins
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

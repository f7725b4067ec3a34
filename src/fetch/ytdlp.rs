// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::Channel;
use crate::error::FetchError;
use crate::listing::Item;
use crate::ytdlp::{
    DEFAULT_FORMAT, KEEP_MERGE_TOKEN, OUTPUT_TEMPLATE, RunFailure, YtDlp, classify_fetch_failure,
    is_missing_media_tool,
};

use super::filename::sanitize_component;
use super::{Artifact, FetchAdapter, PARTIAL_SUFFIX};

/// Extensions yt-dlp uses for its own in-progress files
const INTERMEDIATE_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "tmp"];

/// Fetches items with yt-dlp through a per-item staging directory
///
/// yt-dlp writes into `<destination>/<item id>.partial/`; once it exits
/// successfully the produced media files are renamed into the destination.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    ytdlp: YtDlp,
    format: String,
    merge_format: Option<String>,
}

impl YtDlpFetcher {
    pub fn new(ytdlp: YtDlp) -> Self {
        Self {
            ytdlp,
            format: DEFAULT_FORMAT.to_string(),
            merge_format: Some("mp4".to_string()),
        }
    }

    /// yt-dlp format selector
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Container to merge into; `keep` leaves yt-dlp's choice alone
    pub fn with_merge_format(mut self, merge_format: &str) -> Self {
        self.merge_format = if merge_format.eq_ignore_ascii_case(KEEP_MERGE_TOKEN) {
            None
        } else {
            Some(merge_format.to_string())
        };
        self
    }

    /// Whether fetching may need ffmpeg to merge streams
    pub fn needs_merging_tool(&self) -> bool {
        self.merge_format.is_some()
    }

    fn build_args(&self, staging: &Path, item: &Item) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--no-warnings".into(),
            "--format".into(),
            self.format.clone().into(),
        ];

        if let Some(merge) = &self.merge_format {
            args.push("--merge-output-format".into());
            args.push(merge.into());
        }

        args.push("--paths".into());
        let mut home = OsString::from("home:");
        home.push(staging.as_os_str());
        args.push(home);
        args.push("--output".into());
        args.push(OUTPUT_TEMPLATE.into());
        args.push("--".into());
        args.push(item.url.clone().into());
        args
    }
}

#[async_trait]
impl FetchAdapter for YtDlpFetcher {
    async fn fetch(&self, channel: &Channel, item: &Item) -> Result<Artifact, FetchError> {
        let staging = channel.destination.join(format!(
            "{}{}",
            sanitize_component(&item.item_id),
            PARTIAL_SUFFIX
        ));
        reset_staging(&staging).await?;

        let output = self
            .ytdlp
            .run(self.build_args(&staging, item), None)
            .await
            .map_err(|failure| match failure {
                RunFailure::NotFound => FetchError::ToolMissing {
                    program: self.ytdlp.program_name(),
                },
                RunFailure::Spawn(source) => FetchError::SpawnFailed {
                    program: self.ytdlp.program_name(),
                    source,
                },
                RunFailure::TimedOut(limit) => FetchError::Timeout(limit),
            })?;

        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&staging).await;

            if is_missing_media_tool(&output.stderr) {
                return Err(FetchError::MissingMediaTool {
                    stderr: output.stderr,
                });
            }
            return Err(FetchError::CommandFailed {
                status: output.status.code(),
                kind: classify_fetch_failure(&output.stderr),
                stderr: output.stderr,
            });
        }

        let artifact = promote_staged_files(&staging, &channel.destination).await;
        let _ = tokio::fs::remove_dir_all(&staging).await;

        let artifact = artifact?;
        if artifact.files.is_empty() {
            return Err(FetchError::NoArtifact {
                item_id: item.item_id.clone(),
            });
        }

        Ok(artifact)
    }
}

/// Start from an empty staging directory
async fn reset_staging(staging: &Path) -> Result<(), FetchError> {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(FetchError::PrepareFailed {
                path: staging.to_path_buf(),
                source: e,
            });
        }
    }

    tokio::fs::create_dir_all(staging)
        .await
        .map_err(|e| FetchError::PrepareFailed {
            path: staging.to_path_buf(),
            source: e,
        })
}

/// Rename every finished media file from `staging` into `destination`
async fn promote_staged_files(staging: &Path, destination: &Path) -> Result<Artifact, FetchError> {
    let mut entries = tokio::fs::read_dir(staging)
        .await
        .map_err(|e| FetchError::FinalizeFailed {
            from: staging.to_path_buf(),
            source: e,
        })?;

    let mut staged: Vec<(PathBuf, u64)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FetchError::FinalizeFailed {
            from: staging.to_path_buf(),
            source: e,
        })?
    {
        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if metadata.is_file() && !is_intermediate(&path) {
            staged.push((path, metadata.len()));
        }
    }
    staged.sort();

    let mut artifact = Artifact {
        files: Vec::with_capacity(staged.len()),
        bytes: 0,
    };

    for (path, len) in staged {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = destination.join(name);
        tokio::fs::rename(&path, &target)
            .await
            .map_err(|e| FetchError::FinalizeFailed {
                from: path.clone(),
                source: e,
            })?;
        artifact.files.push(target);
        artifact.bytes += len;
    }

    Ok(artifact)
}

fn is_intermediate(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| INTERMEDIATE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;

use crate::error::FailureKind;

/// Default format selector: 1080p MP4 + M4A with sensible fallbacks
pub const DEFAULT_FORMAT: &str =
    "bv*[ext=mp4][height<=1080]+ba[ext=m4a]/bv*[height<=1080]+ba/b[ext=mp4]/b";

/// Merge format value that keeps whatever container yt-dlp produces
pub const KEEP_MERGE_TOKEN: &str = "keep";

/// Output template relative to the staging directory
pub const OUTPUT_TEMPLATE: &str = "%(upload_date)s - %(title)s [%(id)s].%(ext)s";

/// Messages after which listing a channel again will not help
const FATAL_LISTING_MARKERS: &[&str] = &[
    "does not exist",
    "http error 404",
    "unsupported url",
    "account has been terminated",
    "this channel is not available",
];

/// Messages after which fetching an item again will not help
const FATAL_FETCH_MARKERS: &[&str] = &[
    "video unavailable",
    "private video",
    "has been removed",
    "members-only",
    "join this channel to get access",
    "requested format is not available",
    "unsupported url",
    "http error 404",
    "http error 410",
];

/// Process output captured from one yt-dlp invocation
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Failure to get any output from yt-dlp
#[derive(Debug)]
pub enum RunFailure {
    /// Binary is not installed
    NotFound,
    Spawn(std::io::Error),
    TimedOut(Duration),
}

/// Handle on the yt-dlp executable
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Whether the binary can be found (absolute path or on PATH)
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    /// Run yt-dlp to completion, killing it if `timeout` elapses
    ///
    /// The child is spawned with `kill_on_drop`, so dropping the returned
    /// future (cancellation, outer timeouts) also terminates the process.
    pub async fn run<I, S>(
        &self,
        args: I,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RunFailure>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => return Err(RunFailure::TimedOut(limit)),
            },
            None => command.output().await,
        };

        let output = output.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunFailure::NotFound
            } else {
                RunFailure::Spawn(e)
            }
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::debug!(program = %self.program.display(), status = ?output.status, %stderr, "yt-dlp finished");

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr,
        })
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// Classify a failed listing from yt-dlp's stderr
pub fn classify_listing_failure(stderr: &str) -> FailureKind {
    classify(stderr, FATAL_LISTING_MARKERS)
}

/// Classify a failed fetch from yt-dlp's stderr
pub fn classify_fetch_failure(stderr: &str) -> FailureKind {
    classify(stderr, FATAL_FETCH_MARKERS)
}

/// Whether yt-dlp failed because ffmpeg/ffprobe is missing
pub fn is_missing_media_tool(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    (lower.contains("ffmpeg") || lower.contains("ffprobe"))
        && (lower.contains("not found") || lower.contains("not installed"))
}

/// Whether ffmpeg or avconv is on PATH
pub fn has_merging_tool() -> bool {
    which::which("ffmpeg").is_ok() || which::which("avconv").is_ok()
}

fn classify(stderr: &str, fatal_markers: &[&str]) -> FailureKind {
    let lower = stderr.to_lowercase();
    if fatal_markers.iter().any(|marker| lower.contains(marker)) {
        FailureKind::Fatal
    } else {
        FailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_classification() {
        assert_eq!(
            classify_listing_failure("ERROR: [youtube:tab] @gone: This channel does not exist."),
            FailureKind::Fatal
        );
        assert_eq!(
            classify_listing_failure("ERROR: Unable to download API page: HTTP Error 503"),
            FailureKind::Transient
        );
        assert_eq!(
            classify_listing_failure("ERROR: Read timed out."),
            FailureKind::Transient
        );
    }

    #[test]
    fn fetch_classification() {
        assert_eq!(
            classify_fetch_failure("ERROR: [youtube] abc: Private video. Sign in"),
            FailureKind::Fatal
        );
        assert_eq!(
            classify_fetch_failure("ERROR: [youtube] abc: Video unavailable"),
            FailureKind::Fatal
        );
        assert_eq!(
            classify_fetch_failure("ERROR: unable to download video data: HTTP Error 429: Too Many Requests"),
            FailureKind::Transient
        );
        assert_eq!(
            classify_fetch_failure("ERROR: [youtube] abc: This live event will begin in 3 hours."),
            FailureKind::Transient
        );
    }

    #[test]
    fn detects_missing_media_tool() {
        assert!(is_missing_media_tool(
            "ERROR: You have requested merging of multiple formats but ffmpeg is not installed."
        ));
        assert!(is_missing_media_tool("ERROR: ffprobe and ffmpeg not found. Please install"));
        assert!(!is_missing_media_tool("ERROR: Private video"));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let ytdlp = YtDlp::new("/nonexistent/definitely-not-yt-dlp");
        assert!(!ytdlp.is_available());
        let result = ytdlp.run(["--version"], None).await;
        assert!(matches!(result, Err(RunFailure::NotFound)));
    }
}

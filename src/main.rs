// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use autofollow::ytdlp::{DEFAULT_FORMAT, has_merging_tool};
use autofollow::{
    AdapterOptions, ChannelStatus, FailureKind, ItemStatus, NoopReporter, ProgressEvent,
    ProgressReporter, ReqwestClient, RetryPolicy, RunError, RunOptions, RunPaths, RunResult,
    SharedProgressReporter, SourceAdapters, TracingReporter, YtDlp, parse_since, run_from_paths,
};

// Emoji with fallback for terminals without Unicode support
static TV: Emoji<'_, '_> = Emoji("📺 ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static CHANNEL: Emoji<'_, '_> = Emoji("📡 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static WARNING: Emoji<'_, '_> = Emoji("⚠️  ", "[!] ");
static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[r] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[-] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Exit status when the run aborted on configuration or state
const EXIT_ABORTED: u8 = 2;

/// Follow channels and download every new item exactly once
#[derive(Parser, Debug)]
#[command(name = "autofollow")]
#[command(about = "Follow channels and download every new item exactly once")]
#[command(version)]
struct Args {
    /// Channel configuration file
    #[arg(long, default_value = "channels.json")]
    config: PathBuf,

    /// Base directory for channels without an explicit destination
    #[arg(long, default_value = "downloads")]
    download_dir: PathBuf,

    /// Progress state file recording downloaded items
    #[arg(long, default_value = ".archives/progress.json")]
    state: PathBuf,

    /// yt-dlp format selector
    #[arg(long, default_value = DEFAULT_FORMAT)]
    format: String,

    /// Container to merge video and audio into ('keep' leaves yt-dlp's choice)
    #[arg(long, default_value = "mp4")]
    merge_format: String,

    /// Maximum number of items to download per channel
    #[arg(long)]
    max_downloads: Option<usize>,

    /// Skip items published before this date (YYYY-MM-DD, 'today', 'yesterday')
    #[arg(long)]
    since: Option<String>,

    /// List channels and show what would be downloaded
    #[arg(long)]
    dry_run: bool,

    /// Maximum number of concurrent downloads
    #[arg(short = 'c', long, default_value = "3")]
    concurrent: usize,

    /// Maximum number of concurrent downloads per channel
    #[arg(long)]
    per_channel: Option<usize>,

    /// Attempts per item before giving up for this run
    #[arg(long, default_value = "3")]
    attempts: u32,

    /// Time limit in seconds for a single listing or download attempt
    #[arg(long, default_value = "1800")]
    timeout: u64,

    /// Path to the yt-dlp executable
    #[arg(long, default_value = "yt-dlp")]
    yt_dlp: PathBuf,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Log events instead of drawing progress bars (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<(String, String), ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn get_or_create_bar(&self, channel_id: &str, item_id: &str) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        let key = (channel_id.to_string(), item_id.to_string());

        if let Some(bar) = bars.get(&key) {
            return bar.clone();
        }

        let style = ProgressStyle::default_spinner()
            .template(&format!("  {DOWNLOAD}{{spinner:.cyan}} {{elapsed:>4}} {{wide_msg}}"))
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        bars.insert(key, bar.clone());
        bar
    }

    fn finish_bar(&self, channel_id: &str, item_id: &str) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.remove(&(channel_id.to_string(), item_id.to_string())) {
            bar.finish_and_clear();
        }
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { channels } => {
                self.main_bar.set_message(format!(
                    "{SEARCH}Checking {} channels",
                    channels.to_string().cyan()
                ));
            }

            ProgressEvent::ListingChannel { label, .. } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Listing {}", label.cyan()));
            }

            ProgressEvent::ChannelPlanned {
                label,
                listed,
                new_items,
                to_download,
                ..
            } => {
                self.println(format!(
                    "{CHANNEL}{} • {} listed, {} new, {} to download",
                    label.bold().green(),
                    listed.to_string().cyan(),
                    new_items.to_string().yellow(),
                    to_download.to_string().yellow()
                ));
            }

            ProgressEvent::ListingFailed {
                label, error, kind, ..
            } => {
                let note = match kind {
                    FailureKind::Transient => "will retry next run",
                    FailureKind::Fatal => "check the channel configuration",
                };
                self.println(format!(
                    "{FAILURE}{} - listing failed ({}): {}",
                    label.red().bold(),
                    note,
                    error.red()
                ));
            }

            ProgressEvent::PartialFilesCleanedUp { channel_id, count } => {
                self.println(format!(
                    "{BROOM}{}",
                    format!("Removed {} interrupted download(s) for {}", count, channel_id).dimmed()
                ));
            }

            ProgressEvent::WouldDownload {
                channel_id, title, ..
            } => {
                self.println(format!(
                    "  {DOWNLOAD}{} {}",
                    format!("[{}]", channel_id).dimmed(),
                    truncate_title(&title, 60)
                ));
            }

            ProgressEvent::DownloadStarting {
                channel_id,
                item_id,
                title,
                attempt,
            } => {
                let bar = self.get_or_create_bar(&channel_id, &item_id);
                let attempt_note = if attempt > 1 {
                    format!(" (attempt {})", attempt).yellow().to_string()
                } else {
                    String::new()
                };
                bar.set_message(format!(
                    "{} {}{}",
                    format!("[{}]", channel_id).dimmed(),
                    truncate_title(&title, 40),
                    attempt_note
                ));
            }

            ProgressEvent::RetryScheduled {
                channel_id,
                item_id,
                title,
                attempt,
                max_attempts,
                delay,
                error,
            } => {
                let bar = self.get_or_create_bar(&channel_id, &item_id);
                bar.set_message(format!(
                    "{RETRY}{} - attempt {}/{} failed, retrying in {:.0}s: {}",
                    truncate_title(&title, 30),
                    attempt,
                    max_attempts,
                    delay.as_secs_f64(),
                    truncate_title(&error, 50).yellow()
                ));
            }

            ProgressEvent::DownloadCompleted {
                channel_id,
                item_id,
                title,
            } => {
                self.finish_bar(&channel_id, &item_id);
                self.println(format!(
                    "  {SUCCESS}{} {}",
                    format!("[{}]", channel_id).dimmed(),
                    truncate_title(&title, 60).green()
                ));
            }

            ProgressEvent::DownloadFailed {
                channel_id,
                item_id,
                title,
                error,
                ..
            } => {
                self.finish_bar(&channel_id, &item_id);
                self.println(format!(
                    "  {FAILURE}{} {} - {}",
                    format!("[{}]", channel_id).dimmed(),
                    truncate_title(&title, 30).red(),
                    truncate_title(&error, 80).red()
                ));
            }

            ProgressEvent::MediaToolMissing => {
                self.println(format!(
                    "{WARNING}{}",
                    "ffmpeg/avconv not found on PATH; items that need merging will fail".yellow()
                ));
            }

            ProgressEvent::RunCompleted {
                downloaded_count,
                failed_count,
                failed_channels,
                cancelled,
            } => {
                self.main_bar.finish_and_clear();
                let headline = if cancelled {
                    "Run cancelled:".bold().yellow()
                } else {
                    "Run complete:".bold().green()
                };
                println!(
                    "\n{PARTY}{} {} downloaded, {} failed, {} channel(s) failed",
                    headline,
                    downloaded_count.to_string().green().bold(),
                    if failed_count > 0 {
                        failed_count.to_string().red().bold()
                    } else {
                        failed_count.to_string().green()
                    },
                    if failed_channels > 0 {
                        failed_channels.to_string().red().bold()
                    } else {
                        failed_channels.to_string().green()
                    }
                );
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let kept: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "off",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("autofollow={}", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_failures(result: &RunResult) {
    let failed_channels: Vec<_> = result
        .channels
        .iter()
        .filter_map(|c| match &c.status {
            ChannelStatus::ListingFailed { reason, .. } | ChannelStatus::Failed { reason } => {
                Some((c.label.as_str(), reason.as_str()))
            }
            _ => None,
        })
        .collect();

    if !failed_channels.is_empty() {
        println!("\n{}", "Failed channels:".red().bold());
        for (label, reason) in failed_channels {
            println!("  {}{} - {}", CROSS, label.yellow(), reason.dimmed());
        }
    }

    let failed_items: Vec<_> = result
        .channels
        .iter()
        .flat_map(|c| c.items.iter().map(move |o| (c, o)))
        .filter_map(|(c, o)| match &o.status {
            ItemStatus::Failed(failure) => Some((c.label.as_str(), o.title.as_str(), failure)),
            _ => None,
        })
        .collect();

    if !failed_items.is_empty() {
        println!("\n{}", "Failed items:".red().bold());
        for (label, title, failure) in failed_items {
            println!(
                "  {}{} {} - {}",
                CROSS,
                format!("[{}]", label).dimmed(),
                title.yellow(),
                failure.reason.dimmed()
            );
        }
    }
}

async fn follow(args: Args) -> Result<RunResult> {
    let today = Local::now().date_naive();
    let since = args
        .since
        .as_deref()
        .map(|value| parse_since(value, today))
        .transpose()
        .map_err(RunError::from)
        .context("Invalid --since value")?;

    let timeout = Duration::from_secs(args.timeout.max(1));
    let client = ReqwestClient::with_connect_timeout(Duration::from_secs(30))
        .context("Failed to create HTTP client")?;

    let adapters = Arc::new(SourceAdapters::new(
        AdapterOptions {
            ytdlp: YtDlp::new(args.yt_dlp.clone()),
            format: args.format.clone(),
            merge_format: args.merge_format.clone(),
            listing_timeout: Some(timeout),
        },
        Arc::new(client),
    ));

    let reporter: SharedProgressReporter = if args.quiet {
        NoopReporter::shared()
    } else if args.verbose > 0 {
        TracingReporter::shared()
    } else {
        Arc::new(IndicatifReporter::new())
    };

    if adapters.needs_merging_tool() && !has_merging_tool() {
        reporter.report(ProgressEvent::MediaToolMissing);
    }

    let options = RunOptions {
        max_concurrent: args.concurrent.max(1),
        per_channel: args.per_channel,
        retry: RetryPolicy {
            max_attempts: args.attempts.max(1),
            attempt_timeout: Some(timeout),
            ..RetryPolicy::default()
        },
        limit: args.max_downloads,
        since,
        dry_run: args.dry_run,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let paths = RunPaths {
        config: args.config.clone(),
        download_dir: args.download_dir.clone(),
        state: args.state.clone(),
    };

    let result = run_from_paths(
        &paths,
        adapters.clone(),
        adapters,
        &options,
        reporter,
        cancel,
    )
    .await
    .context("Failed to run")?;

    Ok(result)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let quiet = args.quiet;
    let download_dir = args.download_dir.clone();

    if !quiet {
        println!(
            "\n{}{} {}\n",
            TV,
            "autofollow".bold().magenta(),
            "- Channel Follower".dimmed()
        );
    }

    let result = match follow(args).await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{}{:#}", FAILURE, e);
            return ExitCode::from(EXIT_ABORTED);
        }
    };

    if !quiet {
        print_failures(&result);
        println!(
            "\n{FOLDER}Downloads: {}\n",
            download_dir.display().to_string().cyan()
        );
    }

    if result.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

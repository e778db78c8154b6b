//! mediaq command line: queue URLs, inspect the queue and history, and run the
//! scheduler until the queue drains (or forever with `--follow`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use mediaq::events::{LoggingScanner, LoggingSink};
use mediaq::models::{DownloadItem, DownloadStatus, Format, VideoPreferences};
use mediaq::{url_utils, DownloadOptions, DownloadStore, EngineConfig, SchedulerExit};

#[derive(Parser, Debug)]
#[command(name = "mediaq", version, about = "Persisted download queue driving yt-dlp")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue every URL found in the given text
    Add(AddArgs),
    /// Show the queue
    List,
    /// Show finished downloads, newest first
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Put a failed or cancelled item back at the end of the queue
    Retry { id: i64 },
    /// Cancel a queued item
    Cancel { id: i64 },
    /// Delete an item that is not running
    Remove { id: i64 },
    /// Show or change settings
    Settings(SettingsArgs),
    /// Run the queue
    Run {
        /// Keep running and pick up new or scheduled items
        #[arg(long)]
        follow: bool,

        /// In follow mode, how often to look for items queued by other processes
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Audio,
    Video,
    Command,
}

#[derive(clap::Args, Debug)]
struct AddArgs {
    /// URLs, or any text containing them
    #[arg(required = true)]
    text: Vec<String>,

    #[arg(short = 't', long = "type", value_enum, default_value = "video")]
    kind: Kind,

    /// yt-dlp format id; defaults to the best available
    #[arg(short = 'f', long)]
    format: Option<String>,

    /// Container or audio format (mp4, mkv, mp3, ...)
    #[arg(short = 'c', long)]
    container: Option<String>,

    /// Audio format ids merged into a video download
    #[arg(long = "audio-format-id")]
    audio_format_ids: Vec<String>,

    /// yt-dlp config text for `--type command`
    #[arg(long)]
    template: Option<String>,

    /// Destination directory; defaults to the last one used, then the download folder
    #[arg(short = 'd', long)]
    dest: Option<PathBuf>,

    /// Do not start before this time (RFC 3339)
    #[arg(long)]
    at: Option<DateTime<Local>>,

    /// Keep no history or logs for these items
    #[arg(long)]
    incognito: bool,

    /// Extra yt-dlp arguments, appended last
    #[arg(long, allow_hyphen_values = true)]
    extra: Option<String>,

    /// Output filename template for these items
    #[arg(short = 'o', long)]
    output: Option<String>,
}

#[derive(clap::Args, Debug)]
struct SettingsArgs {
    #[arg(long)]
    concurrency: Option<u32>,

    #[arg(long)]
    download_folder: Option<PathBuf>,

    #[arg(long)]
    cache_downloads: Option<bool>,

    #[arg(long)]
    log_downloads: Option<bool>,

    #[arg(long)]
    use_scheduler: Option<bool>,

    /// Daily window as HH:MM-HH:MM
    #[arg(long)]
    window: Option<String>,

    #[arg(long)]
    use_download_archive: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = EngineConfig::discover()?;
    let store = config.open_store()?;

    match cli.command {
        Command::Add(args) => add(&store, args).await,
        Command::List => list(&store).await,
        Command::History { limit } => history(&store, limit).await,
        Command::Retry { id } => {
            if !store.requeue(id).await? {
                bail!("download {} not found or still running", id);
            }
            println!("re-queued {}", id);
            Ok(())
        }
        Command::Cancel { id } => {
            if !store
                .transition_status(id, DownloadStatus::Queued, DownloadStatus::Cancelled)
                .await?
            {
                bail!("download {} is not queued", id);
            }
            println!("cancelled {}", id);
            Ok(())
        }
        Command::Remove { id } => {
            match store.get(id).await? {
                Some(item) if item.status == DownloadStatus::Active => {
                    bail!("download {} is running", id)
                }
                Some(_) => {
                    store.delete(id).await?;
                    println!("removed {}", id);
                }
                None => bail!("download {} not found", id),
            }
            Ok(())
        }
        Command::Settings(args) => settings(&store, args).await,
        Command::Run { follow, poll_secs } => {
            run(&config, store, follow, Duration::from_secs(poll_secs.max(1))).await
        }
    }
}

async fn add(store: &DownloadStore, args: AddArgs) -> Result<()> {
    let urls = url_utils::extract_urls(&args.text.join(" "));
    if urls.is_empty() {
        bail!("no http(s) URL found");
    }
    let dest = match args.dest.clone() {
        Some(dest) => {
            store.save_last_destination(&dest).await?;
            dest
        }
        None => match store.last_destination().await? {
            Some(dest) => dest,
            None => store.load_settings().await?.general.download_folder,
        },
    };

    for url in urls {
        let mut item = match args.kind {
            Kind::Audio => DownloadItem::new_audio(
                &url,
                Format::new(
                    args.format.as_deref().unwrap_or("bestaudio/best"),
                    args.container.as_deref().unwrap_or("mp3"),
                ),
                dest.clone(),
            ),
            Kind::Video => {
                let mut item = DownloadItem::new_video(
                    &url,
                    Format::new(
                        args.format.as_deref().unwrap_or("bestvideo"),
                        args.container.as_deref().unwrap_or("mp4"),
                    ),
                    dest.clone(),
                );
                let audio = if args.audio_format_ids.is_empty() {
                    vec!["bestaudio".to_string()]
                } else {
                    args.audio_format_ids.clone()
                };
                item.options = DownloadOptions::Video(VideoPreferences {
                    audio_format_ids: audio,
                    ..VideoPreferences::default()
                });
                item
            }
            Kind::Command => {
                let Some(template) = args.template.as_deref() else {
                    bail!("--type command needs --template");
                };
                DownloadItem::new_command(&url, template, dest.clone())
            }
        };
        item.website = url_utils::site_name(&url).unwrap_or_default();
        item.download_start_time = args.at.map(|t| t.with_timezone(&Utc));
        item.incognito = args.incognito;
        item.extra_commands = args.extra.clone().unwrap_or_default();
        item.custom_file_name_template = args.output.clone().unwrap_or_default();

        let id = store.insert(&item).await?;
        if args.incognito {
            println!("queued {}", id);
        } else {
            println!("queued {} {}", id, url);
        }
    }
    Ok(())
}

async fn list(store: &DownloadStore) -> Result<()> {
    for item in store.list_downloads().await? {
        let when = item
            .download_start_time
            .map(|t| format!(" at {}", t.with_timezone(&Local).format("%Y-%m-%d %H:%M")))
            .unwrap_or_default();
        let error = item
            .error_message
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        println!(
            "{:>5}  {:<9} {:<7} {}{}{}",
            item.id,
            item.status.as_str(),
            item.kind().as_str(),
            item.display_title(),
            when,
            error
        );
    }
    let mut summary = Vec::new();
    for status in [
        DownloadStatus::Queued,
        DownloadStatus::Active,
        DownloadStatus::Error,
        DownloadStatus::Cancelled,
    ] {
        summary.push(format!("{} {}", store.count_by_status(status).await?, status.as_str()));
    }
    println!("{}", summary.join(", "));
    Ok(())
}

async fn history(store: &DownloadStore, limit: u32) -> Result<()> {
    for entry in store.history(limit).await? {
        let when = DateTime::from_timestamp(entry.time, 0)
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{:>5}  {}  {}", entry.id, when, entry.title);
        for path in &entry.download_paths {
            println!("       {}", path.display());
        }
    }
    Ok(())
}

fn parse_window(window: &str) -> Result<(NaiveTime, NaiveTime)> {
    let (start, end) = window
        .split_once('-')
        .context("window must look like HH:MM-HH:MM")?;
    let parse = |s: &str| {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .with_context(|| format!("invalid time {:?}", s))
    };
    Ok((parse(start)?, parse(end)?))
}

async fn settings(store: &DownloadStore, args: SettingsArgs) -> Result<()> {
    let mut settings = store.load_settings().await?;
    let before = settings.clone();

    if let Some(n) = args.concurrency {
        settings.general.concurrency = n.max(1);
    }
    if let Some(dir) = args.download_folder {
        settings.general.download_folder = dir;
    }
    if let Some(v) = args.cache_downloads {
        settings.queue.cache_downloads = v;
    }
    if let Some(v) = args.log_downloads {
        settings.queue.log_downloads = v;
    }
    if let Some(v) = args.use_scheduler {
        settings.queue.use_scheduler = v;
    }
    if let Some(window) = args.window.as_deref() {
        let (start, end) = parse_window(window)?;
        settings.queue.schedule_start = start;
        settings.queue.schedule_end = end;
    }
    if let Some(v) = args.use_download_archive {
        settings.queue.use_download_archive = v;
    }

    if settings != before {
        store.save_settings(&settings).await?;
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

/// First signal asks for a clean shutdown; a second one exits immediately.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));
    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                log::warn!("Could not listen for Ctrl+C");
                return;
            }
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                log::info!("Stopping; running downloads go back to the queue. Press Ctrl+C again to force exit");
                handler_token.cancel();
            } else {
                log::warn!("Force exit requested");
                std::process::exit(130);
            }
        }
    });
    token
}

async fn run(config: &EngineConfig, store: DownloadStore, follow: bool, poll: Duration) -> Result<()> {
    let mut scheduler = config.scheduler(
        store.clone(),
        Arc::new(LoggingSink),
        Arc::new(LoggingScanner),
    );
    let handle = scheduler.handle();
    let shutdown = install_signal_handler();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.shutdown();
        });
    }

    loop {
        let wake_at = match scheduler.run().await? {
            SchedulerExit::Shutdown => return Ok(()),
            SchedulerExit::Idle { next_due } => {
                if !follow {
                    if let Some(t) = next_due {
                        log::info!(
                            "Queue idle; next scheduled download at {}",
                            t.with_timezone(&Local).format("%Y-%m-%d %H:%M")
                        );
                    }
                    return Ok(());
                }
                next_due.map(|t| t.with_timezone(&Local))
            }
            SchedulerExit::OutsideWindow => {
                let settings = store.load_settings().await?;
                let opens = settings.queue.next_window_start(Local::now());
                if !follow {
                    if let Some(t) = opens {
                        log::info!("Outside the download window; it opens at {}", t.format("%H:%M"));
                    }
                    return Ok(());
                }
                opens
            }
        };

        let mut sleep_for = poll;
        if let Some(t) = wake_at {
            let until = (t - Local::now()).to_std().unwrap_or(Duration::ZERO);
            sleep_for = sleep_for.min(until);
        }
        let mut changes = store.subscribe();
        changes.borrow_and_update();
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = changes.changed() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

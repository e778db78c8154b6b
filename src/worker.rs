//! One download, start to finish.
//!
//! A worker builds the request, streams progress to the event sink and the
//! log, and writes the item's final state: a history row plus deletion of the
//! queue row on success, `Error` on failure. A cancelled run writes nothing;
//! whoever cancelled it owns the status.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessError, ResolveError, TaskError};
use crate::events::{EngineEvent, EventSink, MediaScanner, NoopScanner};
use crate::models::{DownloadItem, HistoryItem, LogItem};
use crate::output::{
    cleanup_config_files, is_writable_dir, prepare_staging_dir, remove_staging_dir,
    resolve_cached, resolve_uncached, ResolvedOutput,
};
use crate::request::{build_request, RequestPaths};
use crate::settings::UserSettings;
use crate::store::DownloadStore;
use crate::ytdlp::{ProcessOutput, ProcessRunner, ProgressCallback};

const METADATA_REFRESH_DELAY: Duration = Duration::from_millis(1500);

/// Lines batched into one log append.
const LOG_BATCH: usize = 256;

/// Everything a worker needs, shared by all workers of one engine.
pub struct WorkerContext<R: ProcessRunner> {
    pub store: DownloadStore,
    pub runner: Arc<R>,
    pub events: Arc<dyn EventSink>,
    pub scanner: Arc<dyn MediaScanner>,
    pub paths: RequestPaths,
    pub metadata_refresh_delay: Duration,
}

impl<R: ProcessRunner> WorkerContext<R> {
    pub fn new(
        store: DownloadStore,
        runner: Arc<R>,
        events: Arc<dyn EventSink>,
        paths: RequestPaths,
    ) -> Self {
        Self {
            store,
            runner,
            events,
            scanner: Arc::new(NoopScanner),
            paths,
            metadata_refresh_delay: METADATA_REFRESH_DELAY,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn MediaScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_metadata_refresh_delay(mut self, delay: Duration) -> Self {
        self.metadata_refresh_delay = delay;
        self
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Finished { paths: Vec<PathBuf> },
    /// Succeeded without producing a file; the archive already had it.
    AlreadyDownloaded,
    Failed { message: String },
    Cancelled,
}

/// Per-run bookkeeping the failure path needs.
#[derive(Default)]
struct RunState {
    command: String,
    log_id: Option<i64>,
    used_archive: bool,
    output: Vec<String>,
}

/// Aborts the wrapped task when dropped.
struct ChildTask(Option<JoinHandle<()>>);

impl ChildTask {
    fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(Some(tokio::spawn(fut)))
    }

    /// Wait for the task to finish on its own.
    async fn join(mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ChildTask {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Name used in log lines. Incognito items never expose title or URL.
fn label(item: &DownloadItem) -> String {
    if item.incognito {
        format!("download {}", item.id)
    } else {
        format!("download {} ({})", item.id, item.display_title())
    }
}

fn needs_metadata(item: &DownloadItem) -> bool {
    item.title.trim().is_empty()
        || item.author.trim().is_empty()
        || item.thumb.trim().is_empty()
        || item.duration_seconds.is_none()
}

/// Run one Active item to completion.
///
/// `Err` is reserved for store failures; download failures are recorded on
/// the item and reported as [`WorkerOutcome::Failed`].
pub async fn run_download<R: ProcessRunner>(
    ctx: Arc<WorkerContext<R>>,
    item: DownloadItem,
    settings: UserSettings,
    cancel: CancellationToken,
) -> Result<WorkerOutcome, TaskError> {
    let no_cache = !settings.queue.cache_downloads && is_writable_dir(&item.download_path);
    let staging = ctx.paths.staging_dir(item.id);
    let mut state = RunState::default();

    let attempt = attempt(&ctx, &item, &settings, no_cache, &staging, &cancel, &mut state).await;

    match attempt {
        Ok(output) if !cancel.is_cancelled() => {
            finish(&ctx, &item, &settings, no_cache, &staging, &state, output, &cancel).await
        }
        Err(TaskError::Store(e)) => Err(TaskError::Store(e)),
        Err(e) if !e.is_cancelled() && !cancel.is_cancelled() => {
            fail(&ctx, &item, no_cache, &staging, state, e).await
        }
        _ => {
            log::info!("{} cancelled", label(&item));
            if !no_cache {
                remove_staging_dir(&staging).await;
            }
            Ok(WorkerOutcome::Cancelled)
        }
    }
}

async fn attempt<R: ProcessRunner>(
    ctx: &Arc<WorkerContext<R>>,
    item: &DownloadItem,
    settings: &UserSettings,
    no_cache: bool,
    staging: &Path,
    cancel: &CancellationToken,
    state: &mut RunState,
) -> Result<ProcessOutput, TaskError> {
    if !no_cache {
        prepare_staging_dir(staging)
            .await
            .map_err(ResolveError::from)?;
    }

    let request = build_request(item, settings, &ctx.paths, no_cache)?;
    state.command = request.command_string();
    state.used_archive = request.uses_download_archive();

    let mut log_writer = None;
    let mut log_tx = None;
    if settings.queue.log_downloads && !item.incognito {
        let log_id = ctx
            .store
            .insert_log(&LogItem::for_download(item, &state.command))
            .await?;
        ctx.store.set_log_id(item.id, Some(log_id)).await?;
        state.log_id = Some(log_id);
        let (tx, writer) = spawn_log_writer(ctx.store.clone(), log_id);
        log_tx = Some(tx);
        log_writer = Some(writer);
    }

    let _refresh = needs_metadata(item).then(|| spawn_metadata_refresh(ctx, item));

    log::info!("Starting {}", label(item));
    ctx.events.emit(EngineEvent::DownloadStarted {
        id: item.id,
        title: item.display_title().to_string(),
    });

    let id = item.id;
    let events = ctx.events.clone();
    let on_progress: ProgressCallback = Box::new(move |percent, line| {
        events.emit(EngineEvent::DownloadProgress {
            id,
            percent,
            line: line.to_string(),
        });
        if let Some(tx) = &log_tx {
            let _ = tx.send(line.to_string());
        }
    });

    let result = tokio::select! {
        r = ctx.runner.run(&request, id, on_progress) => r,
        _ = cancel.cancelled() => Err(ProcessError::cancelled()),
    };

    // The progress callback (and with it the log sender) is gone; flush.
    if let Some(writer) = log_writer {
        writer.join().await;
    }
    cleanup_config_files(&request.config_files).await;

    result.map_err(|e| {
        state.output = e.output.clone();
        TaskError::from(e)
    })
}

fn spawn_log_writer(
    store: DownloadStore,
    log_id: i64,
) -> (mpsc::UnboundedSender<String>, ChildTask) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let task = ChildTask::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = first;
            for _ in 1..LOG_BATCH {
                match rx.try_recv() {
                    Ok(line) => {
                        batch.push('\n');
                        batch.push_str(&line);
                    }
                    Err(_) => break,
                }
            }
            if let Err(e) = store.append_log(log_id, &batch).await {
                log::warn!("Failed to append to log {}: {:#}", log_id, e);
            }
        }
    });
    (tx, task)
}

/// Fill in missing title, author, thumbnail and duration while the item runs.
fn spawn_metadata_refresh<R: ProcessRunner>(
    ctx: &Arc<WorkerContext<R>>,
    item: &DownloadItem,
) -> ChildTask {
    let ctx = Arc::clone(ctx);
    let id = item.id;
    let url = item.url.clone();
    ChildTask::spawn(async move {
        tokio::time::sleep(ctx.metadata_refresh_delay).await;
        let meta = match ctx.runner.fetch_metadata(&url).await {
            Ok(meta) => meta,
            Err(e) => {
                log::debug!("Metadata refresh for {} failed: {}", id, e);
                return;
            }
        };
        match ctx.store.update_metadata(id, &meta).await {
            Ok(true) => log::debug!("Metadata refreshed for {}", id),
            Ok(false) => {}
            Err(e) => log::warn!("Failed to store metadata for {}: {:#}", id, e),
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn finish<R: ProcessRunner>(
    ctx: &Arc<WorkerContext<R>>,
    item: &DownloadItem,
    settings: &UserSettings,
    no_cache: bool,
    staging: &Path,
    state: &RunState,
    output: ProcessOutput,
    cancel: &CancellationToken,
) -> Result<WorkerOutcome, TaskError> {
    let non_media = settings.non_media_extensions();
    let resolved = if no_cache {
        resolve_uncached(output.lines(), &non_media, ctx.scanner.as_ref())
    } else {
        resolve_cached(
            staging,
            &item.download_path,
            settings.queue.keep_cache,
            &non_media,
            ctx.scanner.as_ref(),
        )
        .await
    };

    if cancel.is_cancelled() {
        log::info!("{} cancelled while finishing", label(item));
        return Ok(WorkerOutcome::Cancelled);
    }

    // Pick up metadata refreshed while running.
    let current = ctx
        .store
        .get(item.id)
        .await?
        .unwrap_or_else(|| item.clone());

    let archived = matches!(resolved, ResolvedOutput::NotFound) && state.used_archive;
    let paths = resolved.paths().to_vec();

    let mut history = None;
    if !archived && !current.incognito && settings.privacy.keep_history {
        let mut entry =
            HistoryItem::from_download(&current, paths.clone(), state.command.clone(), Utc::now());
        if let Some(first) = paths.first() {
            if let Ok(meta) = tokio::fs::metadata(first).await {
                entry.format.filesize = Some(meta.len());
            }
            if let Some(ext) = first.extension().and_then(|e| e.to_str()) {
                entry.format.container = ext.to_string();
            }
        }
        history = Some(entry);
    }

    let completed = ctx
        .store
        .complete(
            item.id,
            history.as_ref(),
            settings.privacy.max_history_entries,
        )
        .await?;
    if !completed {
        log::info!("{} was stopped or cancelled before it could be recorded", label(item));
        return Ok(WorkerOutcome::Cancelled);
    }

    if archived {
        log::info!("{} was already in the download archive", label(&current));
        ctx.events
            .emit(EngineEvent::AlreadyDownloaded { id: item.id });
        return Ok(WorkerOutcome::AlreadyDownloaded);
    }

    if paths.is_empty() {
        log::warn!("{} finished but no media file was found", label(&current));
    } else {
        log::info!("{} finished: {} file(s)", label(&current), paths.len());
    }
    ctx.events.emit(EngineEvent::DownloadFinished {
        id: item.id,
        title: current.display_title().to_string(),
        kind: current.kind(),
        paths: paths.clone(),
    });
    Ok(WorkerOutcome::Finished { paths })
}

async fn fail<R: ProcessRunner>(
    ctx: &Arc<WorkerContext<R>>,
    item: &DownloadItem,
    no_cache: bool,
    staging: &Path,
    state: RunState,
    err: TaskError,
) -> Result<WorkerOutcome, TaskError> {
    let message = err.to_string();
    log::warn!("{} failed: {}", label(item), message);

    let log_id = match state.log_id {
        Some(log_id) => {
            ctx.store.append_log(log_id, &message).await?;
            Some(log_id)
        }
        None if !item.incognito => {
            let mut log = LogItem::for_download(item, &state.command);
            for line in &state.output {
                log.content.push_str(line);
                log.content.push('\n');
            }
            log.content.push_str(&message);
            log.content.push('\n');
            Some(ctx.store.insert_log(&log).await?)
        }
        None => None,
    };

    if !no_cache {
        remove_staging_dir(staging).await;
    }
    if !ctx.store.mark_error(item.id, &message, log_id).await? {
        log::info!("{} left Active before its failure was recorded", label(item));
        return Ok(WorkerOutcome::Cancelled);
    }
    ctx.events.emit(EngineEvent::DownloadFailed {
        id: item.id,
        title: item.display_title().to_string(),
        message: message.clone(),
        log_id,
    });
    Ok(WorkerOutcome::Failed { message })
}

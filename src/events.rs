use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::DownloadType;

/// Engine -> observer events. Serialized as `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    DownloadStarted {
        id: i64,
        title: String,
    },
    DownloadProgress {
        id: i64,
        /// 0..=100, never decreasing within one run.
        percent: f64,
        line: String,
    },
    DownloadFinished {
        id: i64,
        title: String,
        kind: DownloadType,
        paths: Vec<PathBuf>,
    },
    DownloadFailed {
        id: i64,
        title: String,
        message: String,
        log_id: Option<i64>,
    },
    /// Success with no file, with the archive enabled: yt-dlp skipped it.
    AlreadyDownloaded {
        id: i64,
    },
}

impl EngineEvent {
    pub fn id(&self) -> i64 {
        match self {
            EngineEvent::DownloadStarted { id, .. }
            | EngineEvent::DownloadProgress { id, .. }
            | EngineEvent::DownloadFinished { id, .. }
            | EngineEvent::DownloadFailed { id, .. }
            | EngineEvent::AlreadyDownloaded { id } => *id,
        }
    }
}

/// Receives engine events. Must not block.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: EngineEvent);
}

impl EventSink for mpsc::Sender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        // Progress is lossy under back-pressure; everything else is logged when dropped.
        if let Err(e) = self.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(ev) => {
                    if !matches!(ev, EngineEvent::DownloadProgress { .. }) {
                        log::warn!("Event channel full, dropping {:?}", ev);
                    }
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

impl EventSink for mpsc::UnboundedSender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        let _ = self.send(event);
    }
}

/// Writes events to the log; used by the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::DownloadStarted { id, title } => {
                log::info!("[{}] started: {}", id, title)
            }
            EngineEvent::DownloadProgress { id, percent, line } => {
                log::debug!("[{}] {:5.1}% {}", id, percent, line)
            }
            EngineEvent::DownloadFinished {
                id, title, paths, ..
            } => log::info!("[{}] finished: {} -> {:?}", id, title, paths),
            EngineEvent::DownloadFailed {
                id, title, message, ..
            } => log::error!("[{}] failed: {}: {}", id, title, message),
            EngineEvent::AlreadyDownloaded { id } => {
                log::info!("[{}] already in download archive", id)
            }
        }
    }
}

/// Makes new files visible to a media library.
pub trait MediaScanner: Send + Sync + 'static {
    fn scan(&self, paths: &[PathBuf]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScanner;

impl MediaScanner for NoopScanner {
    fn scan(&self, _paths: &[PathBuf]) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingScanner;

impl MediaScanner for LoggingScanner {
    fn scan(&self, paths: &[PathBuf]) {
        for p in paths {
            log::info!("New media file: {}", p.display());
        }
    }
}

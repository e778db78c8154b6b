//! mediaq: a persisted download queue that drives yt-dlp.
//!
//! The [`store::DownloadStore`] is the single source of truth for the queue;
//! the [`scheduler::Scheduler`] watches it and runs one [`worker`] task per
//! active item, each of which executes a [`request::Request`] through a
//! [`ytdlp::ProcessRunner`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod output;
pub mod request;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod url_utils;
pub mod worker;
pub mod ytdlp;

#[cfg(test)]
mod testing;

pub use error::{BuildError, ErrorCode, ProcessError, TaskError};
pub use events::{EngineEvent, EventSink, MediaScanner};
pub use models::{DownloadItem, DownloadOptions, DownloadStatus, DownloadType, HistoryItem};
pub use scheduler::{Scheduler, SchedulerExit, SchedulerHandle};
pub use settings::UserSettings;
pub use store::DownloadStore;
pub use ytdlp::{ProcessRunner, YtDlpConfig, YtDlpRunner};

// ============================================================================
// Engine assembly
// ============================================================================

/// Locations and tools one engine runs with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub yt_dlp: PathBuf,
    pub ffmpeg: Option<PathBuf>,
}

impl EngineConfig {
    /// Per-user directories plus whatever yt-dlp and ffmpeg can be found.
    pub fn discover() -> Result<Self> {
        let dirs = db::ensure_app_dirs()?;
        Ok(Self {
            db_path: db::db_path()?,
            data_dir: dirs.data,
            cache_dir: dirs.cache,
            yt_dlp: ytdlp::find_ytdlp_binary(),
            ffmpeg: ytdlp::find_ffmpeg_binary(),
        })
    }

    pub fn open_store(&self) -> Result<DownloadStore> {
        DownloadStore::new(db::Db::open_at(&self.db_path)?)
    }

    /// A scheduler over `store` backed by the real yt-dlp runner. Settings
    /// are read live from the store.
    pub fn scheduler(
        &self,
        store: DownloadStore,
        events: Arc<dyn EventSink>,
        scanner: Arc<dyn MediaScanner>,
    ) -> Scheduler<YtDlpRunner> {
        let runner = Arc::new(YtDlpRunner::new(YtDlpConfig::new(self.yt_dlp.clone())));
        let paths =
            request::RequestPaths::new(&self.cache_dir, &self.data_dir, self.ffmpeg.clone());
        let settings = store.settings_watch();
        let ctx = worker::WorkerContext::new(store, runner, events, paths).with_scanner(scanner);
        Scheduler::new(ctx, settings)
    }
}

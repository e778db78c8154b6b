//! Shared async handle over [`Db`].
//!
//! Every statement runs under one `tokio::sync::Mutex`; the lock is never held
//! across an await on anything but the database itself. Each committed mutation
//! of the `downloads` table bumps a revision counter published on a watch
//! channel, which is how the scheduler observes the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};

use crate::db::Db;
use crate::models::{DownloadItem, DownloadStatus, FetchedMetadata, HistoryItem, LogItem};
use crate::settings::{SettingsManager, UserSettings};

#[derive(Clone)]
pub struct DownloadStore {
    db: Arc<Mutex<Db>>,
    changes: Arc<watch::Sender<u64>>,
    settings: Arc<watch::Sender<UserSettings>>,
}

impl DownloadStore {
    /// Wrap an opened database. Loads the persisted settings once to seed the
    /// settings watch channel.
    pub fn new(db: Db) -> Result<Self> {
        let settings = SettingsManager::new(db.conn()).get_user_settings()?;
        let (changes, _) = watch::channel(0u64);
        let (settings_tx, _) = watch::channel(settings);
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            changes: Arc::new(changes),
            settings: Arc::new(settings_tx),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Db::open_in_memory()?)
    }

    /// Change notifications for the `downloads` table.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.changes.borrow()
    }

    fn bump(&self) {
        self.changes.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    pub async fn insert(&self, item: &DownloadItem) -> Result<i64> {
        let id = self.db.lock().await.insert_download(item)?;
        self.bump();
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<DownloadItem>> {
        self.db.lock().await.get_download(id)
    }

    pub async fn queued_due_by(&self, due_by: DateTime<Utc>) -> Result<Vec<DownloadItem>> {
        self.db.lock().await.queued_due_by(due_by)
    }

    pub async fn next_scheduled_start(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.db.lock().await.next_scheduled_start(after)
    }

    pub async fn active_downloads(&self) -> Result<Vec<DownloadItem>> {
        self.db.lock().await.active_downloads()
    }

    pub async fn list_downloads(&self) -> Result<Vec<DownloadItem>> {
        self.db.lock().await.list_downloads()
    }

    pub async fn count_by_status(&self, status: DownloadStatus) -> Result<u64> {
        self.db.lock().await.count_by_status(status)
    }

    pub async fn update(&self, item: &DownloadItem) -> Result<bool> {
        let changed = self.db.lock().await.update_download(item)?;
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    pub async fn update_multiple(&self, items: &[DownloadItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.db.lock().await.update_multiple(items)?;
        self.bump();
        Ok(())
    }

    /// Claim Queued rows for execution; see [`Db::activate_queued`].
    pub async fn activate_queued(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let activated = self.db.lock().await.activate_queued(ids)?;
        if !activated.is_empty() {
            self.bump();
        }
        Ok(activated)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let deleted = self.db.lock().await.delete_download(id)?;
        if deleted {
            self.bump();
        }
        Ok(deleted)
    }

    /// Delete a finished Active row, recording `history` alongside it.
    /// Returns false, writing nothing, once the row has left Active.
    pub async fn complete(
        &self,
        id: i64,
        history: Option<&HistoryItem>,
        keep_history: u32,
    ) -> Result<bool> {
        let completed = self
            .db
            .lock()
            .await
            .complete_download(id, history, keep_history)?;
        if completed {
            self.bump();
        }
        Ok(completed)
    }

    pub async fn set_status(&self, id: i64, status: DownloadStatus) -> Result<bool> {
        let changed = self.db.lock().await.set_status(id, status)?;
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    /// Compare-and-set on status.
    pub async fn transition_status(
        &self,
        id: i64,
        from: DownloadStatus,
        to: DownloadStatus,
    ) -> Result<bool> {
        let changed = self.db.lock().await.transition_status(id, from, to)?;
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    /// Only applies while the item is Active.
    pub async fn mark_error(&self, id: i64, message: &str, log_id: Option<i64>) -> Result<bool> {
        let changed = self.db.lock().await.mark_error(id, message, log_id)?;
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    pub async fn set_log_id(&self, id: i64, log_id: Option<i64>) -> Result<()> {
        self.db.lock().await.set_log_id(id, log_id)
    }

    /// Only applies while the item is still Active.
    pub async fn update_metadata(&self, id: i64, meta: &FetchedMetadata) -> Result<bool> {
        let changed = self.db.lock().await.update_metadata(id, meta)?;
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    /// Re-queue a non-active item at the back of the queue.
    pub async fn requeue(&self, id: i64) -> Result<bool> {
        let changed = self.db.lock().await.requeue(id, Utc::now())?;
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub async fn insert_history(&self, item: &HistoryItem) -> Result<i64> {
        self.db.lock().await.insert_history(item)
    }

    pub async fn history(&self, limit: u32) -> Result<Vec<HistoryItem>> {
        self.db.lock().await.get_history(limit)
    }

    pub async fn history_for_download(&self, download_id: i64) -> Result<Vec<HistoryItem>> {
        self.db.lock().await.history_for_download(download_id)
    }

    pub async fn trim_history(&self, keep_count: u32) -> Result<usize> {
        self.db.lock().await.trim_history(keep_count)
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    pub async fn insert_log(&self, item: &LogItem) -> Result<i64> {
        self.db.lock().await.insert_log(item)
    }

    pub async fn append_log(&self, log_id: i64, line: &str) -> Result<()> {
        self.db.lock().await.append_log(log_id, line)
    }

    pub async fn set_log_content(&self, log_id: i64, content: &str) -> Result<()> {
        self.db.lock().await.set_log_content(log_id, content)
    }

    pub async fn get_log(&self, log_id: i64) -> Result<Option<LogItem>> {
        self.db.lock().await.get_log(log_id)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn load_settings(&self) -> Result<UserSettings> {
        let db = self.db.lock().await;
        SettingsManager::new(db.conn()).get_user_settings()
    }

    /// Persist and publish to every settings watcher.
    pub async fn save_settings(&self, settings: &UserSettings) -> Result<()> {
        {
            let db = self.db.lock().await;
            SettingsManager::new(db.conn()).save_user_settings(settings)?;
        }
        self.settings.send_replace(settings.clone());
        Ok(())
    }

    pub fn settings_watch(&self) -> watch::Receiver<UserSettings> {
        self.settings.subscribe()
    }

    /// Destination the user picked last, offered as the default for new items.
    pub async fn last_destination(&self) -> Result<Option<PathBuf>> {
        let db = self.db.lock().await;
        SettingsManager::new(db.conn()).get_last_destination()
    }

    pub async fn save_last_destination(&self, path: &Path) -> Result<()> {
        let db = self.db.lock().await;
        SettingsManager::new(db.conn()).save_last_destination(path)
    }
}

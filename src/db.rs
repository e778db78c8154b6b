use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{
    DownloadItem, DownloadStatus, DownloadType, FetchedMetadata, Format, HistoryItem, LogItem,
};

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

/// Column list shared by every `downloads` SELECT; order matches `row_to_download`.
const DOWNLOAD_COLUMNS: &str = r#"
    id, url, title, author, duration_seconds, thumb, website,
    type, options_json, format_json,
    status, download_path, download_start_time,
    incognito, log_id, custom_file_name_template, extra_commands,
    queued_at, error_message
"#;

const HISTORY_COLUMNS: &str = r#"
    id, url, title, author, duration_seconds, thumb, type, time,
    download_paths_json, website, format_json, download_id, command
"#;

/// Database handle wrapper.
///
/// Notes:
/// - This uses `rusqlite::Connection`, which is not `Sync`.
/// - Shared access goes through [`crate::store::DownloadStore`], which serializes
///   statements behind an async mutex.
pub struct Db {
    conn: Connection,
    path: PathBuf,
}

/// Determines the per-user app data directory and returns its path.
///
/// macOS:  ~/Library/Application Support/mediaq
/// Windows: %APPDATA%\\mediaq
/// Linux:  ~/.local/share/mediaq (depending on XDG)
pub fn app_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "mediaq", "mediaq")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))
}

/// Returns the directory where mediaq stores its state (db, cache).
pub fn app_data_dir() -> Result<PathBuf> {
    Ok(app_project_dirs()?.data_dir().to_path_buf())
}

/// Returns the path to the SQLite database file.
pub fn db_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join("mediaq.sqlite3"))
}

/// Create required directories for state storage: data dir and staging cache dir.
pub fn ensure_app_dirs() -> Result<AppDirs> {
    let dirs = app_project_dirs()?;
    let data = dirs.data_dir().to_path_buf();
    let cache = dirs.cache_dir().join("downloads");

    fs::create_dir_all(&data).with_context(|| format!("create data dir: {}", data.display()))?;
    fs::create_dir_all(&cache)
        .with_context(|| format!("create cache dir: {}", cache.display()))?;

    Ok(AppDirs { data, cache })
}

#[derive(Debug, Clone)]
pub struct AppDirs {
    pub data: PathBuf,
    /// Root of the per-item staging directories.
    pub cache: PathBuf,
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serialize column json")
}

impl Db {
    /// Open database connection at the per-user location and apply migrations.
    pub fn open() -> Result<Self> {
        let dirs = ensure_app_dirs()?;
        Self::open_at(dirs.data.join("mediaq.sqlite3"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create db dir: {}", parent.display()))?;
            }
        }

        let mut conn = Connection::open(&path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // WAL so readers (a UI process) don't block the engine's writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&mut conn)?;

        Ok(Self { conn, path })
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Insert a new download record and return its id.
    pub fn insert_download(&mut self, item: &DownloadItem) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO downloads (
              url, title, author, duration_seconds, thumb, website,
              type, options_json, format_json,
              status, download_path, download_start_time,
              incognito, log_id, custom_file_name_template, extra_commands,
              queued_at, error_message
            ) VALUES (
              ?1, ?2, ?3, ?4, ?5, ?6,
              ?7, ?8, ?9,
              ?10, ?11, ?12,
              ?13, ?14, ?15, ?16,
              ?17, ?18
            )
            "#,
            params![
                item.url,
                item.title,
                item.author,
                item.duration_seconds.map(|d| d as i64),
                item.thumb,
                item.website,
                item.kind().as_str(),
                to_json(&item.options)?,
                to_json(&item.format)?,
                item.status.as_str(),
                item.download_path.to_string_lossy(),
                item.download_start_time.map(to_millis),
                item.incognito,
                item.log_id,
                item.custom_file_name_template,
                item.extra_commands,
                to_millis(item.queued_at),
                item.error_message,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Retrieve a download row by id.
    pub fn get_download(&mut self, id: i64) -> Result<Option<DownloadItem>> {
        let sql = format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], |r| Self::row_to_download(r))
            .optional()?;
        Ok(row)
    }

    /// Queued items that may start at `due_by`, oldest enqueue first.
    pub fn queued_due_by(&mut self, due_by: DateTime<Utc>) -> Result<Vec<DownloadItem>> {
        let sql = format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM downloads
             WHERE status = 'queued'
               AND (download_start_time IS NULL OR download_start_time <= ?1)
             ORDER BY queued_at ASC, id ASC"
        );
        self.query_downloads(&sql, params![to_millis(due_by)])
    }

    /// Earliest start time strictly after `after` among queued items.
    pub fn next_scheduled_start(&mut self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> = self.conn.query_row(
            "SELECT MIN(download_start_time) FROM downloads
             WHERE status = 'queued' AND download_start_time > ?1",
            params![to_millis(after)],
            |r| r.get(0),
        )?;
        Ok(next.map(from_millis))
    }

    /// Items currently marked active.
    pub fn active_downloads(&mut self) -> Result<Vec<DownloadItem>> {
        let sql = format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE status = 'active' ORDER BY id ASC"
        );
        self.query_downloads(&sql, [])
    }

    /// Every row in the queue table, in dispatch order.
    pub fn list_downloads(&mut self) -> Result<Vec<DownloadItem>> {
        let sql = format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads ORDER BY queued_at ASC, id ASC");
        self.query_downloads(&sql, [])
    }

    /// Write every mutable column of an existing row.
    pub fn update_download(&mut self, item: &DownloadItem) -> Result<bool> {
        let changed = Self::update_download_on(&self.conn, item)?;
        Ok(changed)
    }

    /// Update several rows in one transaction.
    pub fn update_multiple(&mut self, items: &[DownloadItem]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for item in items {
            Self::update_download_on(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_download_on(conn: &Connection, item: &DownloadItem) -> Result<bool> {
        let changed = conn.execute(
            r#"
            UPDATE downloads SET
              url = ?2, title = ?3, author = ?4, duration_seconds = ?5, thumb = ?6, website = ?7,
              type = ?8, options_json = ?9, format_json = ?10,
              status = ?11, download_path = ?12, download_start_time = ?13,
              incognito = ?14, log_id = ?15, custom_file_name_template = ?16, extra_commands = ?17,
              queued_at = ?18, error_message = ?19
            WHERE id = ?1
            "#,
            params![
                item.id,
                item.url,
                item.title,
                item.author,
                item.duration_seconds.map(|d| d as i64),
                item.thumb,
                item.website,
                item.kind().as_str(),
                to_json(&item.options)?,
                to_json(&item.format)?,
                item.status.as_str(),
                item.download_path.to_string_lossy(),
                item.download_start_time.map(to_millis),
                item.incognito,
                item.log_id,
                item.custom_file_name_template,
                item.extra_commands,
                to_millis(item.queued_at),
                item.error_message,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Updates a download status. Returns false if the row is gone.
    pub fn set_status(&mut self, id: i64, status: DownloadStatus) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE downloads SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Compare-and-set on status. Returns true when the transition happened.
    pub fn transition_status(
        &mut self,
        id: i64,
        from: DownloadStatus,
        to: DownloadStatus,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE downloads SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Move the given Queued rows to Active in one transaction, clearing any
    /// previous error. Returns the ids that were actually still Queued.
    pub fn activate_queued(&mut self, ids: &[i64]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let mut activated = Vec::with_capacity(ids.len());
        {
            let mut stmt = tx.prepare(
                "UPDATE downloads SET status = 'active', error_message = NULL \
                 WHERE id = ?1 AND status = 'queued'",
            )?;
            for &id in ids {
                if stmt.execute(params![id])? > 0 {
                    activated.push(id);
                }
            }
        }
        tx.commit()?;
        Ok(activated)
    }

    /// Persist a failure on an Active row: Error status, message and
    /// (optional) log back-reference. Rows that already left Active are kept.
    pub fn mark_error(&mut self, id: i64, message: &str, log_id: Option<i64>) -> Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE downloads
            SET status = ?2, error_message = ?3, log_id = COALESCE(?4, log_id)
            WHERE id = ?1 AND status = 'active'
            "#,
            params![id, DownloadStatus::Error.as_str(), message, log_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_log_id(&mut self, id: i64, log_id: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE downloads SET log_id = ?2 WHERE id = ?1",
            params![id, log_id],
        )?;
        Ok(())
    }

    /// Fill in missing metadata for an item that is still active.
    pub fn update_metadata(&mut self, id: i64, meta: &FetchedMetadata) -> Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE downloads SET
              title = CASE WHEN title = '' THEN COALESCE(?2, title) ELSE title END,
              author = CASE WHEN author = '' THEN COALESCE(?3, author) ELSE author END,
              duration_seconds = COALESCE(duration_seconds, ?4),
              thumb = CASE WHEN thumb = '' THEN COALESCE(?5, thumb) ELSE thumb END,
              website = CASE WHEN website = '' THEN COALESCE(?6, website) ELSE website END
            WHERE id = ?1 AND status = 'active'
            "#,
            params![
                id,
                meta.title,
                meta.uploader,
                meta.duration_seconds.map(|d| d as i64),
                meta.thumbnail_url,
                meta.website,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Put an item back at the end of the queue, clearing its last error.
    pub fn requeue(&mut self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE downloads
            SET status = 'queued', queued_at = ?2, error_message = NULL
            WHERE id = ?1 AND status != 'active'
            "#,
            params![id, to_millis(now)],
        )?;
        Ok(changed > 0)
    }

    /// Remove a finished row and record its history entry in one transaction.
    ///
    /// Nothing is written unless the row is still Active, so an item that was
    /// stopped or cancelled meanwhile keeps its new status and gets no history.
    pub fn complete_download(
        &mut self,
        id: i64,
        history: Option<&HistoryItem>,
        keep_history: u32,
    ) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM downloads WHERE id = ?1 AND status = 'active'",
            params![id],
        )?;
        if deleted == 0 {
            return Ok(false);
        }
        if let Some(item) = history {
            insert_history_row(&tx, item)?;
            if keep_history > 0 {
                trim_history_rows(&tx, keep_history)?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Delete a download by ID. Returns false if it did not exist.
    pub fn delete_download(&mut self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM downloads WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Count downloads by status.
    pub fn count_by_status(&mut self, status: DownloadStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn query_downloads<P: rusqlite::Params>(&self, sql: &str, p: P) -> Result<Vec<DownloadItem>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(p, |row| Self::row_to_download(row))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Helper function to convert a database row to DownloadItem.
    fn row_to_download(row: &Row) -> rusqlite::Result<DownloadItem> {
        let status: String = row.get(10)?;
        let status = DownloadStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?;
        let download_path: String = row.get(11)?;
        let duration_seconds: Option<i64> = row.get(4)?;
        let download_start_time: Option<i64> = row.get(12)?;
        let queued_at: i64 = row.get(17)?;

        Ok(DownloadItem {
            id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            author: row.get(3)?,
            duration_seconds: duration_seconds.map(|d| d.max(0) as u64),
            thumb: row.get(5)?,
            website: row.get(6)?,
            options: json_column(row, 8)?,
            format: json_column(row, 9)?,
            status,
            download_path: PathBuf::from(download_path),
            download_start_time: download_start_time.map(from_millis),
            incognito: row.get(13)?,
            log_id: row.get(14)?,
            custom_file_name_template: row.get(15)?,
            extra_commands: row.get(16)?,
            queued_at: from_millis(queued_at),
            error_message: row.get(18)?,
        })
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn insert_history(&mut self, item: &HistoryItem) -> Result<i64> {
        insert_history_row(&self.conn, item)
    }

    /// Most recent history entries first.
    pub fn get_history(&mut self, limit: u32) -> Result<Vec<HistoryItem>> {
        let sql = format!("SELECT {HISTORY_COLUMNS} FROM history ORDER BY time DESC, id DESC LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], |row| Self::row_to_history(row))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn history_for_download(&mut self, download_id: i64) -> Result<Vec<HistoryItem>> {
        let sql = format!("SELECT {HISTORY_COLUMNS} FROM history WHERE download_id = ?1 ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![download_id], |row| Self::row_to_history(row))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Keep only the newest `keep_count` history rows.
    pub fn trim_history(&mut self, keep_count: u32) -> Result<usize> {
        trim_history_rows(&self.conn, keep_count)
    }

    fn row_to_history(row: &Row) -> rusqlite::Result<HistoryItem> {
        let kind: String = row.get(6)?;
        let kind = DownloadType::from_str(&kind).ok_or(rusqlite::Error::InvalidQuery)?;
        let duration_seconds: Option<i64> = row.get(4)?;
        let format: Format = json_column(row, 10)?;

        Ok(HistoryItem {
            id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            author: row.get(3)?,
            duration_seconds: duration_seconds.map(|d| d.max(0) as u64),
            thumb: row.get(5)?,
            kind,
            time: row.get(7)?,
            download_paths: json_column(row, 8)?,
            website: row.get(9)?,
            format,
            download_id: row.get(11)?,
            command: row.get(12)?,
        })
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    pub fn insert_log(&mut self, item: &LogItem) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO logs (title, content, format_json, type, time)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                item.title,
                item.content,
                to_json(&item.format)?,
                item.kind.as_str(),
                item.time.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Append one output line to a log entry.
    pub fn append_log(&mut self, log_id: i64, line: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE logs SET content = content || ?2 || char(10) WHERE id = ?1",
            params![log_id, line],
        )?;
        Ok(())
    }

    pub fn set_log_content(&mut self, log_id: i64, content: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE logs SET content = ?2 WHERE id = ?1",
            params![log_id, content],
        )?;
        Ok(())
    }

    pub fn get_log(&mut self, log_id: i64) -> Result<Option<LogItem>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, content, format_json, type, time FROM logs WHERE id = ?1",
                params![log_id],
                |r| {
                    let kind: String = r.get(4)?;
                    let time: String = r.get(5)?;
                    let kind =
                        DownloadType::from_str(&kind).ok_or(rusqlite::Error::InvalidQuery)?;
                    let time = DateTime::parse_from_rfc3339(&time)
                        .map_err(|_| rusqlite::Error::InvalidQuery)?
                        .with_timezone(&Utc);
                    Ok(LogItem {
                        id: r.get(0)?,
                        title: r.get(1)?,
                        content: r.get(2)?,
                        format: json_column(r, 3)?,
                        kind,
                        time,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn insert_history_row(conn: &Connection, item: &HistoryItem) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO history (
          url, title, author, duration_seconds, thumb, type, time,
          download_paths_json, website, format_json, download_id, command
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            item.url,
            item.title,
            item.author,
            item.duration_seconds.map(|d| d as i64),
            item.thumb,
            item.kind.as_str(),
            item.time,
            to_json(&item.download_paths)?,
            item.website,
            to_json(&item.format)?,
            item.download_id,
            item.command,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn trim_history_rows(conn: &Connection, keep_count: u32) -> Result<usize> {
    let removed = conn.execute(
        r#"
        DELETE FROM history
        WHERE id NOT IN (
            SELECT id FROM history
            ORDER BY time DESC, id DESC
            LIMIT ?1
        )
        "#,
        params![keep_count],
    )?;
    Ok(removed)
}

/// Apply migrations to bring database to current schema.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    // Ensure meta row exists for schema_version.
    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "db schema version {} is newer than app supports {}",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
          id INTEGER PRIMARY KEY AUTOINCREMENT,

          url TEXT NOT NULL,
          title TEXT NOT NULL DEFAULT '',
          author TEXT NOT NULL DEFAULT '',
          duration_seconds INTEGER NULL,
          thumb TEXT NOT NULL DEFAULT '',
          website TEXT NOT NULL DEFAULT '',

          type TEXT NOT NULL,
          options_json TEXT NOT NULL,
          format_json TEXT NOT NULL,

          status TEXT NOT NULL,
          download_path TEXT NOT NULL,
          download_start_time INTEGER NULL,

          incognito INTEGER NOT NULL DEFAULT 0,
          log_id INTEGER NULL,
          custom_file_name_template TEXT NOT NULL DEFAULT '',
          extra_commands TEXT NOT NULL DEFAULT '',

          queued_at INTEGER NOT NULL,
          error_message TEXT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
        CREATE INDEX IF NOT EXISTS idx_downloads_queue_order ON downloads(status, queued_at, id);

        CREATE TABLE IF NOT EXISTS history (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          url TEXT NOT NULL,
          title TEXT NOT NULL,
          author TEXT NOT NULL,
          duration_seconds INTEGER NULL,
          thumb TEXT NOT NULL,
          type TEXT NOT NULL,
          time INTEGER NOT NULL,
          download_paths_json TEXT NOT NULL,
          website TEXT NOT NULL,
          format_json TEXT NOT NULL,
          download_id INTEGER NOT NULL,
          command TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_time ON history(time);

        CREATE TABLE IF NOT EXISTS logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          title TEXT NOT NULL,
          content TEXT NOT NULL,
          format_json TEXT NOT NULL,
          type TEXT NOT NULL,
          time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value_json TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}

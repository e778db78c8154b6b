//! Settings
//!
//! User preferences persisted as JSON in the `settings` table, plus the
//! [`SettingsProvider`] seam the scheduler reads on every pass.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;

/// Everything the engine can be configured with. Missing sections and
/// fields fall back to their defaults when loading older JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub general: GeneralSettings,

    /// Queue behaviour: caching, logging, scheduling window.
    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub formats: FormatSettings,

    #[serde(default)]
    pub sponsorblock: SponsorBlockSettings,

    #[serde(default)]
    pub subtitles: SubtitleSettings,

    #[serde(default)]
    pub privacy: PrivacySettings,

    #[serde(default)]
    pub network: NetworkSettings,
}

/// Destination, parallelism and naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Where items go when `add` is given no destination.
    #[serde(default = "default_download_folder")]
    pub download_folder: PathBuf,

    /// Upper bound on Active items; zero is treated as one.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Output filename template, used when an item carries none.
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            download_folder: default_download_folder(),
            concurrency: default_concurrency(),
            filename_template: default_filename_template(),
        }
    }
}

/// What to do with rows left Active by a previous engine that is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Put them back in the queue.
    #[default]
    Requeue,
    /// Fail them with an "interrupted" message.
    MarkError,
    /// Leave them Active; they keep occupying a slot.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Stage downloads in a private per-item directory and move on success.
    #[serde(default = "default_true")]
    pub cache_downloads: bool,

    /// Copy out of the staging directory instead of moving.
    #[serde(default)]
    pub keep_cache: bool,

    /// Record command and output of every download as a log entry.
    #[serde(default)]
    pub log_downloads: bool,

    /// Only start unscheduled items inside the daily window.
    #[serde(default)]
    pub use_scheduler: bool,

    #[serde(default = "default_schedule_start")]
    pub schedule_start: NaiveTime,

    #[serde(default = "default_schedule_end")]
    pub schedule_end: NaiveTime,

    #[serde(default)]
    pub orphan_policy: OrphanPolicy,

    /// Pass `--download-archive` so already-fetched media is skipped.
    #[serde(default)]
    pub use_download_archive: bool,

    /// Archive file; defaults to `archive.txt` in the data dir.
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            cache_downloads: true,
            keep_cache: false,
            log_downloads: false,
            use_scheduler: false,
            schedule_start: default_schedule_start(),
            schedule_end: default_schedule_end(),
            orphan_policy: OrphanPolicy::default(),
            use_download_archive: false,
            archive_path: None,
        }
    }
}

impl QueueSettings {
    /// Whether `time` falls inside the daily window. The window may wrap
    /// past midnight; equal bounds mean "all day".
    pub fn is_within_window(&self, time: NaiveTime) -> bool {
        let (start, end) = (self.schedule_start, self.schedule_end);
        if start == end {
            true
        } else if start < end {
            time >= start && time < end
        } else {
            time >= start || time < end
        }
    }

    /// Next local time the window opens, strictly after `now`.
    pub fn next_window_start(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let today = now
            .date_naive()
            .and_time(self.schedule_start)
            .and_local_timezone(Local)
            .earliest()?;
        if today > now {
            Some(today)
        } else {
            (now.date_naive() + Days::new(1))
                .and_time(self.schedule_start)
                .and_local_timezone(Local)
                .earliest()
        }
    }
}

/// Post-processing and sidecar handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatSettings {
    #[serde(default = "default_true")]
    pub embed_metadata: bool,

    /// Extensions yt-dlp uses for written thumbnails.
    #[serde(default = "default_thumbnail_containers")]
    pub thumbnail_containers: Vec<String>,

    /// Other sidecar extensions (description, partial files, info json).
    #[serde(default = "default_side_artifact_extensions")]
    pub side_artifact_extensions: Vec<String>,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            embed_metadata: true,
            thumbnail_containers: default_thumbnail_containers(),
            side_artifact_extensions: default_side_artifact_extensions(),
        }
    }
}

impl UserSettings {
    /// Extensions never reported as a download result: thumbnails, subtitles
    /// and other sidecars. Lowercase, without dots.
    pub fn non_media_extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self
            .formats
            .thumbnail_containers
            .iter()
            .chain(self.subtitles.formats.iter())
            .chain(self.formats.side_artifact_extensions.iter())
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        exts.sort();
        exts.dedup();
        exts
    }
}

/// Defaults for `--sponsorblock-remove` / `--sponsorblock-mark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SponsorBlockSettings {
    /// "remove" cuts segments out, "mark" turns them into chapters.
    #[serde(default = "default_sponsorblock_mode")]
    pub mode: String,

    /// Categories offered by default.
    #[serde(default = "default_sponsorblock_categories")]
    pub categories: Vec<String>,
}

impl Default for SponsorBlockSettings {
    fn default() -> Self {
        Self {
            mode: default_sponsorblock_mode(),
            categories: default_sponsorblock_categories(),
        }
    }
}

impl SponsorBlockSettings {
    pub fn marks_only(&self) -> bool {
        self.mode.eq_ignore_ascii_case("mark")
    }
}

/// Categories yt-dlp accepts for `--sponsorblock-*`.
pub const SPONSORBLOCK_CATEGORIES: &[&str] = &[
    "all",
    "sponsor",
    "intro",
    "outro",
    "selfpromo",
    "preview",
    "filler",
    "interaction",
    "music_offtopic",
    "poi_highlight",
    "chapter",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleSettings {
    /// Preferred subtitle format (`--sub-format`).
    #[serde(default = "default_subtitle_format")]
    pub preferred_format: String,

    /// Subtitle file extensions, used to recognise sidecar files.
    #[serde(default = "default_subtitle_formats")]
    pub formats: Vec<String>,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            preferred_format: default_subtitle_format(),
            formats: default_subtitle_formats(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacySettings {
    /// Path to a Netscape cookies file passed to yt-dlp.
    #[serde(default)]
    pub cookies_path: Option<PathBuf>,

    /// Write a history row for each finished item.
    #[serde(default = "default_true")]
    pub keep_history: bool,

    /// Oldest rows beyond this are trimmed; zero keeps everything.
    #[serde(default = "default_max_history")]
    pub max_history_entries: u32,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            cookies_path: None,
            keep_history: true,
            max_history_entries: default_max_history(),
        }
    }
}

/// Flags forwarded to yt-dlp for every non-command item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub use_proxy: bool,

    /// Passed as `--proxy` when `use_proxy` is set.
    #[serde(default)]
    pub proxy_url: String,

    /// `--limit-rate` in bytes per second; zero disables it.
    #[serde(default)]
    pub rate_limit_bps: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    /// `-N` for DASH/HLS downloads.
    #[serde(default = "default_concurrent_fragments")]
    pub concurrent_fragments: u32,

    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            use_proxy: false,
            proxy_url: String::new(),
            rate_limit_bps: 0,
            retries: default_retries(),
            concurrent_fragments: default_concurrent_fragments(),
            socket_timeout: default_socket_timeout(),
        }
    }
}

fn default_download_folder() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

fn default_concurrency() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_filename_template() -> String {
    "%(title)s [%(id)s].%(ext)s".to_string()
}

fn default_schedule_start() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default()
}

fn default_schedule_end() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default()
}

fn default_thumbnail_containers() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp"].map(String::from).to_vec()
}

fn default_side_artifact_extensions() -> Vec<String> {
    ["description", "txt", "json", "part", "ytdl"]
        .map(String::from)
        .to_vec()
}

fn default_sponsorblock_mode() -> String {
    "remove".to_string()
}

fn default_sponsorblock_categories() -> Vec<String> {
    vec!["sponsor".to_string()]
}

fn default_subtitle_format() -> String {
    "srt".to_string()
}

fn default_subtitle_formats() -> Vec<String> {
    ["srt", "vtt", "ass", "lrc"].map(String::from).to_vec()
}

fn default_max_history() -> u32 {
    1000
}

fn default_retries() -> u32 {
    3
}

fn default_concurrent_fragments() -> u32 {
    1
}

fn default_socket_timeout() -> u32 {
    30
}

/// Row keys in the `settings` table.
pub mod keys {
    pub const USER_SETTINGS: &str = "user_settings";
    pub const LAST_DESTINATION: &str = "last_destination";
}

/// Typed access to the `settings` key/value table. Values are stored as JSON
/// so sections can grow fields without a schema change.
pub struct SettingsManager<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("Failed to read setting {key}"))?;

        raw.map(|json| {
            serde_json::from_str(&json).with_context(|| format!("Setting {key} is not valid JSON"))
        })
        .transpose()
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("Failed to encode setting {key}"))?;
        self.conn
            .execute(
                "INSERT INTO settings (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![key, json],
            )
            .with_context(|| format!("Failed to write setting {key}"))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to remove setting {key}"))?;
        Ok(())
    }

    /// Stored settings, or defaults on a fresh database.
    pub fn get_user_settings(&self) -> Result<UserSettings> {
        Ok(self.get(keys::USER_SETTINGS)?.unwrap_or_default())
    }

    pub fn save_user_settings(&self, settings: &UserSettings) -> Result<()> {
        self.set(keys::USER_SETTINGS, settings)
    }

    pub fn get_last_destination(&self) -> Result<Option<PathBuf>> {
        self.get(keys::LAST_DESTINATION)
    }

    pub fn save_last_destination(&self, path: &Path) -> Result<()> {
        self.set(keys::LAST_DESTINATION, path)
    }
}

/// Source of the settings snapshot the engine reads at the start of each pass.
pub trait SettingsProvider: Send + Sync + 'static {
    fn current(&self) -> UserSettings;
}

impl SettingsProvider for UserSettings {
    fn current(&self) -> UserSettings {
        self.clone()
    }
}

impl SettingsProvider for watch::Receiver<UserSettings> {
    fn current(&self) -> UserSettings {
        self.borrow().clone()
    }
}

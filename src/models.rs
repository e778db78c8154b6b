use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What kind of download an item is. Mirrors the variant of [`DownloadOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    Audio,
    Video,
    Command,
}

impl DownloadType {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadType::Audio => "audio",
            DownloadType::Video => "video",
            DownloadType::Command => "command",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "audio" => DownloadType::Audio,
            "video" => DownloadType::Video,
            "command" => DownloadType::Command,
            _ => return None,
        })
    }
}

/// Persistent lifecycle status for a queue row.
///
/// Finished downloads are not a status: they leave the queue and become a
/// [`HistoryItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Active,
    Error,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Active => "active",
            DownloadStatus::Error => "error",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => DownloadStatus::Queued,
            "active" => DownloadStatus::Active,
            "error" => DownloadStatus::Error,
            "cancelled" => DownloadStatus::Cancelled,
            _ => return None,
        })
    }
}

/// Selected format descriptor as reported by `yt-dlp -F` / `--dump-json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    #[serde(default)]
    pub format_id: String,
    /// Container / extension, e.g. "mp4", "m4a", "mp3".
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub vcodec: String,
    #[serde(default)]
    pub acodec: String,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub format_note: String,
}

impl Format {
    pub fn new<S1: Into<String>, S2: Into<String>>(format_id: S1, container: S2) -> Self {
        Self {
            format_id: format_id.into(),
            container: container.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPreferences {
    #[serde(default)]
    pub embed_thumb: bool,
    #[serde(default)]
    pub crop_thumb: bool,
    #[serde(default)]
    pub split_by_chapters: bool,
    /// SponsorBlock categories to cut out (e.g. "sponsor", "intro").
    #[serde(default)]
    pub sponsorblock: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPreferences {
    /// Audio format ids merged with the video stream (`-f video+audio1+audio2`).
    #[serde(default)]
    pub audio_format_ids: Vec<String>,
    #[serde(default)]
    pub embed_subs: bool,
    #[serde(default)]
    pub write_subs: bool,
    #[serde(default)]
    pub write_auto_subs: bool,
    #[serde(default)]
    pub subs_languages: Vec<String>,
    #[serde(default)]
    pub add_chapters: bool,
    #[serde(default)]
    pub split_by_chapters: bool,
    #[serde(default)]
    pub remove_audio: bool,
    #[serde(default)]
    pub sponsorblock: Vec<String>,
}

impl VideoPreferences {
    pub fn wants_subtitles(&self) -> bool {
        self.embed_subs || self.write_subs || self.write_auto_subs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPreferences {
    /// Raw yt-dlp config text, one option per line.
    #[serde(default)]
    pub template: String,
}

/// Type-specific preference payload. The variant is the item's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "preferences", rename_all = "snake_case")]
pub enum DownloadOptions {
    Audio(AudioPreferences),
    Video(VideoPreferences),
    Command(CommandPreferences),
}

impl DownloadOptions {
    pub fn kind(&self) -> DownloadType {
        match self {
            DownloadOptions::Audio(_) => DownloadType::Audio,
            DownloadOptions::Video(_) => DownloadType::Video,
            DownloadOptions::Command(_) => DownloadType::Command,
        }
    }
}

/// Core persisted download record (one row in the queue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadItem {
    /// Assigned by the store; 0 until inserted.
    pub id: i64,

    pub url: String,
    pub title: String,
    pub author: String,
    pub duration_seconds: Option<u64>,
    pub thumb: String,
    pub website: String,

    pub options: DownloadOptions,
    pub format: Format,

    pub status: DownloadStatus,
    pub download_path: PathBuf,
    /// `None` runs as soon as a slot frees up.
    pub download_start_time: Option<DateTime<Utc>>,

    pub incognito: bool,
    pub log_id: Option<i64>,
    pub custom_file_name_template: String,
    pub extra_commands: String,

    /// FIFO key. Set on insert and when the user re-queues.
    pub queued_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl DownloadItem {
    pub fn new<S: Into<String>>(url: S, options: DownloadOptions, download_path: PathBuf) -> Self {
        Self {
            id: 0,
            url: url.into(),
            title: String::new(),
            author: String::new(),
            duration_seconds: None,
            thumb: String::new(),
            website: String::new(),
            options,
            format: Format::default(),
            status: DownloadStatus::Queued,
            download_path,
            download_start_time: None,
            incognito: false,
            log_id: None,
            custom_file_name_template: String::new(),
            extra_commands: String::new(),
            queued_at: Utc::now(),
            error_message: None,
        }
    }

    pub fn new_audio<S: Into<String>>(url: S, format: Format, download_path: PathBuf) -> Self {
        let mut item = Self::new(
            url,
            DownloadOptions::Audio(AudioPreferences::default()),
            download_path,
        );
        item.format = format;
        item
    }

    pub fn new_video<S: Into<String>>(url: S, format: Format, download_path: PathBuf) -> Self {
        let mut item = Self::new(
            url,
            DownloadOptions::Video(VideoPreferences::default()),
            download_path,
        );
        item.format = format;
        item
    }

    pub fn new_command<S1: Into<String>, S2: Into<String>>(
        url: S1,
        template: S2,
        download_path: PathBuf,
    ) -> Self {
        Self::new(
            url,
            DownloadOptions::Command(CommandPreferences {
                template: template.into(),
            }),
            download_path,
        )
    }

    pub fn kind(&self) -> DownloadType {
        self.options.kind()
    }

    /// Title for notifications and logs, falling back to the URL.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.url
        } else {
            &self.title
        }
    }

    /// Whether the item may start at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.download_start_time.map_or(true, |t| t <= now)
    }

    pub fn has_explicit_start_time(&self) -> bool {
        self.download_start_time.is_some()
    }
}

/// Terminal record of a successful, non-incognito download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub author: String,
    pub duration_seconds: Option<u64>,
    pub thumb: String,
    pub kind: DownloadType,
    /// Completion time, unix seconds.
    pub time: i64,
    pub download_paths: Vec<PathBuf>,
    pub website: String,
    pub format: Format,
    pub download_id: i64,
    pub command: String,
}

impl HistoryItem {
    pub fn from_download(
        item: &DownloadItem,
        paths: Vec<PathBuf>,
        command: String,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            url: item.url.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            duration_seconds: item.duration_seconds,
            thumb: item.thumb.clone(),
            kind: item.kind(),
            time: completed_at.timestamp(),
            download_paths: paths,
            website: item.website.clone(),
            format: item.format.clone(),
            download_id: item.id,
            command,
        }
    }
}

/// Diagnostic record: command line plus streamed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogItem {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub format: Format,
    pub kind: DownloadType,
    pub time: DateTime<Utc>,
}

impl LogItem {
    pub fn for_download(item: &DownloadItem, command: &str) -> Self {
        Self {
            id: 0,
            title: item.display_title().to_string(),
            content: format!(
                "Downloading:\nTitle: {}\nURL: {}\nType: {}\nCommand:\n {}\n\n",
                item.title,
                item.url,
                item.kind().as_str(),
                command
            ),
            format: item.format.clone(),
            kind: item.kind(),
            time: Utc::now(),
        }
    }
}

/// Metadata returned by `yt-dlp --dump-json`, used to fill in items queued
/// without a title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedMetadata {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_seconds: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub website: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_string_roundtrip() {
        for s in [
            DownloadStatus::Queued,
            DownloadStatus::Active,
            DownloadStatus::Error,
            DownloadStatus::Cancelled,
        ] {
            assert_eq!(DownloadStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(DownloadStatus::from_str("finished"), None);
    }

    #[test]
    fn options_carry_the_type() {
        let item = DownloadItem::new_command("https://example.com/v", "-f best", PathBuf::from("/tmp"));
        assert_eq!(item.kind(), DownloadType::Command);
        let item = DownloadItem::new_audio("https://example.com/v", Format::new("140", "m4a"), PathBuf::from("/tmp"));
        assert_eq!(item.kind(), DownloadType::Audio);
    }

    #[test]
    fn options_serialize_as_tagged_union() {
        let opts = DownloadOptions::Video(VideoPreferences {
            embed_subs: true,
            subs_languages: vec!["en".into()],
            ..VideoPreferences::default()
        });
        let json = serde_json::to_string(&opts).unwrap();
        assert!(json.contains("\"type\":\"video\""));
        let back: DownloadOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn due_check_honours_start_time() {
        let now = Utc::now();
        let mut item = DownloadItem::new_video("https://example.com/v", Format::new("22", "mp4"), PathBuf::from("/tmp"));
        assert!(item.is_due(now));
        item.download_start_time = Some(now + Duration::minutes(5));
        assert!(!item.is_due(now));
        assert!(item.is_due(now + Duration::minutes(5)));
    }

    #[test]
    fn display_title_falls_back_to_url() {
        let mut item = DownloadItem::new_video("https://example.com/v", Format::default(), PathBuf::from("/tmp"));
        assert_eq!(item.display_title(), "https://example.com/v");
        item.title = "A video".into();
        assert_eq!(item.display_title(), "A video");
    }
}

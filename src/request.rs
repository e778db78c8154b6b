//! Translation of a queued [`DownloadItem`] into a yt-dlp invocation.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::BuildError;
use crate::models::{
    AudioPreferences, CommandPreferences, DownloadItem, DownloadOptions, DownloadType,
    VideoPreferences,
};
use crate::settings::{UserSettings, SPONSORBLOCK_CATEGORIES};

/// Progress line emitted through `--progress-template`; parsed by the runner.
pub const PROGRESS_TEMPLATE: &str = "download:[mediaq] %(progress._percent_str)s %(progress._speed_str)s %(progress._eta_str)s %(progress._total_bytes_str)s";

/// Printed after each file reaches its final location when downloading in place.
pub const AFTER_MOVE_TEMPLATE: &str = "after_move:'%(filepath)s'";

const CROP_THUMBNAIL_PPA: &str =
    "ThumbnailsConvertor+ffmpeg_o:-c:v mjpeg -vf crop=\"'if(gt(ih,iw),iw,ih)':'if(gt(iw,ih),ih,iw)'\"";

const REMOVE_AUDIO_PPA: &str = "ffmpeg:-an";

/// Filesystem locations the builder needs besides the item itself.
#[derive(Debug, Clone)]
pub struct RequestPaths {
    /// Root of the per-item staging directories.
    pub staging_root: PathBuf,
    /// Where transient config files for command downloads are written.
    pub config_dir: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    /// Archive used when `queue.archive_path` is unset.
    pub default_archive: PathBuf,
}

impl RequestPaths {
    pub fn new(cache_dir: &Path, data_dir: &Path, ffmpeg_path: Option<PathBuf>) -> Self {
        Self {
            staging_root: cache_dir.to_path_buf(),
            config_dir: cache_dir.join("configs"),
            ffmpeg_path,
            default_archive: data_dir.join("archive.txt"),
        }
    }

    /// Private staging directory of one item.
    pub fn staging_dir(&self, id: i64) -> PathBuf {
        self.staging_root.join(id.to_string())
    }
}

/// A file that must exist while the process runs and is deleted afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Executable description of one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// URL passed as the final positional argument.
    pub target: String,
    /// Ordered arguments, user extras last.
    pub args: Vec<String>,
    pub config_files: Vec<ConfigFile>,
    /// Staging directory, or the destination when downloading in place.
    pub output_dir: PathBuf,
    /// Output paths are reported on stdout instead of staged.
    pub no_cache: bool,
    /// Index into `args` where the user's extra commands start.
    extra_from: usize,
}

impl Request {
    /// A request with no user extras and no config files.
    pub fn new<S: Into<String>>(target: S, args: Vec<String>, output_dir: PathBuf) -> Self {
        let extra_from = args.len();
        Self {
            target: target.into(),
            args,
            config_files: Vec::new(),
            output_dir,
            no_cache: false,
            extra_from,
        }
    }

    /// Arguments generated from the item, without the user's extras.
    pub fn generated_args(&self) -> &[String] {
        &self.args[..self.extra_from.min(self.args.len())]
    }

    pub fn extra_args(&self) -> &[String] {
        &self.args[self.extra_from.min(self.args.len())..]
    }

    /// Shell-quoted command line, for history and logs.
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        parts.push("yt-dlp".to_string());
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.push(shell_quote(&self.target));
        parts.join(" ")
    }

    /// Whether the archive flag was passed, so a missing file may mean "already downloaded".
    pub fn uses_download_archive(&self) -> bool {
        self.args.iter().any(|a| a == "--download-archive")
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Build the yt-dlp request for `item`.
///
/// `no_cache` downloads straight into `item.download_path` and asks yt-dlp to
/// print every final path; otherwise output goes to the item's staging dir.
pub fn build_request(
    item: &DownloadItem,
    settings: &UserSettings,
    paths: &RequestPaths,
    no_cache: bool,
) -> Result<Request, BuildError> {
    if item.url.trim().is_empty() {
        return Err(BuildError::EmptyUrl);
    }
    validate_options(item)?;
    let extras = tokenize(&item.extra_commands)?;

    let output_dir = if no_cache {
        item.download_path.clone()
    } else {
        paths.staging_dir(item.id)
    };

    let mut args: Vec<String> = Vec::new();
    let mut config_files = Vec::new();

    push_all(
        &mut args,
        [
            "--newline",
            "--progress",
            "--progress-template",
            PROGRESS_TEMPLATE,
            "--no-warnings",
            "-P",
        ],
    );
    args.push(output_dir.to_string_lossy().into_owned());

    let is_command = matches!(item.options, DownloadOptions::Command(_));
    if !item.custom_file_name_template.trim().is_empty() {
        args.push("-o".into());
        args.push(item.custom_file_name_template.clone());
    } else if !is_command {
        args.push("-o".into());
        args.push(settings.general.filename_template.clone());
    }

    if let Some(ffmpeg) = &paths.ffmpeg_path {
        args.push("--ffmpeg-location".into());
        args.push(ffmpeg.to_string_lossy().into_owned());
    }

    if no_cache {
        push_all(&mut args, ["--print", AFTER_MOVE_TEMPLATE, "--no-simulate", "--no-quiet"]);
    }

    if settings.queue.use_download_archive {
        let archive = settings
            .queue
            .archive_path
            .clone()
            .unwrap_or_else(|| paths.default_archive.clone());
        args.push("--download-archive".into());
        args.push(archive.to_string_lossy().into_owned());
    }

    match &item.options {
        DownloadOptions::Audio(prefs) => {
            push_common_options(&mut args, settings);
            push_audio(&mut args, item, prefs);
        }
        DownloadOptions::Video(prefs) => {
            push_common_options(&mut args, settings);
            push_video(&mut args, item, prefs, settings);
        }
        DownloadOptions::Command(prefs) => {
            let path = paths
                .config_dir
                .join(format!("{}-{}.conf", item.id, Uuid::new_v4()));
            args.push("--config-locations".into());
            args.push(path.to_string_lossy().into_owned());
            config_files.push(ConfigFile {
                path,
                contents: prefs.template.clone(),
            });
        }
    }

    let extra_from = args.len();
    args.extend(extras);

    Ok(Request {
        target: item.url.trim().to_string(),
        args,
        config_files,
        output_dir,
        no_cache,
        extra_from,
    })
}

fn validate_options(item: &DownloadItem) -> Result<(), BuildError> {
    match &item.options {
        DownloadOptions::Audio(prefs) => {
            if item.format.format_id.trim().is_empty() {
                return Err(BuildError::MissingFormat { kind: "audio" });
            }
            validate_sponsorblock(&prefs.sponsorblock)
        }
        DownloadOptions::Video(prefs) => {
            if item.format.format_id.trim().is_empty() {
                return Err(BuildError::MissingFormat { kind: "video" });
            }
            if prefs.wants_subtitles() && prefs.subs_languages.iter().all(|l| l.trim().is_empty())
            {
                return Err(BuildError::MissingSubtitleLanguages);
            }
            validate_sponsorblock(&prefs.sponsorblock)
        }
        DownloadOptions::Command(prefs) => {
            if prefs.template.trim().is_empty() {
                return Err(BuildError::EmptyCommandTemplate);
            }
            Ok(())
        }
    }
}

fn validate_sponsorblock(categories: &[String]) -> Result<(), BuildError> {
    for cat in categories {
        if !SPONSORBLOCK_CATEGORIES.contains(&cat.as_str()) {
            return Err(BuildError::UnknownSponsorBlockCategory(cat.clone()));
        }
    }
    Ok(())
}

fn push_all<const N: usize>(args: &mut Vec<String>, items: [&str; N]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Network, cookie and metadata options shared by audio and video.
fn push_common_options(args: &mut Vec<String>, settings: &UserSettings) {
    let net = &settings.network;
    if net.use_proxy && !net.proxy_url.trim().is_empty() {
        args.push("--proxy".into());
        args.push(net.proxy_url.trim().to_string());
    }
    if net.rate_limit_bps > 0 {
        args.push("--limit-rate".into());
        args.push(net.rate_limit_bps.to_string());
    }
    args.push("--retries".into());
    args.push(net.retries.to_string());
    if net.concurrent_fragments > 1 {
        args.push("--concurrent-fragments".into());
        args.push(net.concurrent_fragments.to_string());
    }
    if net.socket_timeout > 0 {
        args.push("--socket-timeout".into());
        args.push(net.socket_timeout.to_string());
    }

    if let Some(cookies) = &settings.privacy.cookies_path {
        args.push("--cookies".into());
        args.push(cookies.to_string_lossy().into_owned());
    }

    if settings.formats.embed_metadata {
        args.push("--embed-metadata".into());
    }
}

fn is_default_container(container: &str) -> bool {
    let c = container.trim();
    c.is_empty() || c.eq_ignore_ascii_case("default")
}

fn push_audio(args: &mut Vec<String>, item: &DownloadItem, prefs: &AudioPreferences) {
    args.push("-x".into());
    args.push("-f".into());
    args.push(item.format.format_id.trim().to_string());
    if !is_default_container(&item.format.container) {
        args.push("--audio-format".into());
        args.push(item.format.container.trim().to_string());
    }
    if prefs.embed_thumb {
        push_all(args, ["--embed-thumbnail", "--convert-thumbnails", "jpg"]);
    }
    if prefs.crop_thumb {
        args.push("--ppa".into());
        args.push(CROP_THUMBNAIL_PPA.into());
    }
    if prefs.split_by_chapters {
        args.push("--split-chapters".into());
    }
    if !prefs.sponsorblock.is_empty() {
        args.push("--sponsorblock-remove".into());
        args.push(prefs.sponsorblock.join(","));
    }
}

fn push_video(
    args: &mut Vec<String>,
    item: &DownloadItem,
    prefs: &VideoPreferences,
    settings: &UserSettings,
) {
    let mut format = item.format.format_id.trim().to_string();
    for audio in prefs.audio_format_ids.iter().filter(|a| !a.trim().is_empty()) {
        format.push('+');
        format.push_str(audio.trim());
    }
    args.push("-f".into());
    args.push(format);

    if !is_default_container(&item.format.container) {
        args.push("--merge-output-format".into());
        args.push(item.format.container.trim().to_string());
    }

    if prefs.wants_subtitles() {
        if prefs.embed_subs {
            args.push("--embed-subs".into());
        }
        if prefs.write_subs {
            args.push("--write-subs".into());
        }
        if prefs.write_auto_subs {
            args.push("--write-auto-subs".into());
        }
        args.push("--sub-langs".into());
        args.push(prefs.subs_languages.join(","));
        args.push("--sub-format".into());
        args.push(settings.subtitles.preferred_format.clone());
    }

    if prefs.add_chapters {
        args.push("--embed-chapters".into());
    }
    if prefs.split_by_chapters {
        args.push("--split-chapters".into());
    }
    if !prefs.sponsorblock.is_empty() {
        let flag = if settings.sponsorblock.marks_only() {
            "--sponsorblock-mark"
        } else {
            "--sponsorblock-remove"
        };
        args.push(flag.into());
        args.push(prefs.sponsorblock.join(","));
    }
    if prefs.remove_audio {
        args.push("--ppa".into());
        args.push(REMOVE_AUDIO_PPA.into());
    }
}

/// Split free-form extra commands into argv tokens. Single quotes are literal,
/// double quotes allow backslash escapes.
pub fn tokenize(input: &str) -> Result<Vec<String>, BuildError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(BuildError::UnbalancedQuote),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch) => current.push(ch),
                            None => return Err(BuildError::UnbalancedQuote),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(BuildError::UnbalancedQuote),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Preferences recovered from a built [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPreferences {
    pub format_id: String,
    /// Empty when yt-dlp picks the container.
    pub container: String,
    pub options: DownloadOptions,
}

impl RequestPreferences {
    pub fn kind(&self) -> DownloadType {
        self.options.kind()
    }

    pub fn from_request(request: &Request) -> Self {
        let args = request.generated_args();
        let mut format_spec = String::new();
        let mut container = String::new();
        let mut extract_audio = false;
        let mut config_location: Option<String> = None;
        let mut audio = AudioPreferences::default();
        let mut video = VideoPreferences::default();
        let mut sponsorblock: Vec<String> = Vec::new();

        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1).cloned().unwrap_or_default();
            let mut consumed = 1;
            match args[i].as_str() {
                "-x" => extract_audio = true,
                "-f" => {
                    format_spec = value;
                    consumed = 2;
                }
                "--audio-format" | "--merge-output-format" => {
                    container = value;
                    consumed = 2;
                }
                "--embed-thumbnail" => audio.embed_thumb = true,
                "--ppa" => {
                    if value == REMOVE_AUDIO_PPA {
                        video.remove_audio = true;
                    } else if value.starts_with("ThumbnailsConvertor") {
                        audio.crop_thumb = true;
                    }
                    consumed = 2;
                }
                "--split-chapters" => {
                    audio.split_by_chapters = true;
                    video.split_by_chapters = true;
                }
                "--sponsorblock-remove" | "--sponsorblock-mark" => {
                    sponsorblock = split_list(&value);
                    consumed = 2;
                }
                "--embed-subs" => video.embed_subs = true,
                "--write-subs" => video.write_subs = true,
                "--write-auto-subs" => video.write_auto_subs = true,
                "--sub-langs" => {
                    video.subs_languages = split_list(&value);
                    consumed = 2;
                }
                "--embed-chapters" => video.add_chapters = true,
                "--config-locations" => {
                    config_location = Some(value);
                    consumed = 2;
                }
                "-P" | "-o" | "--progress-template" | "--ffmpeg-location" | "--print"
                | "--download-archive" | "--proxy" | "--limit-rate" | "--retries"
                | "--concurrent-fragments" | "--socket-timeout" | "--cookies"
                | "--sub-format" | "--convert-thumbnails" => consumed = 2,
                _ => {}
            }
            i += consumed;
        }

        if let Some(location) = config_location {
            let template = request
                .config_files
                .iter()
                .find(|f| f.path.to_string_lossy() == location)
                .map(|f| f.contents.clone())
                .unwrap_or_default();
            return Self {
                format_id: String::new(),
                container: String::new(),
                options: DownloadOptions::Command(CommandPreferences { template }),
            };
        }

        let mut ids = format_spec.split('+').map(str::to_string);
        let format_id = ids.next().unwrap_or_default();

        let options = if extract_audio {
            audio.sponsorblock = sponsorblock;
            DownloadOptions::Audio(audio)
        } else {
            video.audio_format_ids = ids.collect();
            video.sponsorblock = sponsorblock;
            DownloadOptions::Video(video)
        };

        Self {
            format_id,
            container,
            options,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Format;

    fn paths() -> RequestPaths {
        RequestPaths::new(
            Path::new("/cache"),
            Path::new("/data"),
            Some(PathBuf::from("/usr/bin/ffmpeg")),
        )
    }

    fn audio_item() -> DownloadItem {
        let mut item = DownloadItem::new_audio(
            "https://example.com/watch?v=1",
            Format::new("140", "mp3"),
            PathBuf::from("/music"),
        );
        item.id = 7;
        item
    }

    fn video_item(prefs: VideoPreferences) -> DownloadItem {
        let mut item = DownloadItem::new(
            "https://example.com/watch?v=2",
            DownloadOptions::Video(prefs),
            PathBuf::from("/videos"),
        );
        item.id = 8;
        item.format = Format::new("137", "mkv");
        item
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn audio_request_uses_staging_dir_and_audio_flags() {
        let mut item = audio_item();
        item.options = DownloadOptions::Audio(AudioPreferences {
            embed_thumb: true,
            sponsorblock: vec!["sponsor".into(), "intro".into()],
            ..AudioPreferences::default()
        });
        let req = build_request(&item, &UserSettings::default(), &paths(), false).unwrap();

        assert_eq!(req.output_dir, PathBuf::from("/cache/7"));
        assert!(has_pair(&req.args, "-P", "/cache/7"));
        assert!(has_pair(&req.args, "-f", "140"));
        assert!(has_pair(&req.args, "--audio-format", "mp3"));
        assert!(has_pair(&req.args, "--sponsorblock-remove", "sponsor,intro"));
        assert!(has_pair(&req.args, "--ffmpeg-location", "/usr/bin/ffmpeg"));
        assert!(req.args.contains(&"-x".to_string()));
        assert!(req.args.contains(&"--embed-thumbnail".to_string()));
        assert!(!req.args.contains(&"--print".to_string()));
        assert_eq!(req.target, "https://example.com/watch?v=1");
    }

    #[test]
    fn video_request_merges_audio_and_subtitles() {
        let prefs = VideoPreferences {
            audio_format_ids: vec!["140".into(), "251".into()],
            embed_subs: true,
            subs_languages: vec!["en".into(), "fr".into()],
            add_chapters: true,
            ..VideoPreferences::default()
        };
        let req = build_request(&video_item(prefs), &UserSettings::default(), &paths(), false)
            .unwrap();

        assert!(has_pair(&req.args, "-f", "137+140+251"));
        assert!(has_pair(&req.args, "--merge-output-format", "mkv"));
        assert!(has_pair(&req.args, "--sub-langs", "en,fr"));
        assert!(has_pair(&req.args, "--sub-format", "srt"));
        assert!(req.args.contains(&"--embed-chapters".to_string()));
    }

    #[test]
    fn sponsorblock_mark_mode_for_video() {
        let mut settings = UserSettings::default();
        settings.sponsorblock.mode = "mark".into();
        let prefs = VideoPreferences {
            sponsorblock: vec!["sponsor".into()],
            ..VideoPreferences::default()
        };
        let req = build_request(&video_item(prefs), &settings, &paths(), false).unwrap();
        assert!(has_pair(&req.args, "--sponsorblock-mark", "sponsor"));
    }

    #[test]
    fn no_cache_downloads_in_place_and_prints_paths() {
        let req = build_request(&audio_item(), &UserSettings::default(), &paths(), true).unwrap();
        assert_eq!(req.output_dir, PathBuf::from("/music"));
        assert!(req.no_cache);
        assert!(has_pair(&req.args, "--print", AFTER_MOVE_TEMPLATE));
        assert!(req.args.contains(&"--no-simulate".to_string()));
    }

    #[test]
    fn extra_commands_are_tokenized_and_last() {
        let mut item = audio_item();
        item.extra_commands = r#"--postprocessor-args "ffmpeg:-ss 10" --no-mtime"#.into();
        let req = build_request(&item, &UserSettings::default(), &paths(), false).unwrap();
        assert_eq!(
            req.extra_args(),
            &["--postprocessor-args", "ffmpeg:-ss 10", "--no-mtime"]
        );
        assert_eq!(req.args.last().map(String::as_str), Some("--no-mtime"));
    }

    #[test]
    fn command_template_goes_to_config_file() {
        let mut item = DownloadItem::new_command(
            "https://example.com/v",
            "-f bestaudio\n--extract-audio",
            PathBuf::from("/dl"),
        );
        item.id = 3;
        let req = build_request(&item, &UserSettings::default(), &paths(), false).unwrap();

        assert_eq!(req.config_files.len(), 1);
        let conf = &req.config_files[0];
        assert!(conf.path.starts_with("/cache/configs"));
        assert!(conf.path.to_string_lossy().ends_with(".conf"));
        assert_eq!(conf.contents, "-f bestaudio\n--extract-audio");
        assert!(has_pair(&req.args, "--config-locations", &conf.path.to_string_lossy()));
        assert!(!req.args.contains(&"-o".to_string()));
    }

    #[test]
    fn archive_flag_follows_settings() {
        let mut settings = UserSettings::default();
        settings.queue.use_download_archive = true;
        let req = build_request(&audio_item(), &settings, &paths(), false).unwrap();
        assert!(has_pair(&req.args, "--download-archive", "/data/archive.txt"));
        assert!(req.uses_download_archive());
    }

    #[test]
    fn validation_fails_fast() {
        let settings = UserSettings::default();

        let mut item = audio_item();
        item.url = "  ".into();
        assert_eq!(
            build_request(&item, &settings, &paths(), false),
            Err(BuildError::EmptyUrl)
        );

        let mut item = audio_item();
        item.format.format_id.clear();
        assert_eq!(
            build_request(&item, &settings, &paths(), false),
            Err(BuildError::MissingFormat { kind: "audio" })
        );

        let item = DownloadItem::new_command("https://example.com", " ", PathBuf::from("/dl"));
        assert_eq!(
            build_request(&item, &settings, &paths(), false),
            Err(BuildError::EmptyCommandTemplate)
        );

        let item = video_item(VideoPreferences {
            write_subs: true,
            ..VideoPreferences::default()
        });
        assert_eq!(
            build_request(&item, &settings, &paths(), false),
            Err(BuildError::MissingSubtitleLanguages)
        );

        let item = video_item(VideoPreferences {
            sponsorblock: vec!["ads".into()],
            ..VideoPreferences::default()
        });
        assert_eq!(
            build_request(&item, &settings, &paths(), false),
            Err(BuildError::UnknownSponsorBlockCategory("ads".into()))
        );

        let mut item = audio_item();
        item.extra_commands = "--exec 'echo".into();
        assert_eq!(
            build_request(&item, &settings, &paths(), false),
            Err(BuildError::UnbalancedQuote)
        );
    }

    #[test]
    fn identical_inputs_give_identical_args() {
        let item = video_item(VideoPreferences {
            audio_format_ids: vec!["140".into()],
            ..VideoPreferences::default()
        });
        let settings = UserSettings::default();
        let a = build_request(&item, &settings, &paths(), false).unwrap();
        let b = build_request(&item, &settings, &paths(), false).unwrap();
        assert_eq!(a.args, b.args);
    }

    #[test]
    fn preferences_survive_a_round_trip() {
        let settings = UserSettings::default();

        let audio = AudioPreferences {
            embed_thumb: true,
            crop_thumb: true,
            split_by_chapters: true,
            sponsorblock: vec!["sponsor".into(), "outro".into()],
        };
        let mut item = audio_item();
        item.options = DownloadOptions::Audio(audio.clone());
        item.extra_commands = "-x --split-chapters".into();
        let prefs =
            RequestPreferences::from_request(&build_request(&item, &settings, &paths(), true).unwrap());
        assert_eq!(prefs.format_id, "140");
        assert_eq!(prefs.container, "mp3");
        assert_eq!(prefs.options, DownloadOptions::Audio(audio));

        let video = VideoPreferences {
            audio_format_ids: vec!["140".into()],
            embed_subs: true,
            write_subs: true,
            write_auto_subs: true,
            subs_languages: vec!["en".into(), "de".into()],
            add_chapters: true,
            split_by_chapters: true,
            remove_audio: true,
            sponsorblock: vec!["intro".into()],
        };
        let item = video_item(video.clone());
        let prefs =
            RequestPreferences::from_request(&build_request(&item, &settings, &paths(), false).unwrap());
        assert_eq!(prefs.kind(), DownloadType::Video);
        assert_eq!(prefs.format_id, "137");
        assert_eq!(prefs.container, "mkv");
        assert_eq!(prefs.options, DownloadOptions::Video(video));

        let item = DownloadItem::new_command("https://example.com/v", "-f 18", PathBuf::from("/dl"));
        let prefs =
            RequestPreferences::from_request(&build_request(&item, &settings, &paths(), false).unwrap());
        assert_eq!(
            prefs.options,
            DownloadOptions::Command(CommandPreferences {
                template: "-f 18".into()
            })
        );
    }

    #[test]
    fn command_string_quotes_unsafe_args() {
        let mut item = audio_item();
        item.custom_file_name_template = "%(title)s - it's.%(ext)s".into();
        let req = build_request(&item, &UserSettings::default(), &paths(), false).unwrap();
        let cmd = req.command_string();
        assert!(cmd.starts_with("yt-dlp --newline"));
        assert!(cmd.contains(r"-o '%(title)s - it'\''s.%(ext)s'"));
        assert!(cmd.ends_with("'https://example.com/watch?v=1'"));
    }

    #[test]
    fn tokenizer_handles_quotes_and_escapes() {
        assert_eq!(
            tokenize(r#"a 'b c' "d \"e\"" f\ g"#).unwrap(),
            vec!["a", "b c", "d \"e\"", "f g"]
        );
        assert_eq!(tokenize("  ").unwrap(), Vec::<String>::new());
        assert_eq!(tokenize("''").unwrap(), vec![""]);
    }
}

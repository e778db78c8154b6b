use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;

use crate::error::{ErrorCode, ProcessError, ProcessErrorKind};
use crate::models::FetchedMetadata;
use crate::request::Request;

// Bound log capture to avoid unbounded memory use.
const MAX_STDOUT_LINES: usize = 20_000;
const MAX_STDERR_LINES: usize = 20_000;

/// Called for every non-empty output line with the highest percent seen so far.
pub type ProgressCallback = Box<dyn FnMut(f64, &str) + Send>;

/// Where to find yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub yt_dlp_path: PathBuf,

    /// Optional extra arguments injected before every call.
    pub global_args: Vec<String>,

    /// Timeout for metadata calls (not for downloads).
    pub metadata_timeout: Duration,
}

impl YtDlpConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            global_args: vec![],
            metadata_timeout: Duration::from_secs(30),
        }
    }
}

/// Output of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Raw stdout lines captured (bounded).
    pub stdout_lines: Vec<String>,
    /// Raw stderr lines captured (bounded).
    pub stderr_lines: Vec<String>,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout_lines
            .iter()
            .chain(self.stderr_lines.iter())
            .map(String::as_str)
    }
}

/// Runs download processes keyed by item id.
pub trait ProcessRunner: Send + Sync + 'static {
    /// Run `request` to completion. Any process still registered under `id`
    /// is destroyed first.
    fn run(
        &self,
        request: &Request,
        id: i64,
        on_progress: ProgressCallback,
    ) -> impl Future<Output = Result<ProcessOutput, ProcessError>> + Send;

    /// Terminate the process registered under `id`. Returns false if none is.
    fn cancel(&self, id: i64) -> bool;

    fn is_running(&self, id: i64) -> bool;

    /// Best-effort metadata lookup used to fill in items queued without a title.
    fn fetch_metadata(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<FetchedMetadata, ProcessError>> + Send;
}

struct Registration {
    generation: u64,
    cancel: broadcast::Sender<()>,
}

type Registry = Arc<Mutex<HashMap<i64, Registration>>>;

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<i64, Registration>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the registry entry when the run ends, unless a newer run replaced it.
struct RegistrationGuard {
    registry: Registry,
    id: i64,
    generation: u64,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let mut map = lock(&self.registry);
        if map.get(&self.id).map(|r| r.generation) == Some(self.generation) {
            map.remove(&self.id);
        }
    }
}

/// yt-dlp backed [`ProcessRunner`].
#[derive(Clone)]
pub struct YtDlpRunner {
    cfg: YtDlpConfig,
    running: Registry,
    generation: Arc<AtomicU64>,
}

impl YtDlpRunner {
    pub fn new(cfg: YtDlpConfig) -> Self {
        Self {
            cfg,
            running: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn yt_dlp_path(&self) -> &Path {
        &self.cfg.yt_dlp_path
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cfg.yt_dlp_path);
        cmd.args(&self.cfg.global_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }

    fn register(&self, id: i64) -> (RegistrationGuard, broadcast::Receiver<()>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = broadcast::channel(1);
        let stale = lock(&self.running).insert(
            id,
            Registration {
                generation,
                cancel: tx,
            },
        );
        if let Some(stale) = stale {
            log::warn!("Destroying stale process for download {}", id);
            let _ = stale.cancel.send(());
        }
        (
            RegistrationGuard {
                registry: self.running.clone(),
                id,
                generation,
            },
            rx,
        )
    }

    async fn execute(
        &self,
        request: &Request,
        id: i64,
        mut on_progress: ProgressCallback,
    ) -> Result<ProcessOutput, ProcessError> {
        let (_guard, mut cancel_rx) = self.register(id);

        for file in &request.config_files {
            if let Some(parent) = file.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ProcessError::new(
                        ProcessErrorKind::Io,
                        format!("failed to create {}: {e}", parent.display()),
                    )
                })?;
            }
            tokio::fs::write(&file.path, &file.contents)
                .await
                .map_err(|e| {
                    ProcessError::new(
                        ProcessErrorKind::Io,
                        format!("failed to write {}: {e}", file.path.display()),
                    )
                })?;
        }

        let mut cmd = self.command();
        cmd.args(&request.args).arg(&request.target);

        log::debug!("Starting download {} with args: {:?}", id, request.args);

        let mut child = cmd.spawn().map_err(|e| {
            ProcessError::new(
                ProcessErrorKind::ToolMissing,
                format!(
                    "Failed to start yt-dlp ({}): {e}",
                    self.cfg.yt_dlp_path.display()
                ),
            )
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ProcessError::new(ProcessErrorKind::Io, "Failed to capture stdout")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ProcessError::new(ProcessErrorKind::Io, "Failed to capture stderr")
        })?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut output = ProcessOutput::default();
        let mut percent: f64 = 0.0;
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    log::info!("Download {} received cancel signal", id);
                    let _ = child.kill().await;
                    return Err(ProcessError::cancelled());
                }
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(l)) => {
                            handle_line(&l, &mut percent, &mut on_progress);
                            if output.stdout_lines.len() < MAX_STDOUT_LINES {
                                output.stdout_lines.push(l);
                            }
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            log::error!("Error reading stdout: {}", e);
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(l)) => {
                            log::debug!("yt-dlp stderr: {}", l);
                            handle_line(&l, &mut percent, &mut on_progress);
                            if output.stderr_lines.len() < MAX_STDERR_LINES {
                                output.stderr_lines.push(l);
                            }
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            log::error!("Error reading stderr: {}", e);
                            stderr_done = true;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel_rx.recv() => {
                let _ = child.kill().await;
                return Err(ProcessError::cancelled());
            }
            status = child.wait() => status.map_err(|e| {
                ProcessError::new(ProcessErrorKind::Io, format!("Failed to wait for yt-dlp: {e}"))
            })?,
        };
        output.exit_code = status.code();

        if !status.success() {
            let stderr_text = if output.stderr_lines.is_empty() {
                output.stdout_lines.join("\n")
            } else {
                output.stderr_lines.join("\n")
            };
            let (code, message) = classify_error(&stderr_text);
            let mut err = ProcessError::new(ProcessErrorKind::NonZeroExit(code), message);
            err.output = output.lines().map(str::to_string).collect();
            return Err(err);
        }

        Ok(output)
    }

    /// Execute yt-dlp and return each stdout line that parses as a JSON object.
    async fn exec_json_lines(&self, args: &[String]) -> Result<Vec<String>, ProcessError> {
        let mut cmd = self.command();
        cmd.args(args);

        let run = cmd.output();
        let out = match tokio::time::timeout(self.cfg.metadata_timeout, run).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(ProcessError::new(
                    ProcessErrorKind::ToolMissing,
                    format!("failed to spawn yt-dlp: {e}"),
                ))
            }
            Err(_) => {
                return Err(ProcessError::new(
                    ProcessErrorKind::Io,
                    format!("yt-dlp timed out after {:?}", self.cfg.metadata_timeout),
                ))
            }
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let (code, message) = classify_error(&stderr);
            return Err(ProcessError::new(ProcessErrorKind::NonZeroExit(code), message));
        }

        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| looks_like_json_object(l))
            .map(str::to_string)
            .collect())
    }
}

impl ProcessRunner for YtDlpRunner {
    fn run(
        &self,
        request: &Request,
        id: i64,
        on_progress: ProgressCallback,
    ) -> impl Future<Output = Result<ProcessOutput, ProcessError>> + Send {
        self.execute(request, id, on_progress)
    }

    fn cancel(&self, id: i64) -> bool {
        match lock(&self.running).get(&id) {
            Some(reg) => reg.cancel.send(()).is_ok(),
            None => false,
        }
    }

    fn is_running(&self, id: i64) -> bool {
        lock(&self.running).contains_key(&id)
    }

    fn fetch_metadata(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<FetchedMetadata, ProcessError>> + Send {
        let args = vec![
            "--dump-json".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            url.to_string(),
        ];
        async move {
            let lines = self.exec_json_lines(&args).await?;
            lines
                .first()
                .and_then(|l| parse_metadata(l))
                .ok_or_else(|| {
                    ProcessError::new(
                        ProcessErrorKind::Io,
                        "yt-dlp returned no JSON output",
                    )
                })
        }
    }
}

fn handle_line(line: &str, percent: &mut f64, on_progress: &mut ProgressCallback) {
    if line.trim().is_empty() {
        return;
    }
    if let Some(p) = parse_progress(line) {
        if p > *percent {
            *percent = p.min(100.0);
        }
    }
    on_progress(*percent, line);
}

fn progress_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // Our template: [mediaq]  50.5% 1.5MiB/s 00:30 100MiB
            r"\[mediaq\]\s+(\d+\.?\d*)%",
            // Standard: [download]  50.5% of ~100.00MiB at 1.50MiB/s ETA 00:30
            r"\[download\]\s+(\d+\.?\d*)%",
        ]
        .iter()
        .filter_map(|re| Regex::new(re).ok())
        .collect()
    })
}

/// Percent reported by a progress line, if it is one.
pub fn parse_progress(line: &str) -> Option<f64> {
    progress_regexes()
        .iter()
        .find_map(|re| re.captures(line))
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_percent(m.as_str()))
}

fn parse_percent(s: &str) -> Option<f64> {
    let cleaned = s.trim_end_matches('%').trim();
    cleaned.parse::<f64>().ok()
}

/// Classify yt-dlp errors into user-facing categories.
pub fn classify_error(stderr: &str) -> (ErrorCode, String) {
    let stderr_lower = stderr.to_lowercase();

    if stderr_lower.contains("sign in")
        || stderr_lower.contains("login")
        || stderr_lower.contains("cookies")
        || stderr_lower.contains("age-restricted")
    {
        return (
            ErrorCode::LoginRequired,
            "This content requires sign-in. Provide a cookies file and retry.".to_string(),
        );
    }

    if stderr_lower.contains("captcha") || stderr_lower.contains("confirm you're not a bot") {
        return (
            ErrorCode::BotCheck,
            "The site requires verification. Provide cookies from a logged-in browser session."
                .to_string(),
        );
    }

    if stderr_lower.contains("not available in your country")
        || stderr_lower.contains("geo restrict")
        || stderr_lower.contains("geo-restrict")
    {
        return (
            ErrorCode::GeoRestricted,
            "This content is not available in your region.".to_string(),
        );
    }

    if stderr_lower.contains("unsupported url")
        || stderr_lower.contains("no video formats")
        || stderr_lower.contains("extractor")
    {
        return (
            ErrorCode::ExtractorOutdated,
            "The downloader may be outdated for this site.".to_string(),
        );
    }

    if stderr_lower.contains("requested format") || stderr_lower.contains("format not available") {
        return (
            ErrorCode::FormatUnavailable,
            "The requested format is not available for this content.".to_string(),
        );
    }

    if stderr_lower.contains("network")
        || stderr_lower.contains("connection")
        || stderr_lower.contains("timeout")
        || stderr_lower.contains("timed out")
    {
        return (
            ErrorCode::Network,
            "Network error occurred. Check your connection and retry.".to_string(),
        );
    }

    let detail = stderr
        .lines()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("")
        .trim();
    let message = if detail.is_empty() {
        "Download failed with unknown error.".to_string()
    } else if detail.chars().count() > 200 {
        format!("Download failed: {}…", detail.chars().take(200).collect::<String>())
    } else {
        format!("Download failed: {}", detail)
    };

    (ErrorCode::Unknown, message)
}

fn looks_like_json_object(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{') && t.ends_with('}')
}

fn parse_metadata(json_line: &str) -> Option<FetchedMetadata> {
    let v: Value = serde_json::from_str(json_line).ok()?;
    let text = |key: &str| {
        v.get(key)
            .and_then(|x| x.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    Some(FetchedMetadata {
        title: text("title"),
        uploader: text("uploader").or_else(|| text("channel")),
        duration_seconds: v
            .get("duration")
            .and_then(|x| x.as_u64())
            .or_else(|| v.get("duration").and_then(|x| x.as_f64()).map(|f| f as u64)),
        thumbnail_url: text("thumbnail"),
        website: text("extractor_key").or_else(|| text("extractor")),
    })
}

/// Find yt-dlp: bundled sidecar next to the executable, then `PATH`.
pub fn find_ytdlp_binary() -> PathBuf {
    if let Some(path) = find_sidecar("yt-dlp") {
        log::info!("Found bundled yt-dlp sidecar at: {:?}", path);
        return path;
    }
    if let Ok(path) = which::which("yt-dlp") {
        log::info!("Found yt-dlp on PATH: {:?}", path);
        return path;
    }
    log::warn!("Could not find yt-dlp, falling back to bare name");
    PathBuf::from("yt-dlp")
}

pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    if let Some(path) = find_sidecar("ffmpeg") {
        log::info!("Found bundled ffmpeg sidecar at: {:?}", path);
        return Some(path);
    }
    match which::which("ffmpeg") {
        Ok(path) => Some(path),
        Err(_) => {
            log::warn!("Could not find ffmpeg");
            None
        }
    }
}

fn find_sidecar(name: &str) -> Option<PathBuf> {
    let exe_path = std::env::current_exe().ok()?;
    let exe_dir = exe_path.parent()?;
    let file_name = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };

    let sidecar = exe_dir.join(&file_name);
    if sidecar.exists() {
        return Some(sidecar);
    }
    // macOS bundles keep helpers in Contents/Resources.
    let resources = exe_dir.parent()?.join("Resources").join(&file_name);
    resources.exists().then_some(resources)
}

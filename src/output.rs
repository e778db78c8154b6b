//! Finalizing the files a successful download produced.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::ResolveError;
use crate::events::MediaScanner;
use crate::request::ConfigFile;

const SPLIT_CHAPTERS_TAG: &str = "[SplitChapters]";
const DESTINATION_MARKER: &str = "Destination: ";

/// Files a download ended up producing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedOutput {
    Files(Vec<PathBuf>),
    /// The download succeeded but no media file could be located.
    NotFound,
}

impl ResolvedOutput {
    fn from_paths(paths: Vec<PathBuf>) -> Self {
        if paths.is_empty() {
            ResolvedOutput::NotFound
        } else {
            ResolvedOutput::Files(paths)
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        match self {
            ResolvedOutput::Files(paths) => paths,
            ResolvedOutput::NotFound => &[],
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ResolvedOutput::Files(_))
    }
}

/// Empty the staging directory of an item, creating it if needed.
pub async fn prepare_staging_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

pub async fn remove_staging_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove staging dir {}: {}", dir.display(), e),
    }
}

/// Whether a download can be written straight into `dir`.
pub fn is_writable_dir(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

/// Delete transient config files. Missing files are fine.
pub async fn cleanup_config_files(files: &[ConfigFile]) {
    for file in files {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to delete config {}: {}", file.path.display(), e),
        }
    }
}

/// Cache mode: relocate everything under `staging_dir` into `destination`.
///
/// Any relocation failure yields [`ResolvedOutput::NotFound`].
pub async fn resolve_cached(
    staging_dir: &Path,
    destination: &Path,
    keep_cache: bool,
    non_media_extensions: &[String],
    scanner: &dyn MediaScanner,
) -> ResolvedOutput {
    let staging = staging_dir.to_path_buf();
    let dest = destination.to_path_buf();
    let moved = tokio::task::spawn_blocking(move || relocate_staged_files(&staging, &dest, keep_cache))
        .await
        .map_err(ResolveError::from)
        .and_then(|r| r);

    let moved = match moved {
        Ok(moved) => moved,
        Err(e) => {
            log::error!("Failed to relocate downloaded files: {}", e);
            if !keep_cache {
                remove_staging_dir(staging_dir).await;
            }
            return ResolvedOutput::NotFound;
        }
    };

    if !keep_cache {
        remove_staging_dir(staging_dir).await;
    }

    let media = strip_side_artifacts(moved, non_media_extensions);
    if !media.is_empty() {
        scanner.scan(&media);
    }
    ResolvedOutput::from_paths(media)
}

/// No-cache mode: collect the paths yt-dlp reported, newest last.
pub fn resolve_uncached<'a>(
    output_lines: impl IntoIterator<Item = &'a str>,
    non_media_extensions: &[String],
    scanner: &dyn MediaScanner,
) -> ResolvedOutput {
    let mut paths: Vec<PathBuf> = Vec::new();
    for path in output_lines.into_iter().filter_map(reported_path) {
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    let mut existing: Vec<(PathBuf, std::time::SystemTime)> = paths
        .into_iter()
        .filter_map(|p| {
            let meta = fs::metadata(&p).ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            Some((p, modified))
        })
        .collect();
    existing.sort_by_key(|(_, modified)| *modified);

    let media = strip_side_artifacts(
        existing.into_iter().map(|(p, _)| p).collect(),
        non_media_extensions,
    );
    if !media.is_empty() {
        scanner.scan(&media);
    }
    ResolvedOutput::from_paths(media)
}

/// A produced path announced on one output line, if any.
fn reported_path(line: &str) -> Option<PathBuf> {
    let line = line.trim();
    if line.starts_with(SPLIT_CHAPTERS_TAG) {
        let (_, rest) = line.split_once(DESTINATION_MARKER)?;
        let rest = rest.trim();
        return (!rest.is_empty()).then(|| PathBuf::from(rest));
    }

    let inner = line.strip_prefix('\'')?.strip_suffix('\'')?;
    let path = PathBuf::from(inner);
    path.is_absolute().then_some(path)
}

/// Drop thumbnails, subtitles and other sidecars from a list of produced files.
pub fn strip_side_artifacts(paths: Vec<PathBuf>, non_media_extensions: &[String]) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|p| {
            let ext = p
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();
            !non_media_extensions.iter().any(|n| n.eq_ignore_ascii_case(&ext))
        })
        .collect()
}

fn relocate_staged_files(
    staging_dir: &Path,
    destination: &Path,
    keep_cache: bool,
) -> Result<Vec<PathBuf>, ResolveError> {
    if !staging_dir.exists() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(destination)?;

    let mut finals = Vec::new();
    for entry in WalkDir::new(staging_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let src = entry.path();
        let rel = src.strip_prefix(staging_dir).unwrap_or(src);
        let wanted = destination.join(rel);
        if let Some(parent) = wanted.parent() {
            fs::create_dir_all(parent)?;
        }
        let target = unique_destination(&wanted);

        let result = if keep_cache {
            fs::copy(src, &target).map(|_| ())
        } else {
            move_file(src, &target)
        };
        result.map_err(|source| ResolveError::Move {
            from: src.to_path_buf(),
            to: target.clone(),
            source,
        })?;
        finals.push(target);
    }
    Ok(finals)
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

/// `name.ext`, or `name (n).ext` for the first free `n`.
fn unique_destination(wanted: &Path) -> PathBuf {
    if !wanted.exists() {
        return wanted.to_path_buf();
    }
    let dir = wanted.parent().unwrap_or_else(|| Path::new(""));
    let file_name = wanted
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() && !e.is_empty() => (s.to_string(), Some(e.to_string())),
        _ => (file_name.clone(), None),
    };

    let mut n = 1usize;
    loop {
        let candidate = match &ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        };
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Stable failure categories for a finished-with-error download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    Network,
    GeoRestricted,
    LoginRequired,
    BotCheck,
    ExtractorOutdated,
    FormatUnavailable,
}

/// Rejected before any process is started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("download has no url")]
    EmptyUrl,

    #[error("no format selected for {kind} download")]
    MissingFormat { kind: &'static str },

    #[error("command template is empty")]
    EmptyCommandTemplate,

    #[error("unknown sponsorblock category: {0}")]
    UnknownSponsorBlockCategory(String),

    #[error("subtitles requested but no subtitle language selected")]
    MissingSubtitleLanguages,

    #[error("unbalanced quote in extra commands")]
    UnbalancedQuote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessErrorKind {
    /// The binary could not be spawned.
    ToolMissing,
    /// Reading output, writing config files or waiting failed.
    Io,
    /// The tool exited unsuccessfully.
    NonZeroExit(ErrorCode),
    /// Terminated on request; not a failure.
    Cancelled,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    /// User-facing message.
    pub message: String,
    /// Captured output up to the failure, for the log entry.
    pub output: Vec<String>,
}

impl ProcessError {
    pub fn new(kind: ProcessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ProcessErrorKind::Cancelled, "download cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ProcessErrorKind::Cancelled
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file relocation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Everything that can end a worker task unsuccessfully.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Process(e) if e.is_cancelled())
    }
}

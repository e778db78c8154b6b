//! In-process [`ProcessRunner`] used by the worker and scheduler tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{ErrorCode, ProcessError, ProcessErrorKind};
use crate::events::{EngineEvent, EventSink};
use crate::models::FetchedMetadata;
use crate::request::Request;
use crate::ytdlp::{ProcessOutput, ProcessRunner, ProgressCallback};

#[derive(Debug, Clone)]
pub enum Script {
    /// Create `files` (relative to the output dir unless absolute), print
    /// `lines`, exit 0.
    Succeed { files: Vec<String>, lines: Vec<String> },
    /// Exit non-zero with `message`.
    Fail { message: String },
    /// Block until [`FakeRunner::release`] or cancel, then behave like `Succeed`.
    Hold { files: Vec<String> },
}

impl Script {
    pub fn succeed(files: &[&str]) -> Self {
        Script::Succeed {
            files: files.iter().map(|f| f.to_string()).collect(),
            lines: Vec::new(),
        }
    }

    pub fn hold(files: &[&str]) -> Self {
        Script::Hold {
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn fail(message: &str) -> Self {
        Script::Fail {
            message: message.to_string(),
        }
    }
}

pub struct FakeRunner {
    default_script: Script,
    scripts: Mutex<HashMap<String, Script>>,
    cancels: Mutex<HashMap<i64, Arc<Notify>>>,
    gates: Mutex<HashMap<i64, Arc<Notify>>>,
    started: Mutex<Vec<i64>>,
    requests: Mutex<Vec<Request>>,
    metadata: Mutex<Option<FetchedMetadata>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl FakeRunner {
    pub fn new(default_script: Script) -> Self {
        Self {
            default_script,
            scripts: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            metadata: Mutex::new(None),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Script used for one URL instead of the default.
    pub fn script(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    pub fn set_metadata(&self, meta: FetchedMetadata) {
        *self.metadata.lock().unwrap() = Some(meta);
    }

    /// Let a held run of `id` finish. Works before the run starts too.
    pub fn release(&self, id: i64) {
        self.gate(id).notify_one();
    }

    pub fn started(&self) -> Vec<i64> {
        self.started.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.concurrent.load(Ordering::SeqCst)
    }

    fn gate(&self, id: i64) -> Arc<Notify> {
        self.gates
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn script_for(&self, url: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

/// Undoes the bookkeeping of one run, including when the run future is dropped.
struct RunGuard<'a> {
    runner: &'a FakeRunner,
    id: i64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.runner.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.runner.cancels.lock().unwrap().remove(&self.id);
    }
}

fn write_files(output_dir: &Path, files: &[String]) -> Result<(), ProcessError> {
    for file in files {
        let path = if Path::new(file).is_absolute() {
            PathBuf::from(file)
        } else {
            output_dir.join(file)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProcessError::new(ProcessErrorKind::Io, e.to_string()))?;
        }
        std::fs::write(&path, b"media")
            .map_err(|e| ProcessError::new(ProcessErrorKind::Io, e.to_string()))?;
    }
    Ok(())
}

impl ProcessRunner for FakeRunner {
    fn run(
        &self,
        request: &Request,
        id: i64,
        mut on_progress: ProgressCallback,
    ) -> impl Future<Output = Result<ProcessOutput, ProcessError>> + Send {
        let request = request.clone();
        async move {
            let script = self.script_for(&request.target);
            let cancel = Arc::new(Notify::new());
            self.cancels.lock().unwrap().insert(id, cancel.clone());
            self.started.lock().unwrap().push(id);
            self.requests.lock().unwrap().push(request.clone());
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let _guard = RunGuard { runner: self, id };

            on_progress(10.0, "[download]  10.0% of 1.00MiB");

            let (files, lines) = match script {
                Script::Succeed { files, lines } => (files, lines),
                Script::Fail { message } => {
                    let mut err = ProcessError::new(
                        ProcessErrorKind::NonZeroExit(ErrorCode::Unknown),
                        message.clone(),
                    );
                    err.output = vec![format!("ERROR: {}", message)];
                    return Err(err);
                }
                Script::Hold { files } => {
                    let gate = self.gate(id);
                    tokio::select! {
                        _ = gate.notified() => (files, Vec::new()),
                        _ = cancel.notified() => return Err(ProcessError::cancelled()),
                    }
                }
            };

            write_files(&request.output_dir, &files)?;
            for line in &lines {
                on_progress(100.0, line);
            }
            Ok(ProcessOutput {
                stdout_lines: lines,
                stderr_lines: Vec::new(),
                exit_code: Some(0),
            })
        }
    }

    fn cancel(&self, id: i64) -> bool {
        match self.cancels.lock().unwrap().get(&id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    fn is_running(&self, id: i64) -> bool {
        self.cancels.lock().unwrap().contains_key(&id)
    }

    fn fetch_metadata(
        &self,
        _url: &str,
    ) -> impl Future<Output = Result<FetchedMetadata, ProcessError>> + Send {
        let meta = self.metadata.lock().unwrap().clone();
        async move {
            meta.ok_or_else(|| ProcessError::new(ProcessErrorKind::Io, "no metadata"))
        }
    }
}

/// Records every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events other than progress.
    pub fn milestones(&self) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, EngineEvent::DownloadProgress { .. }))
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

//! Queue scheduler.
//!
//! The scheduler owns every worker task of one engine. It is level-triggered:
//! each pass re-reads the queue and the settings, starts what fits in the free
//! slots, then sleeps until the store changes, a worker ends, the next
//! scheduled start arrives or shutdown is requested.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::events::EngineEvent;
use crate::models::{DownloadItem, DownloadStatus};
use crate::settings::{OrphanPolicy, SettingsProvider, UserSettings};
use crate::store::DownloadStore;
use crate::worker::{self, WorkerContext, WorkerOutcome};
use crate::ytdlp::ProcessRunner;

const INTERRUPTED_MESSAGE: &str = "Download was interrupted";

/// Why [`Scheduler::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerExit {
    /// Nothing due and nothing running. `next_due` is the earliest future
    /// start time, if any item has one.
    Idle { next_due: Option<DateTime<Utc>> },
    /// Only unscheduled items are waiting and the daily window is closed.
    OutsideWindow,
    /// Shutdown was requested; interrupted items are back in the queue.
    Shutdown,
}

type LiveTasks = Arc<Mutex<HashMap<i64, CancellationToken>>>;

type TaskResult = (i64, Result<Result<WorkerOutcome, TaskError>, JoinError>);

fn lock(live: &LiveTasks) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
    live.lock().unwrap_or_else(|e| e.into_inner())
}

/// Aborts the worker when its supervising task goes away.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Wake {
    Changed,
    Timer,
    Joined(Result<TaskResult, JoinError>),
    Shutdown,
}

pub struct Scheduler<R: ProcessRunner> {
    ctx: Arc<WorkerContext<R>>,
    settings: Box<dyn SettingsProvider>,
    live: LiveTasks,
    tasks: JoinSet<TaskResult>,
    shutdown: CancellationToken,
}

impl<R: ProcessRunner> Scheduler<R> {
    pub fn new(ctx: WorkerContext<R>, settings: impl SettingsProvider) -> Self {
        Self {
            ctx: Arc::new(ctx),
            settings: Box::new(settings),
            live: Arc::new(Mutex::new(HashMap::new())),
            tasks: JoinSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle<R> {
        SchedulerHandle {
            store: self.ctx.store.clone(),
            runner: self.ctx.runner.clone(),
            live: self.live.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn store(&self) -> &DownloadStore {
        &self.ctx.store
    }

    /// Drive the queue until it is idle, the window closes or shutdown.
    ///
    /// Can be called again after it returns. A store error ends the run;
    /// workers still running are aborted when the scheduler is dropped.
    pub async fn run(&mut self) -> Result<SchedulerExit> {
        let mut changes = self.ctx.store.subscribe();
        let mut settings_changes = self.ctx.store.settings_watch();
        loop {
            changes.borrow_and_update();
            settings_changes.borrow_and_update();
            if self.shutdown.is_cancelled() {
                return self.drain().await;
            }

            let settings = self.settings.current();
            if let Some(exit) = self.pass(&settings).await? {
                log::debug!("Scheduler exiting: {:?}", exit);
                return Ok(exit);
            }

            let now = Utc::now();
            let next_due = self.ctx.store.next_scheduled_start(now).await?;
            let sleep_for = next_due.map(|t| (t - now).to_std().unwrap_or(Duration::ZERO));

            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                changed = changes.changed() => match changed {
                    Ok(()) => Wake::Changed,
                    Err(_) => Wake::Shutdown,
                },
                Ok(()) = settings_changes.changed() => Wake::Changed,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => Wake::Joined(joined),
                _ = tokio::time::sleep(sleep_for.unwrap_or_default()), if sleep_for.is_some() => Wake::Timer,
            };

            match wake {
                Wake::Joined(joined) => self.on_task_done(joined).await?,
                Wake::Shutdown => self.shutdown.cancel(),
                Wake::Changed | Wake::Timer => {}
            }
        }
    }

    /// One scheduling pass. `Some` means the loop should exit.
    async fn pass(&mut self, settings: &UserSettings) -> Result<Option<SchedulerExit>> {
        let store = &self.ctx.store;
        let now = Utc::now();

        let mut running: HashSet<i64> = lock(&self.live).keys().copied().collect();
        for orphan in store.active_downloads().await? {
            if running.contains(&orphan.id) {
                continue;
            }
            match settings.queue.orphan_policy {
                OrphanPolicy::Requeue => {
                    if store
                        .transition_status(orphan.id, DownloadStatus::Active, DownloadStatus::Queued)
                        .await?
                    {
                        log::warn!("Re-queued interrupted download {}", orphan.id);
                    }
                }
                OrphanPolicy::MarkError => {
                    store.mark_error(orphan.id, INTERRUPTED_MESSAGE, None).await?;
                    log::warn!("Marked interrupted download {} as failed", orphan.id);
                }
                OrphanPolicy::Keep => {
                    running.insert(orphan.id);
                }
            }
        }

        let due = store.queued_due_by(now).await?;

        if due.is_empty() && running.is_empty() {
            let next_due = store.next_scheduled_start(now).await?;
            return Ok(Some(SchedulerExit::Idle { next_due }));
        }

        if settings.queue.use_scheduler
            && running.is_empty()
            && !due.iter().any(DownloadItem::has_explicit_start_time)
            && !settings.queue.is_within_window(Local::now().time())
        {
            return Ok(Some(SchedulerExit::OutsideWindow));
        }

        let concurrency = settings.general.concurrency.max(1) as usize;
        let free = concurrency.saturating_sub(running.len());
        let selected: Vec<DownloadItem> = due
            .into_iter()
            .filter(|item| !running.contains(&item.id))
            .take(free)
            .collect();
        if selected.is_empty() {
            return Ok(None);
        }

        let ids: Vec<i64> = selected.iter().map(|item| item.id).collect();
        let claimed: HashSet<i64> = store.activate_queued(&ids).await?.into_iter().collect();
        for mut item in selected {
            if !claimed.contains(&item.id) {
                continue;
            }
            item.status = DownloadStatus::Active;
            item.error_message = None;
            self.spawn(item, settings.clone());
        }
        Ok(None)
    }

    fn spawn(&mut self, item: DownloadItem, settings: UserSettings) {
        let id = item.id;
        let token = self.shutdown.child_token();
        lock(&self.live).insert(id, token.clone());

        let ctx = self.ctx.clone();
        self.tasks.spawn(async move {
            let worker = tokio::spawn(worker::run_download(ctx, item, settings, token));
            let _abort = AbortOnDrop(worker.abort_handle());
            (id, worker.await)
        });
        log::debug!("Dispatched download {}", id);
    }

    async fn on_task_done(&mut self, joined: Result<TaskResult, JoinError>) -> Result<()> {
        let (id, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                log::error!("Worker supervisor failed: {}", e);
                return Ok(());
            }
        };
        lock(&self.live).remove(&id);

        match result {
            Ok(Ok(outcome)) => log::debug!("Download {} ended: {:?}", id, outcome),
            Ok(Err(e)) => {
                log::error!("Download {} could not be recorded: {}", id, e);
                self.fail_if_active(id, &e.to_string()).await?;
            }
            Err(e) if e.is_panic() => {
                log::error!("Download {} worker panicked", id);
                self.fail_if_active(id, "download task panicked").await?;
            }
            Err(_) => {}
        }
        Ok(())
    }

    async fn fail_if_active(&self, id: i64, message: &str) -> Result<()> {
        let store = &self.ctx.store;
        let Some(item) = store.get(id).await? else {
            return Ok(());
        };
        if item.status != DownloadStatus::Active {
            return Ok(());
        }
        store.mark_error(id, message, None).await?;
        self.ctx.events.emit(EngineEvent::DownloadFailed {
            id,
            title: item.display_title().to_string(),
            message: message.to_string(),
            log_id: item.log_id,
        });
        Ok(())
    }

    /// Cancel every worker, wait for them, and put their items back in the queue.
    async fn drain(&mut self) -> Result<SchedulerExit> {
        let ids: Vec<i64> = lock(&self.live).keys().copied().collect();
        for &id in &ids {
            self.ctx.runner.cancel(id);
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.on_task_done(joined).await?;
        }
        let mut requeued = 0;
        for id in ids {
            if self
                .ctx
                .store
                .transition_status(id, DownloadStatus::Active, DownloadStatus::Queued)
                .await?
            {
                requeued += 1;
            }
        }
        log::info!("Scheduler stopped; {} download(s) returned to the queue", requeued);
        Ok(SchedulerExit::Shutdown)
    }
}

/// Control surface for a running [`Scheduler`].
pub struct SchedulerHandle<R: ProcessRunner> {
    store: DownloadStore,
    runner: Arc<R>,
    live: LiveTasks,
    shutdown: CancellationToken,
}

impl<R: ProcessRunner> Clone for SchedulerHandle<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            runner: self.runner.clone(),
            live: self.live.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<R: ProcessRunner> SchedulerHandle<R> {
    /// Terminate a running item and return it to the queue.
    ///
    /// The status is written before the process is killed, so the scheduler
    /// never sees the item as an orphan in between.
    pub async fn stop(&self, id: i64) -> Result<bool> {
        let stopped = self
            .store
            .transition_status(id, DownloadStatus::Active, DownloadStatus::Queued)
            .await?;
        self.terminate(id);
        Ok(stopped)
    }

    /// Terminate a running item, or withdraw a queued one, as Cancelled.
    pub async fn cancel(&self, id: i64) -> Result<bool> {
        let mut cancelled = self
            .store
            .transition_status(id, DownloadStatus::Active, DownloadStatus::Cancelled)
            .await?;
        if !cancelled {
            cancelled = self
                .store
                .transition_status(id, DownloadStatus::Queued, DownloadStatus::Cancelled)
                .await?;
        }
        self.terminate(id);
        Ok(cancelled)
    }

    pub fn is_running(&self, id: i64) -> bool {
        lock(&self.live).contains_key(&id)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn terminate(&self, id: i64) {
        if let Some(token) = lock(&self.live).get(&id) {
            token.cancel();
        }
        self.runner.cancel(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MediaScanner, NoopScanner};
    use crate::models::Format;
    use crate::request::RequestPaths;
    use crate::testing::{wait_until, FakeRunner, RecordingSink, Script};
    use chrono::NaiveTime;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        store: DownloadStore,
        runner: Arc<FakeRunner>,
        sink: Arc<RecordingSink>,
        dest: PathBuf,
        tmp: TempDir,
    }

    fn harness(script: Script) -> Harness {
        let tmp = TempDir::new().unwrap();
        Harness {
            store: DownloadStore::open_in_memory().unwrap(),
            runner: Arc::new(FakeRunner::new(script)),
            sink: Arc::new(RecordingSink::default()),
            dest: tmp.path().join("media"),
            tmp,
        }
    }

    impl Harness {
        fn scheduler(&self, settings: impl SettingsProvider) -> Scheduler<FakeRunner> {
            self.scheduler_scanning(settings, Arc::new(NoopScanner))
        }

        fn scheduler_scanning(
            &self,
            settings: impl SettingsProvider,
            scanner: Arc<dyn MediaScanner>,
        ) -> Scheduler<FakeRunner> {
            let paths = RequestPaths::new(
                &self.tmp.path().join("cache"),
                &self.tmp.path().join("data"),
                None,
            );
            let ctx = WorkerContext::new(
                self.store.clone(),
                self.runner.clone(),
                self.sink.clone(),
                paths,
            )
            .with_scanner(scanner)
            .with_metadata_refresh_delay(Duration::from_secs(3600));
            Scheduler::new(ctx, settings)
        }

        fn count_events(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
            self.sink.milestones().iter().filter(|e| pred(e)).count()
        }

        async fn queue(&self, url: &str) -> i64 {
            let mut item = DownloadItem::new_video(url, Format::new("22", "mp4"), self.dest.clone());
            item.title = url.rsplit('/').next().unwrap_or_default().to_string();
            self.store.insert(&item).await.unwrap()
        }

        async fn status(&self, id: i64) -> Option<DownloadStatus> {
            self.store.get(id).await.unwrap().map(|item| item.status)
        }
    }

    fn concurrency(n: u32) -> UserSettings {
        let mut settings = UserSettings::default();
        settings.general.concurrency = n;
        settings
    }

    #[tokio::test]
    async fn runs_queue_in_order_and_goes_idle() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        let b = h.queue("https://example.com/b").await;
        let c = h.queue("https://example.com/c").await;

        let exit = h.scheduler(concurrency(1)).run().await.unwrap();

        assert_eq!(exit, SchedulerExit::Idle { next_due: None });
        assert_eq!(h.runner.started(), vec![a, b, c]);
        assert_eq!(h.runner.max_concurrent(), 1);
        assert!(h.store.list_downloads().await.unwrap().is_empty());
        assert_eq!(h.store.history(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn second_item_waits_while_first_holds_the_only_slot() {
        let h = harness(Script::hold(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        let b = h.queue("https://example.com/b").await;

        let mut scheduler = h.scheduler(concurrency(1));
        let run = tokio::spawn(async move { scheduler.run().await });
        let runner = h.runner.clone();
        wait_until(|| runner.started().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.runner.started(), vec![a]);
        assert_eq!(h.status(a).await, Some(DownloadStatus::Active));
        assert_eq!(h.status(b).await, Some(DownloadStatus::Queued));

        h.runner.release(a);
        wait_until(|| runner.started().len() == 2).await;
        h.runner.release(b);

        assert_eq!(
            run.await.unwrap().unwrap(),
            SchedulerExit::Idle { next_due: None }
        );
        assert_eq!(h.runner.started(), vec![a, b]);
        assert_eq!(h.runner.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn raised_concurrency_applies_without_queue_changes() {
        let h = harness(Script::hold(&["out.mp4"]));
        h.store.save_settings(&concurrency(1)).await.unwrap();
        let a = h.queue("https://example.com/a").await;
        let b = h.queue("https://example.com/b").await;

        let mut scheduler = h.scheduler(h.store.settings_watch());
        let run = tokio::spawn(async move { scheduler.run().await });
        let runner = h.runner.clone();
        wait_until(|| runner.started().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.runner.started(), vec![a]);

        h.store.save_settings(&concurrency(2)).await.unwrap();
        wait_until(|| runner.started().len() == 2).await;
        assert_eq!(h.runner.started(), vec![a, b]);

        h.runner.release(a);
        h.runner.release(b);
        assert_eq!(
            run.await.unwrap().unwrap(),
            SchedulerExit::Idle { next_due: None }
        );
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let h = harness(Script::hold(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        let b = h.queue("https://example.com/b").await;
        let c = h.queue("https://example.com/c").await;

        let mut scheduler = h.scheduler(concurrency(2));
        let run = tokio::spawn(async move { scheduler.run().await });

        let runner = h.runner.clone();
        wait_until(|| runner.started().len() == 2).await;
        assert_eq!(h.runner.started(), vec![a, b]);
        assert_eq!(h.status(c).await, Some(DownloadStatus::Queued));

        h.runner.release(a);
        wait_until(|| runner.started().len() == 3).await;
        h.runner.release(b);
        h.runner.release(c);

        let exit = run.await.unwrap().unwrap();
        assert_eq!(exit, SchedulerExit::Idle { next_due: None });
        assert_eq!(h.runner.max_concurrent(), 2);
    }

    #[tokio::test]
    async fn new_items_wake_a_waiting_scheduler() {
        let h = harness(Script::hold(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;

        let mut scheduler = h.scheduler(concurrency(2));
        let run = tokio::spawn(async move { scheduler.run().await });
        let runner = h.runner.clone();
        wait_until(|| runner.started().len() == 1).await;

        let b = h.queue("https://example.com/b").await;
        wait_until(|| runner.started().len() == 2).await;

        h.runner.release(a);
        h.runner.release(b);
        assert_eq!(
            run.await.unwrap().unwrap(),
            SchedulerExit::Idle { next_due: None }
        );
    }

    #[tokio::test]
    async fn future_start_time_is_reported_as_next_due() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let now = h.queue("https://example.com/now").await;
        let start = Utc::now() + chrono::Duration::hours(1);
        let mut later = DownloadItem::new_video(
            "https://example.com/later",
            Format::new("22", "mp4"),
            h.dest.clone(),
        );
        later.download_start_time = Some(start);
        let later = h.store.insert(&later).await.unwrap();

        let exit = h.scheduler(concurrency(1)).run().await.unwrap();

        match exit {
            SchedulerExit::Idle { next_due: Some(t) } => {
                assert_eq!(t.timestamp_millis(), start.timestamp_millis())
            }
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(h.runner.started(), vec![now]);
        assert_eq!(h.status(later).await, Some(DownloadStatus::Queued));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_queue_moves_on() {
        let h = harness(Script::succeed(&["out.mp4"]));
        h.runner.script("https://example.com/bad", Script::fail("HTTP Error 404"));
        let bad = h.queue("https://example.com/bad").await;
        let good = h.queue("https://example.com/good").await;

        h.scheduler(concurrency(1)).run().await.unwrap();

        let failed = h.store.get(bad).await.unwrap().unwrap();
        assert_eq!(failed.status, DownloadStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("HTTP Error 404"));
        assert_eq!(
            h.count_events(|e| matches!(e, EngineEvent::DownloadFailed { id, .. } if *id == bad)),
            1
        );
        assert_eq!(
            h.count_events(|e| matches!(e, EngineEvent::DownloadFailed { .. })),
            1
        );
        assert!(h.store.get(good).await.unwrap().is_none());
        assert_eq!(h.store.history_for_download(good).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_leaves_no_history_and_no_error() {
        let h = harness(Script::hold(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;

        let mut scheduler = h.scheduler(concurrency(1));
        let handle = scheduler.handle();
        let run = tokio::spawn(async move { scheduler.run().await });
        let runner = h.runner.clone();
        wait_until(|| runner.started().len() == 1).await;

        assert!(handle.cancel(a).await.unwrap());

        assert_eq!(
            run.await.unwrap().unwrap(),
            SchedulerExit::Idle { next_due: None }
        );
        let item = h.store.get(a).await.unwrap().unwrap();
        assert_eq!(item.status, DownloadStatus::Cancelled);
        assert_eq!(item.error_message, None);
        assert!(h.store.history(10).await.unwrap().is_empty());
        assert!(!h
            .sink
            .milestones()
            .iter()
            .any(|e| matches!(e, EngineEvent::DownloadFailed { .. })));
    }

    /// Blocks inside `scan` until released, holding a worker in output resolution.
    #[derive(Default)]
    struct GateScanner {
        entered: std::sync::atomic::AtomicBool,
        open: Mutex<bool>,
        released: std::sync::Condvar,
    }

    impl GateScanner {
        fn entered(&self) -> bool {
            self.entered.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.released.notify_all();
        }
    }

    impl MediaScanner for GateScanner {
        fn scan(&self, _paths: &[PathBuf]) {
            self.entered.store(true, std::sync::atomic::Ordering::SeqCst);
            let open = self.open.lock().unwrap();
            let _ = self
                .released
                .wait_timeout_while(open, Duration::from_secs(5), |open| !*open)
                .unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_while_finishing_records_no_history() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        let scanner = Arc::new(GateScanner::default());

        let mut scheduler = h.scheduler_scanning(concurrency(1), scanner.clone());
        let handle = scheduler.handle();
        let run = tokio::spawn(async move { scheduler.run().await });
        let gate = scanner.clone();
        wait_until(|| gate.entered()).await;

        assert!(handle.cancel(a).await.unwrap());
        assert_eq!(h.status(a).await, Some(DownloadStatus::Cancelled));
        scanner.release();

        assert_eq!(
            run.await.unwrap().unwrap(),
            SchedulerExit::Idle { next_due: None }
        );
        assert_eq!(h.status(a).await, Some(DownloadStatus::Cancelled));
        assert!(h.store.history(10).await.unwrap().is_empty());
        assert_eq!(
            h.count_events(|e| matches!(e, EngineEvent::DownloadFinished { .. })),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_while_finishing_requeues_the_item() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        let scanner = Arc::new(GateScanner::default());

        let mut scheduler = h.scheduler_scanning(concurrency(1), scanner.clone());
        let handle = scheduler.handle();
        let run = tokio::spawn(async move { scheduler.run().await });
        let gate = scanner.clone();
        wait_until(|| gate.entered()).await;

        assert!(handle.stop(a).await.unwrap());
        scanner.release();

        run.await.unwrap().unwrap();
        // The interrupted run wrote nothing; the rerun recorded one entry.
        assert_eq!(h.runner.started(), vec![a, a]);
        assert_eq!(h.store.history_for_download(a).await.unwrap().len(), 1);
        assert_eq!(
            h.count_events(|e| matches!(e, EngineEvent::DownloadFinished { .. })),
            1
        );
    }

    #[tokio::test]
    async fn cancel_withdraws_a_queued_item() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        let handle = h.scheduler(concurrency(1)).handle();

        assert!(handle.cancel(a).await.unwrap());
        assert_eq!(h.status(a).await, Some(DownloadStatus::Cancelled));
        assert!(!handle.is_running(a));
    }

    #[tokio::test]
    async fn stopped_item_goes_back_to_the_queue() {
        let h = harness(Script::hold(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;

        let mut scheduler = h.scheduler(concurrency(1));
        let handle = scheduler.handle();
        let run = tokio::spawn(async move { scheduler.run().await });
        let runner = h.runner.clone();
        wait_until(|| runner.started().len() == 1).await;

        assert!(handle.stop(a).await.unwrap());
        wait_until(|| runner.started().len() == 2).await;
        h.runner.release(a);

        run.await.unwrap().unwrap();
        assert_eq!(h.runner.started(), vec![a, a]);
        assert_eq!(h.store.history_for_download(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn orphans_are_requeued_and_run() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        h.store.set_status(a, DownloadStatus::Active).await.unwrap();

        h.scheduler(concurrency(1)).run().await.unwrap();

        assert_eq!(h.runner.started(), vec![a]);
        assert!(h.store.get(a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphans_can_be_marked_failed() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        h.store.set_status(a, DownloadStatus::Active).await.unwrap();
        let mut settings = concurrency(1);
        settings.queue.orphan_policy = OrphanPolicy::MarkError;

        let exit = h.scheduler(settings).run().await.unwrap();

        assert_eq!(exit, SchedulerExit::Idle { next_due: None });
        assert!(h.runner.started().is_empty());
        let item = h.store.get(a).await.unwrap().unwrap();
        assert_eq!(item.status, DownloadStatus::Error);
        assert_eq!(item.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    }

    fn closed_window() -> UserSettings {
        let now = Local::now().time();
        let mut settings = concurrency(1);
        settings.queue.use_scheduler = true;
        settings.queue.schedule_start = now + chrono::Duration::hours(2);
        settings.queue.schedule_end = now + chrono::Duration::hours(3);
        settings
    }

    #[tokio::test]
    async fn closed_window_holds_unscheduled_items() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;

        let exit = h.scheduler(closed_window()).run().await.unwrap();

        assert_eq!(exit, SchedulerExit::OutsideWindow);
        assert!(h.runner.started().is_empty());
        assert_eq!(h.status(a).await, Some(DownloadStatus::Queued));
    }

    #[tokio::test]
    async fn explicit_start_time_overrides_the_window() {
        let h = harness(Script::succeed(&["out.mp4"]));
        let mut item = DownloadItem::new_video(
            "https://example.com/a",
            Format::new("22", "mp4"),
            h.dest.clone(),
        );
        item.download_start_time = Some(Utc::now() - chrono::Duration::minutes(1));
        let a = h.store.insert(&item).await.unwrap();

        let exit = h.scheduler(closed_window()).run().await.unwrap();

        assert_eq!(exit, SchedulerExit::Idle { next_due: None });
        assert_eq!(h.runner.started(), vec![a]);
    }

    #[tokio::test]
    async fn all_day_window_when_bounds_are_equal() {
        let h = harness(Script::succeed(&["out.mp4"]));
        h.queue("https://example.com/a").await;
        let mut settings = concurrency(1);
        settings.queue.use_scheduler = true;
        settings.queue.schedule_start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        settings.queue.schedule_end = settings.queue.schedule_start;

        let exit = h.scheduler(settings).run().await.unwrap();

        assert_eq!(exit, SchedulerExit::Idle { next_due: None });
        assert_eq!(h.runner.started().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_returns_running_items_to_queue() {
        let h = harness(Script::hold(&["out.mp4"]));
        let a = h.queue("https://example.com/a").await;
        let b = h.queue("https://example.com/b").await;

        let mut scheduler = h.scheduler(concurrency(2));
        let handle = scheduler.handle();
        let run = tokio::spawn(async move { scheduler.run().await });
        let runner = h.runner.clone();
        wait_until(|| runner.started().len() == 2).await;

        handle.shutdown();

        assert_eq!(run.await.unwrap().unwrap(), SchedulerExit::Shutdown);
        assert_eq!(h.runner.running_count(), 0);
        assert_eq!(h.status(a).await, Some(DownloadStatus::Queued));
        assert_eq!(h.status(b).await, Some(DownloadStatus::Queued));
        assert!(h.store.history(10).await.unwrap().is_empty());
    }
}

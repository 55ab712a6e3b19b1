//! Asynchronous task engine.
//!
//! A fixed-size pool of workers consumes one FIFO queue; tasks run
//! concurrently up to the pool size and sequentially within a task.
//! Enqueueing reserves the app's per-kind task slot through the catalog's
//! compare-and-set, so "at most one non-terminal task per kind per app"
//! holds across processes. Each task carries a `CancellationToken`
//! observed at every I/O boundary; transient failures retry with
//! exponential backoff, terminal failures park the app in `error`, and a
//! cancellation restores the app to its pre-task status. Typed events fan
//! out over a broadcast channel for live observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::DbHandle;
use crate::catalog::models::{AppStatus, TaskKind, TaskRecord, TaskState};
use crate::errors::{PipelineError, TaskError};
use crate::util::{LOG_TAIL_LIMIT, truncate_log_tail};

/// Caller-supplied options for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    /// Build without chaining into deploy.
    #[serde(default)]
    pub build_only: bool,
}

/// Typed event stream for live observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task_id: String,
        kind: TaskKind,
        app_id: i64,
    },
    Progress {
        task_id: String,
        current: u32,
        total: u32,
        message: String,
    },
    Finished {
        task_id: String,
        kind: TaskKind,
        app_id: i64,
        state: TaskState,
    },
}

/// Per-task progress writer. `current` is monotonic within a phase;
/// `begin_phase` resets the floor and updates the total.
pub struct ProgressReporter {
    catalog: DbHandle,
    task_id: String,
    events: broadcast::Sender<TaskEvent>,
    floor: AtomicU32,
}

impl ProgressReporter {
    fn new(catalog: DbHandle, task_id: String, events: broadcast::Sender<TaskEvent>) -> Self {
        Self {
            catalog,
            task_id,
            events,
            floor: AtomicU32::new(0),
        }
    }

    /// Start a new phase: the monotonic floor resets to zero.
    pub async fn begin_phase(&self, total: u32, message: &str) {
        self.floor.store(0, Ordering::SeqCst);
        self.write(0, total, message).await;
    }

    /// Enter a named step at a known position. Resets the monotonic floor
    /// to `current` so a following phase (e.g. build-log line counting)
    /// starts fresh.
    pub async fn begin_step(&self, current: u32, total: u32, message: &str) {
        self.floor.store(current, Ordering::SeqCst);
        self.write(current, total, message).await;
    }

    /// Report progress. Values below the current floor are clamped up so
    /// observers never see progress move backwards within a phase.
    pub async fn update(&self, current: u32, total: u32, message: &str) {
        let floor = self.floor.fetch_max(current, Ordering::SeqCst).max(current);
        self.write(floor, total, message).await;
    }

    async fn write(&self, current: u32, total: u32, message: &str) {
        let task_id = self.task_id.clone();
        let message_owned = message.to_string();
        let result = self
            .catalog
            .call(move |c| c.set_task_progress(&task_id, current, total, &message_owned))
            .await;
        if let Err(e) = result {
            warn!(task_id = %self.task_id, error = %e, "progress write failed");
        }
        let _ = self.events.send(TaskEvent::Progress {
            task_id: self.task_id.clone(),
            current,
            total,
            message: message.to_string(),
        });
    }
}

/// Everything a pipeline run receives from the engine.
pub struct TaskContext {
    pub task_id: String,
    pub kind: TaskKind,
    pub app_id: i64,
    pub params: TaskParams,
    pub cancel: CancellationToken,
    pub progress: Arc<ProgressReporter>,
}

impl TaskContext {
    /// Cancellation checkpoint. Call between pipeline steps.
    pub fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Executes one task to completion. Implemented by the pipeline runner.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> Result<(), PipelineError>;
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    pub workers: usize,
    pub max_attempts: u8,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

struct QueuedTask {
    task_id: String,
    kind: TaskKind,
    app_id: i64,
    params: TaskParams,
}

/// The engine: queue, worker pool, cancel registry, event fan-out.
pub struct TaskEngine {
    catalog: DbHandle,
    queue_tx: mpsc::Sender<QueuedTask>,
    events_tx: broadcast::Sender<TaskEvent>,
    cancels: Arc<StdMutex<HashMap<String, CancellationToken>>>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl TaskEngine {
    /// Spawn the worker pool. `executor` runs every task.
    pub fn start(
        catalog: DbHandle,
        executor: Arc<dyn TaskExecutor>,
        config: TaskEngineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<QueuedTask>(256);
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let (events_tx, _) = broadcast::channel(256);
        let cancels: Arc<StdMutex<HashMap<String, CancellationToken>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for worker_id in 0..config.workers.max(1) {
            let worker = Worker {
                id: worker_id,
                catalog: catalog.clone(),
                executor: executor.clone(),
                events_tx: events_tx.clone(),
                cancels: cancels.clone(),
                config: config.clone(),
            };
            let rx = queue_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    match next {
                        Some(task) => worker.run_task(task).await,
                        None => break,
                    }
                }
            }));
        }

        Self {
            catalog,
            queue_tx,
            events_tx,
            cancels,
            workers,
        }
    }

    /// Reserve the app's task slot and enqueue. Fails with `Conflict`
    /// when a task of the same kind is still non-terminal for the app.
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        app_id: i64,
        params: TaskParams,
    ) -> Result<String, TaskError> {
        let task_id = Uuid::new_v4().to_string();
        let reserved = {
            let task_id = task_id.clone();
            self.catalog
                .call(move |c| c.reserve_task(app_id, kind, &task_id))
                .await?
        };
        if !reserved {
            return Err(TaskError::Conflict {
                app_id,
                kind: kind.to_string(),
            });
        }

        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .insert(task_id.clone(), cancel);

        info!(task_id = %task_id, %kind, app_id, "task enqueued");
        self.queue_tx
            .send(QueuedTask {
                task_id: task_id.clone(),
                kind,
                app_id,
                params,
            })
            .await
            .map_err(|_| TaskError::QueueClosed)?;
        Ok(task_id)
    }

    /// Cancel a task. Pending tasks revoke immediately; running tasks get
    /// their token tripped and finalize at the next cancellation point.
    /// Terminal tasks are left untouched.
    pub async fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        let record = self.status(task_id).await?;
        match record.state {
            TaskState::Pending => {
                // Trip the token first so a worker popping the task
                // concurrently skips it, then mark it revoked
                if let Some(token) = self
                    .cancels
                    .lock()
                    .expect("cancel registry poisoned")
                    .get(task_id)
                {
                    token.cancel();
                }
                finalize_cancelled(&self.catalog, &record).await?;
                let _ = self.events_tx.send(TaskEvent::Finished {
                    task_id: record.id.clone(),
                    kind: record.kind,
                    app_id: record.app_id,
                    state: TaskState::Revoked,
                });
                Ok(())
            }
            TaskState::Running | TaskState::Retry => {
                if let Some(token) = self
                    .cancels
                    .lock()
                    .expect("cancel registry poisoned")
                    .get(task_id)
                {
                    token.cancel();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        let id = task_id.to_string();
        self.catalog
            .call(move |c| c.get_task(&id))
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    /// Subscribe to the typed event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events_tx.subscribe()
    }

    /// Close the queue and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        drop(self.queue_tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

/// Mark a task revoked and put its app back where it was.
async fn finalize_cancelled(catalog: &DbHandle, record: &TaskRecord) -> Result<(), TaskError> {
    let task_id = record.id.clone();
    let app_id = record.app_id;
    let kind = record.kind;
    let prior = record.prior_status;
    catalog
        .call(move |c| {
            c.set_task_state(&task_id, TaskState::Revoked)?;
            c.set_app_status(app_id, prior)?;
            c.clear_task_slot(app_id, kind, &task_id)?;
            Ok(())
        })
        .await?;
    Ok(())
}

struct Worker {
    id: usize,
    catalog: DbHandle,
    executor: Arc<dyn TaskExecutor>,
    events_tx: broadcast::Sender<TaskEvent>,
    cancels: Arc<StdMutex<HashMap<String, CancellationToken>>>,
    config: TaskEngineConfig,
}

impl Worker {
    async fn run_task(&self, queued: QueuedTask) {
        let QueuedTask {
            task_id,
            kind,
            app_id,
            params,
        } = queued;

        // The task may have been revoked while it sat in the queue
        let record = {
            let id = task_id.clone();
            match self.catalog.call(move |c| c.get_task(&id)).await {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "failed to load task");
                    return;
                }
            }
        };
        let cancel = self
            .cancels
            .lock()
            .expect("cancel registry poisoned")
            .get(&task_id)
            .cloned()
            .unwrap_or_default();
        if record.state != TaskState::Pending || cancel.is_cancelled() {
            self.drop_cancel(&task_id);
            return;
        }

        info!(worker = self.id, task_id = %task_id, %kind, app_id, "task started");
        let started = {
            let id = task_id.clone();
            self.catalog
                .call(move |c| {
                    c.set_task_state(&id, TaskState::Running)?;
                    c.set_app_status(app_id, kind.active_status())?;
                    Ok(())
                })
                .await
        };
        if let Err(e) = started {
            error!(task_id = %task_id, error = %e, "failed to mark task running");
            return;
        }
        let _ = self.events_tx.send(TaskEvent::Started {
            task_id: task_id.clone(),
            kind,
            app_id,
        });

        let progress = Arc::new(ProgressReporter::new(
            self.catalog.clone(),
            task_id.clone(),
            self.events_tx.clone(),
        ));
        let ctx = TaskContext {
            task_id: task_id.clone(),
            kind,
            app_id,
            params,
            cancel: cancel.clone(),
            progress,
        };

        let final_state = self.run_with_retry(&ctx).await;
        self.drop_cancel(&task_id);
        let _ = self.events_tx.send(TaskEvent::Finished {
            task_id,
            kind,
            app_id,
            state: final_state,
        });
    }

    async fn run_with_retry(&self, ctx: &TaskContext) -> TaskState {
        let mut attempt: u8 = 1;
        loop {
            let result = self.executor.execute(ctx).await;
            match result {
                Ok(()) => {
                    self.finalize(ctx, TaskState::Success, None).await;
                    return TaskState::Success;
                }
                Err(e) if e.is_cancelled() || ctx.cancel.is_cancelled() => {
                    info!(task_id = %ctx.task_id, "task cancelled");
                    self.finalize(ctx, TaskState::Revoked, None).await;
                    return TaskState::Revoked;
                }
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = calculate_backoff(
                        attempt,
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                    );
                    warn!(
                        task_id = %ctx.task_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    let retry_marked = {
                        let id = ctx.task_id.clone();
                        self.catalog
                            .call(move |c| c.set_task_state(&id, TaskState::Retry))
                            .await
                    };
                    if let Err(e) = retry_marked {
                        warn!(task_id = %ctx.task_id, error = %e, "failed to mark retry");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => {
                            self.finalize(ctx, TaskState::Revoked, None).await;
                            return TaskState::Revoked;
                        }
                    }
                    let rerun_marked = {
                        let id = ctx.task_id.clone();
                        self.catalog
                            .call(move |c| c.set_task_state(&id, TaskState::Running))
                            .await
                    };
                    if let Err(e) = rerun_marked {
                        warn!(task_id = %ctx.task_id, error = %e, "failed to re-mark running");
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(task_id = %ctx.task_id, error = %e, "task failed");
                    self.finalize(ctx, TaskState::Failure, Some(e.to_string()))
                        .await;
                    return TaskState::Failure;
                }
            }
        }
    }

    async fn finalize(&self, ctx: &TaskContext, state: TaskState, error: Option<String>) {
        let task_id = ctx.task_id.clone();
        let app_id = ctx.app_id;
        let kind = ctx.kind;
        let prior = {
            let id = ctx.task_id.clone();
            self.catalog
                .call(move |c| Ok(c.get_task(&id)?.map(|t| t.prior_status)))
                .await
                .ok()
                .flatten()
                .unwrap_or(AppStatus::Stopped)
        };
        let result = self
            .catalog
            .call(move |c| {
                c.set_task_state(&task_id, state)?;
                if let Some(ref message) = error {
                    c.set_task_error(&task_id, &truncate_log_tail(message, LOG_TAIL_LIMIT))?;
                }
                match state {
                    // Success: the pipeline has already written the app's
                    // final status (running / stopped)
                    TaskState::Failure => c.set_app_status(app_id, AppStatus::Error)?,
                    TaskState::Revoked => c.set_app_status(app_id, prior)?,
                    _ => {}
                }
                c.clear_task_slot(app_id, kind, &task_id)?;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!(task_id = %ctx.task_id, error = %e, "failed to finalize task");
        }
    }

    fn drop_cancel(&self, task_id: &str) {
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .remove(task_id);
    }
}

/// Exponential backoff with 0–25% jitter:
/// `min(base_ms * 2^(attempt-1) + jitter, max_ms)`.
pub fn calculate_backoff(attempt: u8, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp_factor = 2u64.saturating_pow((attempt - 1) as u32);
    let delay_ms = base_ms.saturating_mul(exp_factor);
    let jitter = if delay_ms > 0 {
        rand::rng().random_range(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::BaseImageChoice;
    use crate::catalog::{Catalog, NewApp};
    use std::sync::atomic::AtomicUsize;

    fn handle_with_app() -> (DbHandle, i64) {
        let catalog = Catalog::open_in_memory().unwrap();
        let app = catalog
            .create_app(&NewApp {
                owner_id: 1,
                name: "Demo".into(),
                git_url: "https://example.com/repo".into(),
                branch: "main".into(),
                entry_file: "app.py".into(),
                base_image_choice: BaseImageChoice::Auto,
                custom_base_image: None,
                custom_overlay: None,
                credential_id: None,
                env_vars: vec![],
                is_public: false,
            })
            .unwrap();
        (DbHandle::new(catalog), app.id)
    }

    /// Executor with scriptable behaviour per attempt.
    struct StubExecutor {
        attempts: AtomicUsize,
        /// Results for successive attempts; the last entry repeats.
        script: Vec<StubResult>,
        /// Park until cancelled instead of consulting the script.
        park: bool,
    }

    #[derive(Clone, Copy)]
    enum StubResult {
        Ok,
        Transient,
        Terminal,
    }

    impl StubExecutor {
        fn with(script: Vec<StubResult>) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                script,
                park: false,
            })
        }

        fn parking() -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                script: vec![StubResult::Ok],
                park: true,
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for StubExecutor {
        async fn execute(&self, ctx: &TaskContext) -> Result<(), PipelineError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.park {
                ctx.cancel.cancelled().await;
                return Err(PipelineError::Cancelled);
            }
            let step = *self.script.get(n).or(self.script.last()).unwrap();
            match step {
                StubResult::Ok => {
                    ctx.progress.update(1, 1, "done").await;
                    Ok(())
                }
                StubResult::Transient => Err(PipelineError::Git(
                    crate::errors::GitError::Unreachable("flaky network".into()),
                )),
                StubResult::Terminal => Err(PipelineError::InvalidInput("bad overlay".into())),
            }
        }
    }

    fn fast_config() -> TaskEngineConfig {
        TaskEngineConfig {
            workers: 2,
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
        }
    }

    async fn wait_terminal(engine: &TaskEngine, task_id: &str) -> TaskRecord {
        for _ in 0..200 {
            let record = engine.status(task_id).await.unwrap();
            if record.state.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn successful_task_completes_and_clears_slot() {
        let (catalog, app_id) = handle_with_app();
        let engine = TaskEngine::start(
            catalog.clone(),
            StubExecutor::with(vec![StubResult::Ok]),
            fast_config(),
        );
        let task_id = engine
            .enqueue(TaskKind::Build, app_id, TaskParams::default())
            .await
            .unwrap();
        let record = wait_terminal(&engine, &task_id).await;
        assert_eq!(record.state, TaskState::Success);

        let app = catalog
            .call(move |c| Ok(c.get_app(app_id)?.unwrap()))
            .await
            .unwrap();
        assert!(app.build_task_id.is_none());
    }

    #[tokio::test]
    async fn second_enqueue_same_kind_conflicts() {
        let (catalog, app_id) = handle_with_app();
        let engine = TaskEngine::start(catalog, StubExecutor::parking(), fast_config());
        let first = engine
            .enqueue(TaskKind::Build, app_id, TaskParams::default())
            .await
            .unwrap();
        let err = engine
            .enqueue(TaskKind::Build, app_id, TaskParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Conflict { .. }));

        // The first task is unaffected and can still be cancelled cleanly
        engine.cancel(&first).await.unwrap();
        let record = wait_terminal(&engine, &first).await;
        assert_eq!(record.state, TaskState::Revoked);
    }

    #[tokio::test]
    async fn transient_failure_retries_to_success() {
        let (catalog, app_id) = handle_with_app();
        let executor = StubExecutor::with(vec![
            StubResult::Transient,
            StubResult::Transient,
            StubResult::Ok,
        ]);
        let engine = TaskEngine::start(catalog, executor.clone(), fast_config());
        let task_id = engine
            .enqueue(TaskKind::Build, app_id, TaskParams::default())
            .await
            .unwrap();
        let record = wait_terminal(&engine, &task_id).await;
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_after_max_attempts() {
        let (catalog, app_id) = handle_with_app();
        let executor = StubExecutor::with(vec![StubResult::Transient]);
        let engine = TaskEngine::start(catalog.clone(), executor.clone(), fast_config());
        let task_id = engine
            .enqueue(TaskKind::Build, app_id, TaskParams::default())
            .await
            .unwrap();
        let record = wait_terminal(&engine, &task_id).await;
        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);

        let app = catalog
            .call(move |c| Ok(c.get_app(app_id)?.unwrap()))
            .await
            .unwrap();
        assert_eq!(app.status, AppStatus::Error);
    }

    #[tokio::test]
    async fn terminal_failure_does_not_retry() {
        let (catalog, app_id) = handle_with_app();
        let executor = StubExecutor::with(vec![StubResult::Terminal]);
        let engine = TaskEngine::start(catalog, executor.clone(), fast_config());
        let task_id = engine
            .enqueue(TaskKind::Build, app_id, TaskParams::default())
            .await
            .unwrap();
        let record = wait_terminal(&engine, &task_id).await;
        assert_eq!(record.state, TaskState::Failure);
        assert!(record.error_message.unwrap().contains("bad overlay"));
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_running_restores_prior_status() {
        let (catalog, app_id) = handle_with_app();
        let engine = TaskEngine::start(catalog.clone(), StubExecutor::parking(), fast_config());
        let task_id = engine
            .enqueue(TaskKind::Build, app_id, TaskParams::default())
            .await
            .unwrap();

        // Wait for the worker to pick it up
        for _ in 0..100 {
            if engine.status(&task_id).await.unwrap().state == TaskState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.cancel(&task_id).await.unwrap();
        let record = wait_terminal(&engine, &task_id).await;
        assert_eq!(record.state, TaskState::Revoked);

        let app = catalog
            .call(move |c| Ok(c.get_app(app_id)?.unwrap()))
            .await
            .unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
        assert!(app.build_task_id.is_none());
    }

    #[tokio::test]
    async fn progress_events_fan_out() {
        let (catalog, app_id) = handle_with_app();
        let engine = TaskEngine::start(
            catalog,
            StubExecutor::with(vec![StubResult::Ok]),
            fast_config(),
        );
        let mut events = engine.subscribe();
        let task_id = engine
            .enqueue(TaskKind::Deploy, app_id, TaskParams::default())
            .await
            .unwrap();
        wait_terminal(&engine, &task_id).await;

        let mut saw_started = false;
        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TaskEvent::Started { kind, .. } => {
                    saw_started = true;
                    assert_eq!(kind, TaskKind::Deploy);
                }
                TaskEvent::Finished { state, .. } => {
                    saw_finished = true;
                    assert_eq!(state, TaskState::Success);
                }
                TaskEvent::Progress { .. } => {}
            }
        }
        assert!(saw_started && saw_finished);
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_phase() {
        let (catalog, app_id) = handle_with_app();
        let catalog2 = catalog.clone();
        // Reserve a task row for the reporter to write against
        catalog
            .call(move |c| {
                c.reserve_task(app_id, TaskKind::Build, "t-prog")?;
                Ok(())
            })
            .await
            .unwrap();
        let (events, _) = broadcast::channel(16);
        let reporter = ProgressReporter::new(catalog2.clone(), "t-prog".into(), events);

        reporter.update(5, 10, "five").await;
        reporter.update(3, 10, "stale").await;
        let record = catalog2
            .call(|c| Ok(c.get_task("t-prog")?.unwrap()))
            .await
            .unwrap();
        assert_eq!(record.progress.current, 5);

        // Phase change resets the floor
        reporter.begin_phase(4, "next phase").await;
        reporter.update(1, 4, "one").await;
        let record = catalog2
            .call(|c| Ok(c.get_task("t-prog")?.unwrap()))
            .await
            .unwrap();
        assert_eq!(record.progress.current, 1);
        assert_eq!(record.progress.total, 4);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = calculate_backoff(1, 1000, 60_000);
        assert!(d1.as_millis() >= 1000 && d1.as_millis() <= 1250);
        let d2 = calculate_backoff(2, 1000, 60_000);
        assert!(d2.as_millis() >= 2000 && d2.as_millis() <= 2500);
        let d3 = calculate_backoff(3, 1000, 60_000);
        assert!(d3.as_millis() >= 4000 && d3.as_millis() <= 5000);
        assert!(calculate_backoff(10, 10_000, 60_000).as_millis() <= 60_000);
        assert_eq!(calculate_backoff(0, 1000, 60_000), Duration::ZERO);
    }
}

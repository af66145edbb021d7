//! Job queue and worker loop.
//!
//! The queue is a plain value owned by the caller and shared through
//! [`QueueHandle`]. The worker loop drains the queue front to back, one job at
//! a time, and parks on a wake signal when the queue is empty. Wakes coalesce;
//! shutdown is a separate token so it can never be lost behind them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::batch::{translate_volume, BatchOptions, JobOutcome, TaskCallback};
use crate::cancellation::JobCancellation;
use crate::config::PipelineConfig;
use crate::metrics::MetricsRegistry;
use crate::state_machine::{JobState, JobStateMachine};
use crate::store::{VolumeProgress, VolumeStore};
use crate::task::TaskDescriptor;
use crate::translate::translator::{ProgressFn, Translator};
use crate::translate::{TaskLog, TranslateError};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateJob {
    /// Task descriptor, also the job identity.
    pub task: String,
    pub description: String,
    pub created_at: u64,
}

impl TranslateJob {
    pub fn new(task: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            description: description.into(),
            created_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
}

/// A job that left the queue without finishing cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateJobRecord {
    pub task: String,
    pub description: String,
    pub created_at: u64,
    pub finished_at: Option<u64>,
    pub outcome: Option<JobOutcome>,
    pub progress: Option<JobProgress>,
}

impl TranslateJobRecord {
    pub fn is_finished(&self) -> bool {
        let progress = self.progress.unwrap_or_default();
        self.outcome == Some(JobOutcome::Completed)
            && progress.finished + progress.failed >= progress.total
            && progress.failed == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobQueue {
    jobs: Vec<TranslateJob>,
    records: Vec<TranslateJobRecord>,
}

pub type QueueHandle = Arc<Mutex<JobQueue>>;

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> &[TranslateJob] {
        &self.jobs
    }

    pub fn records(&self) -> &[TranslateJobRecord] {
        &self.records
    }

    /// False if a job for the same task is already queued.
    pub fn add_job(&mut self, job: TranslateJob) -> bool {
        if self.jobs.iter().any(|j| j.task == job.task) {
            return false;
        }
        self.jobs.push(job);
        true
    }

    pub fn delete_job(&mut self, task: &str) {
        self.jobs.retain(|j| j.task != task);
    }

    pub fn top_job(&mut self, task: &str) {
        if let Some(pos) = self.jobs.iter().position(|j| j.task == task) {
            let job = self.jobs.remove(pos);
            self.jobs.insert(0, job);
        }
    }

    pub fn bottom_job(&mut self, task: &str) {
        if let Some(pos) = self.jobs.iter().position(|j| j.task == task) {
            let job = self.jobs.remove(pos);
            self.jobs.push(job);
        }
    }

    pub fn next_job(&self) -> Option<TranslateJob> {
        self.jobs.first().cloned()
    }

    /// Replaces any record for the same task.
    pub fn add_record(&mut self, record: TranslateJobRecord) {
        self.delete_record(&record.task);
        self.records.push(record);
    }

    pub fn delete_record(&mut self, task: &str) {
        self.records.retain(|r| r.task != task);
    }

    /// Queue the record's task again as a fresh job and drop the record.
    pub fn retry_record(&mut self, task: &str) {
        if let Some(record) = self.records.iter().find(|r| r.task == task).cloned() {
            self.add_job(TranslateJob::new(record.task, record.description));
            self.delete_record(task);
        }
    }

    /// Re-queue every unfinished record; finished ones stay.
    pub fn retry_all_records(&mut self) {
        let records = std::mem::take(&mut self.records);
        for record in records {
            if record.is_finished() {
                self.records.push(record);
            } else {
                self.add_job(TranslateJob::new(record.task, record.description));
            }
        }
    }

    pub fn delete_all_records(&mut self) {
        self.records.clear();
    }
}

/// Lifecycle of the most recently started job.
struct ActiveJob {
    task: String,
    state: Arc<JobStateMachine>,
}

pub struct Scheduler {
    queue: QueueHandle,
    wake: Notify,
    shutdown: CancellationToken,
    loop_started: AtomicBool,
    cancel: Arc<JobCancellation>,
    active: RwLock<Option<ActiveJob>>,
}

impl Scheduler {
    pub fn new(queue: QueueHandle) -> Self {
        Self {
            queue,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            loop_started: AtomicBool::new(false),
            cancel: Arc::new(JobCancellation::new()),
            active: RwLock::new(None),
        }
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Queue a job and wake the worker. False if the task is already queued.
    pub fn submit(&self, job: TranslateJob) -> bool {
        let added = self.queue.lock().add_job(job);
        if added {
            self.wake();
        }
        added
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop the worker once the queue is drained.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel the job that is currently running.
    pub fn cancel_current(&self) {
        self.cancel.cancel_current();
        info!("current job cancelled");
    }

    /// Task and state updates of the job started last, if any.
    pub fn watch_active_job(&self) -> Option<(String, watch::Receiver<JobState>)> {
        self.active
            .read()
            .as_ref()
            .map(|job| (job.task.clone(), job.state.subscribe()))
    }

    fn activate(&self, task: &str) -> Arc<JobStateMachine> {
        let state = Arc::new(JobStateMachine::new());
        *self.active.write() = Some(ActiveJob {
            task: task.to_string(),
            state: Arc::clone(&state),
        });
        state
    }
}

fn advance(state: &JobStateMachine, next: JobState) {
    if let Err(reason) = state.transition(next) {
        error!(%reason, "job lifecycle out of order");
    }
}

/// Builds one translator per job.
#[async_trait]
pub trait TranslatorFactory: Send + Sync {
    async fn create(&self, log: Arc<dyn TaskLog>) -> Result<Translator, TranslateError>;

    fn concurrency(&self) -> usize;
}

pub struct ConfiguredFactory {
    config: PipelineConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ConfiguredFactory {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl TranslatorFactory for ConfiguredFactory {
    async fn create(&self, log: Arc<dyn TaskLog>) -> Result<Translator, TranslateError> {
        let translator = Translator::create(&self.config, log).await?;
        Ok(match &self.metrics {
            Some(metrics) => translator.with_metrics(Arc::clone(metrics)),
            None => translator,
        })
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency
    }
}

/// Counts chapter results for the job record and forwards log lines.
pub struct JobProgressCallback {
    log: Arc<dyn TaskLog>,
    progress: Mutex<JobProgress>,
}

impl JobProgressCallback {
    pub fn new(log: Arc<dyn TaskLog>) -> Self {
        Self {
            log,
            progress: Mutex::new(JobProgress::default()),
        }
    }

    pub fn progress(&self) -> JobProgress {
        *self.progress.lock()
    }
}

impl TaskLog for JobProgressCallback {
    fn log(&self, message: &str, detail: Option<&[String]>) {
        self.log.log(message, detail);
    }
}

impl TaskCallback for JobProgressCallback {
    fn on_start(&self, total: usize) {
        self.progress.lock().total = total;
    }

    fn on_chapter_success(&self, progress: &VolumeProgress) {
        self.progress.lock().finished += 1;
        info!(translated = progress.translated, total = progress.total, "chapter saved");
    }

    fn on_chapter_failure(&self) {
        self.progress.lock().failed += 1;
    }
}

pub struct JobWorker {
    pub store: Arc<dyn VolumeStore>,
    pub factory: Arc<dyn TranslatorFactory>,
    pub log: Arc<dyn TaskLog>,
    pub on_progress: Option<ProgressFn>,
}

impl JobWorker {
    /// Run one job and settle it in the queue: the job is removed, and a
    /// record is kept unless it completed with no failed chapters.
    pub async fn run_job(&self, scheduler: &Scheduler, job: &TranslateJob) -> JobOutcome {
        let guard = scheduler.cancel.start_job();
        let state = scheduler.activate(&job.task);
        let callback = Arc::new(JobProgressCallback::new(Arc::clone(&self.log)));

        advance(&state, JobState::Running);
        let outcome = match TaskDescriptor::parse(&job.task) {
            Err(e) => {
                callback.log(&format!("error, invalid task {}: {e}", job.task), None);
                JobOutcome::Uncomplete
            }
            Ok((volume_id, params)) => match self.factory.create(callback.clone()).await {
                Err(e) => {
                    callback.log(&format!("error, could not create translator: {e}"), None);
                    JobOutcome::Uncomplete
                }
                Ok(translator) => {
                    let options = BatchOptions {
                        concurrency: self.factory.concurrency(),
                        on_progress: self.on_progress.clone(),
                    };
                    translate_volume(
                        &volume_id,
                        &params,
                        self.store.as_ref(),
                        &translator,
                        callback.as_ref(),
                        guard.token(),
                        &options,
                    )
                    .await
                }
            },
        };
        advance(&state, outcome.into());

        if !guard.is_current() {
            warn!(task = %job.task, "stale job result dropped");
            return outcome;
        }

        let progress = callback.progress();
        let mut queue = scheduler.queue.lock();
        queue.delete_job(&job.task);
        if !(outcome == JobOutcome::Completed && progress.failed == 0) {
            queue.add_record(TranslateJobRecord {
                task: job.task.clone(),
                description: job.description.clone(),
                created_at: job.created_at,
                finished_at: Some(now_millis()),
                outcome: Some(outcome),
                progress: Some(progress),
            });
        }
        outcome
    }
}

/// Spawn the worker loop. Returns `None` if a loop was already started for
/// this scheduler.
pub fn run_job_loop(scheduler: Arc<Scheduler>, worker: JobWorker) -> Option<JoinHandle<()>> {
    if scheduler.loop_started.swap(true, Ordering::SeqCst) {
        warn!("job loop already running");
        return None;
    }

    Some(tokio::spawn(async move {
        info!("job loop started");
        loop {
            loop {
                let next = scheduler.queue.lock().next_job();
                let Some(job) = next else { break };
                let run_id = uuid::Uuid::new_v4();
                let outcome = worker
                    .run_job(&scheduler, &job)
                    .instrument(tracing::info_span!("job", %run_id, task = %job.task))
                    .await;
                info!(%run_id, ?outcome, "job finished");
            }
            if scheduler.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = scheduler.wake.notified() => {}
                _ = scheduler.shutdown.cancelled() => {}
            }
        }
        info!("job loop exiting");
    }))
}

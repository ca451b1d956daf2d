//! WorkerPool - pulls dispatched jobs and runs the executor on them.
//!
//! # Flow per job
//! 1. `JobQueue::pop()` (raced against shutdown)
//! 2. the executor runs in its own tokio task, registered in `RunningJobs`
//! 3. soft time limit: the cancellation flag is set (`Stop(Graceful)`)
//! 4. hard time limit: the job task is aborted; the lease guard releases
//!    the lease and the stale sweep fails the task
//!
//! Shutdown stops taking new jobs; in-flight jobs run to the end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::app::executor::{ExecutionOutcome, TaskExecutor};
use crate::app::lock_manager::{CancelSignal, StopMode, TaskLockManager};
use crate::config::EngineConfig;
use crate::domain::{JobId, Result, TaskId};
use crate::ports::{Job, JobQueue};

/// Jobs currently executing in this process, by task.
#[derive(Default)]
pub struct RunningJobs {
    jobs: Mutex<HashMap<TaskId, (JobId, AbortHandle)>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, (JobId, AbortHandle)>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, task_id: TaskId, job_id: JobId, handle: AbortHandle) {
        self.lock().insert(task_id, (job_id, handle));
    }

    fn remove(&self, task_id: TaskId, job_id: JobId) {
        let mut jobs = self.lock();
        if jobs.get(&task_id).is_some_and(|(id, _)| *id == job_id) {
            jobs.remove(&task_id);
        }
    }

    /// Abort the job running `task_id` here, if any.
    pub fn terminate(&self, task_id: TaskId) -> bool {
        match self.lock().remove(&task_id) {
            Some((job_id, handle)) => {
                handle.abort();
                tracing::info!(%task_id, %job_id, "running job terminated");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.lock().contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_timeout: Duration,
    pub soft_time_limit: Duration,
    pub time_limit: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.workers.concurrency,
            poll_timeout: config.poll_timeout(),
            soft_time_limit: config.soft_time_limit(),
            time_limit: config.time_limit(),
        }
    }
}

struct WorkerContext {
    queue: Arc<dyn JobQueue>,
    executor: Arc<TaskExecutor>,
    locks: Arc<TaskLockManager>,
    running: Arc<RunningJobs>,
    settings: WorkerSettings,
}

/// Worker pool handle.
/// - `request_shutdown()` stops every worker from taking new jobs
/// - `shutdown_and_join()` also waits for them to exit
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        settings: WorkerSettings,
        queue: Arc<dyn JobQueue>,
        executor: Arc<TaskExecutor>,
        locks: Arc<TaskLockManager>,
        running: Arc<RunningJobs>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let n = settings.concurrency;
        let ctx = Arc::new(WorkerContext {
            queue,
            executor,
            locks,
            running,
            settings,
        });

        let joins = (0..n)
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move { worker_loop(worker_id, ctx, &mut rx).await })
            })
            .collect();
        tracing::info!(workers = n, "worker pool started");

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker exited abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>, shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let popped = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            popped = ctx.queue.pop(ctx.settings.poll_timeout) => popped,
        };

        match popped {
            Ok(Some(job)) => run_job(worker_id, &ctx, job).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "queue pop failed; backing off");
                tokio::time::sleep(ctx.settings.poll_timeout).await;
            }
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

async fn run_job(worker_id: usize, ctx: &WorkerContext, job: Job) {
    tracing::info!(worker_id, job_id = %job.id, task_id = %job.task_id, kind = %job.kind, "job picked up");

    let executor = Arc::clone(&ctx.executor);
    let (kind, task_id) = (job.kind, job.task_id);
    let handle = tokio::spawn(async move { executor.execute(kind, task_id).await });
    ctx.running.insert(task_id, job.id, handle.abort_handle());

    match supervise(ctx, &job, handle).await {
        Some(Ok(outcome)) => {
            tracing::info!(worker_id, job_id = %job.id, %task_id, ?outcome, "job finished");
        }
        Some(Err(e)) => {
            tracing::error!(worker_id, job_id = %job.id, %task_id, error = %e, "job failed");
        }
        None => {}
    }
    ctx.running.remove(task_id, job.id);
}

/// Wait for the job under the soft and hard time limits. `None` when the
/// job did not return (aborted or panicked).
async fn supervise(
    ctx: &WorkerContext,
    job: &Job,
    mut handle: JoinHandle<Result<ExecutionOutcome>>,
) -> Option<Result<ExecutionOutcome>> {
    let soft = tokio::time::sleep(ctx.settings.soft_time_limit);
    let hard = tokio::time::sleep(ctx.settings.time_limit);
    tokio::pin!(soft, hard);
    let mut soft_fired = false;

    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            _ = &mut soft, if !soft_fired => {
                soft_fired = true;
                tracing::warn!(job_id = %job.id, task_id = %job.task_id, "soft time limit reached; requesting graceful stop");
                let signal = CancelSignal::Stop(StopMode::Graceful);
                if let Err(e) = ctx.locks.request_cancellation(job.kind, job.task_id, signal).await {
                    tracing::warn!(task_id = %job.task_id, error = %e, "could not set stop flag");
                }
            }
            _ = &mut hard => {
                tracing::error!(job_id = %job.id, task_id = %job.task_id, "hard time limit reached; aborting job");
                handle.abort();
                break (&mut handle).await;
            }
        }
    };

    match joined {
        Ok(result) => Some(result),
        Err(e) if e.is_cancelled() => {
            tracing::warn!(job_id = %job.id, task_id = %job.task_id, "job aborted");
            None
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, task_id = %job.task_id, error = %e, "job panicked");
            None
        }
    }
}

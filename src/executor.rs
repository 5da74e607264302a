//! Bounded concurrent task execution with proxy assignment and retries.

use crate::config::{ExecutorConfig, ProxyPolicy};
use crate::error::{ErrorClass, ExecutorError, NoProxyAvailable};
use crate::pool::ProxyPool;
use crate::proxy::ProxyRecord;
use crate::task::{ExecutionResult, TaskContext, TaskDescriptor, TaskId, TaskStatus, TaskWork};
use crate::tracker::{ProgressSnapshot, ProgressTracker};

use futures::FutureExt;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of one attempt, handed back from the spawned task body.
struct Attempt<P> {
    task: TaskDescriptor<P>,
    proxy_key: Option<String>,
    outcome: Result<(), ErrorClass>,
    elapsed: Duration,
}

/// Per-run scheduling state. A task lives in exactly one of `queue`,
/// `backoff`, `in_flight` or `results`.
struct Batch<P> {
    queue: VecDeque<TaskDescriptor<P>>,
    /// Retries waiting out their delay, with the instant they become ready.
    backoff: Vec<(Instant, TaskDescriptor<P>)>,
    in_flight: JoinSet<Attempt<P>>,
    /// Which task each in-flight runtime task carries, in case its
    /// `Attempt` never comes back.
    carrying: HashMap<Id, (TaskId, u32, Option<String>)>,
    results: Vec<ExecutionResult>,
    spacing: Option<DefaultKeyedRateLimiter<String>>,
}

impl<P> Batch<P> {
    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.backoff.is_empty() && self.in_flight.is_empty()
    }

    fn waiting(&self) -> usize {
        self.queue.len() + self.backoff.len()
    }

    /// Move retries whose delay has elapsed to the back of the queue.
    fn promote_ready(&mut self, now: Instant) {
        if self.backoff.is_empty() {
            return;
        }
        self.backoff.sort_by_key(|(at, _)| *at);
        let ready = self.backoff.partition_point(|(at, _)| *at <= now);
        for (_, task) in self.backoff.drain(..ready) {
            self.queue.push_back(task);
        }
    }

    fn next_backoff(&self) -> Option<Instant> {
        self.backoff.iter().map(|(at, _)| *at).min()
    }
}

/// Clears the executor's running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs batches of independent tasks under one global concurrency ceiling.
///
/// The executor owns a single scheduling loop per batch. Task bodies run
/// concurrently on the tokio runtime; the loop wakes on each completion, on
/// retry delays elapsing, on a coarse poll while tasks are held back by group
/// spacing, and on cancellation.
pub struct TaskExecutor {
    pool: Arc<ProxyPool>,
    config: ExecutorConfig,
    tracker: Arc<ProgressTracker>,
    shutdown: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl TaskExecutor {
    pub fn new(pool: Arc<ProxyPool>, config: ExecutorConfig) -> Self {
        info!(
            "Task executor ready: {} workers x {} tasks = {} concurrent",
            config.budget.workers,
            config.budget.tasks_per_worker,
            config.budget.max_concurrent()
        );
        Self {
            pool,
            config,
            tracker: Arc::new(ProgressTracker::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Shared progress counters, suitable for polling from a timer.
    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    /// Current progress of the running (or last) batch.
    pub fn stats(&self) -> ProgressSnapshot {
        self.tracker.snapshot()
    }

    /// Stop dispatching in any running batch and reset counters. Queued tasks
    /// of a running batch come back as abandoned. Safe to call repeatedly.
    pub fn cleanup(&self) {
        // Holding the lock orders this against a run taking its token.
        let mut token = self.shutdown.lock();
        std::mem::replace(&mut *token, CancellationToken::new()).cancel();
        if !self.running.load(Ordering::SeqCst) {
            self.tracker.reset();
        }
        debug!("Task executor cleaned up");
    }

    fn validate(&self) -> Result<(), ExecutorError> {
        if self.config.budget.max_concurrent() == 0 {
            return Err(ExecutorError::InvalidConfig(
                "concurrency budget must be at least 1".into(),
            ));
        }
        if self.config.task_timeout.is_zero() {
            return Err(ExecutorError::InvalidConfig(
                "task timeout must be non-zero".into(),
            ));
        }
        if self.config.poll_interval.is_zero() {
            return Err(ExecutorError::InvalidConfig(
                "poll interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Run every task to a terminal state and return one result per task.
    ///
    /// Task ids are assigned from each task's position in `tasks`.
    pub async fn run<P, W>(
        &self,
        tasks: Vec<TaskDescriptor<P>>,
        work: W,
    ) -> Result<Vec<ExecutionResult>, ExecutorError>
    where
        P: Send + Sync + 'static,
        W: TaskWork<P>,
    {
        self.run_until_cancelled(tasks, work, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but stops dispatching once `cancel` fires.
    /// In-flight attempts finish naturally and everything still queued is
    /// returned as [`TaskStatus::Abandoned`].
    pub async fn run_until_cancelled<P, W>(
        &self,
        tasks: Vec<TaskDescriptor<P>>,
        work: W,
        cancel: CancellationToken,
    ) -> Result<Vec<ExecutionResult>, ExecutorError>
    where
        P: Send + Sync + 'static,
        W: TaskWork<P>,
    {
        self.validate()?;
        let shutdown = {
            let token = self.shutdown.lock();
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(ExecutorError::AlreadyRunning);
            }
            token.clone()
        };
        let _guard = RunGuard(&self.running);

        let total = tasks.len();
        self.tracker.begin(total);
        if total == 0 {
            return Ok(Vec::new());
        }

        let work = Arc::new(work);
        let mut batch = Batch {
            queue: tasks
                .into_iter()
                .enumerate()
                .map(|(i, mut task)| {
                    task.id = TaskId(i);
                    task.attempts = 0;
                    task.status = TaskStatus::Queued;
                    task
                })
                .collect(),
            backoff: Vec::new(),
            in_flight: JoinSet::new(),
            carrying: HashMap::new(),
            results: Vec::with_capacity(total),
            spacing: self
                .config
                .group_spacing
                .and_then(Quota::with_period)
                .map(RateLimiter::keyed),
        };

        info!(
            "Executing {} tasks with up to {} concurrent",
            total,
            self.config.budget.max_concurrent()
        );
        let started = Instant::now();
        let reporter = self
            .config
            .progress_interval
            .map(|every| self.tracker.spawn_reporter(every));

        let mut cancelled = false;
        loop {
            if !cancelled && (cancel.is_cancelled() || shutdown.is_cancelled()) {
                cancelled = true;
                self.abandon_waiting(&mut batch);
            }

            let now = Instant::now();
            batch.promote_ready(now);
            let deferred = !cancelled && self.dispatch(&mut batch, &work);
            self.tracker.set_running(batch.in_flight.len());
            self.tracker.set_queued(batch.waiting());

            if batch.is_drained() {
                break;
            }

            let poll_at = deferred.then(|| now + self.config.poll_interval);
            let wake = match (batch.next_backoff(), poll_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let sleep = time::sleep_until(wake.unwrap_or(now + Duration::from_secs(3600)));

            tokio::select! {
                Some(joined) = batch.in_flight.join_next_with_id(), if !batch.in_flight.is_empty() => {
                    match joined {
                        Ok((id, attempt)) => {
                            batch.carrying.remove(&id);
                            self.complete(&mut batch, attempt, cancelled);
                        }
                        Err(e) => self.lost(&mut batch, e),
                    }
                }
                _ = sleep, if wake.is_some() => {}
                _ = cancel.cancelled(), if !cancelled => {}
                _ = shutdown.cancelled(), if !cancelled => {}
            }
        }

        if let Some(handle) = reporter {
            handle.abort();
        }
        self.tracker.set_running(0);
        self.tracker.set_queued(0);

        let s = self.tracker.snapshot();
        info!(
            "Finished {} tasks in {:?}: {} succeeded, {} failed{}",
            batch.results.len(),
            started.elapsed(),
            s.success,
            s.fail,
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(batch.results)
    }

    /// Start as many queued tasks as the budget allows, in FIFO order.
    /// Returns true when some task was held back by group spacing.
    fn dispatch<P, W>(&self, batch: &mut Batch<P>, work: &Arc<W>) -> bool
    where
        P: Send + Sync + 'static,
        W: TaskWork<P>,
    {
        let budget = self.config.budget.max_concurrent();
        let mut deferred = false;
        let mut idx = 0;

        while batch.in_flight.len() < budget && idx < batch.queue.len() {
            if let (Some(limiter), Some(group)) = (&batch.spacing, &batch.queue[idx].group_key) {
                if limiter.check_key(group).is_err() {
                    deferred = true;
                    idx += 1;
                    continue;
                }
            }
            let Some(mut task) = batch.queue.remove(idx) else {
                break;
            };

            let proxy = match task.assigned_proxy.take() {
                Some(proxy) => Some(proxy),
                None => match self.pool.select(self.config.proxy_preference) {
                    Ok(proxy) => Some(proxy),
                    Err(NoProxyAvailable) if self.config.proxy_policy == ProxyPolicy::Optional => {
                        debug!("No proxy for task {}, running without one", task.id);
                        None
                    }
                    Err(NoProxyAvailable) => {
                        warn!("No proxy available for task {}", task.id);
                        task.status = TaskStatus::Failed;
                        let result = ExecutionResult::failed(
                            task.id,
                            task.attempts,
                            ErrorClass::NoProxyAvailable,
                            None,
                            Duration::ZERO,
                        );
                        self.finish(batch, result);
                        continue;
                    }
                },
            };

            task.attempts += 1;
            task.status = TaskStatus::Running;
            self.spawn_attempt(batch, task, proxy, work);
        }

        deferred
    }

    fn spawn_attempt<P, W>(
        &self,
        batch: &mut Batch<P>,
        task: TaskDescriptor<P>,
        proxy: Option<ProxyRecord>,
        work: &Arc<W>,
    ) where
        P: Send + Sync + 'static,
        W: TaskWork<P>,
    {
        let ctx = TaskContext {
            id: task.id,
            attempt: task.attempts,
            group_key: task.group_key.clone(),
            payload: Arc::clone(&task.payload),
            proxy: proxy.clone(),
        };
        let proxy_key = proxy.as_ref().map(ProxyRecord::key);
        let work = Arc::clone(work);
        let timeout = self.config.task_timeout;

        debug!(
            "Starting task {} attempt {} via {}",
            task.id,
            task.attempts,
            proxy_key.as_deref().unwrap_or("direct")
        );
        let (task_id, attempts) = (task.id, task.attempts);
        let carried = proxy_key.clone();
        let handle = batch.in_flight.spawn(async move {
            let started = Instant::now();
            // Dropping the future on timeout abandons the attempt.
            let outcome =
                match time::timeout(timeout, AssertUnwindSafe(work.execute(ctx)).catch_unwind()).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Err(ErrorClass::Panicked),
                    Err(_) => Err(ErrorClass::Timeout),
                };
            Attempt {
                task,
                proxy_key,
                outcome,
                elapsed: started.elapsed(),
            }
        });
        batch.carrying.insert(handle.id(), (task_id, attempts, carried));
    }

    /// A runtime task ended without handing back its attempt, e.g. the work
    /// future panicked while being dropped. The task fails terminally.
    fn lost<P>(&self, batch: &mut Batch<P>, err: JoinError) {
        let Some((task_id, attempts, proxy_key)) = batch.carrying.remove(&err.id()) else {
            error!("Unknown attempt ended abnormally: {}", err);
            return;
        };
        error!("Task {} attempt {} ended abnormally: {}", task_id, attempts, err);
        let class = if err.is_panic() {
            ErrorClass::Panicked
        } else {
            ErrorClass::Other("attempt aborted".into())
        };
        let result = ExecutionResult::failed(task_id, attempts, class, proxy_key, Duration::ZERO);
        self.finish(batch, result);
    }

    /// Record an attempt and either finish the task or schedule a retry.
    fn complete<P>(&self, batch: &mut Batch<P>, attempt: Attempt<P>, cancelled: bool) {
        let Attempt {
            mut task,
            proxy_key,
            outcome,
            elapsed,
        } = attempt;

        let class = match outcome {
            Ok(()) => {
                task.status = TaskStatus::Succeeded;
                let result = ExecutionResult::succeeded(task.id, task.attempts, proxy_key, elapsed);
                self.finish(batch, result);
                return;
            }
            Err(class) => class,
        };

        if class == ErrorClass::Timeout && elapsed >= self.config.task_timeout {
            warn!(
                "Task {} exceeded {:?}, abandoning attempt {}",
                task.id, self.config.task_timeout, task.attempts
            );
        }
        // Report before the next dispatch so a bad proxy is not handed straight out again.
        if let Some(key) = &proxy_key {
            if class.is_proxy_related() {
                self.pool.report_error(key, &class);
            }
        }
        if class.is_auth() {
            task.auth_failures += 1;
        }

        let retry = &self.config.retry;
        if !cancelled && retry.should_retry(&class, task.attempts, task.auth_failures) {
            let delay = if class.is_auth() {
                Duration::ZERO
            } else {
                retry.backoff(task.attempts)
            };
            debug!(
                "Retrying task {} after {:?} (attempt {} failed: {})",
                task.id, delay, task.attempts, class
            );
            task.assigned_proxy = None;
            task.status = TaskStatus::Queued;
            task.last_error = Some(class);
            if delay.is_zero() {
                batch.queue.push_back(task);
            } else {
                batch.backoff.push((Instant::now() + delay, task));
            }
            return;
        }

        debug!(
            "Task {} failed after {} attempts: {}",
            task.id, task.attempts, class
        );
        task.status = TaskStatus::Failed;
        let result = ExecutionResult::failed(task.id, task.attempts, class, proxy_key, elapsed);
        self.finish(batch, result);
    }

    fn abandon_waiting<P>(&self, batch: &mut Batch<P>) {
        let waiting: Vec<TaskDescriptor<P>> = batch
            .queue
            .drain(..)
            .chain(batch.backoff.drain(..).map(|(_, task)| task))
            .collect();
        if !waiting.is_empty() {
            info!("Cancelled: abandoning {} queued tasks", waiting.len());
        }
        for mut task in waiting {
            task.status = TaskStatus::Abandoned;
            let result = ExecutionResult::abandoned(task.id, task.attempts, task.last_error.take());
            self.finish(batch, result);
        }
    }

    fn finish<P>(&self, batch: &mut Batch<P>, result: ExecutionResult) {
        self.tracker.on_result(&result);
        batch.results.push(result);
    }
}

//! Bounded-concurrency task scheduler with retry and status tracking.
//!
//! Executes a caller-supplied async worker over an ordered input list under
//! one of three strategies (serial fallback, independent, batch), with
//! uniform linear-backoff retry, per-task status callbacks, and cooperative
//! cancellation. Output slots are always written at the task's own index, so
//! result ordering is guaranteed regardless of completion order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use loresmith_shared::{LoresmithError, Result, SchedulerConfig, SchedulerMode};

use crate::semaphore::Semaphore;

// ---------------------------------------------------------------------------
// Task status & observer
// ---------------------------------------------------------------------------

/// Per-task lifecycle state.
///
/// `pending → processing → (completed | retrying → processing … | failed)`;
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Callbacks for task lifecycle events. All methods default to no-ops.
pub trait SchedulerObserver: Send + Sync {
    /// Called on every status transition.
    fn task_status(&self, _index: usize, _status: TaskStatus) {}

    /// Called once per task when it reaches a terminal status. `error` is
    /// set only for `Failed`.
    fn task_settled(&self, _index: usize, _status: TaskStatus, _error: Option<&LoresmithError>) {}
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl SchedulerObserver for SilentObserver {}

// ---------------------------------------------------------------------------
// Batch outcome
// ---------------------------------------------------------------------------

/// Index-aligned results of one batch: exactly one slot per input, `None`
/// where not applicable. A non-empty error set is a partial success, not a
/// batch failure.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub results: Vec<Option<T>>,
    pub errors: Vec<Option<LoresmithError>>,
}

impl<T> BatchOutcome<T> {
    fn with_len(len: usize) -> Self {
        Self {
            results: (0..len).map(|_| None).collect(),
            errors: (0..len).map(|_| None).collect(),
        }
    }

    fn record(&mut self, index: usize, outcome: Result<T>) {
        match outcome {
            Ok(value) => self.results[index] = Some(value),
            Err(err) => self.errors[index] = Some(err),
        }
    }

    /// Number of failed tasks.
    pub fn error_count(&self) -> usize {
        self.errors.iter().filter(|e| e.is_some()).count()
    }

    /// Whether every task completed successfully.
    pub fn is_complete(&self) -> bool {
        self.error_count() == 0
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Bounded-concurrency executor for per-chunk pipeline work.
pub struct TaskScheduler {
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    aborted: Arc<AtomicBool>,
}

impl TaskScheduler {
    /// Create a scheduler from a validated runtime configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency as usize));
        Self {
            config,
            semaphore,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cooperative cancellation: queued semaphore acquirers fail,
    /// and no new retry attempt starts. Workers already mid-call to the
    /// backend run to completion.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.semaphore.abort();
    }

    /// Whether `abort()` has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Clear the abort flag and semaphore state between independent batches.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
        self.semaphore.reset();
    }

    /// Execute `worker` over `inputs`, returning index-aligned results and
    /// errors. Serial execution is forced when concurrency is disabled or
    /// there is at most one input.
    pub async fn run<I, T, W, Fut>(
        &self,
        inputs: Vec<I>,
        worker: W,
        observer: Arc<dyn SchedulerObserver>,
    ) -> BatchOutcome<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        W: Fn(usize, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = inputs.len();
        for index in 0..total {
            observer.task_status(index, TaskStatus::Pending);
        }

        let worker = Arc::new(worker);
        if !self.config.enabled || total <= 1 {
            return self.run_serial(inputs, worker, observer).await;
        }
        match self.config.mode {
            SchedulerMode::Independent => self.run_independent(inputs, worker, observer).await,
            SchedulerMode::Batch => self.run_batched(inputs, worker, observer).await,
        }
    }

    /// Strictly ordered execution; a task's failure never blocks the next.
    async fn run_serial<I, T, W, Fut>(
        &self,
        inputs: Vec<I>,
        worker: Arc<W>,
        observer: Arc<dyn SchedulerObserver>,
    ) -> BatchOutcome<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        W: Fn(usize, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut outcome = BatchOutcome::with_len(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let result = attempt_task(
                &self.config,
                &self.aborted,
                index,
                input,
                worker.as_ref(),
                observer.as_ref(),
            )
            .await;
            settle(observer.as_ref(), index, &result);
            outcome.record(index, result);
        }
        outcome
    }

    /// All tasks start immediately; the semaphore caps actual parallelism.
    async fn run_independent<I, T, W, Fut>(
        &self,
        inputs: Vec<I>,
        worker: Arc<W>,
        observer: Arc<dyn SchedulerObserver>,
    ) -> BatchOutcome<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        W: Fn(usize, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut outcome = BatchOutcome::with_len(inputs.len());
        let handles: Vec<_> = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                (
                    index,
                    self.spawn_task(index, input, worker.clone(), observer.clone()),
                )
            })
            .collect();

        for (index, handle) in handles {
            collect(&mut outcome, index, handle.await);
        }
        outcome
    }

    /// Contiguous groups of `concurrency` tasks; each group settles fully
    /// before the next starts.
    async fn run_batched<I, T, W, Fut>(
        &self,
        inputs: Vec<I>,
        worker: Arc<W>,
        observer: Arc<dyn SchedulerObserver>,
    ) -> BatchOutcome<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        W: Fn(usize, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let group_size = self.config.concurrency as usize;
        let mut outcome = BatchOutcome::with_len(inputs.len());

        let indexed: Vec<(usize, I)> = inputs.into_iter().enumerate().collect();
        for group in indexed.chunks(group_size) {
            debug!(
                first = group[0].0,
                size = group.len(),
                "starting task group"
            );
            let handles: Vec<_> = group
                .iter()
                .cloned()
                .map(|(index, input)| {
                    (
                        index,
                        self.spawn_task(index, input, worker.clone(), observer.clone()),
                    )
                })
                .collect();

            for (index, handle) in handles {
                collect(&mut outcome, index, handle.await);
            }
        }
        outcome
    }

    /// Spawn one task: abort check → slot acquisition → retry loop.
    fn spawn_task<I, T, W, Fut>(
        &self,
        index: usize,
        input: I,
        worker: Arc<W>,
        observer: Arc<dyn SchedulerObserver>,
    ) -> tokio::task::JoinHandle<(usize, Result<T>)>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        W: Fn(usize, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let config = self.config.clone();
        let semaphore = self.semaphore.clone();
        let aborted = self.aborted.clone();

        tokio::spawn(async move {
            if aborted.load(Ordering::SeqCst) {
                let result = Err(LoresmithError::Aborted);
                settle(observer.as_ref(), index, &result);
                return (index, result);
            }
            let permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    let result = Err(err);
                    settle(observer.as_ref(), index, &result);
                    return (index, result);
                }
            };

            let result = attempt_task(
                &config,
                &aborted,
                index,
                input,
                worker.as_ref(),
                observer.as_ref(),
            )
            .await;
            drop(permit);

            settle(observer.as_ref(), index, &result);
            (index, result)
        })
    }
}

/// Run one task through the retry loop. The abort flag is checked before
/// every attempt; between attempts (not after the final one) the task waits
/// `retry_delay × attempt_number` — linearly increasing backoff. Only the
/// final attempt's error is surfaced.
async fn attempt_task<I, T, W, Fut>(
    config: &SchedulerConfig,
    aborted: &AtomicBool,
    index: usize,
    input: I,
    worker: &W,
    observer: &dyn SchedulerObserver,
) -> Result<T>
where
    I: Clone,
    W: Fn(usize, I) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 0..config.retry_count {
        if aborted.load(Ordering::SeqCst) {
            return Err(LoresmithError::Aborted);
        }
        if attempt > 0 {
            observer.task_status(index, TaskStatus::Retrying);
            tokio::time::sleep(config.retry_delay * attempt).await;
            if aborted.load(Ordering::SeqCst) {
                return Err(LoresmithError::Aborted);
            }
        }
        observer.task_status(index, TaskStatus::Processing);

        match worker(index, input.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(index, attempt, error = %err, "task attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| LoresmithError::provider("task finished without an attempt")))
}

/// Fire the terminal status callbacks for a settled task.
fn settle<T>(observer: &dyn SchedulerObserver, index: usize, result: &Result<T>) {
    match result {
        Ok(_) => {
            observer.task_status(index, TaskStatus::Completed);
            observer.task_settled(index, TaskStatus::Completed, None);
        }
        Err(err) => {
            observer.task_status(index, TaskStatus::Failed);
            observer.task_settled(index, TaskStatus::Failed, Some(err));
        }
    }
}

/// Fold one joined task into the outcome. A panicked worker is recorded as
/// that task's error, not a batch failure.
fn collect<T>(
    outcome: &mut BatchOutcome<T>,
    index: usize,
    joined: std::result::Result<(usize, Result<T>), tokio::task::JoinError>,
) {
    match joined {
        Ok((index, result)) => outcome.record(index, result),
        Err(err) => {
            warn!(index, error = %err, "worker task aborted abnormally");
            outcome.record(
                index,
                Err(LoresmithError::validation(format!(
                    "worker task aborted abnormally: {err}"
                ))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use loresmith_shared::SchedulerSettings;

    fn config(
        enabled: bool,
        concurrency: u32,
        mode: SchedulerMode,
        retry_count: u32,
    ) -> SchedulerConfig {
        SchedulerConfig::from(&SchedulerSettings {
            enabled,
            concurrency,
            mode,
            retry_count,
            retry_delay_ms: 1,
        })
    }

    #[tokio::test]
    async fn failing_worker_is_invoked_exactly_retry_count_times() {
        let scheduler = TaskScheduler::new(config(true, 2, SchedulerMode::Independent, 3));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_ref = calls.clone();
        let outcome = scheduler
            .run(
                vec!["only"],
                move |_, _| {
                    let calls = calls_ref.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(LoresmithError::provider("always fails"))
                    }
                },
                Arc::new(SilentObserver),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.error_count(), 1);
        assert!(
            outcome.errors[0]
                .as_ref()
                .expect("error recorded")
                .to_string()
                .contains("always fails")
        );
    }

    #[tokio::test]
    async fn fail_once_then_succeed_completes_with_second_result() {
        let scheduler = TaskScheduler::new(config(true, 2, SchedulerMode::Independent, 2));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_ref = calls.clone();
        let outcome = scheduler
            .run(
                vec![7usize],
                move |_, input| {
                    let calls = calls_ref.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(LoresmithError::Network("flaky".into()))
                        } else {
                            Ok(input * 10)
                        }
                    }
                },
                Arc::new(SilentObserver),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.results[0], Some(70));
        assert!(outcome.errors[0].is_none());
    }

    #[tokio::test]
    async fn results_are_index_aligned_despite_completion_order() {
        let scheduler = TaskScheduler::new(config(true, 4, SchedulerMode::Independent, 1));

        let outcome = scheduler
            .run(
                vec![30u64, 1, 15, 5],
                |index, delay| async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(index)
                },
                Arc::new(SilentObserver),
            )
            .await;

        let results: Vec<_> = outcome.results.iter().map(|r| r.unwrap()).collect();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_siblings() {
        let scheduler = TaskScheduler::new(config(true, 2, SchedulerMode::Independent, 1));

        let outcome = scheduler
            .run(
                vec![0usize, 1, 2],
                |_, input| async move {
                    if input == 1 {
                        Err(LoresmithError::provider("bad chunk"))
                    } else {
                        Ok(input)
                    }
                },
                Arc::new(SilentObserver),
            )
            .await;

        assert_eq!(outcome.results[0], Some(0));
        assert!(outcome.results[1].is_none());
        assert!(outcome.errors[1].is_some());
        assert_eq!(outcome.results[2], Some(2));
        assert_eq!(outcome.error_count(), 1);
    }

    #[tokio::test]
    async fn batch_mode_bounds_parallelism_and_orders_groups() {
        let k = 2u32;
        let scheduler = TaskScheduler::new(config(true, k, SchedulerMode::Batch, 1));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));

        let current_ref = current.clone();
        let peak_ref = peak.clone();
        let started_ref = started.clone();
        let outcome = scheduler
            .run(
                (0..6usize).collect::<Vec<_>>(),
                move |index, _| {
                    let current = current_ref.clone();
                    let peak = peak_ref.clone();
                    let started = started_ref.clone();
                    async move {
                        started.lock().unwrap().push(index);
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(index)
                    }
                },
                Arc::new(SilentObserver),
            )
            .await;

        assert!(outcome.is_complete());
        assert!(peak.load(Ordering::SeqCst) <= k as usize);

        // Group i+1 never starts before group i settles: start order grouped
        // into [0,1], [2,3], [4,5] (order within a group is free).
        let started = started.lock().unwrap();
        for (group, pair) in started.chunks(2).enumerate() {
            let mut pair = pair.to_vec();
            pair.sort_unstable();
            assert_eq!(pair, vec![group * 2, group * 2 + 1]);
        }
    }

    #[tokio::test]
    async fn disabled_scheduler_falls_back_to_serial() {
        let scheduler = TaskScheduler::new(config(false, 4, SchedulerMode::Independent, 1));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let current_ref = current.clone();
        let peak_ref = peak.clone();
        let outcome = scheduler
            .run(
                (0..5usize).collect::<Vec<_>>(),
                move |index, _| {
                    let current = current_ref.clone();
                    let peak = peak_ref.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(index)
                    }
                },
                Arc::new(SilentObserver),
            )
            .await;

        assert!(outcome.is_complete());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_skips_remaining_retries() {
        let scheduler = Arc::new(TaskScheduler::new(config(
            true,
            1,
            SchedulerMode::Independent,
            5,
        )));
        let calls = Arc::new(AtomicUsize::new(0));

        let scheduler_ref = scheduler.clone();
        let calls_ref = calls.clone();
        let outcome = scheduler
            .run(
                vec![(), ()],
                move |_, _| {
                    let scheduler = scheduler_ref.clone();
                    let calls = calls_ref.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // First attempt triggers a scheduler-wide abort.
                        scheduler.abort();
                        Err::<(), _>(LoresmithError::Network("transient".into()))
                    }
                },
                Arc::new(SilentObserver),
            )
            .await;

        // Each started task stops after the attempt that observed the abort.
        assert!(calls.load(Ordering::SeqCst) <= 2);
        assert!(
            outcome
                .errors
                .iter()
                .flatten()
                .any(|e| e.is_aborted())
        );
    }

    #[tokio::test]
    async fn non_retryable_errors_bypass_retry() {
        let scheduler = TaskScheduler::new(config(true, 1, SchedulerMode::Independent, 4));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_ref = calls.clone();
        let outcome = scheduler
            .run(
                vec![()],
                move |_, _| {
                    let calls = calls_ref.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(LoresmithError::token_limit("prompt is too long"))
                    }
                },
                Arc::new(SilentObserver),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome.errors[0],
            Some(LoresmithError::TokenLimit { .. })
        ));
    }

    #[tokio::test]
    async fn observer_sees_terminal_statuses() {
        struct Recorder(Mutex<Vec<(usize, TaskStatus)>>);
        impl SchedulerObserver for Recorder {
            fn task_settled(
                &self,
                index: usize,
                status: TaskStatus,
                _error: Option<&LoresmithError>,
            ) {
                self.0.lock().unwrap().push((index, status));
            }
        }

        let scheduler = TaskScheduler::new(config(true, 2, SchedulerMode::Independent, 1));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        let _ = scheduler
            .run(
                vec![0usize, 1],
                |_, input| async move {
                    if input == 1 {
                        Err(LoresmithError::provider("boom"))
                    } else {
                        Ok(input)
                    }
                },
                recorder.clone(),
            )
            .await;

        let mut settled = recorder.0.lock().unwrap().clone();
        settled.sort_by_key(|(i, _)| *i);
        assert_eq!(settled[0], (0, TaskStatus::Completed));
        assert_eq!(settled[1], (1, TaskStatus::Failed));
    }
}

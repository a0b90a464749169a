use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::{JobFailure, SpawnedJob};

/// Counting slot gate bounding in-flight jobs. A plain semaphore; the
/// cancellation path performs one extra `release` so a spawner blocked in
/// `acquire` is guaranteed another wake-up to observe the stop flag.
struct Slots {
    available: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn new(count: usize) -> Self {
        Self {
            available: Mutex::new(count),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while *available == 0 {
            available = self
                .freed
                .wait(available)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *available -= 1;
    }

    fn release(&self) {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *available += 1;
        drop(available);
        self.freed.notify_one();
    }
}

/// What to do with one item's failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Cancel the whole batch: kill in-flight jobs and surface the error.
    Abort,
    /// Yield the `(input, error)` pair to the consumer and keep going.
    Yield,
    /// Drop the item and keep going.
    Skip,
}

/// Policy hooks consulted for spawn-time and job-time failures.
pub trait ErrorHandler<I> {
    fn handle_spawn_error(&self, input: &I, error: &anyhow::Error) -> ErrorAction;
    fn handle_job_error(&self, input: &I, error: &JobFailure) -> ErrorAction;
}

/// Abort the batch on the first failure of any kind.
pub struct Raise;

impl<I> ErrorHandler<I> for Raise {
    fn handle_spawn_error(&self, _input: &I, _error: &anyhow::Error) -> ErrorAction {
        ErrorAction::Abort
    }

    fn handle_job_error(&self, _input: &I, _error: &JobFailure) -> ErrorAction {
        ErrorAction::Abort
    }
}

/// Yield each failure alongside its input and continue.
pub struct Retain;

impl<I> ErrorHandler<I> for Retain {
    fn handle_spawn_error(&self, _input: &I, _error: &anyhow::Error) -> ErrorAction {
        ErrorAction::Yield
    }

    fn handle_job_error(&self, _input: &I, _error: &JobFailure) -> ErrorAction {
        ErrorAction::Yield
    }
}

/// Log each failure and continue. The default policy.
pub struct Log;

impl<I> ErrorHandler<I> for Log {
    fn handle_spawn_error(&self, _input: &I, error: &anyhow::Error) -> ErrorAction {
        warn!("failed to spawn job: {error:#}");
        ErrorAction::Skip
    }

    fn handle_job_error(&self, _input: &I, error: &JobFailure) -> ErrorAction {
        warn!("job failed: {error}");
        ErrorAction::Skip
    }
}

/// One yielded item of [`execute_parallel`] under a non-aborting policy.
#[derive(Debug)]
pub enum ParallelResult<I, T> {
    Success(T),
    Failed { input: I, error: JobFailure },
}

enum Spawned<I, T> {
    Ok(I, SpawnedJob<T>),
    SpawnError(I, anyhow::Error),
}

/// Clamp the requested job budget to `[1, 2 × CPU count]`, defaulting to the
/// CPU count.
#[must_use]
pub(crate) fn sanitize_max_jobs(max_jobs: Option<usize>) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    max_jobs.unwrap_or(cpus).clamp(1, cpus * 2)
}

/// Spawn a job per input with bounded concurrency and stream results back in
/// spawn order.
///
/// A dedicated spawner thread pulls inputs and calls `spawn` for each, gated
/// by the slot count; results are awaited by the consuming iterator in the
/// original input order, so per-item error routing stays deterministic even
/// though jobs run concurrently. The first `Abort`-classified failure stops
/// new spawns, kills every not-yet-consumed job, and is surfaced as the final
/// `Err` item.
pub fn execute_parallel<I, T, F, H>(
    inputs: Vec<I>,
    spawn: F,
    error_handler: H,
    max_jobs: Option<usize>,
) -> ExecuteParallel<I, T, H>
where
    I: Send + 'static,
    T: Send + 'static,
    F: FnMut(&I) -> anyhow::Result<SpawnedJob<T>> + Send + 'static,
    H: ErrorHandler<I>,
{
    let max_jobs = sanitize_max_jobs(max_jobs);
    let slots = Arc::new(Slots::new(max_jobs));
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = sync_channel::<Spawned<I, T>>(max_jobs);

    let spawner = {
        let slots = Arc::clone(&slots);
        let stop = Arc::clone(&stop);
        let mut spawn = spawn;
        std::thread::spawn(move || {
            for input in inputs {
                slots.acquire();
                // Re-check after every wake: the consumer releases one extra
                // slot at cancellation precisely so this check runs.
                if stop.load(Ordering::SeqCst) {
                    slots.release();
                    break;
                }
                let message = match spawn(&input) {
                    Ok(spawned) => Spawned::Ok(input, spawned),
                    Err(error) => Spawned::SpawnError(input, error),
                };
                if tx.send(message).is_err() {
                    // Consumer hung up; nothing left to do.
                    break;
                }
            }
            debug!("job spawner finished");
        })
    };

    ExecuteParallel {
        rx,
        slots,
        stop,
        spawner: Some(spawner),
        error_handler,
        done: false,
    }
}

/// Iterator over [`execute_parallel`] results, in spawn order.
pub struct ExecuteParallel<I, T, H> {
    rx: Receiver<Spawned<I, T>>,
    slots: Arc<Slots>,
    stop: Arc<AtomicBool>,
    spawner: Option<JoinHandle<()>>,
    error_handler: H,
    done: bool,
}

impl<I, T, H> ExecuteParallel<I, T, H> {
    /// Stop spawning, kill every already-spawned unconsumed job, and reap the
    /// spawner thread.
    fn cancel(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // The one-shot extra release: a spawner blocked waiting for a slot is
        // guaranteed to wake and observe the stop flag.
        self.slots.release();
        while let Ok(message) = self.rx.recv() {
            if let Spawned::Ok(_, mut spawned) = message {
                spawned.kill();
            }
            self.slots.release();
        }
        if let Some(spawner) = self.spawner.take() {
            let _ = spawner.join();
        }
        self.done = true;
    }

    fn finish(&mut self) {
        if let Some(spawner) = self.spawner.take() {
            let _ = spawner.join();
        }
        self.done = true;
    }
}

impl<I, T, H> Iterator for ExecuteParallel<I, T, H>
where
    H: ErrorHandler<I>,
{
    type Item = anyhow::Result<ParallelResult<I, T>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Ok(message) = self.rx.recv() else {
                self.finish();
                return None;
            };
            match message {
                Spawned::SpawnError(input, error) => {
                    self.slots.release();
                    match self.error_handler.handle_spawn_error(&input, &error) {
                        ErrorAction::Abort => {
                            self.cancel();
                            return Some(Err(
                                error.context("failed to spawn a parallel job")
                            ));
                        }
                        ErrorAction::Yield => {
                            return Some(Ok(ParallelResult::Failed {
                                input,
                                error: JobFailure::Extract(error),
                            }));
                        }
                        ErrorAction::Skip => {}
                    }
                }
                Spawned::Ok(input, spawned) => {
                    let result = spawned.await_result();
                    self.slots.release();
                    match result {
                        Ok(value) => return Some(Ok(ParallelResult::Success(value))),
                        Err(error) => {
                            match self.error_handler.handle_job_error(&input, &error) {
                                ErrorAction::Abort => {
                                    self.cancel();
                                    return Some(Err(anyhow::Error::new(error)
                                        .context("a parallel job failed")));
                                }
                                ErrorAction::Yield => {
                                    return Some(Ok(ParallelResult::Failed { input, error }));
                                }
                                ErrorAction::Skip => {}
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<I, T, H> Drop for ExecuteParallel<I, T, H> {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Command, Stdio};

    use anyhow::anyhow;

    use crate::Job;

    use super::*;

    fn sleep_then_echo(tag: usize, seconds: &str) -> anyhow::Result<SpawnedJob<usize>> {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("sleep {seconds}; printf {tag}"),
        ];
        let child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(SpawnedJob::stdout(Job::new(command, child), |stdout| {
            Ok(String::from_utf8(stdout)?.trim().parse()?)
        }))
    }

    #[cfg(unix)]
    #[test]
    fn results_arrive_in_spawn_order() {
        // Earlier inputs sleep longer, so completion order inverts spawn
        // order; yielded order must still match the inputs.
        let inputs = vec![1usize, 2, 3, 4];
        let results: Vec<usize> = execute_parallel(
            inputs,
            |input| {
                let delay = match input {
                    1 => "0.3",
                    2 => "0.2",
                    3 => "0.1",
                    _ => "0",
                };
                sleep_then_echo(*input, delay)
            },
            Raise,
            Some(4),
        )
        .map(|item| match item.unwrap() {
            ParallelResult::Success(value) => value,
            ParallelResult::Failed { error, .. } => panic!("unexpected failure: {error}"),
        })
        .collect();
        assert_eq!(results, vec![1, 2, 3, 4]);
    }

    #[cfg(unix)]
    #[test]
    fn raise_aborts_batch_and_kills_remaining_jobs() {
        let inputs = vec![1usize, 2, 3, 4, 5];
        let started = std::time::Instant::now();
        let mut yielded = Vec::new();
        let mut fatal = None;
        for item in execute_parallel(
            inputs,
            |input| {
                if *input == 3 {
                    // Fails fast with a non-zero exit.
                    let command = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 9".to_string()];
                    let child = Command::new(&command[0])
                        .args(&command[1..])
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .spawn()?;
                    Ok(SpawnedJob::and_then(Job::new(command, child), || {
                        Ok(0usize)
                    }))
                } else if *input < 3 {
                    sleep_then_echo(*input, "0")
                } else {
                    // Would take far too long if actually awaited.
                    sleep_then_echo(*input, "30")
                }
            },
            Raise,
            Some(2),
        ) {
            match item {
                Ok(ParallelResult::Success(value)) => yielded.push(value),
                Ok(ParallelResult::Failed { error, .. }) => panic!("retained: {error}"),
                Err(error) => {
                    fatal = Some(error);
                    break;
                }
            }
        }
        assert_eq!(yielded, vec![1, 2]);
        assert!(fatal.is_some(), "the failure must surface");
        // Jobs 4/5 were killed, not awaited: the 30s sleeps never elapse.
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn retain_yields_failures_in_place() {
        let inputs = vec![0usize, 9, 0];
        let outcomes: Vec<_> = execute_parallel(
            inputs,
            |input| {
                let command = vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("exit {input}"),
                ];
                let child = Command::new(&command[0])
                    .args(&command[1..])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
                let tag = *input;
                Ok(SpawnedJob::and_then(Job::new(command, child), move || {
                    Ok(tag)
                }))
            },
            Retain,
            Some(2),
        )
        .collect::<anyhow::Result<Vec<_>>>()
        .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], ParallelResult::Success(0)));
        match &outcomes[1] {
            ParallelResult::Failed { input, error } => {
                assert_eq!(*input, 9);
                match error {
                    JobFailure::Job(job_error) => assert_eq!(job_error.exitcode, Some(9)),
                    JobFailure::Extract(other) => panic!("unexpected: {other}"),
                }
            }
            other => panic!("expected failure in slot 1, got {other:?}"),
        }
        assert!(matches!(outcomes[2], ParallelResult::Success(0)));
    }

    #[test]
    fn spawn_errors_are_routed_through_the_handler() {
        let inputs = vec![1usize, 2];
        let mut saw_fatal = false;
        for item in execute_parallel(
            inputs,
            |_input| Err::<SpawnedJob<usize>, _>(anyhow!("no such executable")),
            Raise,
            None,
        ) {
            if item.is_err() {
                saw_fatal = true;
            }
        }
        assert!(saw_fatal);
    }

    #[test]
    fn log_policy_skips_failures_silently() {
        let inputs = vec![1usize, 2, 3];
        let results: Vec<_> = execute_parallel(
            inputs,
            |input| {
                if *input == 2 {
                    Err(anyhow!("boom"))
                } else {
                    Ok(SpawnedJob::completed(*input))
                }
            },
            Log,
            None,
        )
        .collect();
        let values: Vec<usize> = results
            .into_iter()
            .map(|item| match item.unwrap() {
                ParallelResult::Success(value) => value,
                ParallelResult::Failed { error, .. } => panic!("unexpected: {error}"),
            })
            .collect();
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn max_jobs_is_clamped() {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        assert_eq!(sanitize_max_jobs(Some(0)), 1);
        assert_eq!(sanitize_max_jobs(Some(usize::MAX)), cpus * 2);
        assert_eq!(sanitize_max_jobs(None), cpus.clamp(1, cpus * 2));
    }
}

//! Fan-out/fan-in execution of independent units of work.
//!
//! [`ParallelExecutor`] runs each unit on its own tokio task inside a
//! [`JoinSet`], with a semaphore capping how many execute at once. Every
//! unit produces exactly one [`TaskResult`]; an error, panic or timeout in
//! one unit never cancels or delays the others.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// The default number of units allowed to execute at the same time.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// How a unit ended.
#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    Success(T),
    Failed(E),
    /// The unit panicked; carries the panic message when there is one.
    Panicked(String),
    /// The unit exceeded its bound and was dropped.
    TimedOut(Duration),
}

impl<T, E> TaskOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// The result of one spawned unit, labelled with its target.
#[derive(Debug)]
pub struct TaskResult<T, E> {
    pub target: String,
    pub outcome: TaskOutcome<T, E>,
}

/// Returned by [`ParallelExecutor::join_all`] when any unit did not succeed.
#[derive(Debug)]
pub enum ParallelError<T, E> {
    TasksFailed {
        /// Targets of every unit that failed, panicked or timed out,
        /// including results already consumed through `next()`.
        failed: Vec<String>,
        /// Results not yet consumed, in spawn order.
        results: Vec<TaskResult<T, E>>,
    },
}

impl<T, E> fmt::Display for ParallelError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParallelError::TasksFailed { failed, .. } => {
                write!(f, "{} task(s) failed: {}", failed.len(), failed.join(", "))
            }
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> std::error::Error for ParallelError<T, E> {}

/// A set of concurrently running units, bounded by a maximum parallelism.
pub struct ParallelExecutor<T, E> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<(usize, TaskResult<T, E>)>,
    spawned: usize,
    failed: Vec<String>,
}

impl<T, E> Default for ParallelExecutor<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> ParallelExecutor<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates an executor with [`DEFAULT_MAX_PARALLELISM`].
    pub fn new() -> Self {
        Self::with_parallelism(DEFAULT_MAX_PARALLELISM)
    }

    pub fn with_parallelism(max_parallelism: usize) -> Self {
        ParallelExecutor {
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            set: JoinSet::new(),
            spawned: 0,
            failed: Vec::new(),
        }
    }

    /// Number of units spawned and not yet yielded.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Schedules `unit` for `target`.
    pub fn spawn<F>(&mut self, target: impl Into<String>, unit: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn_inner(target.into(), None, unit);
    }

    /// Schedules `unit` for `target`, dropping it if it runs longer than
    /// `timeout` once started.
    pub fn spawn_with_timeout<F>(&mut self, target: impl Into<String>, timeout: Duration, unit: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn_inner(target.into(), Some(timeout), unit);
    }

    fn spawn_inner<F>(&mut self, target: String, timeout: Option<Duration>, unit: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let index = self.spawned;
        self.spawned += 1;
        let semaphore = Arc::clone(&self.semaphore);

        self.set.spawn(async move {
            // The semaphore is never closed, so acquisition only waits.
            let _permit = semaphore.acquire_owned().await.ok();

            // The unit runs on its own task so a panic is observed here as
            // a JoinError instead of tearing down the wrapper.
            let mut handle = tokio::spawn(unit);
            let outcome = match timeout {
                Some(bound) => match tokio::time::timeout(bound, &mut handle).await {
                    Ok(joined) => outcome_of(joined),
                    Err(_) => {
                        handle.abort();
                        TaskOutcome::TimedOut(bound)
                    }
                },
                None => outcome_of(handle.await),
            };

            (index, TaskResult { target, outcome })
        });
    }

    async fn next_indexed(&mut self) -> Option<(usize, TaskResult<T, E>)> {
        loop {
            match self.set.join_next().await? {
                Ok((index, result)) => {
                    if !result.outcome.is_success() {
                        self.failed.push(result.target.clone());
                    }
                    return Some((index, result));
                }
                Err(err) => {
                    // Only the wrapper task can fail here, and it neither
                    // panics nor gets aborted.
                    tracing::error!("parallel executor lost a task: {}", err);
                }
            }
        }
    }

    /// Waits for the next unit to finish, in completion order.
    pub async fn next(&mut self) -> Option<TaskResult<T, E>> {
        self.next_indexed().await.map(|(_, result)| result)
    }

    /// Waits for every outstanding unit.
    ///
    /// Fails if any unit, including ones already yielded by
    /// [`next`](Self::next), did not succeed. Either way the remaining
    /// results come back in spawn order.
    pub async fn join_all(mut self) -> Result<Vec<TaskResult<T, E>>, ParallelError<T, E>> {
        let mut remaining = Vec::with_capacity(self.set.len());
        while let Some(entry) = self.next_indexed().await {
            remaining.push(entry);
        }
        remaining.sort_by_key(|(index, _)| *index);
        let results = remaining.into_iter().map(|(_, result)| result).collect();

        if self.failed.is_empty() {
            Ok(results)
        } else {
            Err(ParallelError::TasksFailed {
                failed: self.failed,
                results,
            })
        }
    }
}

fn outcome_of<T, E>(joined: Result<Result<T, E>, JoinError>) -> TaskOutcome<T, E> {
    match joined {
        Ok(Ok(value)) => TaskOutcome::Success(value),
        Ok(Err(err)) => TaskOutcome::Failed(err),
        Err(err) if err.is_panic() => TaskOutcome::Panicked(panic_message(err)),
        Err(err) => TaskOutcome::Panicked(err.to_string()),
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unit panicked".to_string()
    }
}

//! Bounded-concurrency dispatch of independent jobs.
//!
//! [`TaskDispatcher::run`] executes every job on the Tokio runtime with at
//! most `concurrency` running at once, reports each outcome to a callback
//! in completion order, and returns only once every job is terminal. A
//! failing or panicking job is recorded in its own slot and never affects
//! the others.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Caller-chosen job identifier, e.g. `sample3/finetuned`.
pub type JobId = String;

type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T, JobError>> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Terminal failure of one job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    /// First step of a two-step job.
    #[error("compute step failed: {0}")]
    Compute(String),

    /// Second step of a two-step job; the compute step succeeded.
    #[error("persist step failed: {0}")]
    Persist(String),

    #[error("cancelled before persisting")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A unit of work for the dispatcher.
pub struct Job<T> {
    id: JobId,
    future: JobFuture<T>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new<F>(id: impl Into<JobId>, future: F) -> Self
    where
        F: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            future: Box::pin(future),
        }
    }

    /// A compute-then-persist job.
    ///
    /// `persist` runs only if `compute` succeeded and `cancel` (when given)
    /// has not fired in between. Whatever `persist` wrote before failing
    /// is left in place.
    pub fn two_step<C, R, CE, P, PF, PE>(
        id: impl Into<JobId>,
        compute: C,
        persist: P,
        cancel: Option<CancellationToken>,
    ) -> Self
    where
        C: Future<Output = Result<R, CE>> + Send + 'static,
        R: Send + 'static,
        CE: fmt::Display + 'static,
        P: FnOnce(R) -> PF + Send + 'static,
        PF: Future<Output = Result<T, PE>> + Send + 'static,
        PE: fmt::Display + 'static,
    {
        Self::new(id, async move {
            let computed = compute
                .await
                .map_err(|e| JobError::Compute(e.to_string()))?;
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(JobError::Cancelled);
            }
            persist(computed)
                .await
                .map_err(|e| JobError::Persist(e.to_string()))
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct JobOutcome<T> {
    pub job_id: JobId,
    pub result: Result<T, JobError>,
    /// Running time once a worker slot was acquired. Panicked jobs report
    /// the time since the batch started.
    pub elapsed: Duration,
}

impl<T> JobOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Success/failure counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchTally {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl fmt::Display for BatchTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed ({} total)",
            self.succeeded,
            self.failed,
            self.total()
        )
    }
}

/// All outcomes of a batch, in completion order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub outcomes: Vec<JobOutcome<T>>,
    pub elapsed: Duration,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            outcomes: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

impl<T> BatchReport<T> {
    pub fn tally(&self) -> BatchTally {
        let succeeded = self.outcomes.iter().filter(|o| o.is_success()).count();
        BatchTally {
            succeeded,
            failed: self.outcomes.len() - succeeded,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &JobError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.job_id.as_str(), e)))
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &T)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|v| (o.job_id.as_str(), v)))
    }

    pub fn outcome(&self, job_id: &str) -> Option<&JobOutcome<T>> {
        self.outcomes.iter().find(|o| o.job_id == job_id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(JobOutcome::is_success)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs batches of jobs with a fixed concurrency limit.
#[derive(Debug, Clone, Copy)]
pub struct TaskDispatcher {
    concurrency: usize,
}

impl TaskDispatcher {
    /// `concurrency` is clamped to at least 1.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every job to a terminal state.
    pub async fn run<T>(&self, jobs: Vec<Job<T>>) -> BatchReport<T>
    where
        T: Send + 'static,
    {
        self.run_with(jobs, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_complete` as each job finishes.
    pub async fn run_with<T, F>(&self, jobs: Vec<Job<T>>, mut on_complete: F) -> BatchReport<T>
    where
        T: Send + 'static,
        F: FnMut(&JobOutcome<T>),
    {
        if jobs.is_empty() {
            return BatchReport::default();
        }

        let started = Instant::now();
        let total = jobs.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut job_ids = HashMap::with_capacity(total);

        tracing::info!(jobs = total, concurrency = self.concurrency, "Dispatching batch");

        for job in jobs {
            let permits = Arc::clone(&permits);
            let Job { id, future } = job;
            let handle = set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (
                        Err(JobError::Failed("worker pool closed".to_string())),
                        Duration::ZERO,
                    );
                };
                let job_started = Instant::now();
                let result = future.await;
                (result, job_started.elapsed())
            });
            job_ids.insert(handle.id(), id);
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = set.join_next_with_id().await {
            let (task_id, result, elapsed) = match joined {
                Ok((task_id, (result, elapsed))) => (task_id, result, elapsed),
                Err(e) => {
                    let task_id = e.id();
                    let message = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "task aborted".to_string()
                    };
                    (task_id, Err(JobError::Panicked(message)), started.elapsed())
                }
            };
            let job_id = job_ids.remove(&task_id).unwrap_or_default();
            let outcome = JobOutcome {
                job_id,
                result,
                elapsed,
            };
            match &outcome.result {
                Ok(_) => tracing::debug!(
                    job_id = %outcome.job_id,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Job succeeded",
                ),
                Err(e) => tracing::warn!(job_id = %outcome.job_id, error = %e, "Job failed"),
            }
            on_complete(&outcome);
            outcomes.push(outcome);
        }

        let report = BatchReport {
            outcomes,
            elapsed: started.elapsed(),
        };
        tracing::info!(tally = %report.tally(), "Batch finished");
        report
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // -- Job::two_step --------------------------------------------------------

    #[tokio::test]
    async fn persist_failure_is_one_failure() {
        let job: Job<u32> = Job::two_step(
            "a",
            async { Ok::<_, String>(2) },
            |n| async move { Err::<u32, _>(format!("disk full after computing {n}")) },
            None,
        );
        let report = TaskDispatcher::new(1).run(vec![job]).await;
        assert_eq!(report.tally(), BatchTally { succeeded: 0, failed: 1 });
        assert_matches!(
            &report.outcomes[0].result,
            Err(JobError::Persist(msg)) if msg.contains("computing 2")
        );
    }

    #[tokio::test]
    async fn cancellation_checked_between_steps() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let job: Job<u32> = Job::two_step(
            "a",
            async { Ok::<_, String>(2) },
            |n| async move { Ok::<_, String>(n * 10) },
            Some(cancel),
        );
        let report = TaskDispatcher::new(1).run(vec![job]).await;
        assert_matches!(report.outcomes[0].result, Err(JobError::Cancelled));
    }

    #[tokio::test]
    async fn compute_failure_skips_persist() {
        let job: Job<u32> = Job::two_step(
            "a",
            async { Err::<u32, _>("model unavailable") },
            |_| async { Err::<u32, _>("persist ran") },
            None,
        );
        let report = TaskDispatcher::new(1).run(vec![job]).await;
        assert_matches!(&report.outcomes[0].result, Err(JobError::Compute(_)));
    }

    // -- TaskDispatcher -------------------------------------------------------

    #[tokio::test]
    async fn zero_jobs_is_empty_success() {
        let report = TaskDispatcher::new(4).run(Vec::<Job<()>>::new()).await;
        assert!(report.outcomes.is_empty());
        assert!(report.all_succeeded());
        assert_eq!(report.tally().total(), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_captured() {
        let jobs = vec![
            Job::new("ok", async { Ok(1) }),
            Job::new("boom", async {
                let fail = true;
                if fail {
                    panic!("exploded");
                }
                Ok(2)
            }),
        ];
        let report = TaskDispatcher::new(2).run(jobs).await;
        assert_eq!(report.tally(), BatchTally { succeeded: 1, failed: 1 });
        assert_matches!(
            &report.outcome("boom").unwrap().result,
            Err(JobError::Panicked(msg)) if msg == "exploded"
        );
    }

    #[test]
    fn concurrency_clamped_to_one() {
        assert_eq!(TaskDispatcher::new(0).concurrency(), 1);
    }

    #[test]
    fn tally_display() {
        let tally = BatchTally { succeeded: 4, failed: 1 };
        assert_eq!(tally.to_string(), "4 succeeded, 1 failed (5 total)");
    }
}

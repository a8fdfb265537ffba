//! Bounded concurrent execution of independent I/O jobs.
//!
//! Results come back in submission order no matter which job finishes first. A job
//! that panics is reported as a failed [`Outcome`] and never takes its siblings down.
//! Jobs sharing a destination key run one at a time.

use crate::error::FetchError;
use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
use log::{info, warn};
use serde::Serialize;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Downloaded,
    SkippedExisting,
    Failed,
}

/// Result of one I/O operation.
#[derive(Clone, Debug, Serialize)]
pub struct Outcome {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<Duration>,
}

impl Outcome {
    fn new(target: impl Into<String>, status: OutcomeStatus, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            destination: None,
            status,
            message: message.into(),
            size: None,
            elapsed: None,
        }
    }

    pub fn downloaded(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(target, OutcomeStatus::Downloaded, message)
    }

    pub fn skipped(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(target, OutcomeStatus::SkippedExisting, message)
    }

    pub fn failed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(target, OutcomeStatus::Failed, message)
    }

    pub fn at(mut self, destination: PathBuf) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_stats(mut self, size: Option<u64>, elapsed: Duration) -> Self {
        self.size = size;
        self.elapsed = Some(elapsed);
        self
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.status, OutcomeStatus::Failed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.status {
            OutcomeStatus::Downloaded => "ok",
            OutcomeStatus::SkippedExisting => "skip",
            OutcomeStatus::Failed => "fail",
        };
        write!(f, "[{tag}] {}: {}", self.target, self.message)?;
        if let Some(destination) = &self.destination {
            write!(f, " ({})", destination.display())?;
        }
        Ok(())
    }
}

/// Aggregate of a batch. `succeeded` counts skips as successes.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<Outcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub outcomes: Vec<Outcome>,
}

impl BatchSummary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_outcomes(outcomes: Vec<Outcome>) -> Self {
        let total = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let skipped = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::SkippedExisting)
            .count();
        let failed = outcomes.iter().filter(|o| !o.is_success()).cloned().collect();
        Self {
            total,
            succeeded,
            skipped,
            failed,
            warnings: Vec::new(),
            outcomes,
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// An empty batch, or at least one success.
    pub fn is_success(&self) -> bool {
        self.total == 0 || self.succeeded > 0
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// `Err` only when every attempted operation failed.
    pub fn into_result(self) -> Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::NothingSucceeded { total: self.total })
        }
    }

    /// `Err` on any failure.
    pub fn require_all(&self) -> Result<(), FetchError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(FetchError::PartialBatchFailure {
                total: self.total,
                failed: self.failed.len(),
            })
        }
    }

    pub fn log(&self, label: &str) {
        for outcome in &self.failed {
            warn!("{label}: {outcome}");
        }
        for warning in &self.warnings {
            warn!("{label}: {warning}");
        }
        info!(
            "{label}: {}/{} succeeded{}",
            self.succeeded,
            self.total,
            if self.skipped > 0 {
                format!(" ({} already present)", self.skipped)
            } else {
                String::new()
            }
        );
    }
}

/// A unit of scheduled work.
pub struct Job<'a> {
    label: String,
    key: Option<PathBuf>,
    future: BoxFuture<'a, Outcome>,
}

impl<'a> Job<'a> {
    pub fn new<F>(label: impl Into<String>, future: F) -> Self
    where
        F: std::future::Future<Output = Outcome> + Send + 'a,
    {
        Self {
            label: label.into(),
            key: None,
            future: future.boxed(),
        }
    }

    /// Jobs with the same key never run concurrently.
    pub fn keyed(mut self, key: PathBuf) -> Self {
        self.key = Some(key);
        self
    }
}

#[derive(Clone, Debug)]
pub struct BatchScheduler {
    limit: usize,
    cancel: CancellationToken,
}

impl BatchScheduler {
    pub fn new(max_concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            limit: max_concurrency.max(1),
            cancel,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn run(&self, jobs: Vec<Job<'_>>) -> Vec<Outcome> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let total = jobs.len();
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut locks: HashMap<PathBuf, Arc<Mutex<()>>> = HashMap::new();
        let mut labels = Vec::with_capacity(total);

        let pending = jobs
            .into_iter()
            .enumerate()
            .map(|(index, Job { label, key, future })| {
                labels.push((label.clone(), key.clone()));
                let lock = key.map(|key| locks.entry(key).or_default().clone());
                let semaphore = semaphore.clone();
                let cancel = self.cancel.clone();

                async move {
                    let run = async move {
                        let _guard = match lock {
                            Some(lock) => Some(lock.lock_owned().await),
                            None => None,
                        };
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return Outcome::failed(label, "scheduler closed"),
                        };
                        match AssertUnwindSafe(future).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(panic) => Outcome::failed(
                                label,
                                format!("task panicked: {}", panic_message(panic.as_ref())),
                            ),
                        }
                    };

                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        outcome = run => Some(outcome),
                    };
                    (index, outcome)
                }
            })
            .collect::<Vec<_>>();

        let mut slots: Vec<Option<Outcome>> = (0..total).map(|_| None).collect();
        let mut finished = stream::iter(pending).buffer_unordered(total);
        while let Some((index, outcome)) = finished.next().await {
            slots[index] = outcome;
        }

        slots
            .into_iter()
            .zip(labels)
            .map(|(slot, (label, key))| {
                slot.unwrap_or_else(|| {
                    let outcome = Outcome::failed(label, "cancelled");
                    match key {
                        Some(key) => outcome.at(key),
                        None => outcome,
                    }
                })
            })
            .collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn scheduler(limit: usize) -> BatchScheduler {
        BatchScheduler::new(limit, CancellationToken::new())
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        assert!(scheduler(4).run(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn results_follow_submission_order() {
        let jobs = (0..6u64)
            .map(|i| {
                Job::new(format!("job-{i}"), async move {
                    sleep(Duration::from_millis(60 - i * 10)).await;
                    Outcome::downloaded(format!("job-{i}"), "done")
                })
            })
            .collect();
        let outcomes = scheduler(6).run(jobs).await;
        let targets: Vec<_> = outcomes.iter().map(|o| o.target.as_str()).collect();
        assert_eq!(
            targets,
            ["job-0", "job-1", "job-2", "job-3", "job-4", "job-5"]
        );
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_stop_siblings() {
        let jobs = vec![
            Job::new("a", async { Outcome::downloaded("a", "ok") }),
            Job::new("b", async { Outcome::failed("b", "HTTP 404") }),
            Job::new("c", async {
                if true {
                    panic!("boom");
                }
                Outcome::downloaded("c", "unreachable")
            }),
            Job::new("d", async { Outcome::skipped("d", "present") }),
        ];
        let outcomes = scheduler(2).run(jobs).await;
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1].status, OutcomeStatus::Failed);
        assert_eq!(outcomes[2].status, OutcomeStatus::Failed);
        assert!(outcomes[2].message.contains("boom"));
        assert!(outcomes[3].is_success());

        let summary = BatchSummary::from_outcomes(outcomes);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed.len(), 2);
        assert!(summary.is_success());
        assert!(summary.require_all().is_err());
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = (0..10)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                Job::new(format!("{i}"), async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Outcome::downloaded(format!("{i}"), "ok")
                })
            })
            .collect();
        let outcomes = scheduler(3).run(jobs).await;
        assert_eq!(outcomes.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn jobs_with_same_key_are_serialised() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let key = PathBuf::from("/tmp/same-destination.bin");
        let jobs = (0..4)
            .map(|i| {
                let active = active.clone();
                let overlapped = overlapped.clone();
                Job::new(format!("{i}"), async move {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.fetch_add(1, Ordering::SeqCst);
                    }
                    sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Outcome::downloaded(format!("{i}"), "ok")
                })
                .keyed(key.clone())
            })
            .collect();
        scheduler(4).run(jobs).await;
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_marks_unfinished_jobs() {
        let cancel = CancellationToken::new();
        let scheduler = BatchScheduler::new(2, cancel.clone());
        let jobs = vec![
            Job::new("fast", async { Outcome::downloaded("fast", "ok") }),
            Job::new("slow", async {
                sleep(Duration::from_secs(30)).await;
                Outcome::downloaded("slow", "ok")
            }),
        ];
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcomes = scheduler.run(jobs).await;
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1].status, OutcomeStatus::Failed);
        assert_eq!(outcomes[1].message, "cancelled");
    }

    #[test]
    fn display_names_the_destination() {
        let outcome = Outcome::failed("a.bin", "HTTP 404").at(PathBuf::from("/m/a.bin"));
        assert_eq!(outcome.to_string(), "[fail] a.bin: HTTP 404 (/m/a.bin)");
        assert_eq!(Outcome::skipped("b", "present").to_string(), "[skip] b: present");
    }

    #[test]
    fn nothing_succeeded_is_an_error() {
        let summary = BatchSummary::from_outcomes(vec![
            Outcome::failed("a", "x"),
            Outcome::failed("b", "y"),
        ]);
        assert!(matches!(
            summary.into_result(),
            Err(FetchError::NothingSucceeded { total: 2 })
        ));
        assert!(BatchSummary::empty().into_result().is_ok());
    }
}

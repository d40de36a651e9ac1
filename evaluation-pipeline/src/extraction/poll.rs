use std::{future::Future, sync::Mutex, time::Duration};

use tokio::time::{timeout_at, Instant};
use tokio_retry::{strategy::FixedInterval, RetryIf};
use tracing::debug;

use super::ExtractionError;

const SUCCESS_STATUSES: [&str; 6] = [
    "succeeded",
    "success",
    "completed",
    "complete",
    "done",
    "finished",
];
const FAILURE_STATUSES: [&str; 2] = ["failed", "error"];
/// Reported as the last status when a request is still in flight at the deadline.
pub const STALLED_STATUS: &str = "request still in flight at deadline";

/// Classified job status as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed(String),
    Pending(String),
}

impl JobStatus {
    /// Case-insensitive match against the known success and failure labels.
    /// Anything else is still in progress.
    pub fn classify(raw: &str) -> Self {
        let status = raw.trim().to_lowercase();
        if SUCCESS_STATUSES.contains(&status.as_str()) {
            JobStatus::Succeeded
        } else if FAILURE_STATUSES.contains(&status.as_str()) {
            JobStatus::Failed(status)
        } else {
            JobStatus::Pending(status)
        }
    }
}

/// Why one poll attempt did not finish the wait.
#[derive(Debug)]
enum PollAttempt {
    Pending(String),
    Failed(String),
}

/// Fixed-interval polling bounded by an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600),
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Deadline for an extraction started now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// [`Self::wait_until`] with a deadline starting now.
    pub async fn wait_for_completion<F, Fut>(
        &self,
        filename: &str,
        check: F,
    ) -> Result<(), ExtractionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobStatus, ExtractionError>>,
    {
        self.wait_until(filename, self.deadline(), check).await
    }

    /// Call `check` until it reports success, a terminal failure, or `deadline`
    /// passes. Errors from `check` are treated as transient and retried. An attempt
    /// still in flight at the deadline is abandoned.
    pub async fn wait_until<F, Fut>(
        &self,
        filename: &str,
        deadline: Instant,
        mut check: F,
    ) -> Result<(), ExtractionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobStatus, ExtractionError>>,
    {
        let strategy = FixedInterval::new(self.interval).take_while(move |_| Instant::now() < deadline);
        let last_seen = Mutex::new(String::new());

        let outcome = RetryIf::spawn(
            strategy,
            || {
                let attempt = check();
                let last_seen = &last_seen;
                async move {
                    let Ok(outcome) = timeout_at(deadline, attempt).await else {
                        debug!("status request outlived the deadline");
                        let previous = last_seen
                            .lock()
                            .map(|status| status.clone())
                            .unwrap_or_default();
                        return Err(PollAttempt::Pending(if previous.is_empty() {
                            STALLED_STATUS.to_string()
                        } else {
                            previous
                        }));
                    };
                    let pending = match outcome {
                        Ok(JobStatus::Succeeded) => return Ok(()),
                        Ok(JobStatus::Failed(status)) => return Err(PollAttempt::Failed(status)),
                        Ok(JobStatus::Pending(status)) => {
                            debug!(status = %status, "extraction job still running");
                            status
                        }
                        Err(err) => {
                            debug!(error = %err, "transient status poll failure");
                            err.to_string()
                        }
                    };
                    if let Ok(mut slot) = last_seen.lock() {
                        slot.clone_from(&pending);
                    }
                    Err(PollAttempt::Pending(pending))
                }
            },
            |attempt: &PollAttempt| matches!(attempt, PollAttempt::Pending(_)),
        )
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(PollAttempt::Failed(status)) => Err(ExtractionError::ExtractionFailed {
                filename: filename.to_string(),
                detail: format!("job reported status '{status}'"),
            }),
            Err(PollAttempt::Pending(last_status)) => Err(ExtractionError::ExtractionTimeout {
                filename: filename.to_string(),
                timeout_secs: self.timeout.as_secs(),
                last_status,
            }),
        }
    }
}

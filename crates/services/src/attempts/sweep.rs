use std::sync::Arc;

use serde::Serialize;
use storage::repository::AttemptRepository;

use super::SessionGrader;
use crate::Clock;
use crate::error::AttemptServiceError;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Overdue attempts picked up by the scan.
    pub scanned: usize,
    /// Attempts this pass moved to `Timeout`.
    pub expired: usize,
    /// Attempts a concurrent submit or expiry closed first.
    pub already_finished: usize,
    /// Attempts that could not be expired; they are retried on the next pass.
    pub failed: usize,
}

/// Closes attempts whose deadline passed without a submission.
///
/// The sweep only finds candidates; every transition still goes through
/// `SessionGrader::expire` and its compare-and-set.
#[derive(Clone)]
pub struct ExpirySweep {
    clock: Clock,
    grader: Arc<SessionGrader>,
    attempts: Arc<dyn AttemptRepository>,
}

impl ExpirySweep {
    #[must_use]
    pub fn new(clock: Clock, grader: Arc<SessionGrader>, attempts: Arc<dyn AttemptRepository>) -> Self {
        Self {
            clock,
            grader,
            attempts,
        }
    }

    /// Expire up to `limit` overdue attempts, earliest deadline first.
    ///
    /// Attempts still inside the policy's late-submission grace period are
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns `AttemptServiceError::Storage` if the overdue scan fails.
    /// Failures on individual attempts are counted in the report instead.
    pub async fn run_once(&self, limit: u32) -> Result<SweepReport, AttemptServiceError> {
        let cutoff = self.clock.now() - self.grader.policy().late_submission_grace();
        let overdue = self.attempts.list_overdue(cutoff, limit).await?;
        let mut report = SweepReport {
            scanned: overdue.len(),
            ..SweepReport::default()
        };

        for attempt in overdue {
            match self.grader.expire(attempt.id()).await {
                Ok(_) => report.expired += 1,
                Err(AttemptServiceError::AttemptNotInProgress { .. }) => {
                    report.already_finished += 1;
                }
                Err(err) => {
                    tracing::warn!(attempt_id = %attempt.id(), error = %err, "expiry failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            expired = report.expired,
            already_finished = report.already_finished,
            failed = report.failed,
            "expiry sweep finished"
        );
        Ok(report)
    }
}

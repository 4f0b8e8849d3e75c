//! Background re-submission of dead-lettered events
//!
//! Each pass re-publishes every due `pending`/`retrying` record as a fresh
//! delivery. The workers then run it through all three dedup layers like
//! any other event.

use crate::pipeline::{IngestOutcome, Pipeline};
use chrono::Duration as ChronoDuration;
use playtrack_common::time::now;
use playtrack_common::Result;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryPassReport {
    pub due: usize,
    pub resubmitted: usize,
    pub skipped: usize,
}

pub struct RetryScheduler {
    interval: Duration,
    backoff: ChronoDuration,
}

impl RetryScheduler {
    /// `backoff` is multiplied by a record's retry count to space attempts
    pub fn new(interval: Duration, backoff: Duration) -> Self {
        Self {
            interval,
            backoff: ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::seconds(30)),
        }
    }

    pub async fn run_once(&self, pipeline: &Pipeline) -> Result<RetryPassReport> {
        let due = pipeline.dead_letter().due_for_retry(now(), self.backoff).await?;
        let mut report = RetryPassReport {
            due: due.len(),
            ..Default::default()
        };

        for record in due {
            match pipeline.resubmit_failed(record.id).await {
                Ok(IngestOutcome::Published { .. }) => report.resubmitted += 1,
                Ok(other) => {
                    warn!(failed_event_id = %record.id, outcome = ?other, "Re-submission not published");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(failed_event_id = %record.id, error = %e, "Re-submission failed");
                    report.skipped += 1;
                }
            }
        }

        if report.resubmitted > 0 {
            info!(resubmitted = report.resubmitted, skipped = report.skipped, "Dead-letter retry pass");
        }
        Ok(report)
    }

    pub async fn run(&self, pipeline: &Pipeline, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Dead-letter retry scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = self.run_once(pipeline).await {
                warn!("Dead-letter retry pass failed: {}", e);
            }
        }
        info!("Dead-letter retry scheduler stopped");
    }
}

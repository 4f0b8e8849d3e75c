//! WAL recovery
//!
//! The startup scan replays every WAL entry that never reached `applied`,
//! using its original transaction id, so a crash between storage insert and
//! WAL commit resolves to exactly one stored record, and an event staged at
//! ingest but never fetched is still applied. The maintenance loop runs the
//! same replay for entries left behind at runtime, with linear backoff per
//! entry, and compacts the WAL and L1 cache.
//!
//! Entries older than the configured TTL are dead-lettered instead of
//! replayed.

use crate::correlation::source_of_key;
use crate::dead_letter::NewFailedEvent;
use crate::delivery::Envelope;
use crate::pipeline::{DeliveryOutcome, Pipeline, PIPELINE_ACTOR};
use crate::wal::{BeginOutcome, WalEntry};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use playtrack_common::models::{FailureLayer, RawEvent};
use playtrack_common::time::now;
use playtrack_common::Result;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_ENTRY_BACKOFF_SECS: i64 = 3600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub pending_found: usize,
    /// Storage already held the transaction; only the WAL commit was missing
    pub already_committed: usize,
    pub recovered: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Older than the entry TTL; dead-lettered
    pub expired: usize,
    /// Claimed by a live worker, not yet due, or interrupted by shutdown
    pub skipped: usize,
    pub duration_ms: u64,
}

enum EntryResult {
    AlreadyCommitted,
    Recovered,
    Failed,
    Abandoned,
    Expired,
    Skipped,
}

/// Replay every unapplied WAL entry. Run before workers start.
pub async fn recover_on_startup(pipeline: &Pipeline) -> Result<RecoveryReport> {
    let report = replay_pending(pipeline, None).await?;
    if report.pending_found > 0 {
        info!(
            pending = report.pending_found,
            already_committed = report.already_committed,
            recovered = report.recovered,
            failed = report.failed,
            abandoned = report.abandoned,
            expired = report.expired,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "WAL recovery complete"
        );
    } else {
        info!("WAL recovery: nothing to replay");
    }
    Ok(report)
}

/// Replay unapplied entries.
///
/// With `backoff` set, an entry is only replayed once `attempts * backoff`
/// (capped at an hour) has passed since it was last touched.
pub async fn replay_pending(pipeline: &Pipeline, backoff: Option<Duration>) -> Result<RecoveryReport> {
    let started = Instant::now();
    let entries = pipeline.wal().pending_entries().await?;
    let mut report = RecoveryReport {
        pending_found: entries.len(),
        ..Default::default()
    };

    let at = now();
    let ttl = ChronoDuration::from_std(pipeline.entry_ttl()).unwrap_or_else(|_| ChronoDuration::days(7));
    for entry in entries {
        if let Some(backoff) = backoff {
            let step = ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::seconds(30));
            let wait = (step * entry.attempts.max(1) as i32).min(ChronoDuration::seconds(MAX_ENTRY_BACKOFF_SECS));
            if at - entry.updated_at < wait {
                report.skipped += 1;
                continue;
            }
        }

        let result = match replay_entry(pipeline, &entry, at - ttl).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    transaction_id = %entry.transaction_id,
                    error = %e,
                    "WAL replay failed, will retry"
                );
                EntryResult::Failed
            }
        };
        match result {
            EntryResult::AlreadyCommitted => report.already_committed += 1,
            EntryResult::Recovered => report.recovered += 1,
            EntryResult::Failed => report.failed += 1,
            EntryResult::Abandoned => report.abandoned += 1,
            EntryResult::Expired => report.expired += 1,
            EntryResult::Skipped => report.skipped += 1,
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

async fn replay_entry(pipeline: &Pipeline, entry: &WalEntry, expires_before: DateTime<Utc>) -> Result<EntryResult> {
    let txn = entry.transaction_id.as_str();
    if pipeline.broker().contains(txn) {
        debug!(transaction_id = %txn, "WAL entry still held by the broker, skipping");
        return Ok(EntryResult::Skipped);
    }
    let Some(_claim) = pipeline.wal().try_claim(txn) else {
        debug!(transaction_id = %txn, "WAL entry claimed by a worker, skipping");
        return Ok(EntryResult::Skipped);
    };

    let envelope = match entry.envelope() {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(transaction_id = %txn, error = %e, "WAL payload failed integrity check");
            abandon(pipeline, entry, None, "WAL payload failed integrity check", &e.to_string()).await?;
            return Ok(EntryResult::Abandoned);
        }
    };

    if entry.created_at < expires_before {
        abandon(
            pipeline,
            entry,
            Some(&envelope),
            "WAL entry expired",
            &format!("unapplied since {}", entry.created_at.to_rfc3339()),
        )
        .await?;
        return Ok(EntryResult::Expired);
    }

    if entry.attempts >= pipeline.max_replay_attempts() {
        abandon(
            pipeline,
            entry,
            Some(&envelope),
            "WAL replay budget exhausted",
            entry.last_error.as_deref().unwrap_or("never reached applied"),
        )
        .await?;
        return Ok(EntryResult::Abandoned);
    }

    if pipeline.store().find_by_transaction(txn).await?.is_some() {
        // Crashed after the insert, before the commit
        pipeline.wal().commit_write(txn).await?;
        if let Some(id) = envelope.failed_event_id() {
            if let Err(e) = pipeline
                .dead_letter()
                .mark_resolved(id, PIPELINE_ACTOR, Some("stored before restart"))
                .await
            {
                debug!(failed_event_id = %id, error = %e, "Dead-letter record not resolved");
            }
        }
        info!(transaction_id = %txn, "WAL entry was already applied, committed");
        return Ok(EntryResult::AlreadyCommitted);
    }

    if let Some(outcome) = pipeline.screen(&envelope).await? {
        debug!(transaction_id = %txn, outcome = ?outcome, "WAL entry discarded on replay");
        return Ok(EntryResult::Recovered);
    }

    match pipeline.wal().begin_write(&envelope).await? {
        BeginOutcome::Started { .. } => {}
        BeginOutcome::AlreadyApplied => return Ok(EntryResult::AlreadyCommitted),
        BeginOutcome::Abandoned => return Ok(EntryResult::Abandoned),
    }

    let outcome = pipeline.apply_envelope(&envelope).await?;
    debug!(transaction_id = %txn, outcome = ?outcome, "WAL entry replayed");
    Ok(match outcome {
        DeliveryOutcome::Stored { .. } | DeliveryOutcome::Duplicate { .. } | DeliveryOutcome::Redelivery => {
            EntryResult::Recovered
        }
        DeliveryOutcome::DeadLettered { .. } => EntryResult::Failed,
        DeliveryOutcome::Requeued { .. } => EntryResult::Skipped,
    })
}

/// Dead-letter an entry that cannot be replayed and take it out of the replay set
async fn abandon(
    pipeline: &Pipeline,
    entry: &WalEntry,
    envelope: Option<&Envelope>,
    reason: &str,
    error: &str,
) -> Result<()> {
    // A corrupt payload may still decode; otherwise keep what the key tells us
    let decoded = match envelope {
        Some(envelope) => Some(envelope.clone()),
        None => Envelope::from_json(&entry.payload).ok(),
    };
    let record_id = decoded.as_ref().map(|envelope| envelope.record_id);
    let restore = decoded
        .as_ref()
        .and_then(|envelope| envelope.restored_from().zip(envelope.restore_policy()));
    let event = decoded.map(|envelope| envelope.event).unwrap_or_else(|| RawEvent {
        event_id: entry.transaction_id.clone(),
        source: source_of_key(&entry.correlation_key).unwrap_or("unknown").to_string(),
        ..Default::default()
    });

    pipeline
        .dead_letter()
        .record(NewFailedEvent {
            transaction_id: entry.transaction_id.clone(),
            correlation_key: Some(entry.correlation_key.clone()),
            record_id,
            restore,
            event,
            failure_layer: FailureLayer::ConsumerWal,
            failure_reason: reason.to_string(),
            last_error: error.to_string(),
        })
        .await?;
    pipeline.wal().mark_abandoned(&entry.transaction_id, reason).await
}

/// Periodic WAL replay plus compaction of applied entries and expired L1 keys
pub async fn run_maintenance(
    pipeline: &Pipeline,
    interval: Duration,
    applied_retention: Duration,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "WAL maintenance loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }

        match replay_pending(pipeline, Some(interval)).await {
            Ok(report) if report.recovered + report.abandoned + report.expired + report.failed > 0 => {
                info!(
                    recovered = report.recovered,
                    failed = report.failed,
                    abandoned = report.abandoned,
                    expired = report.expired,
                    "WAL retry pass"
                );
            }
            Ok(_) => {}
            Err(e) => warn!("WAL retry pass failed: {}", e),
        }

        let cutoff = now()
            - ChronoDuration::from_std(applied_retention).unwrap_or_else(|_| ChronoDuration::days(7));
        if let Err(e) = pipeline.wal().purge_applied(cutoff).await {
            warn!("WAL compaction failed: {}", e);
        }

        let expired = pipeline.cache().purge_expired();
        if expired > 0 {
            debug!(expired, "Purged expired L1 entries");
        }
    }
    info!("WAL maintenance loop stopped");
}

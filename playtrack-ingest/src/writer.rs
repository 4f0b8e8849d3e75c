//! Storage writer: bounded retry around the event store
//!
//! Transient failures are retried with exponential backoff plus jitter
//! (delay doubles from `initial_backoff` up to `max_backoff`). Validation
//! failures are not retried. Cancellation stops retrying between attempts
//! and never interrupts an attempt in progress.

use crate::storage::{EventStore, InsertOutcome, StoreError};
use playtrack_common::config::StorageConfig;
use playtrack_common::models::PlaybackEvent;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1 = first retry), without jitter
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        let spread = base.as_millis() as u64 / 4;
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Stored(InsertOutcome),
    /// Structurally invalid for the store
    Rejected { error: String },
    /// Every attempt failed with a transient error
    Exhausted { attempts: u32, last_error: String },
    /// Cancelled before the next attempt; nothing further was written
    Interrupted { attempts: u32, last_error: String },
}

#[derive(Clone)]
pub struct StorageWriter {
    store: Arc<dyn EventStore>,
    policy: RetryPolicy,
}

impl StorageWriter {
    pub fn new(store: Arc<dyn EventStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn write(&self, event: &PlaybackEvent, cancel: &CancellationToken) -> WriteOutcome {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.store.insert_if_absent(event).await {
                Ok(outcome) => {
                    if attempt > 1 {
                        debug!(
                            transaction_id = %event.transaction_id,
                            attempt,
                            "Storage write succeeded after retry"
                        );
                    }
                    return WriteOutcome::Stored(outcome);
                }
                Err(StoreError::Validation(error)) => {
                    warn!(
                        transaction_id = %event.transaction_id,
                        error = %error,
                        "Storage rejected event"
                    );
                    return WriteOutcome::Rejected { error };
                }
                Err(StoreError::Unavailable(error)) => error,
            };

            if attempt >= self.policy.max_attempts {
                warn!(
                    transaction_id = %event.transaction_id,
                    attempts = attempt,
                    error = %error,
                    "Storage retry budget exhausted"
                );
                return WriteOutcome::Exhausted {
                    attempts: attempt,
                    last_error: error,
                };
            }

            let delay = self.policy.jittered(attempt);
            warn!(
                transaction_id = %event.transaction_id,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Storage write failed, will retry after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return WriteOutcome::Interrupted {
                        attempts: attempt,
                        last_error: error,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails the first `failures` inserts, then succeeds
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
        validation: bool,
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn insert_if_absent(&self, _event: &PlaybackEvent) -> Result<InsertOutcome, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.validation {
                return Err(StoreError::Validation("bad row".into()));
            }
            if call <= self.failures {
                Err(StoreError::Unavailable("locked".into()))
            } else {
                Ok(InsertOutcome::Inserted)
            }
        }

        async fn find_by_transaction(&self, _: &str) -> Result<Option<PlaybackEvent>, StoreError> {
            Ok(None)
        }

        async fn find_by_correlation_key(&self, _: &str) -> Result<Option<PlaybackEvent>, StoreError> {
            Ok(None)
        }

        async fn get(&self, _: Uuid) -> Result<Option<PlaybackEvent>, StoreError> {
            Ok(None)
        }

        async fn count(&self) -> Result<i64, StoreError> {
            Ok(0)
        }
    }

    fn event() -> PlaybackEvent {
        let raw = playtrack_common::models::RawEvent {
            event_id: "e1".into(),
            source: "plex".into(),
            user_id: Some(1),
            rating_key: Some("1".into()),
            timestamp: Some(playtrack_common::time::now()),
            ..Default::default()
        };
        PlaybackEvent::from_raw(Uuid::new_v4(), &raw, "plex:k".into(), "t1".into(), None).unwrap()
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn writer(store: Arc<FlakyStore>, max_attempts: u32) -> StorageWriter {
        StorageWriter::new(store, policy(max_attempts))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(300));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let store = Arc::new(FlakyStore { failures: 2, calls: AtomicU32::new(0), validation: false });
        let outcome = writer(Arc::clone(&store), 5).write(&event(), &CancellationToken::new()).await;

        assert_eq!(outcome, WriteOutcome::Stored(InsertOutcome::Inserted));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_after_exact_budget() {
        let store = Arc::new(FlakyStore { failures: u32::MAX, calls: AtomicU32::new(0), validation: false });
        let outcome = writer(Arc::clone(&store), 3).write(&event(), &CancellationToken::new()).await;

        assert!(matches!(outcome, WriteOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_not_retried() {
        let store = Arc::new(FlakyStore { failures: 0, calls: AtomicU32::new(0), validation: true });
        let outcome = writer(Arc::clone(&store), 5).write(&event(), &CancellationToken::new()).await;

        assert!(matches!(outcome, WriteOutcome::Rejected { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_attempts() {
        let store = Arc::new(FlakyStore { failures: u32::MAX, calls: AtomicU32::new(0), validation: false });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = StorageWriter::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(30),
            },
        );

        let outcome = slow.write(&event(), &cancel).await;
        assert!(matches!(outcome, WriteOutcome::Interrupted { attempts: 1, .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}

//! L2: in-process partitioned broker with publish-side deduplication
//!
//! Provides the broker contract the pipeline relies on:
//! - publish is deduplicated by transaction id within a sliding window
//! - deliveries are routed to a partition by correlation key, so one
//!   consumer sees every delivery for a given key
//! - a delivery stays in flight until it is acked; nacked and un-acked
//!   deliveries are redelivered with an incremented attempt counter

use crate::delivery::Envelope;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A delivery handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: u64,
    pub partition: usize,
    /// 1 for the first delivery, incremented on each redelivery
    pub attempt: u32,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Accepted { partition: usize },
    /// Transaction id already published within the dedup window
    Duplicate {
        original_record_id: Uuid,
        original_correlation_key: String,
        /// False when the producer reused the message id for different content
        same_content: bool,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    pub published: u64,
    pub duplicates_rejected: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub queued: usize,
    pub in_flight: usize,
}

struct SeenMessage {
    at: Instant,
    record_id: Uuid,
    correlation_key: String,
    digest: String,
}

struct InFlight {
    partition: usize,
    attempt: u32,
    envelope: Envelope,
}

struct Queued {
    delivery_id: u64,
    attempt: u32,
    envelope: Envelope,
}

struct BrokerState {
    partitions: Vec<VecDeque<Queued>>,
    in_flight: HashMap<u64, InFlight>,
    seen: HashMap<String, SeenMessage>,
    next_delivery_id: u64,
    stats: BrokerStats,
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    wakers: Vec<Notify>,
    dedup_window: Duration,
}

impl MemoryBroker {
    pub fn new(partitions: usize, dedup_window: Duration) -> Self {
        let partitions = partitions.max(1);
        Self {
            state: Mutex::new(BrokerState {
                partitions: (0..partitions).map(|_| VecDeque::new()).collect(),
                in_flight: HashMap::new(),
                seen: HashMap::new(),
                next_delivery_id: 0,
                stats: BrokerStats::default(),
            }),
            wakers: (0..partitions).map(|_| Notify::new()).collect(),
            dedup_window,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.wakers.len()
    }

    pub fn partition_for(&self, correlation_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        correlation_key.hash(&mut hasher);
        (hasher.finish() % self.wakers.len() as u64) as usize
    }

    pub fn publish(&self, envelope: Envelope) -> PublishOutcome {
        let digest = envelope.event_digest();
        let partition = self.partition_for(&envelope.correlation_key);
        let now = Instant::now();

        {
            let mut state = self.state.lock();
            let window = self.dedup_window;
            state.seen.retain(|_, seen| now.duration_since(seen.at) < window);

            if let Some(seen) = state.seen.get(&envelope.transaction_id) {
                let outcome = PublishOutcome::Duplicate {
                    original_record_id: seen.record_id,
                    original_correlation_key: seen.correlation_key.clone(),
                    same_content: seen.digest == digest,
                };
                state.stats.duplicates_rejected += 1;
                debug!(
                    transaction_id = %envelope.transaction_id,
                    "Broker rejected duplicate publish"
                );
                return outcome;
            }

            state.seen.insert(
                envelope.transaction_id.clone(),
                SeenMessage {
                    at: now,
                    record_id: envelope.record_id,
                    correlation_key: envelope.correlation_key.clone(),
                    digest,
                },
            );
            state.next_delivery_id += 1;
            let delivery_id = state.next_delivery_id;
            state.partitions[partition].push_back(Queued {
                delivery_id,
                attempt: 1,
                envelope,
            });
            state.stats.published += 1;
        }

        self.wakers[partition].notify_one();
        PublishOutcome::Accepted { partition }
    }

    /// Take the next queued delivery from a partition without waiting
    pub fn try_fetch(&self, partition: usize) -> Option<Delivery> {
        let mut state = self.state.lock();
        let queued = state.partitions.get_mut(partition)?.pop_front()?;
        state.in_flight.insert(
            queued.delivery_id,
            InFlight {
                partition,
                attempt: queued.attempt,
                envelope: queued.envelope.clone(),
            },
        );
        Some(Delivery {
            delivery_id: queued.delivery_id,
            partition,
            attempt: queued.attempt,
            envelope: queued.envelope,
        })
    }

    /// Wait for the next delivery on a partition; `None` once cancelled
    pub async fn next(&self, partition: usize, cancel: &CancellationToken) -> Option<Delivery> {
        let waker = self.wakers.get(partition)?;
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(delivery) = self.try_fetch(partition) {
                return Some(delivery);
            }
            tokio::select! {
                _ = waker.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn ack(&self, delivery_id: u64) {
        let mut state = self.state.lock();
        if state.in_flight.remove(&delivery_id).is_some() {
            state.stats.acked += 1;
        } else {
            warn!(delivery_id, "Ack for unknown delivery");
        }
    }

    /// Return a delivery to the front of its partition for redelivery
    pub fn nack(&self, delivery_id: u64) {
        let partition = {
            let mut state = self.state.lock();
            let Some(in_flight) = state.in_flight.remove(&delivery_id) else {
                warn!(delivery_id, "Nack for unknown delivery");
                return;
            };
            let partition = in_flight.partition;
            state.partitions[partition].push_front(Queued {
                delivery_id,
                attempt: in_flight.attempt + 1,
                envelope: in_flight.envelope,
            });
            state.stats.redelivered += 1;
            partition
        };
        self.wakers[partition].notify_one();
    }

    /// Requeue every un-acked delivery, as after a consumer crash.
    /// Returns how many were requeued.
    pub fn redeliver_unacked(&self) -> usize {
        let touched: Vec<usize> = {
            let mut state = self.state.lock();
            let mut drained: Vec<(u64, InFlight)> = state.in_flight.drain().collect();
            drained.sort_by_key(|(id, _)| *id);
            let mut touched = Vec::with_capacity(drained.len());
            for (delivery_id, in_flight) in drained {
                let partition = in_flight.partition;
                state.partitions[partition].push_back(Queued {
                    delivery_id,
                    attempt: in_flight.attempt + 1,
                    envelope: in_flight.envelope,
                });
                state.stats.redelivered += 1;
                touched.push(partition);
            }
            touched
        };

        for partition in &touched {
            self.wakers[*partition].notify_one();
        }
        touched.len()
    }

    /// True while a delivery for the transaction is queued or in flight
    pub fn contains(&self, transaction_id: &str) -> bool {
        let state = self.state.lock();
        state.in_flight.values().any(|d| d.envelope.transaction_id == transaction_id)
            || state
                .partitions
                .iter()
                .flatten()
                .any(|q| q.envelope.transaction_id == transaction_id)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().partitions.iter().map(VecDeque::len).sum()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Nothing queued and nothing awaiting ack
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.in_flight.is_empty() && state.partitions.iter().all(VecDeque::is_empty)
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.queued = state.partitions.iter().map(VecDeque::len).sum();
        stats.in_flight = state.in_flight.len();
        stats
    }
}

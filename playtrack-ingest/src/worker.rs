//! Consumer workers, one per broker partition
//!
//! Same-key deliveries always land on the same partition, so per-key order
//! is preserved within a worker. On shutdown a worker finishes the delivery
//! in hand and stops fetching; anything still queued or un-acked is left
//! to broker redelivery and WAL recovery.

use crate::pipeline::{DeliveryOutcome, Pipeline};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEUE_BACKOFF_INITIAL: Duration = Duration::from_millis(25);
const REQUEUE_BACKOFF_MAX: Duration = Duration::from_secs(2);
const IDLE_POLL: Duration = Duration::from_millis(20);

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start one worker per partition, stopped by the pipeline's shutdown token
    pub fn spawn(pipeline: Arc<Pipeline>) -> Self {
        let cancel = pipeline.shutdown_token();
        let handles = (0..pipeline.broker().partition_count())
            .map(|partition| {
                tokio::spawn(run_worker(Arc::clone(&pipeline), partition, cancel.clone()))
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Worker pool started");
        Self {
            pipeline,
            cancel,
            handles,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait until the broker has nothing queued or in flight.
    /// Returns false if `timeout` elapsed or shutdown began first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pipeline.broker().is_idle() {
                return true;
            }
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Cancel and join every worker
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }

        let broker = self.pipeline.broker();
        info!(
            queued = broker.queued(),
            in_flight = broker.in_flight(),
            "Worker pool stopped"
        );
    }
}

async fn run_worker(pipeline: Arc<Pipeline>, partition: usize, cancel: CancellationToken) {
    debug!(partition, "Worker started");
    let mut backoff = REQUEUE_BACKOFF_INITIAL;

    while let Some(delivery) = pipeline.broker().next(partition, &cancel).await {
        match pipeline.process_delivery(delivery).await {
            DeliveryOutcome::Requeued { reason } => {
                debug!(partition, backoff_ms = backoff.as_millis() as u64, reason = %reason, "Delivery requeued");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break,
                }
                backoff = (backoff * 2).min(REQUEUE_BACKOFF_MAX);
            }
            _ => backoff = REQUEUE_BACKOFF_INITIAL,
        }
    }

    debug!(partition, "Worker stopped");
}

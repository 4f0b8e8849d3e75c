//! Operator surface over the dead-letter store and the audit ledger
//!
//! Every state change here is itself an audited transition carrying the
//! acting operator; nothing overwrites a record silently.

use crate::audit::AuditFilter;
use crate::broker::BrokerStats;
use crate::dead_letter::{FailedEventCounts, FailedEventFilter};
use crate::pipeline::{ConsumerStatsSnapshot, IngestOutcome, Pipeline, RestoreOutcome};
use crate::wal::WalStats;
use playtrack_common::models::{DedupeAuditEntry, DedupeAuditStats, FailedEvent, RestorePolicy};
use playtrack_common::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Counts an operator dashboard needs
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub events_stored: i64,
    pub l1_entries: usize,
    pub consumer: ConsumerStatsSnapshot,
    pub broker: BrokerStats,
    pub wal: WalStats,
    pub failed_events: FailedEventCounts,
    pub audit: DedupeAuditStats,
}

fn require_actor(actor: &str) -> Result<&str> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(Error::InvalidInput("an acting operator is required".to_string()));
    }
    Ok(actor)
}

#[derive(Clone)]
pub struct AdminService {
    pipeline: Arc<Pipeline>,
}

impl AdminService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn overview(&self) -> Result<Overview> {
        Ok(Overview {
            events_stored: self.pipeline.store().count().await?,
            l1_entries: self.pipeline.cache().len(),
            consumer: self.pipeline.stats(),
            broker: self.pipeline.broker().stats(),
            wal: self.pipeline.wal().stats().await?,
            failed_events: self.pipeline.dead_letter().counts().await?,
            audit: self.pipeline.audit().stats().await?,
        })
    }

    pub async fn list_failed(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEvent>> {
        self.pipeline.dead_letter().list(filter).await
    }

    pub async fn get_failed(&self, id: Uuid) -> Result<FailedEvent> {
        self.pipeline.dead_letter().require(id).await
    }

    /// Re-submit a failed event now, ignoring its backoff
    pub async fn retry_failed(&self, id: Uuid) -> Result<IngestOutcome> {
        self.pipeline.resubmit_failed(id).await
    }

    pub async fn abandon_failed(&self, id: Uuid, actor: &str, notes: Option<&str>) -> Result<FailedEvent> {
        let actor = require_actor(actor)?;
        self.pipeline.dead_letter().abandon(id, actor, notes).await
    }

    pub async fn resolve_failed(&self, id: Uuid, actor: &str, notes: Option<&str>) -> Result<FailedEvent> {
        let actor = require_actor(actor)?;
        self.pipeline.dead_letter().mark_resolved(id, actor, notes).await
    }

    pub async fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<DedupeAuditEntry>> {
        self.pipeline.audit().list(filter).await
    }

    pub async fn get_audit(&self, id: Uuid) -> Result<DedupeAuditEntry> {
        self.pipeline.audit().require(id).await
    }

    pub async fn confirm(&self, id: Uuid, actor: &str, notes: Option<&str>) -> Result<DedupeAuditEntry> {
        let actor = require_actor(actor)?;
        self.pipeline.audit().confirm(id, actor, notes).await
    }

    pub async fn restore(
        &self,
        id: Uuid,
        actor: &str,
        notes: Option<&str>,
        policy: RestorePolicy,
    ) -> Result<RestoreOutcome> {
        let actor = require_actor(actor)?;
        self.pipeline.restore(id, actor, notes, policy).await
    }

    pub async fn audit_stats(&self) -> Result<DedupeAuditStats> {
        self.pipeline.audit().stats().await
    }

    pub async fn cleanup_audit(&self, retention_days: u32) -> Result<u64> {
        self.pipeline.audit().cleanup(retention_days).await
    }

    /// Process queued deliveries in the calling task, for use without a worker pool
    pub async fn drain(&self) -> usize {
        self.pipeline.drain().await
    }
}

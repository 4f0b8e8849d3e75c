//! L1 dedup: in-process exact-match cache shared by all workers
//!
//! Every check is a single check-and-record under one lock, so two workers
//! holding deliveries with the same key can never both be told "fresh".
//! The lock is never held across an `.await`.

use crate::correlation::{cross_source_similarity, is_known_cross_source};
use crate::exact_cache::ExactLru;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use playtrack_common::config::CacheConfig;
use playtrack_common::models::{DedupeReason, KNOWN_CROSS_SOURCES};
use tracing::debug;
use uuid::Uuid;

/// The delivery that currently owns a cache key
#[derive(Debug, Clone, PartialEq)]
pub struct KeptRef {
    /// Stored record id of the kept event
    pub record_id: Uuid,
    pub transaction_id: String,
    pub correlation_key: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: Option<i64>,
}

/// What L1 needs to know about a delivery
#[derive(Debug, Clone)]
pub struct CacheCandidate {
    pub kept: KeptRef,
    pub event_id: String,
    pub session_key: Option<String>,
    pub cross_source_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// No live key matched; the candidate's keys are now recorded
    Fresh,
    /// The same transaction already owns a key (transport redelivery)
    Redelivery,
    Duplicate {
        kept: KeptRef,
        reason: DedupeReason,
        similarity: Option<f64>,
    },
}

pub struct LocalDedupCache {
    entries: Mutex<ExactLru<KeptRef>>,
    session_key_dedup: bool,
    cross_source_dedup: bool,
    min_similarity: f64,
    bucket_secs: u64,
}

fn corr_key(key: &str) -> String {
    format!("corr:{}", key)
}

fn event_key(source: &str, event_id: &str) -> String {
    format!("evt:{}:{}", source, event_id)
}

fn session_cache_key(source: &str, session: &str) -> String {
    format!("sess:{}:{}", source, session)
}

fn xsrc_key(source: &str, cross_key: &str) -> String {
    format!("xsrc:{}:{}", source, cross_key)
}

impl LocalDedupCache {
    pub fn new(config: &CacheConfig, bucket_secs: u64) -> Self {
        Self {
            entries: Mutex::new(ExactLru::new(config.capacity, config.ttl())),
            session_key_dedup: config.session_key_dedup,
            cross_source_dedup: config.cross_source_dedup,
            min_similarity: config.cross_source_min_similarity,
            bucket_secs,
        }
    }

    /// `Seen(key)` on a raw cache key
    pub fn seen(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    /// `Record(key)` on a raw cache key
    pub fn record(&self, key: &str, kept: KeptRef) {
        self.entries.lock().insert(key.to_string(), kept);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.lock().purge_expired()
    }

    /// Atomic check-and-record.
    ///
    /// Checks, in order: correlation key, event id, session key (when
    /// enabled), then the lower-confidence cross-source pass. A fresh
    /// candidate has all its keys recorded before the lock is released.
    pub fn check_and_record(&self, candidate: &CacheCandidate) -> CacheDecision {
        let mut entries = self.entries.lock();
        let kept = &candidate.kept;

        let mut exact = vec![(
            corr_key(&kept.correlation_key),
            DedupeReason::CorrelationKey,
        )];
        exact.push((event_key(&kept.source, &candidate.event_id), DedupeReason::EventId));
        if self.session_key_dedup {
            if let Some(session) = &candidate.session_key {
                exact.push((session_cache_key(&kept.source, session), DedupeReason::SessionKey));
            }
        }

        for (key, reason) in &exact {
            if let Some(existing) = entries.get(key) {
                if existing.transaction_id == kept.transaction_id {
                    return CacheDecision::Redelivery;
                }
                debug!(
                    transaction_id = %kept.transaction_id,
                    kept_transaction_id = %existing.transaction_id,
                    reason = %reason,
                    "L1 exact match"
                );
                return CacheDecision::Duplicate {
                    kept: existing,
                    reason: *reason,
                    similarity: None,
                };
            }
        }

        if let Some(decision) = self.cross_source_match(&mut entries, candidate) {
            return decision;
        }

        for (key, _) in exact {
            entries.insert(key, kept.clone());
        }
        if let Some(cross) = self.cross_source_slot(candidate) {
            entries.insert(cross, kept.clone());
        }
        CacheDecision::Fresh
    }

    /// Record `kept` as the owner of every key the candidate would have recorded.
    ///
    /// Used when storage reveals a different record already owns the key.
    pub fn record_kept(&self, candidate: &CacheCandidate, kept: &KeptRef) {
        let mut entries = self.entries.lock();
        entries.insert(corr_key(&candidate.kept.correlation_key), kept.clone());
        entries.insert(event_key(&candidate.kept.source, &candidate.event_id), kept.clone());
        if self.session_key_dedup {
            if let Some(session) = &candidate.session_key {
                entries.insert(session_cache_key(&candidate.kept.source, session), kept.clone());
            }
        }
    }

    /// Drop keys still owned by the candidate's transaction.
    ///
    /// Called when the delivery never reached storage, so a later delivery of
    /// the same playback is not discarded against a record that does not exist.
    pub fn release(&self, candidate: &CacheCandidate) {
        let mut entries = self.entries.lock();
        let mut keys = vec![
            corr_key(&candidate.kept.correlation_key),
            event_key(&candidate.kept.source, &candidate.event_id),
        ];
        if let Some(session) = &candidate.session_key {
            keys.push(session_cache_key(&candidate.kept.source, session));
        }
        if let Some(cross) = self.cross_source_slot(candidate) {
            keys.push(cross);
        }

        for key in keys {
            let owned = entries
                .get(&key)
                .map(|existing| existing.transaction_id == candidate.kept.transaction_id)
                .unwrap_or(false);
            if owned {
                entries.remove(&key);
            }
        }
    }

    fn cross_source_slot(&self, candidate: &CacheCandidate) -> Option<String> {
        if !self.cross_source_dedup || !is_known_cross_source(&candidate.kept.source) {
            return None;
        }
        candidate
            .cross_source_key
            .as_deref()
            .map(|cross| xsrc_key(&candidate.kept.source, cross))
    }

    fn cross_source_match(
        &self,
        entries: &mut ExactLru<KeptRef>,
        candidate: &CacheCandidate,
    ) -> Option<CacheDecision> {
        self.cross_source_slot(candidate)?;
        let cross = candidate.cross_source_key.as_deref()?;
        let kept = &candidate.kept;

        for other in KNOWN_CROSS_SOURCES.iter().filter(|s| **s != kept.source) {
            let existing = match entries.get(&xsrc_key(other, cross)) {
                Some(existing) => existing,
                None => continue,
            };
            let score = cross_source_similarity(
                kept.started_at,
                kept.duration_secs,
                existing.started_at,
                existing.duration_secs,
                self.bucket_secs,
            );
            if score >= self.min_similarity {
                debug!(
                    transaction_id = %kept.transaction_id,
                    kept_source = %existing.source,
                    similarity = score,
                    "L1 cross-source match"
                );
                return Some(CacheDecision::Duplicate {
                    kept: existing,
                    reason: DedupeReason::CrossSourceKey,
                    similarity: Some(score),
                });
            }
            debug!(
                transaction_id = %kept.transaction_id,
                kept_source = %existing.source,
                similarity = score,
                "Cross-source candidate below similarity threshold, keeping both"
            );
        }
        None
    }
}

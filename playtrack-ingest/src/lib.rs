//! playtrack-ingest - exactly-once playback event ingestion
//!
//! Turns an at-least-once, multi-source stream of playback events into a
//! deduplicated event store. Layers, fastest first:
//!
//! - L1: in-process exact-match LRU cache ([`local_dedup`])
//! - L2: broker publish dedup by transaction id ([`broker`])
//! - L3: unique correlation key in storage ([`storage`])
//!
//! The consumer WAL ([`wal`]) makes the storage write replayable after a
//! crash. Discards are recorded in the audit ledger ([`audit`]), failures in
//! the dead-letter store ([`dead_letter`]).

pub mod admin;
pub mod audit;
pub mod broker;
pub mod correlation;
pub mod db_retry;
pub mod dead_letter;
pub mod delivery;
pub mod exact_cache;
pub mod local_dedup;
pub mod pipeline;
pub mod recovery;
pub mod retry_scheduler;
pub mod storage;
pub mod wal;
pub mod worker;
pub mod writer;

pub use admin::AdminService;
pub use pipeline::{DeliveryOutcome, IngestOutcome, Pipeline};
pub use recovery::{recover_on_startup, RecoveryReport};
pub use worker::WorkerPool;

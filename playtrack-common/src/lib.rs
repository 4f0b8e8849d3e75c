//! # Playtrack Common Library
//!
//! Shared code for the playtrack ingestion services:
//! - Error type and `Result` alias
//! - Bootstrap configuration (TOML) and root folder resolution
//! - SQLite schema for the event store, dead-letter store, audit ledger and consumer WAL
//! - Playback event, failed event and dedup audit data model
//! - Time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod time;

pub use error::{Error, Result};

//! # spoolguard-store
//!
//! SQLite persistence for the Spoolguard print-queue manager.
//!
//! Holds everything the service owns durably: API keys and kiosk device
//! tokens (hashed), per-job submission metadata and claim state, the
//! device/email identity mapping tables, and the fixed-window rate-limit
//! counters.  The live print jobs themselves belong to the external spooler
//! and are never mirrored here.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every domain model.

pub mod database;
pub mod jobs;
pub mod keys;
pub mod kiosks;
pub mod mappings;
pub mod migrations;
pub mod models;
pub mod rate_limit;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;

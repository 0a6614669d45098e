//! Plaid Transaction Sync Tool
//!
//! Keeps a local mirror of a user's bank transactions and balances in step
//! with an aggregator (Plaid):
//! - Cursor-based incremental sync that survives crashes and retries
//! - Balance reads served from a short-lived snapshot cache
//! - Access tokens sealed with AES-256-GCM under a versioned key ring
//! - Flat-file or SQLite storage behind one trait
//!
//! SYNC LOOP:
//! LOAD CURSOR → FETCH PAGE → VALIDATE → COMMIT (DELTA + CURSOR) → MORE?

pub mod aggregator;
pub mod api;
pub mod app;
pub mod balance;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod models;
pub mod reconciler;
pub mod retry;
pub mod storage;
pub mod tools;
pub mod vault;

pub use error::Result;

// Re-export common types
pub use models::*;

//! Bidirectional record synchronization engine for Frigg integrations.
//!
//! The crate keeps two connected modules (e.g. a Crossbeam workspace and a
//! Monday.com board) holding the same logical records in step:
//!
//! - `hash`: deterministic content hashing over ordered canonical values.
//! - `config`: sync type configuration (ordered canonical keys, match keys,
//!   per-module field maps in both directions).
//! - `record`: the transient per-record wrapper carrying canonical data and
//!   its match/identity hashes.
//! - `module`: the capability trait a module manager implements to take part
//!   in a sync, plus an in-memory implementation.
//! - `store`: durable sync state in SQLite (entities, native identifiers,
//!   content hash) for idempotent reconciliation across runs.
//! - `manager`: the orchestrator driving initial and incremental sync.

pub mod config;
pub mod error;
pub mod hash;
pub mod manager;
pub mod module;
pub mod record;
pub mod store;

pub use config::{ModuleMapping, SyncDefinition, SyncSettings, SyncTypeConfig};
pub use error::{Result, SyncError};
pub use manager::{SyncContext, SyncManager, SyncReport};
pub use module::{MemoryModule, OutcomeKind, RecordOutcome, SyncModule};
pub use record::SyncRecord;
pub use store::{DataIdentifier, Pool, SyncRow};

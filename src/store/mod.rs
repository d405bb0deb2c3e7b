//! Sync store: durable sync state and its SQL repository.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by the repository.
//! - `repo`: SQL-only functions that map rows into those types.
//!
//! External modules should import from `frigg_sync::store` — we re-export the
//! repository API and the row types for convenience.

pub mod model;
pub mod repo;

pub use model::{DataIdentifier, SyncRow};
pub use repo::*;

//! Typed storage operations for the Afterword vault datastore
//!
//! The heartbeat worker never issues raw queries; every table, bucket and
//! admin operation it needs is a named method on the [`store::VaultStore`]
//! trait. [`supabase::SupabaseStore`] implements the trait against the
//! production datastore (PostgREST, Storage, GoTrue admin); the in-memory
//! [`memory::MemoryStore`] backs the worker's scenario tests.

#![deny(clippy::all)]

/// Error types for storage operations
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
/// The narrow operation set consumed by the heartbeat worker
pub mod store;
/// Supabase-backed implementation
pub mod supabase;
/// Row types for the vault tables
pub mod types;

pub use error::{StorageError, StorageResult};
pub use store::{ReminderStage, VaultStore};
pub use supabase::SupabaseStore;
pub use types::{
    ActionType, EntryStatus, EnvelopeCiphertext, Profile, ProfileStatus, PushDevice, VaultEntry,
    VaultEntryTombstone,
};

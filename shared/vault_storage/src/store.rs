//! The narrow operation set the heartbeat worker consumes
//!
//! Every query the worker runs is a named method here, so the cycle logic is
//! testable against [`crate::memory::MemoryStore`] and so the serialization
//! point of the whole system — the conditional entry-status transitions — is
//! visible in one place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;
use crate::types::{Profile, PushDevice, VaultEntry, VaultEntryTombstone};

/// Which staged reminder push a timestamp column belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderStage {
    /// 66 % of the timer remaining
    TwoThirds,
    /// 33 % of the timer remaining
    OneThird,
}

/// Narrow table/bucket/admin operations over the vault datastore
///
/// Conditional updates return whether a row was actually mutated; zero
/// affected rows is how concurrent runners stay out of each other's way, so
/// callers must treat `false` as "someone else owns it", never as an error.
#[async_trait]
pub trait VaultStore: Send + Sync {
    // ---- profiles ----

    /// One keyset page of active profiles, ascending by id
    async fn active_profiles_page(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>>;

    /// One keyset page of inactive profiles whose grace period started
    /// before `cutoff`
    async fn inactive_grace_expired_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>>;

    /// One keyset page of active profiles created before `cutoff`
    /// (bot-sweep candidates)
    async fn active_profiles_created_before_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>>;

    /// Single profile lookup (sender-name resolution during sweeps)
    async fn fetch_profile(&self, user_id: &str) -> StorageResult<Option<Profile>>;

    /// Stamps `warning_sent_at`
    async fn mark_warning_sent(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()>;

    /// Stamps `push_66_sent_at` or `push_33_sent_at`
    async fn mark_reminder_push_sent(
        &self,
        user_id: &str,
        stage: ReminderStage,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Execution delivered at least one entry: profile enters the 30-day
    /// grace period (inactive, timer 30, `protocol_executed_at` stamped,
    /// reminder stamps cleared, vault activity recorded)
    async fn begin_grace_period(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()>;

    /// Fresh-active reset: active, timer 30, `last_check_in = at`, all
    /// reminder/execution stamps cleared, vault activity recorded
    async fn reset_profile_fresh_active(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Marks that execution touched this profile without changing its state
    async fn record_vault_activity(&self, user_id: &str) -> StorageResult<()>;

    /// Reverts paid-tier artifacts after a downgrade: timer 30,
    /// `last_check_in = at`, reminder stamps cleared, theme and soul-fire
    /// nulled
    async fn revert_profile_downgrade(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    // ---- vault entries ----

    /// All active entries belonging to the given users, for in-memory
    /// grouping
    async fn active_entries_for_users(
        &self,
        user_ids: &[String],
    ) -> StorageResult<Vec<VaultEntry>>;

    /// Optimistic claim: `active → sending`. Returns whether this runner
    /// now owns the entry.
    async fn claim_entry(&self, entry_id: &str) -> StorageResult<bool>;

    /// Symmetric release: `sending → active`. A `false` return means the
    /// entry moved on (typically to `sent`) and must be left alone.
    async fn release_entry(&self, entry_id: &str) -> StorageResult<bool>;

    /// Finalize: `sending → sent`, stamping `sent_at`
    async fn mark_entry_sent(&self, entry_id: &str, at: DateTime<Utc>) -> StorageResult<bool>;

    /// Unconditional row delete (destroy entries and swept sent entries)
    async fn delete_entry(&self, entry_id: &str) -> StorageResult<()>;

    /// Entries still in {active, sending} for a user
    async fn count_pending_entries(&self, user_id: &str) -> StorageResult<i64>;

    /// All entries for a user, any status
    async fn count_entries(&self, user_id: &str) -> StorageResult<i64>;

    /// One keyset page of sent entries delivered before `cutoff`
    async fn sent_entries_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<VaultEntry>>;

    /// Returns entries stuck in `sending` since before `cutoff` to
    /// `active`; returns how many were recovered
    async fn release_stale_sending(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    // ---- tombstones ----

    /// Insert-only history marker; a duplicate primary key is a silent no-op
    async fn insert_tombstone(&self, tombstone: &VaultEntryTombstone) -> StorageResult<()>;

    /// Tombstones recorded for a user
    async fn count_tombstones(&self, user_id: &str) -> StorageResult<i64>;

    // ---- push devices ----

    /// Device tokens registered by a user
    async fn push_devices_for_user(&self, user_id: &str) -> StorageResult<Vec<PushDevice>>;

    /// Drops a token the provider reported invalid
    async fn delete_push_device(&self, token: &str) -> StorageResult<()>;

    // ---- object store ----

    /// Removes an audio blob; callers treat failures as best-effort
    async fn remove_audio_object(&self, path: &str) -> StorageResult<()>;

    // ---- auth admin ----

    /// Deletes the auth user; cascades to profile, entries and devices
    async fn delete_auth_user(&self, user_id: &str) -> StorageResult<()>;
}

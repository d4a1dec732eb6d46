//! In-memory [`VaultStore`] fake for tests
//!
//! Mirrors the conditional-update semantics of the real datastore: claims,
//! releases and finalizes only mutate rows in the expected source state, and
//! keyset pages come back in ascending id order. State lives behind a
//! `Mutex` so a single fake can be shared across the worker's components the
//! same way the real store is.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;
use crate::store::{ReminderStage, VaultStore};
use crate::types::{
    EntryStatus, Profile, ProfileStatus, PushDevice, VaultEntry, VaultEntryTombstone,
};

#[derive(Default)]
struct State {
    profiles: BTreeMap<String, Profile>,
    entries: BTreeMap<String, VaultEntry>,
    tombstones: BTreeMap<String, VaultEntryTombstone>,
    devices: Vec<PushDevice>,
    removed_audio: Vec<String>,
    deleted_users: Vec<String>,
}

/// Shared in-memory datastore fake
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a profile row
    pub fn put_profile(&self, profile: Profile) {
        let mut state = self.state.lock().unwrap();
        state.profiles.insert(profile.id.clone(), profile);
    }

    /// Seeds an entry row
    pub fn put_entry(&self, entry: VaultEntry) {
        let mut state = self.state.lock().unwrap();
        state.entries.insert(entry.id.clone(), entry);
    }

    /// Seeds a device token
    pub fn put_device(&self, device: PushDevice) {
        self.state.lock().unwrap().devices.push(device);
    }

    /// Seeds a tombstone row
    pub fn put_tombstone(&self, tombstone: VaultEntryTombstone) {
        let mut state = self.state.lock().unwrap();
        state
            .tombstones
            .insert(tombstone.vault_entry_id.clone(), tombstone);
    }

    /// Snapshot of a profile row
    #[must_use]
    pub fn profile(&self, user_id: &str) -> Option<Profile> {
        self.state.lock().unwrap().profiles.get(user_id).cloned()
    }

    /// Snapshot of an entry row; `None` after deletion
    #[must_use]
    pub fn entry(&self, entry_id: &str) -> Option<VaultEntry> {
        self.state.lock().unwrap().entries.get(entry_id).cloned()
    }

    /// Snapshot of all entries for a user
    #[must_use]
    pub fn entries_for_user(&self, user_id: &str) -> Vec<VaultEntry> {
        self.state
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Snapshot of a tombstone row
    #[must_use]
    pub fn tombstone(&self, entry_id: &str) -> Option<VaultEntryTombstone> {
        self.state.lock().unwrap().tombstones.get(entry_id).cloned()
    }

    /// Audio object paths removed so far
    #[must_use]
    pub fn removed_audio(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_audio.clone()
    }

    /// Auth users deleted so far
    #[must_use]
    pub fn deleted_users(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_users.clone()
    }

    /// Device tokens still registered
    #[must_use]
    pub fn device_tokens(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .devices
            .iter()
            .map(|d| d.token.clone())
            .collect()
    }

    fn update_profile(&self, user_id: &str, apply: impl FnOnce(&mut Profile)) {
        let mut state = self.state.lock().unwrap();
        if let Some(profile) = state.profiles.get_mut(user_id) {
            apply(profile);
        }
    }

    fn clear_reminder_stamps(profile: &mut Profile) {
        profile.warning_sent_at = None;
        profile.push_66_sent_at = None;
        profile.push_33_sent_at = None;
    }
}

#[async_trait]
impl VaultStore for MemoryStore {
    async fn active_profiles_page(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .profiles
            .values()
            .filter(|p| p.status == ProfileStatus::Active)
            .filter(|p| after_id.is_none_or(|last| p.id.as_str() > last))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn inactive_grace_expired_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .profiles
            .values()
            .filter(|p| p.status == ProfileStatus::Inactive)
            .filter(|p| p.protocol_executed_at.is_some_and(|at| at < cutoff))
            .filter(|p| after_id.is_none_or(|last| p.id.as_str() > last))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn active_profiles_created_before_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .profiles
            .values()
            .filter(|p| p.status == ProfileStatus::Active)
            .filter(|p| p.created_at.is_some_and(|at| at < cutoff))
            .filter(|p| after_id.is_none_or(|last| p.id.as_str() > last))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_profile(&self, user_id: &str) -> StorageResult<Option<Profile>> {
        Ok(self.profile(user_id))
    }

    async fn mark_warning_sent(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.update_profile(user_id, |p| p.warning_sent_at = Some(at));
        Ok(())
    }

    async fn mark_reminder_push_sent(
        &self,
        user_id: &str,
        stage: ReminderStage,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.update_profile(user_id, |p| match stage {
            ReminderStage::TwoThirds => p.push_66_sent_at = Some(at),
            ReminderStage::OneThird => p.push_33_sent_at = Some(at),
        });
        Ok(())
    }

    async fn begin_grace_period(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.update_profile(user_id, |p| {
            p.status = ProfileStatus::Inactive;
            p.timer_days = Some(30);
            p.protocol_executed_at = Some(at);
            p.had_vault_activity = true;
            Self::clear_reminder_stamps(p);
        });
        Ok(())
    }

    async fn reset_profile_fresh_active(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.update_profile(user_id, |p| {
            p.status = ProfileStatus::Active;
            p.timer_days = Some(30);
            p.last_check_in = Some(at);
            p.protocol_executed_at = None;
            p.had_vault_activity = true;
            Self::clear_reminder_stamps(p);
        });
        Ok(())
    }

    async fn record_vault_activity(&self, user_id: &str) -> StorageResult<()> {
        self.update_profile(user_id, |p| p.had_vault_activity = true);
        Ok(())
    }

    async fn revert_profile_downgrade(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.update_profile(user_id, |p| {
            p.timer_days = Some(30);
            p.last_check_in = Some(at);
            p.selected_theme = None;
            p.selected_soul_fire = None;
            Self::clear_reminder_stamps(p);
        });
        Ok(())
    }

    async fn active_entries_for_users(
        &self,
        user_ids: &[String],
    ) -> StorageResult<Vec<VaultEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Active)
            .filter(|e| user_ids.contains(&e.user_id))
            .cloned()
            .collect())
    }

    async fn claim_entry(&self, entry_id: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get_mut(entry_id) {
            Some(entry) if entry.status == EntryStatus::Active => {
                entry.status = EntryStatus::Sending;
                entry.updated_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_entry(&self, entry_id: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get_mut(entry_id) {
            Some(entry) if entry.status == EntryStatus::Sending => {
                entry.status = EntryStatus::Active;
                entry.updated_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_entry_sent(&self, entry_id: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get_mut(entry_id) {
            Some(entry) if entry.status == EntryStatus::Sending => {
                entry.status = EntryStatus::Sent;
                entry.sent_at = Some(at);
                entry.updated_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_entry(&self, entry_id: &str) -> StorageResult<()> {
        self.state.lock().unwrap().entries.remove(entry_id);
        Ok(())
    }

    async fn count_pending_entries(&self, user_id: &str) -> StorageResult<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .values()
            .filter(|e| e.user_id == user_id)
            .filter(|e| matches!(e.status, EntryStatus::Active | EntryStatus::Sending))
            .count() as i64)
    }

    async fn count_entries(&self, user_id: &str) -> StorageResult<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .values()
            .filter(|e| e.user_id == user_id)
            .count() as i64)
    }

    async fn sent_entries_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<VaultEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Sent)
            .filter(|e| e.sent_at.is_some_and(|at| at < cutoff))
            .filter(|e| after_id.is_none_or(|last| e.id.as_str() > last))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn release_stale_sending(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.state.lock().unwrap();
        let mut recovered = 0;
        for entry in state.entries.values_mut() {
            if entry.status == EntryStatus::Sending
                && entry.updated_at.is_some_and(|at| at < cutoff)
            {
                entry.status = EntryStatus::Active;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn insert_tombstone(&self, tombstone: &VaultEntryTombstone) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .tombstones
            .entry(tombstone.vault_entry_id.clone())
            .or_insert_with(|| tombstone.clone());
        Ok(())
    }

    async fn count_tombstones(&self, user_id: &str) -> StorageResult<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tombstones
            .values()
            .filter(|t| t.user_id == user_id)
            .count() as i64)
    }

    async fn push_devices_for_user(&self, user_id: &str) -> StorageResult<Vec<PushDevice>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_push_device(&self, token: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.devices.retain(|d| d.token != token);
        Ok(())
    }

    async fn remove_audio_object(&self, path: &str) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .removed_audio
            .push(path.to_string());
        Ok(())
    }

    async fn delete_auth_user(&self, user_id: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.profiles.remove(user_id);
        let entry_ids: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.id.clone())
            .collect();
        for id in entry_ids {
            state.entries.remove(&id);
        }
        state.devices.retain(|d| d.user_id != user_id);
        state.deleted_users.push(user_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, status: &str) -> VaultEntry {
        serde_json::from_value(json!({
            "id": id,
            "user_id": "u1",
            "status": status,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryStore::new();
        store.put_entry(entry("e1", "active"));

        assert!(store.claim_entry("e1").await.unwrap());
        assert!(!store.claim_entry("e1").await.unwrap());
        assert_eq!(store.entry("e1").unwrap().status, EntryStatus::Sending);
    }

    #[tokio::test]
    async fn release_never_unseats_sent() {
        let store = MemoryStore::new();
        store.put_entry(entry("e1", "active"));
        store.claim_entry("e1").await.unwrap();
        store.mark_entry_sent("e1", Utc::now()).await.unwrap();

        assert!(!store.release_entry("e1").await.unwrap());
        assert_eq!(store.entry("e1").unwrap().status, EntryStatus::Sent);
    }

    #[tokio::test]
    async fn duplicate_tombstone_is_noop() {
        let store = MemoryStore::new();
        let first = VaultEntryTombstone {
            vault_entry_id: "e1".into(),
            user_id: "u1".into(),
            sender_name: Some("Ada".into()),
            sent_at: None,
            expired_at: Utc::now(),
        };
        let second = VaultEntryTombstone {
            sender_name: Some("Grace".into()),
            ..first.clone()
        };
        store.insert_tombstone(&first).await.unwrap();
        store.insert_tombstone(&second).await.unwrap();

        assert_eq!(
            store.tombstone("e1").unwrap().sender_name.as_deref(),
            Some("Ada")
        );
    }
}

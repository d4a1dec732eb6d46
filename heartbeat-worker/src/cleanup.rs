//! End-of-cycle sweeps
//!
//! Two independent passes: sent entries past the 30-day grace window are
//! tombstoned and removed (and emptied profiles restarted), then accounts
//! that never showed a sign of life in 90 days are deleted outright. Both
//! sweeps keyset-paginate because they mutate the rows they are filtering
//! on, and both contain every per-item failure.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use vault_storage::{Profile, VaultEntryTombstone, VaultStore};

use crate::cycle::KEYSET_PAGE_SIZE;

/// Sent entries older than this are tombstoned and deleted
pub const SENT_RETENTION_DAYS: i64 = 30;
/// Accounts must be at least this old before the bot sweep may touch them
pub const BOT_MIN_AGE_DAYS: i64 = 90;
/// A check-in within this many seconds of account creation counts as
/// "never refreshed"
const BOT_CHECKIN_SLACK_SECS: i64 = 60;

/// What the sweeps did
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// Sent entries tombstoned and deleted
    pub entries_expired: usize,
    /// Profiles reset to a fresh active timer
    pub profiles_reset: usize,
    /// Abandoned accounts deleted
    pub bots_deleted: usize,
}

/// Runs the end-of-cycle sweeps
pub struct CleanupSweeper {
    store: Arc<dyn VaultStore>,
}

impl CleanupSweeper {
    /// Creates the sweeper
    #[must_use]
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }

    /// Runs both sweeps; failures are contained per item and the report
    /// covers whatever completed
    pub async fn run(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_sent_aged_out(now, &mut report).await;
        self.reset_orphan_grace_profiles(now, &mut report).await;
        self.sweep_bots(now, &mut report).await;
        report
    }

    async fn sweep_sent_aged_out(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = now - Duration::days(SENT_RETENTION_DAYS);
        let mut sender_names: HashMap<String, Option<String>> = HashMap::new();
        let mut touched_users = BTreeSet::new();
        let mut after_id: Option<String> = None;

        loop {
            let page = match self
                .store
                .sent_entries_page(cutoff, after_id.as_deref(), KEYSET_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "sent-entry sweep aborted mid-scan");
                    break;
                }
            };
            let Some(last) = page.last() else { break };
            after_id = Some(last.id.clone());
            let page_len = page.len();

            for entry in page {
                let sender_name = match sender_names.get(&entry.user_id) {
                    Some(name) => name.clone(),
                    None => {
                        let name = self.resolve_sender_name(&entry.user_id).await;
                        sender_names.insert(entry.user_id.clone(), name.clone());
                        name
                    }
                };

                let tombstone = VaultEntryTombstone {
                    vault_entry_id: entry.id.clone(),
                    user_id: entry.user_id.clone(),
                    sender_name,
                    sent_at: entry.sent_at,
                    expired_at: now,
                };
                // History first: a row without a tombstone must not be
                // deleted.
                if let Err(e) = self.store.insert_tombstone(&tombstone).await {
                    warn!(entry_id = %entry.id, error = %e, "tombstone insert failed; keeping row");
                    continue;
                }
                if let Err(e) = self.store.delete_entry(&entry.id).await {
                    warn!(entry_id = %entry.id, error = %e, "expired entry delete failed");
                    continue;
                }
                if let Some(path) = entry.audio_file_path.as_deref() {
                    if let Err(e) = self.store.remove_audio_object(path).await {
                        warn!(entry_id = %entry.id, error = %e, "audio object removal failed");
                    }
                }
                report.entries_expired += 1;
                touched_users.insert(entry.user_id.clone());
            }

            if page_len < KEYSET_PAGE_SIZE {
                break;
            }
        }

        for user_id in touched_users {
            match self.store.count_entries(&user_id).await {
                Ok(0) => {
                    if let Err(e) = self.store.reset_profile_fresh_active(&user_id, now).await {
                        warn!(user_id = %user_id, error = %e, "post-sweep profile reset failed");
                    } else {
                        report.profiles_reset += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(user_id = %user_id, error = %e, "post-sweep entry count failed"),
            }
        }
    }

    /// Inactive profiles whose grace period lapsed but whose entries were
    /// already gone never show up in the sent-entry scan; reset them here.
    async fn reset_orphan_grace_profiles(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = now - Duration::days(SENT_RETENTION_DAYS);
        let mut after_id: Option<String> = None;

        loop {
            let page = match self
                .store
                .inactive_grace_expired_page(cutoff, after_id.as_deref(), KEYSET_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "orphan grace sweep aborted mid-scan");
                    break;
                }
            };
            let Some(last) = page.last() else { break };
            after_id = Some(last.id.clone());
            let page_len = page.len();

            for profile in page {
                match self.store.count_entries(&profile.id).await {
                    Ok(0) => {
                        info!(user_id = %profile.id, "grace period over; resetting profile");
                        if let Err(e) =
                            self.store.reset_profile_fresh_active(&profile.id, now).await
                        {
                            warn!(user_id = %profile.id, error = %e, "grace reset failed");
                        } else {
                            report.profiles_reset += 1;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(user_id = %profile.id, error = %e, "grace sweep count failed");
                    }
                }
            }

            if page_len < KEYSET_PAGE_SIZE {
                break;
            }
        }
    }

    async fn sweep_bots(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = now - Duration::days(BOT_MIN_AGE_DAYS);
        let mut after_id: Option<String> = None;

        loop {
            let page = match self
                .store
                .active_profiles_created_before_page(cutoff, after_id.as_deref(), KEYSET_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "bot sweep aborted mid-scan");
                    break;
                }
            };
            let Some(last) = page.last() else { break };
            after_id = Some(last.id.clone());
            let page_len = page.len();

            for profile in page {
                match self.is_bot(&profile).await {
                    Ok(true) => {
                        info!(user_id = %profile.id, "deleting abandoned account");
                        if let Err(e) = self.store.delete_auth_user(&profile.id).await {
                            warn!(user_id = %profile.id, error = %e, "account delete failed");
                        } else {
                            report.bots_deleted += 1;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(user_id = %profile.id, error = %e, "bot check failed"),
                }
            }

            if page_len < KEYSET_PAGE_SIZE {
                break;
            }
        }
    }

    async fn is_bot(&self, profile: &Profile) -> vault_storage::StorageResult<bool> {
        if profile.had_vault_activity {
            return Ok(false);
        }
        let (Some(created_at), Some(last_check_in)) = (profile.created_at, profile.last_check_in)
        else {
            return Ok(false);
        };
        let drift = (last_check_in - created_at).num_seconds().abs();
        if drift > BOT_CHECKIN_SLACK_SECS {
            return Ok(false);
        }
        if self.store.count_entries(&profile.id).await? > 0 {
            return Ok(false);
        }
        Ok(self.store.count_tombstones(&profile.id).await? == 0)
    }

    async fn resolve_sender_name(&self, user_id: &str) -> Option<String> {
        match self.store.fetch_profile(user_id).await {
            Ok(Some(profile)) => Some(profile.display_name().to_string()),
            Ok(None) => None,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "sender-name lookup failed");
                None
            }
        }
    }
}

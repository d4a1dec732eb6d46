//! One heartbeat cycle, end to end
//!
//! Stale-lock recovery first, then a keyset scan of active profiles with a
//! single `IN (user_ids)` entry prefetch per page, then the end-of-cycle
//! sweeps. The scan is keyset-paginated because execution flips profile
//! `status` mid-iteration; offsets would skip rows. Per-user failures are
//! logged and the scan continues; only pagination-level datastore failures
//! escape to the supervisor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vault_storage::{Profile, VaultEntry, VaultStore};

use crate::cleanup::{CleanupSweeper, SweepReport};
use crate::crypto::ServerCrypto;
use crate::downgrade::DowngradeReverter;
use crate::error::HeartbeatError;
use crate::executor::{EntryExecutor, STALE_LOCK_MINUTES};
use crate::lifecycle::LifecycleController;
use crate::notify::NotificationDispatcher;
use crate::timer::build_timer_state;

/// Page size for every keyset scan
pub const KEYSET_PAGE_SIZE: usize = 200;

/// Counters for one cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    /// Active profiles examined
    pub profiles_seen: usize,
    /// Entries recovered from abandoned `sending` claims
    pub stale_locks_recovered: usize,
    /// Expired profiles that went through execution + lifecycle
    pub executions: usize,
    /// Entries delivered and finalized
    pub entries_sent: usize,
    /// Destroy entries removed
    pub entries_destroyed: usize,
    /// Claims released back for a later cycle
    pub entries_released: usize,
    /// Warning emails delivered
    pub warnings_sent: usize,
    /// Reminder pushes delivered
    pub pushes_sent: usize,
    /// Free profiles stripped of paid artifacts
    pub downgrades_reverted: usize,
    /// Whether the budget or a shutdown stopped the scan early
    pub stopped_early: bool,
    /// End-of-cycle sweep counters
    pub sweep: SweepReport,
}

/// The scheduled heartbeat pass
pub struct HeartbeatCycle {
    store: Arc<dyn VaultStore>,
    executor: EntryExecutor,
    lifecycle: LifecycleController,
    dispatcher: Arc<NotificationDispatcher>,
    downgrade: DowngradeReverter,
    cleanup: CleanupSweeper,
    crypto: Arc<ServerCrypto>,
    cancel: CancellationToken,
}

impl HeartbeatCycle {
    /// Wires the cycle together
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn VaultStore>,
        executor: EntryExecutor,
        lifecycle: LifecycleController,
        dispatcher: Arc<NotificationDispatcher>,
        downgrade: DowngradeReverter,
        cleanup: CleanupSweeper,
        crypto: Arc<ServerCrypto>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            executor,
            lifecycle,
            dispatcher,
            downgrade,
            cleanup,
            crypto,
            cancel,
        }
    }

    /// Runs one full cycle at instant `now`, stopping cleanly between
    /// profiles once `deadline` passes or a shutdown is requested
    ///
    /// # Errors
    ///
    /// Only datastore failures the scan cannot proceed past; everything
    /// per-user is contained and logged
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<CycleReport, HeartbeatError> {
        let mut report = CycleReport::default();

        let stale_cutoff = now - Duration::minutes(STALE_LOCK_MINUTES);
        report.stale_locks_recovered = self.store.release_stale_sending(stale_cutoff).await?;
        if report.stale_locks_recovered > 0 {
            info!(
                recovered = report.stale_locks_recovered,
                "recovered entries from abandoned claims"
            );
        }

        let mut after_id: Option<String> = None;
        'pages: loop {
            let page = self
                .store
                .active_profiles_page(after_id.as_deref(), KEYSET_PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else { break };
            after_id = Some(last.id.clone());
            let page_len = page.len();

            let user_ids: Vec<String> = page.iter().map(|p| p.id.clone()).collect();
            let mut grouped = group_by_user(self.store.active_entries_for_users(&user_ids).await?);

            for profile in &page {
                if self.should_stop(deadline) {
                    info!("stopping between profiles (budget or shutdown)");
                    report.stopped_early = true;
                    break 'pages;
                }
                report.profiles_seen += 1;
                let entries = grouped.remove(&profile.id).unwrap_or_default();
                if let Err(e) = self.process_profile(profile, &entries, now, &mut report).await {
                    warn!(user_id = %profile.id, error = %e, "profile pass failed; continuing");
                }
            }

            if page_len < KEYSET_PAGE_SIZE {
                break;
            }
        }

        if report.stopped_early {
            info!("skipping end-of-cycle sweeps");
        } else {
            report.sweep = self.cleanup.run(now).await;
        }

        Ok(report)
    }

    async fn process_profile(
        &self,
        profile: &Profile,
        entries: &[VaultEntry],
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), HeartbeatError> {
        let Some(last_check_in) = profile.last_check_in else {
            debug!(user_id = %profile.id, "no check-in recorded; skipping");
            return Ok(());
        };

        if self.downgrade.maybe_revert(profile, entries, now).await? {
            // The in-memory profile is stale now; pick the user up again
            // next cycle.
            report.downgrades_reverted += 1;
            return Ok(());
        }

        let timer = build_timer_state(last_check_in, profile.effective_timer_days(), now);

        if timer.expired() {
            if entries.is_empty() {
                // Nothing to execute. Leaving the profile alone keeps the
                // bot sweep's abandonment signals intact; the next cycle
                // rescans it.
                debug!(user_id = %profile.id, "expired with no active entries");
                return Ok(());
            }
            info!(
                user_id = %profile.id,
                entries = entries.len(),
                "timer expired; executing entries"
            );
            let hmac_key = self.decrypt_hmac_key(profile);
            let summary = self
                .executor
                .execute_for_profile(profile, entries, hmac_key.as_deref(), now)
                .await;
            report.executions += 1;
            report.entries_sent += summary.sent;
            report.entries_destroyed += summary.destroyed;
            report.entries_released += summary.released;
            self.lifecycle.settle(profile, &summary, now).await?;
        } else {
            let activity = self.dispatcher.process_reminders(profile, &timer, now).await;
            if activity.warning_email_sent {
                report.warnings_sent += 1;
            }
            report.pushes_sent += activity.pushes_sent;
        }

        Ok(())
    }

    fn decrypt_hmac_key(&self, profile: &Profile) -> Option<Vec<u8>> {
        let envelope = profile.hmac_key_encrypted.as_ref()?;
        match self.crypto.decrypt_envelope(envelope.as_str()) {
            Ok(key) => Some(key),
            Err(e) => {
                error!(
                    user_id = %profile.id,
                    error = %e,
                    "CRITICAL: HMAC key decryption failed; send entries will be preserved"
                );
                None
            }
        }
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        self.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)
    }
}

fn group_by_user(entries: Vec<VaultEntry>) -> HashMap<String, Vec<VaultEntry>> {
    let mut grouped: HashMap<String, Vec<VaultEntry>> = HashMap::new();
    for entry in entries {
        grouped.entry(entry.user_id.clone()).or_default().push(entry);
    }
    grouped
}

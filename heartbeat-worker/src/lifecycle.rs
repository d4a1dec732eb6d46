//! Profile state after execution
//!
//! Four outcomes, checked in order: entries still pending keep the profile
//! active for another attempt; a delivered send starts the 30-day grace
//! period; send entries that all vanished from the pipeline trip the
//! data-loss guard and freeze the profile as-is; a genuinely destroy-only
//! execution resets the profile to a fresh active timer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};
use vault_storage::{Profile, StorageResult, VaultStore};

use crate::executor::ExecutionSummary;

/// Settles a profile once its entries have been executed
pub struct LifecycleController {
    store: Arc<dyn VaultStore>,
}

impl LifecycleController {
    /// Creates the controller
    #[must_use]
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }

    /// Decides and applies the post-execution profile state
    ///
    /// # Errors
    ///
    /// Propagates datastore failures; the caller contains them per user
    pub async fn settle(
        &self,
        profile: &Profile,
        summary: &ExecutionSummary,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let pending = self.store.count_pending_entries(&profile.id).await?;

        if pending > 0 {
            info!(
                user_id = %profile.id,
                pending,
                "entries still pending; profile stays active for retry"
            );
            return self.store.record_vault_activity(&profile.id).await;
        }

        if summary.had_send {
            info!(user_id = %profile.id, "send occurred; entering 30-day grace period");
            return self.store.begin_grace_period(&profile.id, now).await;
        }

        if summary.input_send_count > 0 {
            // Send entries came in, none were delivered, and none remain
            // pending. Resetting here would erase the only record that a
            // delivery was owed.
            error!(
                user_id = %profile.id,
                input_send_count = summary.input_send_count,
                "CRITICAL: send entries vanished without delivery; refusing to reset profile"
            );
            return self.store.record_vault_activity(&profile.id).await;
        }

        info!(user_id = %profile.id, "destroy-only execution; resetting to fresh active");
        self.store.reset_profile_fresh_active(&profile.id, now).await
    }
}

//! Paid-tier artifact revert after a subscription downgrade
//!
//! A profile whose subscription reads "free" must not keep paid-tier state.
//! Strong indicators (a custom timer, audio entries) get a courtesy email;
//! cosmetic leftovers (theme, soul-fire) are reverted silently.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use vault_storage::{Profile, StorageResult, VaultEntry, VaultStore};

use crate::email::{render_html_document, EmailMessage, Mailer};

/// Free-tier timer ceiling; anything longer is a paid artifact
const FREE_TIMER_DAYS: i64 = 30;
/// Themes available on the free tier
const DEFAULT_THEMES: [&str; 3] = ["oledVoid", "midnightFrost", "shadowRose"];
/// Soul-fires available on the free tier
const DEFAULT_SOUL_FIRES: [&str; 3] = ["etherealOrb", "goldenPulse", "nebulaHeart"];

/// Detects and reverts paid-tier leftovers on free profiles
pub struct DowngradeReverter {
    store: Arc<dyn VaultStore>,
    mailer: Arc<dyn Mailer>,
    from_email: String,
}

impl DowngradeReverter {
    /// Creates the reverter
    #[must_use]
    pub fn new(store: Arc<dyn VaultStore>, mailer: Arc<dyn Mailer>, from_email: String) -> Self {
        Self {
            store,
            mailer,
            from_email,
        }
    }

    /// Reverts paid artifacts when present. Returns whether anything
    /// changed — the caller must then skip the rest of this user's passes,
    /// since the in-memory profile is stale.
    ///
    /// # Errors
    ///
    /// Propagates datastore failures; the caller contains them per user
    pub async fn maybe_revert(
        &self,
        profile: &Profile,
        active_entries: &[VaultEntry],
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let is_free = profile
            .subscription_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("free"));
        if !is_free {
            return Ok(false);
        }

        let custom_timer = profile.timer_days.is_some_and(|days| days > FREE_TIMER_DAYS);
        let custom_theme = profile
            .selected_theme
            .as_deref()
            .is_some_and(|theme| !DEFAULT_THEMES.contains(&theme));
        let custom_soul_fire = profile
            .selected_soul_fire
            .as_deref()
            .is_some_and(|fire| !DEFAULT_SOUL_FIRES.contains(&fire));
        let audio_entries: Vec<&VaultEntry> = active_entries
            .iter()
            .filter(|entry| entry.is_audio())
            .collect();

        let strong_indicator = custom_timer || !audio_entries.is_empty();
        if !strong_indicator && !custom_theme && !custom_soul_fire {
            return Ok(false);
        }

        info!(
            user_id = %profile.id,
            custom_timer,
            custom_theme,
            custom_soul_fire,
            audio_entries = audio_entries.len(),
            "reverting paid-tier artifacts on free profile"
        );
        self.store.revert_profile_downgrade(&profile.id, now).await?;

        for entry in &audio_entries {
            if let Err(e) = self.store.delete_entry(&entry.id).await {
                warn!(entry_id = %entry.id, error = %e, "audio entry delete failed");
                continue;
            }
            if let Some(path) = entry.audio_file_path.as_deref() {
                if let Err(e) = self.store.remove_audio_object(path).await {
                    warn!(entry_id = %entry.id, error = %e, "audio object removal failed");
                }
            }
        }

        if strong_indicator {
            self.send_courtesy_email(profile, now).await;
        }

        Ok(true)
    }

    async fn send_courtesy_email(&self, profile: &Profile, now: DateTime<Utc>) {
        let Some(email) = profile.email.as_deref() else {
            return;
        };
        let name = profile.display_name();
        let text = format!(
            "Hi {name},\n\n\
             Your Afterword subscription has ended, so your vault was returned to the \
             free plan: the check-in timer is back to 30 days and premium content was \
             removed.\n\n\
             Your written entries are untouched. Resubscribe any time to restore the \
             longer timer and audio messages."
        );
        let body_html = format!(
            "<p>Hi {name},</p>\
             <p>Your Afterword subscription has ended, so your vault was returned to the \
             free plan: the check-in timer is back to 30 days and premium content was \
             removed.</p>\
             <p>Your written entries are untouched. Resubscribe any time to restore the \
             longer timer and audio messages.</p>"
        );
        let message = EmailMessage::new(
            &self.from_email,
            email,
            "Your Afterword plan changed",
            text,
            render_html_document("Your Afterword plan changed", &body_html),
        );
        let key = format!("downgrade-{}-{}", profile.id, now.format("%Y-%m-%d"));

        if let Err(e) = self.mailer.send(&message, Some(&key)).await {
            warn!(user_id = %profile.id, error = %e, "downgrade courtesy email failed");
        }
    }
}

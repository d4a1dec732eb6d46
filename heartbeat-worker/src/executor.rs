//! Entry execution at timer expiry
//!
//! Three phases per expired profile: prepare each active entry under an
//! optimistic `active → sending` claim, batch-send every prepared unlock
//! email in one idempotent call, then finalize `sending → sent`.
//!
//! The governing rule: a send entry is never deleted on a failure path.
//! Validation and provider failures release the claim so the entry retries
//! next cycle; only destroy entries are deleted, and only sent entries age
//! out through the sweep. Destruction of a destroy entry is the point of
//! the entry, so it proceeds even when the crypto around it is broken.

use std::sync::Arc;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, error, info, warn};
use vault_storage::{ActionType, Profile, VaultEntry, VaultStore};

use crate::crypto::{entry_canonical_message, verify_hmac_signature, ServerCrypto};
use crate::email::{render_html_document, EmailMessage, Mailer};
use crate::notify::{ExecutedVerb, NotificationDispatcher};

/// Claims older than this are considered abandoned by a dead runner
pub const STALE_LOCK_MINUTES: i64 = 30;

/// Why a claimed send entry was handed back instead of delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The profile's HMAC key is absent or undecryptable
    MissingHmacKey,
    /// Stored signature does not match the entry contents
    SignatureMismatch,
    /// No recipient ciphertext at all
    EmptyRecipient,
    /// Recipient ciphertext would not decrypt
    RecipientUnreadable,
    /// Decrypted recipient is not an email address
    InvalidRecipient,
    /// No data-key ciphertext
    MissingDataKey,
    /// Data-key ciphertext would not decrypt
    DataKeyUnreadable,
    /// The provider batch call failed; nothing was delivered
    BatchSendFailed,
}

/// Terminal state of one entry within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Delivered and finalized
    Sent,
    /// Claim handed back; will retry next cycle
    Released(ReleaseReason),
    /// Destroy entry removed
    DeletedDestroy,
    /// Another runner owns it, or the claim failed
    Skipped,
}

/// What execution did for one profile
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutionSummary {
    /// Whether at least one send entry was actually delivered
    pub had_send: bool,
    /// Send-type entries in the input, regardless of outcome
    pub input_send_count: usize,
    /// Entries delivered and finalized
    pub sent: usize,
    /// Destroy entries removed
    pub destroyed: usize,
    /// Claims released back to active
    pub released: usize,
    /// Entries another runner owned or that failed to claim
    pub skipped: usize,
}

enum PrepareResult {
    Prepared(PreparedSend),
    Outcome(ExecutionOutcome),
}

struct PreparedSend {
    entry_id: String,
    title: String,
    message: EmailMessage,
}

/// Executes the active entries of an expired profile
pub struct EntryExecutor {
    store: Arc<dyn VaultStore>,
    mailer: Arc<dyn Mailer>,
    notifier: Arc<NotificationDispatcher>,
    crypto: Arc<ServerCrypto>,
    from_email: String,
    viewer_base_url: String,
}

impl EntryExecutor {
    /// Creates the executor
    #[must_use]
    pub fn new(
        store: Arc<dyn VaultStore>,
        mailer: Arc<dyn Mailer>,
        notifier: Arc<NotificationDispatcher>,
        crypto: Arc<ServerCrypto>,
        from_email: String,
        viewer_base_url: String,
    ) -> Self {
        Self {
            store,
            mailer,
            notifier,
            crypto,
            from_email,
            viewer_base_url,
        }
    }

    /// Runs all three phases for one profile. Failures are contained to the
    /// entry they belong to; the summary reports what actually happened.
    pub async fn execute_for_profile(
        &self,
        profile: &Profile,
        entries: &[VaultEntry],
        hmac_key: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            input_send_count: entries
                .iter()
                .filter(|e| e.action() == ActionType::Send)
                .count(),
            ..ExecutionSummary::default()
        };
        let mut prepared = Vec::new();

        for entry in entries {
            match self.prepare_entry(profile, entry, hmac_key).await {
                PrepareResult::Prepared(send) => prepared.push(send),
                PrepareResult::Outcome(ExecutionOutcome::DeletedDestroy) => summary.destroyed += 1,
                PrepareResult::Outcome(ExecutionOutcome::Released(_)) => summary.released += 1,
                PrepareResult::Outcome(_) => summary.skipped += 1,
            }
        }

        if prepared.is_empty() {
            return summary;
        }

        let batch_key = format!("unlock-batch-{}-{}", profile.id, now.timestamp());
        let messages: Vec<EmailMessage> = prepared.iter().map(|p| p.message.clone()).collect();

        match self.mailer.send_batch(&messages, &batch_key).await {
            Ok(()) => {
                summary.had_send = true;
                for send in &prepared {
                    if self.finalize_entry(&send.entry_id, now).await {
                        summary.sent += 1;
                        self.notifier
                            .send_executed_push(&profile.id, &send.title, ExecutedVerb::Sent)
                            .await;
                    }
                }
                info!(
                    user_id = %profile.id,
                    delivered = prepared.len(),
                    finalized = summary.sent,
                    "unlock batch delivered"
                );
            }
            Err(e) => {
                error!(
                    user_id = %profile.id,
                    prepared = prepared.len(),
                    error = %e,
                    "CRITICAL: unlock batch failed; releasing all prepared entries"
                );
                for send in &prepared {
                    self.release_claim(&send.entry_id, ReleaseReason::BatchSendFailed)
                        .await;
                    summary.released += 1;
                }
            }
        }

        summary
    }

    async fn prepare_entry(
        &self,
        profile: &Profile,
        entry: &VaultEntry,
        hmac_key: Option<&[u8]>,
    ) -> PrepareResult {
        match self.store.claim_entry(&entry.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(entry_id = %entry.id, "entry claimed by another runner");
                return PrepareResult::Outcome(ExecutionOutcome::Skipped);
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "claim failed");
                return PrepareResult::Outcome(ExecutionOutcome::Skipped);
            }
        }

        if entry.action() == ActionType::Destroy {
            self.notifier
                .send_executed_push(&profile.id, entry.display_title(), ExecutedVerb::Destroyed)
                .await;
            self.destroy_entry(entry).await;
            return PrepareResult::Outcome(ExecutionOutcome::DeletedDestroy);
        }

        let Some(key) = hmac_key else {
            error!(
                entry_id = %entry.id,
                user_id = %profile.id,
                "CRITICAL: HMAC key unavailable for send entry; releasing"
            );
            return self
                .released(&entry.id, ReleaseReason::MissingHmacKey)
                .await;
        };

        let payload = entry.payload_encrypted.as_deref().unwrap_or_default();
        let recipient_ciphertext = entry
            .recipient_email_encrypted
            .as_ref()
            .map_or("", |c| c.as_str());
        let canonical = entry_canonical_message(payload, recipient_ciphertext);
        let stored_signature = entry.hmac_signature.as_deref().unwrap_or_default();
        if !verify_hmac_signature(&canonical, key, stored_signature) {
            error!(
                entry_id = %entry.id,
                user_id = %profile.id,
                "CRITICAL: HMAC signature mismatch; possible tampering; releasing"
            );
            return self
                .released(&entry.id, ReleaseReason::SignatureMismatch)
                .await;
        }

        if recipient_ciphertext.is_empty() {
            error!(
                entry_id = %entry.id,
                user_id = %profile.id,
                "CRITICAL: send entry has no recipient ciphertext; releasing"
            );
            return self.released(&entry.id, ReleaseReason::EmptyRecipient).await;
        }

        let recipient = match self.crypto.decrypt_envelope_text(recipient_ciphertext) {
            Ok(recipient) => recipient,
            Err(e) => {
                error!(
                    entry_id = %entry.id,
                    user_id = %profile.id,
                    error = %e,
                    "CRITICAL: recipient decryption failed; releasing"
                );
                return self
                    .released(&entry.id, ReleaseReason::RecipientUnreadable)
                    .await;
            }
        };
        if !recipient_regex().is_match(&recipient) {
            error!(
                entry_id = %entry.id,
                user_id = %profile.id,
                "CRITICAL: decrypted recipient is not an address; releasing"
            );
            return self
                .released(&entry.id, ReleaseReason::InvalidRecipient)
                .await;
        }

        let Some(data_key_ciphertext) = entry.data_key_encrypted.as_ref().filter(|c| !c.is_empty())
        else {
            error!(
                entry_id = %entry.id,
                user_id = %profile.id,
                "CRITICAL: send entry has no data key; releasing"
            );
            return self.released(&entry.id, ReleaseReason::MissingDataKey).await;
        };
        let data_key = match self.crypto.decrypt_envelope(data_key_ciphertext.as_str()) {
            Ok(data_key) => data_key,
            Err(e) => {
                error!(
                    entry_id = %entry.id,
                    user_id = %profile.id,
                    error = %e,
                    "CRITICAL: data-key decryption failed; releasing"
                );
                return self
                    .released(&entry.id, ReleaseReason::DataKeyUnreadable)
                    .await;
            }
        };

        let security_key = BASE64.encode(data_key);
        let viewer_link = build_viewer_link(&self.viewer_base_url, &entry.id);
        let title = entry.display_title().to_string();
        let message = build_unlock_email(
            &self.from_email,
            &recipient,
            profile.display_name(),
            &title,
            &viewer_link,
            &security_key,
        );

        PrepareResult::Prepared(PreparedSend {
            entry_id: entry.id.clone(),
            title,
            message,
        })
    }

    async fn released(&self, entry_id: &str, reason: ReleaseReason) -> PrepareResult {
        self.release_claim(entry_id, reason).await;
        PrepareResult::Outcome(ExecutionOutcome::Released(reason))
    }

    async fn release_claim(&self, entry_id: &str, reason: ReleaseReason) {
        match self.store.release_entry(entry_id).await {
            Ok(true) => {}
            // The entry left `sending` under us — most likely a concurrent
            // runner committed `sent`. Leaving it alone is the only safe move.
            Ok(false) => warn!(entry_id = %entry_id, ?reason, "release was a no-op"),
            Err(e) => error!(
                entry_id = %entry_id,
                ?reason,
                error = %e,
                "release failed; stale-lock recovery will reclaim it"
            ),
        }
    }

    async fn destroy_entry(&self, entry: &VaultEntry) {
        if let Err(e) = self.store.delete_entry(&entry.id).await {
            error!(entry_id = %entry.id, error = %e, "destroy delete failed");
            return;
        }
        info!(entry_id = %entry.id, "destroy entry removed");
        if let Some(path) = entry.audio_file_path.as_deref() {
            if let Err(e) = self.store.remove_audio_object(path).await {
                warn!(entry_id = %entry.id, error = %e, "audio object removal failed");
            }
        }
    }

    /// Conditional `sending → sent`, retried once on a zero-row result
    async fn finalize_entry(&self, entry_id: &str, now: DateTime<Utc>) -> bool {
        for attempt in 0..2 {
            match self.store.mark_entry_sent(entry_id, now).await {
                Ok(true) => return true,
                Ok(false) if attempt == 0 => {
                    warn!(entry_id = %entry_id, "mark-sent touched no rows; retrying once");
                }
                Ok(false) => {
                    error!(
                        entry_id = %entry_id,
                        "CRITICAL: delivered entry could not be finalized"
                    );
                }
                Err(e) if attempt == 0 => {
                    warn!(entry_id = %entry_id, error = %e, "mark-sent failed; retrying once");
                }
                Err(e) => {
                    error!(
                        entry_id = %entry_id,
                        error = %e,
                        "CRITICAL: delivered entry could not be finalized"
                    );
                }
            }
        }
        false
    }
}

fn recipient_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("recipient pattern compiles")
    })
}

/// Link the beneficiary opens to decrypt the message
#[must_use]
pub fn build_viewer_link(base_url: &str, entry_id: &str) -> String {
    format!("{}/?entry={entry_id}", base_url.trim_end_matches('/'))
}

fn build_unlock_email(
    from: &str,
    recipient: &str,
    sender_name: &str,
    title: &str,
    viewer_link: &str,
    security_key: &str,
) -> EmailMessage {
    let subject = format!("Message from {sender_name}");
    let text = format!(
        "{sender_name} left you a secure message in Afterword.\n\n\
         Title: {title}\n\
         Security Key: {security_key}\n\
         Open: {viewer_link}\n\n\
         The key decrypts the message in your browser.\n\n\
         Important: This secure transmission expires 30 days after delivery."
    );
    let body_html = format!(
        "<p><strong>{sender_name}</strong> left you a secure message in Afterword.</p>\
         <p><strong>Title:</strong> {title}</p>\
         <p><strong>Security Key:</strong> {security_key}</p>\
         <p><a href=\"{viewer_link}\">Open the secure message</a></p>\
         <p>The key decrypts the message in your browser.</p>\
         <p><strong>Important:</strong> This secure transmission expires 30 days after delivery.</p>"
    );
    EmailMessage::new(
        from,
        recipient,
        &subject,
        text,
        render_html_document(&subject, &body_html),
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn viewer_link_normalizes_trailing_slash() {
        assert_eq!(
            build_viewer_link("https://viewer.afterword.app/", "e-1"),
            "https://viewer.afterword.app/?entry=e-1"
        );
        assert_eq!(
            build_viewer_link("https://viewer.afterword.app", "e-1"),
            "https://viewer.afterword.app/?entry=e-1"
        );
    }

    #[test]
    fn recipient_pattern_accepts_addresses_only() {
        let re = recipient_regex();
        assert!(re.is_match("ada@example.com"));
        assert!(re.is_match("a.b+c@mail.example.co"));
        assert!(!re.is_match("not-an-address"));
        assert!(!re.is_match("two words@example.com"));
        assert!(!re.is_match("missing@tld"));
        assert!(!re.is_match("@example.com"));
    }

    #[test]
    fn unlock_email_carries_key_and_link() {
        let message = build_unlock_email(
            "vault@afterword.app",
            "ben@example.com",
            "Ada",
            "For you",
            "https://v/?entry=e1",
            "c2VjcmV0",
        );
        assert_eq!(message.subject, "Message from Ada");
        assert!(message.text.contains("Security Key: c2VjcmV0"));
        assert!(message.text.contains("https://v/?entry=e1"));
        assert!(message.html.contains("Open the secure message"));
        assert_eq!(message.to, vec!["ben@example.com".to_string()]);
    }
}

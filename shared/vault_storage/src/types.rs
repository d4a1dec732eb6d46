//! Row types for the vault tables
//!
//! Columns that may be null in the datastore are `Option` here; the worker
//! owns the normalization rules (timer floor, name fallbacks) so a partially
//! populated row never panics the cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// An opaque `nonce.ciphertext.tag` envelope, possibly wrapped in a JSON
/// `{server, device}` object by newer clients. Only the crypto layer looks
/// inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeCiphertext(pub String);

impl EnvelopeCiphertext {
    /// Borrows the raw stored string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the stored ciphertext is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for EnvelopeCiphertext {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Profile lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProfileStatus {
    /// Timer running, entries may execute at expiry
    Active,
    /// Post-execution grace period; beneficiary may still download
    Inactive,
    /// Frozen by the user; the heartbeat never touches these
    Archived,
}

/// Vault entry state machine: active → sending → sent, or back to active
/// when a claim is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryStatus {
    /// Eligible for execution
    Active,
    /// Claimed by a running executor
    Sending,
    /// Delivered; awaits the 30-day sweep
    Sent,
}

/// What expiry does with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ActionType {
    /// Deliver to the beneficiary
    Send,
    /// Delete without delivery
    Destroy,
}

/// One user profile row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable, orderable identifier (keyset pagination key)
    pub id: String,
    /// Contact address for reminders; absent for anonymous accounts
    #[serde(default)]
    pub email: Option<String>,
    /// Display name shown to beneficiaries
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Lifecycle status
    pub status: ProfileStatus,
    /// Free-form subscription tier; interpreted by `is_paid`
    #[serde(default)]
    pub subscription_status: Option<String>,
    /// Last time the user confirmed they are alive
    #[serde(default)]
    pub last_check_in: Option<DateTime<Utc>>,
    /// Countdown length in days; null/0 normalizes to 1 on read
    #[serde(default)]
    pub timer_days: Option<i64>,
    /// AES-GCM envelope over the user's 32-byte HMAC key
    #[serde(default)]
    pub hmac_key_encrypted: Option<EnvelopeCiphertext>,
    /// When the 24 h warning email went out (null = never this cycle)
    #[serde(default)]
    pub warning_sent_at: Option<DateTime<Utc>>,
    /// When the 66 %-remaining push went out
    #[serde(default)]
    pub push_66_sent_at: Option<DateTime<Utc>>,
    /// When the 33 %-remaining push went out
    #[serde(default)]
    pub push_33_sent_at: Option<DateTime<Utc>>,
    /// When this profile's entries were last executed
    #[serde(default)]
    pub protocol_executed_at: Option<DateTime<Utc>>,
    /// Whether the vault ever executed for this user (bot-sweep signal)
    #[serde(default)]
    pub had_vault_activity: bool,
    /// Paid-tier theme selection, if any
    #[serde(default)]
    pub selected_theme: Option<String>,
    /// Paid-tier soul-fire selection, if any
    #[serde(default)]
    pub selected_soul_fire: Option<String>,
    /// Account creation instant
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// Countdown length with the null/zero floor applied
    #[must_use]
    pub fn effective_timer_days(&self) -> i64 {
        self.timer_days.map_or(1, |days| days.max(1))
    }

    /// Sender name with the product fallback
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self.sender_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Afterword",
        }
    }
}

/// One encrypted vault entry row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Stable, orderable identifier
    pub id: String,
    /// Owning profile id
    pub user_id: String,
    /// Title shown to the beneficiary
    #[serde(default)]
    pub title: Option<String>,
    /// Send or destroy; absent reads as send
    #[serde(default)]
    pub action_type: Option<ActionType>,
    /// Payload kind, e.g. "text" or "audio"
    #[serde(default)]
    pub data_type: Option<String>,
    /// State machine position
    pub status: EntryStatus,
    /// Client-encrypted message body (opaque to the server)
    #[serde(default)]
    pub payload_encrypted: Option<String>,
    /// Envelope over the recipient address
    #[serde(default)]
    pub recipient_email_encrypted: Option<EnvelopeCiphertext>,
    /// Envelope over the per-entry data-encryption key
    #[serde(default)]
    pub data_key_encrypted: Option<EnvelopeCiphertext>,
    /// base64 HMAC-SHA256 over `payload_encrypted|recipient_email_encrypted`
    #[serde(default)]
    pub hmac_signature: Option<String>,
    /// Object-store key of the audio blob, when `data_type` is audio
    #[serde(default)]
    pub audio_file_path: Option<String>,
    /// Delivery instant, once sent
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    /// Last mutation instant (drives stale-lock recovery)
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl VaultEntry {
    /// Action with the legacy-row fallback applied
    #[must_use]
    pub fn action(&self) -> ActionType {
        self.action_type.unwrap_or(ActionType::Send)
    }

    /// Title with the product fallback
    #[must_use]
    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.is_empty() => title,
            _ => "Untitled",
        }
    }

    /// Whether this entry carries an audio blob
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.data_type.as_deref() == Some("audio")
    }
}

/// Insert-only history marker written before a sent entry is deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntryTombstone {
    /// Primary key: the deleted entry's id
    pub vault_entry_id: String,
    /// Owning profile id
    pub user_id: String,
    /// Sender name at deletion time
    #[serde(default)]
    pub sender_name: Option<String>,
    /// When the entry was delivered
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    /// When the sweep removed it
    pub expired_at: DateTime<Utc>,
}

/// One push-capable device token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushDevice {
    /// Owning profile id
    pub user_id: String,
    /// Opaque provider token; deleted when the provider reports it invalid
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn timer_days_floor() {
        let mut profile = profile_fixture();
        profile.timer_days = None;
        assert_eq!(profile.effective_timer_days(), 1);
        profile.timer_days = Some(0);
        assert_eq!(profile.effective_timer_days(), 1);
        profile.timer_days = Some(-3);
        assert_eq!(profile.effective_timer_days(), 1);
        profile.timer_days = Some(30);
        assert_eq!(profile.effective_timer_days(), 30);
    }

    #[test]
    fn name_and_title_fallbacks() {
        let mut profile = profile_fixture();
        profile.sender_name = Some(String::new());
        assert_eq!(profile.display_name(), "Afterword");
        profile.sender_name = Some("Ada".into());
        assert_eq!(profile.display_name(), "Ada");

        let entry: VaultEntry = serde_json::from_value(serde_json::json!({
            "id": "e1",
            "user_id": "u1",
            "status": "active",
        }))
        .unwrap();
        assert_eq!(entry.display_title(), "Untitled");
        assert_eq!(entry.action(), ActionType::Send);
    }

    #[test]
    fn status_filter_rendering() {
        assert_eq!(ProfileStatus::Active.to_string(), "active");
        assert_eq!(EntryStatus::Sending.to_string(), "sending");
        assert_eq!(ActionType::Destroy.to_string(), "destroy");
    }

    fn profile_fixture() -> Profile {
        serde_json::from_value(serde_json::json!({
            "id": "u1",
            "status": "active",
        }))
        .unwrap()
    }
}

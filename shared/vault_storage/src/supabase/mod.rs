//! Supabase-backed [`VaultStore`] implementation
//!
//! Three surfaces, all authenticated with the service-role key: PostgREST
//! for the tables, the Storage API for the audio bucket, and the GoTrue
//! admin API for cascading account deletes.

mod query;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::{StorageError, StorageResult};
use crate::store::{ReminderStage, VaultStore};
use crate::types::{Profile, PushDevice, VaultEntry, VaultEntryTombstone};

use query::ts;

/// Bucket holding encrypted audio blobs
const AUDIO_BUCKET: &str = "vault-audio";
/// Default timeout for datastore requests
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Maximum number of idle connections to maintain per host
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 10;

/// Supabase datastore client
pub struct SupabaseStore {
    pub(crate) http: reqwest::Client,
    pub(crate) rest_base: String,
    storage_base: String,
    admin_base: String,
    pub(crate) service_key: String,
}

impl SupabaseStore {
    /// Creates a new datastore client
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Config` when the URL or key is empty and
    /// `StorageError::Transport` when the HTTP client cannot be built
    pub fn new(base_url: &str, service_role_key: &str) -> StorageResult<Self> {
        let base = base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(StorageError::Config("empty datastore URL".to_string()));
        }
        if service_role_key.is_empty() {
            return Err(StorageError::Config("empty service-role key".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .build()?;

        Ok(Self {
            http,
            rest_base: format!("{base}/rest/v1"),
            storage_base: format!("{base}/storage/v1"),
            admin_base: format!("{base}/auth/v1/admin"),
            service_key: service_role_key.to_string(),
        })
    }

    fn keyset_query(after_id: Option<&str>, limit: usize) -> Vec<(&'static str, String)> {
        let mut query = vec![("select", "*".to_string())];
        if let Some(last) = after_id {
            query.push(("id", format!("gt.{last}")));
        }
        query.push(("order", "id.asc".to_string()));
        query.push(("limit", limit.to_string()));
        query
    }
}

#[async_trait]
impl VaultStore for SupabaseStore {
    async fn active_profiles_page(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>> {
        let mut query = Self::keyset_query(after_id, limit);
        query.push(("status", "eq.active".to_string()));
        self.select_rows("profiles", &query).await
    }

    async fn inactive_grace_expired_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>> {
        let mut query = Self::keyset_query(after_id, limit);
        query.push(("status", "eq.inactive".to_string()));
        query.push(("protocol_executed_at", format!("lt.{}", ts(cutoff))));
        self.select_rows("profiles", &query).await
    }

    async fn active_profiles_created_before_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Profile>> {
        let mut query = Self::keyset_query(after_id, limit);
        query.push(("status", "eq.active".to_string()));
        query.push(("created_at", format!("lt.{}", ts(cutoff))));
        self.select_rows("profiles", &query).await
    }

    async fn fetch_profile(&self, user_id: &str) -> StorageResult<Option<Profile>> {
        let query = [
            ("select", "*".to_string()),
            ("id", format!("eq.{user_id}")),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<Profile> = self.select_rows("profiles", &query).await?;
        Ok(rows.into_iter().next())
    }

    async fn mark_warning_sent(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.patch_where(
            "profiles",
            &[("id", format!("eq.{user_id}"))],
            &json!({ "warning_sent_at": ts(at) }),
        )
        .await?;
        Ok(())
    }

    async fn mark_reminder_push_sent(
        &self,
        user_id: &str,
        stage: ReminderStage,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let column = match stage {
            ReminderStage::TwoThirds => "push_66_sent_at",
            ReminderStage::OneThird => "push_33_sent_at",
        };
        self.patch_where(
            "profiles",
            &[("id", format!("eq.{user_id}"))],
            &json!({ column: ts(at) }),
        )
        .await?;
        Ok(())
    }

    async fn begin_grace_period(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.patch_where(
            "profiles",
            &[("id", format!("eq.{user_id}"))],
            &json!({
                "status": "inactive",
                "timer_days": 30,
                "protocol_executed_at": ts(at),
                "warning_sent_at": null,
                "push_66_sent_at": null,
                "push_33_sent_at": null,
                "had_vault_activity": true,
            }),
        )
        .await?;
        Ok(())
    }

    async fn reset_profile_fresh_active(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.patch_where(
            "profiles",
            &[("id", format!("eq.{user_id}"))],
            &json!({
                "status": "active",
                "timer_days": 30,
                "last_check_in": ts(at),
                "warning_sent_at": null,
                "push_66_sent_at": null,
                "push_33_sent_at": null,
                "protocol_executed_at": null,
                "had_vault_activity": true,
            }),
        )
        .await?;
        Ok(())
    }

    async fn record_vault_activity(&self, user_id: &str) -> StorageResult<()> {
        self.patch_where(
            "profiles",
            &[("id", format!("eq.{user_id}"))],
            &json!({ "had_vault_activity": true }),
        )
        .await?;
        Ok(())
    }

    async fn revert_profile_downgrade(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.patch_where(
            "profiles",
            &[("id", format!("eq.{user_id}"))],
            &json!({
                "timer_days": 30,
                "last_check_in": ts(at),
                "warning_sent_at": null,
                "push_66_sent_at": null,
                "push_33_sent_at": null,
                "selected_theme": null,
                "selected_soul_fire": null,
            }),
        )
        .await?;
        Ok(())
    }

    async fn active_entries_for_users(
        &self,
        user_ids: &[String],
    ) -> StorageResult<Vec<VaultEntry>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = [
            ("select", "*".to_string()),
            ("status", "eq.active".to_string()),
            ("user_id", format!("in.({})", user_ids.join(","))),
        ];
        self.select_rows("vault_entries", &query).await
    }

    async fn claim_entry(&self, entry_id: &str) -> StorageResult<bool> {
        let affected = self
            .patch_where(
                "vault_entries",
                &[
                    ("id", format!("eq.{entry_id}")),
                    ("status", "eq.active".to_string()),
                ],
                &json!({ "status": "sending" }),
            )
            .await?;
        Ok(affected > 0)
    }

    async fn release_entry(&self, entry_id: &str) -> StorageResult<bool> {
        let affected = self
            .patch_where(
                "vault_entries",
                &[
                    ("id", format!("eq.{entry_id}")),
                    ("status", "eq.sending".to_string()),
                ],
                &json!({ "status": "active" }),
            )
            .await?;
        Ok(affected > 0)
    }

    async fn mark_entry_sent(&self, entry_id: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        let affected = self
            .patch_where(
                "vault_entries",
                &[
                    ("id", format!("eq.{entry_id}")),
                    ("status", "eq.sending".to_string()),
                ],
                &json!({ "status": "sent", "sent_at": ts(at) }),
            )
            .await?;
        Ok(affected > 0)
    }

    async fn delete_entry(&self, entry_id: &str) -> StorageResult<()> {
        self.delete_where("vault_entries", &[("id", format!("eq.{entry_id}"))])
            .await
    }

    async fn count_pending_entries(&self, user_id: &str) -> StorageResult<i64> {
        self.count_where(
            "vault_entries",
            &[
                ("user_id", format!("eq.{user_id}")),
                ("status", "in.(active,sending)".to_string()),
            ],
        )
        .await
    }

    async fn count_entries(&self, user_id: &str) -> StorageResult<i64> {
        self.count_where("vault_entries", &[("user_id", format!("eq.{user_id}"))])
            .await
    }

    async fn sent_entries_page(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<VaultEntry>> {
        let mut query = Self::keyset_query(after_id, limit);
        query.push(("status", "eq.sent".to_string()));
        query.push(("sent_at", format!("lt.{}", ts(cutoff))));
        self.select_rows("vault_entries", &query).await
    }

    async fn release_stale_sending(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        self.patch_where(
            "vault_entries",
            &[
                ("status", "eq.sending".to_string()),
                ("updated_at", format!("lt.{}", ts(cutoff))),
            ],
            &json!({ "status": "active" }),
        )
        .await
    }

    async fn insert_tombstone(&self, tombstone: &VaultEntryTombstone) -> StorageResult<()> {
        let body = serde_json::to_value(tombstone)
            .map_err(|e| StorageError::Malformed(format!("tombstone serialization: {e}")))?;
        match self.insert_row("vault_entry_tombstones", &body).await {
            // Re-sweeps may race; the history row is already there.
            Err(StorageError::Api { status: 409, .. }) => {
                tracing::debug!(entry_id = %tombstone.vault_entry_id, "tombstone already recorded");
                Ok(())
            }
            other => other,
        }
    }

    async fn count_tombstones(&self, user_id: &str) -> StorageResult<i64> {
        self.count_where(
            "vault_entry_tombstones",
            &[("user_id", format!("eq.{user_id}"))],
        )
        .await
    }

    async fn push_devices_for_user(&self, user_id: &str) -> StorageResult<Vec<PushDevice>> {
        let query = [
            ("select", "*".to_string()),
            ("user_id", format!("eq.{user_id}")),
        ];
        self.select_rows("push_devices", &query).await
    }

    async fn delete_push_device(&self, token: &str) -> StorageResult<()> {
        self.delete_where("push_devices", &[("token", format!("eq.{token}"))])
            .await
    }

    async fn remove_audio_object(&self, path: &str) -> StorageResult<()> {
        let url = format!("{}/object/{AUDIO_BUCKET}/{path}", self.storage_base);
        let response = self
            .http
            .delete(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(StorageError::Api {
            status: response.status().as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn delete_auth_user(&self, user_id: &str) -> StorageResult<()> {
        let url = format!("{}/users/{user_id}", self.admin_base);
        let response = self
            .http
            .delete(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(StorageError::Api {
            status: response.status().as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_config() {
        assert!(SupabaseStore::new("", "key").is_err());
        assert!(SupabaseStore::new("https://db.example.com", "").is_err());
    }

    #[test]
    fn trims_trailing_slash() {
        let store = SupabaseStore::new("https://db.example.com/", "key").unwrap();
        assert_eq!(store.rest_base, "https://db.example.com/rest/v1");
    }

    #[test]
    fn keyset_query_shape() {
        let query = SupabaseStore::keyset_query(Some("abc"), 200);
        assert!(query.contains(&("id", "gt.abc".to_string())));
        assert!(query.contains(&("order", "id.asc".to_string())));
        assert!(query.contains(&("limit", "200".to_string())));
    }
}

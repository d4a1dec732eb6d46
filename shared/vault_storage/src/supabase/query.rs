//! Request plumbing shared by the table operations
//!
//! PostgREST encodes filters in the query string (`status=eq.active`,
//! `sent_at=lt.<ts>`, `user_id=in.(a,b)`) and signals row counts through the
//! `Content-Range` header. Conditional updates ask for
//! `Prefer: return=representation` so the number of affected rows is the
//! length of the returned array.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

use super::SupabaseStore;

/// How much of an error body is worth keeping in logs
const ERROR_BODY_LIMIT: usize = 512;

/// Timestamp rendering used in both filters and bodies. The trailing `Z`
/// form avoids `+` in query strings.
pub(super) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SupabaseStore {
    fn rest_url(&self, table: &str) -> String {
        format!("{}/{table}", self.rest_base)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn ensure_success(response: reqwest::Response) -> StorageResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(ERROR_BODY_LIMIT);
        Err(StorageError::Api {
            status: status.as_u16(),
            body,
        })
    }

    pub(super) async fn select_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> StorageResult<Vec<T>> {
        let response = self
            .authed(self.http.get(self.rest_url(table)).query(query))
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| StorageError::Malformed(format!("{table} rows: {e}")))
    }

    /// Filtered `PATCH` returning how many rows the filters matched
    pub(super) async fn patch_where(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: &Value,
    ) -> StorageResult<usize> {
        let response = self
            .authed(self.http.patch(self.rest_url(table)).query(filters))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| StorageError::Malformed(format!("{table} patch result: {e}")))?;
        Ok(rows.len())
    }

    pub(super) async fn insert_row(&self, table: &str, body: &Value) -> StorageResult<()> {
        let response = self
            .authed(self.http.post(self.rest_url(table)))
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    pub(super) async fn delete_where(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> StorageResult<()> {
        let response = self
            .authed(self.http.delete(self.rest_url(table)).query(filters))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// Exact count without fetching rows: `Prefer: count=exact` over a
    /// zero-width `Range`, answered in `Content-Range: 0-0/<total>`
    pub(super) async fn count_where(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> StorageResult<i64> {
        let mut query: Vec<(&str, String)> = vec![("select", "id".to_string())];
        query.extend(filters.iter().map(|(k, v)| (*k, v.clone())));

        let response = self
            .authed(self.http.get(self.rest_url(table)).query(&query))
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0")
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let content_range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StorageError::Malformed(format!("{table} count: missing range")))?;
        content_range
            .rsplit('/')
            .next()
            .and_then(|total| total.parse::<i64>().ok())
            .ok_or_else(|| {
                StorageError::Malformed(format!("{table} count: bad range {content_range}"))
            })
    }
}

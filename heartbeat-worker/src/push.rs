//! Push notifications through the FCM HTTP v1 API
//!
//! Sends authenticate with a short-lived OAuth access token minted from the
//! service-account credential. The token is cached for the run and refreshed
//! proactively after 45 minutes, or reactively once when a send comes back
//! 401/403. Provider responses naming a dead registration token surface as
//! [`PushOutcome::InvalidToken`] so the caller can prune the device row.

use std::collections::BTreeMap;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::retry::{HttpClientError, RetryClient};

/// FCM HTTP v1 base
const FCM_BASE: &str = "https://fcm.googleapis.com/v1";
/// OAuth scope required for messaging
const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
/// Token endpoint used when the credential does not name one
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// JWT-bearer grant type
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Assertion lifetime requested from the token endpoint
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Cached tokens older than this are refreshed before use
const TOKEN_MAX_AGE_MINS: i64 = 45;

/// Provider response fragments that mean the registration token is dead
const INVALID_TOKEN_MARKERS: [&str; 4] = [
    "unregistered",
    "registration-token-not-registered",
    "invalid registration token",
    "requested entity was not found",
];

/// Errors from the push pipeline
#[derive(Error, Debug)]
pub enum PushError {
    /// The service-account credential is unusable
    #[error("push credential error: {0}")]
    Credential(String),

    /// Provider or token-endpoint HTTP failure
    #[error(transparent)]
    Http(#[from] HttpClientError),

    /// The token endpoint answered without an access token
    #[error("token endpoint returned no access token")]
    MissingAccessToken,
}

/// What a single push send did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted by the provider
    Delivered,
    /// The registration token is dead; delete the device row
    InvalidToken,
}

/// One notification: visible title/body plus a data payload for the app
#[derive(Debug, Clone)]
pub struct PushNote {
    /// Notification title
    pub title: String,
    /// Notification body
    pub body: String,
    /// App-facing key/value payload
    pub data: BTreeMap<String, String>,
}

/// Push delivery seam
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Sends one notification to one device token
    async fn send(&self, device_token: &str, note: &PushNote) -> Result<PushOutcome, PushError>;
}

/// Whether a provider response body names a dead registration token
#[must_use]
pub fn is_invalid_token_response(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    INVALID_TOKEN_MARKERS
        .iter()
        .any(|marker| body.contains(marker))
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    project_id: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

struct CachedToken {
    access_token: String,
    minted_at: DateTime<Utc>,
}

/// FCM-backed push gateway
pub struct FcmClient {
    client: Arc<RetryClient>,
    signing_key: jsonwebtoken::EncodingKey,
    client_email: String,
    project_id: String,
    token_uri: String,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for FcmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmClient")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl FcmClient {
    /// Parses the service-account JSON and prepares the signing key
    ///
    /// # Errors
    ///
    /// `PushError::Credential` when the JSON is invalid, the project id is
    /// empty, or the private key is not usable RSA PEM
    pub fn from_service_account_json(
        client: Arc<RetryClient>,
        credential_json: &str,
    ) -> Result<Self, PushError> {
        let account: ServiceAccountKey = serde_json::from_str(credential_json)
            .map_err(|e| PushError::Credential(format!("invalid service account JSON: {e}")))?;
        if account.project_id.is_empty() {
            return Err(PushError::Credential(
                "service account has no project_id".to_string(),
            ));
        }
        let signing_key = jsonwebtoken::EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| PushError::Credential(format!("invalid private key: {e}")))?;

        Ok(Self {
            client,
            signing_key,
            client_email: account.client_email,
            project_id: account.project_id,
            token_uri: account
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self, force_refresh: bool) -> Result<String, PushError> {
        let mut cached = self.token.lock().await;
        if !force_refresh {
            if let Some(token) = cached.as_ref() {
                let age = Utc::now() - token.minted_at;
                if age < Duration::minutes(TOKEN_MAX_AGE_MINS) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &self.signing_key,
        )
        .map_err(|e| PushError::Credential(format!("assertion signing failed: {e}")))?;

        let response = self
            .client
            .post_form(
                &self.token_uri,
                &[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)],
            )
            .await?;
        let access_token = response
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or(PushError::MissingAccessToken)?
            .to_string();

        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            minted_at: Utc::now(),
        });
        Ok(access_token)
    }

    async fn post_message(
        &self,
        access_token: &str,
        device_token: &str,
        note: &PushNote,
    ) -> Result<serde_json::Value, HttpClientError> {
        let url = format!("{FCM_BASE}/projects/{}/messages:send", self.project_id);
        let body = json!({
            "message": {
                "token": device_token,
                "notification": {
                    "title": note.title,
                    "body": note.body,
                },
                "data": note.data,
            }
        });
        self.client
            .post_json(&url, Some(access_token), None, &body)
            .await
    }
}

#[async_trait]
impl PushGateway for FcmClient {
    async fn send(&self, device_token: &str, note: &PushNote) -> Result<PushOutcome, PushError> {
        let access_token = self.access_token(false).await?;
        match self.post_message(&access_token, device_token, note).await {
            Ok(_) => Ok(PushOutcome::Delivered),
            Err(err) => {
                if err.body().is_some_and(is_invalid_token_response) {
                    return Ok(PushOutcome::InvalidToken);
                }
                // One refresh-and-retry when the token aged out mid-run
                if matches!(err.status(), Some(401 | 403)) {
                    let refreshed = self.access_token(true).await?;
                    return match self.post_message(&refreshed, device_token, note).await {
                        Ok(_) => Ok(PushOutcome::Delivered),
                        Err(retry_err) if retry_err.body().is_some_and(is_invalid_token_response) => {
                            Ok(PushOutcome::InvalidToken)
                        }
                        Err(retry_err) => Err(retry_err.into()),
                    };
                }
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_markers_match_provider_spellings() {
        assert!(is_invalid_token_response("UNREGISTERED"));
        assert!(is_invalid_token_response(
            "error: registration-token-not-registered"
        ));
        assert!(is_invalid_token_response("Invalid registration token"));
        assert!(is_invalid_token_response("Requested entity was not found"));
        assert!(!is_invalid_token_response("internal server error"));
    }

    #[test]
    fn credential_parsing_requires_project_id() {
        let client = Arc::new(RetryClient::new());
        let err = FcmClient::from_service_account_json(
            client,
            r#"{"client_email":"svc@p.iam.gserviceaccount.com","private_key":"x","project_id":""}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PushError::Credential(_)));
    }
}

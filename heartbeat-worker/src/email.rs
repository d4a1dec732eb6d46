//! Outbound email through the transactional provider
//!
//! Single sends carry reminder and courtesy mail; unlock deliveries go
//! through the batch endpoint, chunked at the provider's 100-message limit
//! with an indexed idempotency key per chunk.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::retry::{HttpClientError, RetryClient};

/// Production API base
const RESEND_API_BASE: &str = "https://api.resend.com";
/// Provider limit on messages per batch call
pub const BATCH_CHUNK_SIZE: usize = 100;
/// Unsubscribe header attached to every send
const LIST_UNSUBSCRIBE: &str = "<mailto:afterword.app@gmail.com?subject=Unsubscribe>";
/// Display name used when wrapping a bare from address
const FROM_DISPLAY_NAME: &str = "Afterword";

/// One outbound message in the provider's wire shape
#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    /// Display-formatted sender
    pub from: String,
    /// Recipient addresses
    pub to: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub text: String,
    /// HTML body
    pub html: String,
    /// Extra headers (List-Unsubscribe)
    pub headers: BTreeMap<String, String>,
}

impl EmailMessage {
    /// Builds a message with the standard headers and from wrapping
    #[must_use]
    pub fn new(from: &str, to: &str, subject: &str, text: String, html: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("List-Unsubscribe".to_string(), LIST_UNSUBSCRIBE.to_string());
        Self {
            from: wrap_from_address(from),
            to: vec![to.to_string()],
            subject: subject.to_string(),
            text,
            html,
            headers,
        }
    }
}

/// Wraps a bare address as `"Afterword <addr>"`; display-formatted
/// addresses pass through
#[must_use]
pub fn wrap_from_address(address: &str) -> String {
    if address.contains('<') {
        address.to_string()
    } else {
        format!("{FROM_DISPLAY_NAME} <{address}>")
    }
}

/// Wraps body markup in a small responsive document shell
#[must_use]
pub fn render_html_document(title: &str, body_html: &str) -> String {
    format!(
        concat!(
            "<!DOCTYPE html>",
            "<html lang=\"en\"><head><meta charset=\"utf-8\">",
            "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">",
            "<title>{title}</title></head>",
            "<body style=\"margin:0;padding:0;background-color:#f4f4f5;\">",
            "<div style=\"max-width:600px;margin:0 auto;padding:24px 16px;",
            "font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,sans-serif;",
            "color:#18181b;line-height:1.6;\">{body}</div>",
            "</body></html>"
        ),
        title = title,
        body = body_html
    )
}

/// Idempotency key for one chunk of a batch; single-chunk batches keep the
/// bare key
#[must_use]
pub fn chunk_idempotency_key(base: &str, chunk_count: usize, chunk_index: usize) -> String {
    if chunk_count <= 1 {
        base.to_string()
    } else {
        format!("{base}-{chunk_index}")
    }
}

/// Outbound email seam
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends one message
    async fn send(
        &self,
        message: &EmailMessage,
        idempotency_key: Option<&str>,
    ) -> Result<(), HttpClientError>;

    /// Sends a batch, chunking at the provider limit. Any chunk failure
    /// fails the whole batch.
    async fn send_batch(
        &self,
        messages: &[EmailMessage],
        idempotency_key: &str,
    ) -> Result<(), HttpClientError>;
}

/// Resend-backed mailer
pub struct ResendMailer {
    client: Arc<RetryClient>,
    api_key: String,
    base_url: String,
}

impl ResendMailer {
    /// Creates the mailer over a shared retry client
    #[must_use]
    pub fn new(client: Arc<RetryClient>, api_key: String) -> Self {
        Self::with_base_url(client, api_key, RESEND_API_BASE.to_string())
    }

    /// Creates the mailer against a custom API base (tests)
    #[must_use]
    pub fn with_base_url(client: Arc<RetryClient>, api_key: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(
        &self,
        message: &EmailMessage,
        idempotency_key: Option<&str>,
    ) -> Result<(), HttpClientError> {
        let body = serde_json::to_value(message).unwrap_or_default();
        let url = format!("{}/emails", self.base_url);
        self.client
            .post_json(&url, Some(&self.api_key), idempotency_key, &body)
            .await?;
        Ok(())
    }

    async fn send_batch(
        &self,
        messages: &[EmailMessage],
        idempotency_key: &str,
    ) -> Result<(), HttpClientError> {
        let chunks: Vec<&[EmailMessage]> = messages.chunks(BATCH_CHUNK_SIZE).collect();
        let chunk_count = chunks.len();
        let url = format!("{}/emails/batch", self.base_url);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let key = chunk_idempotency_key(idempotency_key, chunk_count, index);
            let body = serde_json::to_value(chunk).unwrap_or_default();
            self.client
                .post_json(&url, Some(&self.api_key), Some(&key), &body)
                .await?;
        }
        Ok(())
    }
}

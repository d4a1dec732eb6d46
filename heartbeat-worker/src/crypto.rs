//! Envelope decryption and entry integrity checks
//!
//! Envelopes are the dotted triple `base64(nonce).base64(ciphertext).base64(tag)`
//! produced by the client, decryptable with AES-256-GCM under the SHA-256 of
//! the process-wide server secret. Newer clients wrap two envelopes in a JSON
//! object `{v, server, device}`; only the `server` one is readable here.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// AES-GCM nonce length used by the client envelopes
const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

/// Errors from envelope handling
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The stored string is not a decodable `nonce.ciphertext.tag` triple
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),

    /// Well-formed envelope, wrong key or tampered ciphertext
    #[error("envelope decryption failed")]
    DecryptFailed,
}

/// Process-wide decryption context derived from the server secret
pub struct ServerCrypto {
    key: [u8; 32],
}

impl ServerCrypto {
    /// Derives the envelope key: SHA-256 over the utf-8 secret
    #[must_use]
    pub fn new(server_secret: &str) -> Self {
        let key = Sha256::digest(server_secret.as_bytes()).into();
        Self { key }
    }

    /// Decrypts a stored envelope, unwrapping a JSON `{server: …}` wrapper
    /// first when present
    ///
    /// # Errors
    ///
    /// `CryptoError::Malformed` when the triple does not decode,
    /// `CryptoError::DecryptFailed` when AES-GCM rejects it
    pub fn decrypt_envelope(&self, stored: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = extract_server_envelope(stored);
        let (nonce, ciphertext, tag) = decode_secret_box(&encoded)?;

        let mut combined = ciphertext;
        combined.extend_from_slice(&tag);
        if combined.len() < TAG_LEN {
            return Err(CryptoError::Malformed("ciphertext shorter than tag"));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), combined.as_ref())
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Decrypts an envelope into trimmed utf-8 text
    ///
    /// # Errors
    ///
    /// As [`Self::decrypt_envelope`], plus `Malformed` for non-utf-8
    /// plaintext
    pub fn decrypt_envelope_text(&self, stored: &str) -> Result<String, CryptoError> {
        let plain = self.decrypt_envelope(stored)?;
        let text =
            String::from_utf8(plain).map_err(|_| CryptoError::Malformed("non-utf8 plaintext"))?;
        Ok(text.trim().to_string())
    }
}

/// Pulls the server-readable envelope out of a stored string: a JSON object
/// with a non-empty string field `server` yields that field, anything else
/// is already the envelope
#[must_use]
pub fn extract_server_envelope(stored: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(stored) {
        if let Some(serde_json::Value::String(server)) = map.get("server") {
            if !server.is_empty() {
                return server.clone();
            }
        }
    }
    stored.to_string()
}

fn decode_secret_box(encoded: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CryptoError> {
    let parts: Vec<&str> = encoded.split('.').collect();
    if parts.len() != 3 {
        return Err(CryptoError::Malformed("expected nonce.ciphertext.tag"));
    }
    let nonce = BASE64
        .decode(parts[0])
        .map_err(|_| CryptoError::Malformed("bad nonce encoding"))?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Malformed("bad nonce length"));
    }
    let ciphertext = BASE64
        .decode(parts[1])
        .map_err(|_| CryptoError::Malformed("bad ciphertext encoding"))?;
    let tag = BASE64
        .decode(parts[2])
        .map_err(|_| CryptoError::Malformed("bad tag encoding"))?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::Malformed("bad tag length"));
    }
    Ok((nonce, ciphertext, tag))
}

/// base64 HMAC-SHA256 over the utf-8 message
#[must_use]
pub fn compute_hmac_signature(message: &str, key: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Constant-time check of a stored base64 signature against the message.
/// An undecodable stored signature is a mismatch, not an error.
#[must_use]
pub fn verify_hmac_signature(message: &str, key: &[u8], stored_signature: &str) -> bool {
    let Ok(expected) = BASE64.decode(stored_signature) else {
        return false;
    };
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// The canonical message an entry's signature covers
#[must_use]
pub fn entry_canonical_message(payload_encrypted: &str, recipient_encrypted: &str) -> String {
    format!("{payload_encrypted}|{recipient_encrypted}")
}

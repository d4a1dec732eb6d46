#![allow(dead_code)]

//! Shared fixtures and mock providers for the worker's scenario tests

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use vault_storage::memory::MemoryStore;
use vault_storage::{
    ActionType, EntryStatus, EnvelopeCiphertext, Profile, ProfileStatus, PushDevice, VaultEntry,
    VaultStore,
};

use heartbeat_worker::cleanup::CleanupSweeper;
use heartbeat_worker::crypto::{compute_hmac_signature, entry_canonical_message, ServerCrypto};
use heartbeat_worker::cycle::HeartbeatCycle;
use heartbeat_worker::downgrade::DowngradeReverter;
use heartbeat_worker::email::{EmailMessage, Mailer};
use heartbeat_worker::executor::EntryExecutor;
use heartbeat_worker::lifecycle::LifecycleController;
use heartbeat_worker::notify::NotificationDispatcher;
use heartbeat_worker::push::{PushError, PushGateway, PushNote, PushOutcome};
use heartbeat_worker::retry::HttpClientError;

pub const SERVER_SECRET: &str = "test-server-secret";
pub const FROM_EMAIL: &str = "vault@afterword.app";
pub const VIEWER_BASE: &str = "https://viewer.afterword.app";
pub const HMAC_KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

/// Client-side envelope encryption, mirrored here so fixtures decrypt with
/// the production code path
pub fn encrypt_envelope(secret: &str, plaintext: &[u8]) -> String {
    let key = Sha256::digest(secret.as_bytes());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let combined = cipher.encrypt(&nonce, plaintext).unwrap();
    let (ciphertext, tag) = combined.split_at(combined.len() - 16);
    format!(
        "{}.{}.{}",
        BASE64.encode(nonce),
        BASE64.encode(ciphertext),
        BASE64.encode(tag)
    )
}

pub fn profile(id: &str) -> Profile {
    Profile {
        id: id.to_string(),
        email: Some(format!("{id}@example.com")),
        sender_name: Some("Ada".to_string()),
        status: ProfileStatus::Active,
        subscription_status: Some("free".to_string()),
        last_check_in: None,
        timer_days: Some(30),
        hmac_key_encrypted: None,
        warning_sent_at: None,
        push_66_sent_at: None,
        push_33_sent_at: None,
        protocol_executed_at: None,
        had_vault_activity: false,
        selected_theme: None,
        selected_soul_fire: None,
        created_at: None,
    }
}

/// Profile whose HMAC key envelope decrypts to [`HMAC_KEY`]
pub fn profile_with_hmac_key(id: &str) -> Profile {
    let mut profile = profile(id);
    profile.hmac_key_encrypted = Some(EnvelopeCiphertext(encrypt_envelope(
        SERVER_SECRET,
        HMAC_KEY,
    )));
    profile
}

pub fn bare_entry(id: &str, user_id: &str, action: ActionType) -> VaultEntry {
    VaultEntry {
        id: id.to_string(),
        user_id: user_id.to_string(),
        title: Some("For you".to_string()),
        action_type: Some(action),
        data_type: Some("text".to_string()),
        status: EntryStatus::Active,
        payload_encrypted: Some("opaque-client-ciphertext".to_string()),
        recipient_email_encrypted: None,
        data_key_encrypted: None,
        hmac_signature: None,
        audio_file_path: None,
        sent_at: None,
        updated_at: None,
    }
}

/// A send entry whose envelopes decrypt and whose signature verifies
pub fn valid_send_entry(id: &str, user_id: &str, recipient: &str) -> VaultEntry {
    let mut entry = bare_entry(id, user_id, ActionType::Send);
    let recipient_ciphertext = encrypt_envelope(SERVER_SECRET, recipient.as_bytes());
    let payload = entry.payload_encrypted.clone().unwrap();
    entry.hmac_signature = Some(compute_hmac_signature(
        &entry_canonical_message(&payload, &recipient_ciphertext),
        HMAC_KEY,
    ));
    entry.recipient_email_encrypted = Some(EnvelopeCiphertext(recipient_ciphertext));
    entry.data_key_encrypted = Some(EnvelopeCiphertext(encrypt_envelope(
        SERVER_SECRET,
        b"per-entry-data-key-32-bytes-long",
    )));
    entry
}

// ---- mock providers ----

#[derive(Default)]
pub struct MockMailer {
    pub sent: Mutex<Vec<(EmailMessage, Option<String>)>>,
    pub batches: Mutex<Vec<(Vec<EmailMessage>, String)>>,
    pub fail_batches: AtomicBool,
}

impl MockMailer {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(
        &self,
        message: &EmailMessage,
        idempotency_key: Option<&str>,
    ) -> Result<(), HttpClientError> {
        self.sent
            .lock()
            .unwrap()
            .push((message.clone(), idempotency_key.map(String::from)));
        Ok(())
    }

    async fn send_batch(
        &self,
        messages: &[EmailMessage],
        idempotency_key: &str,
    ) -> Result<(), HttpClientError> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(HttpClientError::Exhausted {
                attempts: 4,
                status: 503,
                body: "provider down".to_string(),
            });
        }
        self.batches
            .lock()
            .unwrap()
            .push((messages.to_vec(), idempotency_key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPush {
    pub delivered: Mutex<Vec<(String, PushNote)>>,
    pub invalid_tokens: Mutex<BTreeSet<String>>,
}

impl MockPush {
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn mark_invalid(&self, token: &str) {
        self.invalid_tokens.lock().unwrap().insert(token.to_string());
    }
}

#[async_trait]
impl PushGateway for MockPush {
    async fn send(&self, device_token: &str, note: &PushNote) -> Result<PushOutcome, PushError> {
        if self.invalid_tokens.lock().unwrap().contains(device_token) {
            return Ok(PushOutcome::InvalidToken);
        }
        self.delivered
            .lock()
            .unwrap()
            .push((device_token.to_string(), note.clone()));
        Ok(PushOutcome::Delivered)
    }
}

// ---- wiring ----

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<MockMailer>,
    pub push: Arc<MockPush>,
    pub cycle: HeartbeatCycle,
}

/// Full worker wiring over the in-memory store and mock providers
pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(MockMailer::default());
    let push = Arc::new(MockPush::default());
    let (dispatcher, executor, lifecycle, downgrade, cleanup, crypto) =
        components(&store, &mailer, &push);

    let cycle = HeartbeatCycle::new(
        store.clone(),
        executor,
        lifecycle,
        dispatcher,
        downgrade,
        cleanup,
        crypto,
        CancellationToken::new(),
    );

    Harness {
        store,
        mailer,
        push,
        cycle,
    }
}

pub struct ExecHarness {
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<MockMailer>,
    pub push: Arc<MockPush>,
    pub executor: EntryExecutor,
    pub lifecycle: LifecycleController,
}

impl ExecHarness {
    pub fn fail_batches(&self) {
        self.mailer.fail_batches.store(true, Ordering::SeqCst);
    }
}

/// Executor + lifecycle only, for tests that assert on the summary
pub fn exec_harness() -> ExecHarness {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(MockMailer::default());
    let push = Arc::new(MockPush::default());
    let (_, executor, lifecycle, _, _, _) = components(&store, &mailer, &push);

    ExecHarness {
        store,
        mailer,
        push,
        executor,
        lifecycle,
    }
}

type Components = (
    Arc<NotificationDispatcher>,
    EntryExecutor,
    LifecycleController,
    DowngradeReverter,
    CleanupSweeper,
    Arc<ServerCrypto>,
);

fn components(
    store: &Arc<MemoryStore>,
    mailer: &Arc<MockMailer>,
    push: &Arc<MockPush>,
) -> Components {
    let store: Arc<dyn VaultStore> = store.clone();
    let mailer: Arc<dyn Mailer> = mailer.clone();
    let push: Arc<dyn PushGateway> = push.clone();
    let crypto = Arc::new(ServerCrypto::new(SERVER_SECRET));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        store.clone(),
        mailer.clone(),
        Some(push),
        FROM_EMAIL.to_string(),
    ));
    let executor = EntryExecutor::new(
        store.clone(),
        mailer.clone(),
        dispatcher.clone(),
        crypto.clone(),
        FROM_EMAIL.to_string(),
        VIEWER_BASE.to_string(),
    );
    let lifecycle = LifecycleController::new(store.clone());
    let downgrade = DowngradeReverter::new(store.clone(), mailer, FROM_EMAIL.to_string());
    let cleanup = CleanupSweeper::new(store);

    (dispatcher, executor, lifecycle, downgrade, cleanup, crypto)
}

pub fn device(user_id: &str, token: &str) -> PushDevice {
    PushDevice {
        user_id: user_id.to_string(),
        token: token.to_string(),
    }
}

/// Entries of a user indexed by id, for terse assertions
pub fn entries_by_id(store: &MemoryStore, user_id: &str) -> HashMap<String, VaultEntry> {
    store
        .entries_for_user(user_id)
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect()
}

pub fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - chrono::Duration::days(days)
}

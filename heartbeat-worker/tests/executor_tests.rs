//! End-to-end execution scenarios over the in-memory store

mod common;

use chrono::Utc;
use pretty_assertions::assert_eq;
use vault_storage::{ActionType, EntryStatus, ProfileStatus};

use common::*;

#[tokio::test]
async fn happy_path_send_delivers_and_enters_grace() {
    let h = harness();
    let now = Utc::now();
    let mut profile = profile_with_hmac_key("user-1");
    profile.last_check_in = Some(days_ago(now, 31));
    h.store.put_profile(profile);
    h.store
        .put_entry(valid_send_entry("entry-1", "user-1", "ben@example.com"));

    let report = h.cycle.run(now, None).await.unwrap();

    assert_eq!(report.executions, 1);
    assert_eq!(report.entries_sent, 1);
    assert_eq!(h.mailer.batch_count(), 1);

    let (messages, key) = h.mailer.batches.lock().unwrap()[0].clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].subject, "Message from Ada");
    assert_eq!(messages[0].to, vec!["ben@example.com".to_string()]);
    assert!(messages[0]
        .text
        .contains("https://viewer.afterword.app/?entry=entry-1"));
    assert!(messages[0].text.contains("Security Key: "));
    assert_eq!(key, format!("unlock-batch-user-1-{}", now.timestamp()));

    let entry = h.store.entry("entry-1").unwrap();
    assert_eq!(entry.status, EntryStatus::Sent);
    assert_eq!(entry.sent_at, Some(now));

    let profile = h.store.profile("user-1").unwrap();
    assert_eq!(profile.status, ProfileStatus::Inactive);
    assert_eq!(profile.timer_days, Some(30));
    assert_eq!(profile.protocol_executed_at, Some(now));
    assert!(profile.had_vault_activity);
    assert_eq!(profile.warning_sent_at, None);
}

#[tokio::test]
async fn destroy_only_expiry_resets_profile_fresh_active() {
    let h = harness();
    let now = Utc::now();
    let mut profile = profile_with_hmac_key("user-2");
    profile.last_check_in = Some(days_ago(now, 31));
    h.store.put_profile(profile);
    h.store.put_device(device("user-2", "tok-2"));
    let mut entry = bare_entry("entry-2", "user-2", ActionType::Destroy);
    entry.data_type = Some("audio".to_string());
    entry.audio_file_path = Some("user-2/entry-2.enc".to_string());
    h.store.put_entry(entry);

    let report = h.cycle.run(now, None).await.unwrap();

    assert_eq!(report.entries_destroyed, 1);
    assert_eq!(h.store.entry("entry-2"), None);
    assert_eq!(h.store.removed_audio(), vec!["user-2/entry-2.enc".to_string()]);
    assert_eq!(h.mailer.batch_count(), 0);

    // Owner push carries the destroyed verb
    let delivered = h.push.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].1.body.contains("destroyed"));

    let profile = h.store.profile("user-2").unwrap();
    assert_eq!(profile.status, ProfileStatus::Active);
    assert_eq!(profile.last_check_in, Some(now));
    assert_eq!(profile.timer_days, Some(30));
    assert_eq!(profile.protocol_executed_at, None);
    assert!(profile.had_vault_activity);
}

#[tokio::test]
async fn null_hmac_key_preserves_every_send_entry() {
    let h = exec_harness();
    let now = Utc::now();
    let mut profile = profile("user-3");
    profile.last_check_in = Some(days_ago(now, 31));
    h.store.put_profile(profile.clone());

    let mut entries = Vec::new();
    for i in 0..6 {
        let entry = valid_send_entry(&format!("send-{i}"), "user-3", "ben@example.com");
        h.store.put_entry(entry.clone());
        entries.push(entry);
    }
    for i in 0..3 {
        let entry = bare_entry(&format!("destroy-{i}"), "user-3", ActionType::Destroy);
        h.store.put_entry(entry.clone());
        entries.push(entry);
    }

    let summary = h
        .executor
        .execute_for_profile(&profile, &entries, None, now)
        .await;

    assert!(!summary.had_send);
    assert_eq!(summary.input_send_count, 6);
    assert_eq!(summary.released, 6);
    assert_eq!(summary.destroyed, 3);
    assert_eq!(summary.sent, 0);
    assert_eq!(h.mailer.batch_count(), 0);

    let remaining = entries_by_id(&h.store, "user-3");
    assert_eq!(remaining.len(), 6);
    for i in 0..6 {
        assert_eq!(remaining[&format!("send-{i}")].status, EntryStatus::Active);
    }
    for i in 0..3 {
        assert!(!remaining.contains_key(&format!("destroy-{i}")));
    }

    // Settling must not reset the profile while entries are still owed
    h.lifecycle.settle(&profile, &summary, now).await.unwrap();
    let profile = h.store.profile("user-3").unwrap();
    assert_eq!(profile.status, ProfileStatus::Active);
    assert_eq!(profile.last_check_in, Some(days_ago(now, 31)));
    assert!(profile.had_vault_activity);
}

#[tokio::test]
async fn tampered_signature_releases_without_email() {
    let h = harness();
    let now = Utc::now();
    let mut profile = profile_with_hmac_key("user-4");
    profile.last_check_in = Some(days_ago(now, 31));
    h.store.put_profile(profile);
    let mut entry = valid_send_entry("entry-4", "user-4", "ben@example.com");
    entry.payload_encrypted = Some("tampered-after-signing".to_string());
    h.store.put_entry(entry);

    let report = h.cycle.run(now, None).await.unwrap();

    assert_eq!(report.entries_sent, 0);
    assert_eq!(report.entries_released, 1);
    assert_eq!(h.mailer.batch_count(), 0);
    let entry = h.store.entry("entry-4").unwrap();
    assert_eq!(entry.status, EntryStatus::Active);
    assert_eq!(entry.sent_at, None);
}

#[tokio::test]
async fn invalid_recipient_releases_the_claim() {
    let h = exec_harness();
    let now = Utc::now();
    let profile = profile_with_hmac_key("user-5");
    h.store.put_profile(profile.clone());
    let entry = valid_send_entry("entry-5", "user-5", "not-an-address");
    h.store.put_entry(entry.clone());

    let summary = h
        .executor
        .execute_for_profile(&profile, &[entry], Some(HMAC_KEY), now)
        .await;

    assert_eq!(summary.released, 1);
    assert_eq!(h.store.entry("entry-5").unwrap().status, EntryStatus::Active);
    assert_eq!(h.mailer.batch_count(), 0);
}

#[tokio::test]
async fn batch_failure_releases_all_prepared_entries() {
    let h = exec_harness();
    let now = Utc::now();
    let profile = profile_with_hmac_key("user-6");
    h.store.put_profile(profile.clone());
    let entries: Vec<_> = (0..3)
        .map(|i| valid_send_entry(&format!("entry-{i}"), "user-6", "ben@example.com"))
        .collect();
    for entry in &entries {
        h.store.put_entry(entry.clone());
    }
    h.fail_batches();

    let summary = h
        .executor
        .execute_for_profile(&profile, &entries, Some(HMAC_KEY), now)
        .await;

    assert!(!summary.had_send);
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.released, 3);
    for i in 0..3 {
        let entry = h.store.entry(&format!("entry-{i}")).unwrap();
        assert_eq!(entry.status, EntryStatus::Active);
        assert_eq!(entry.sent_at, None);
    }
}

#[tokio::test]
async fn entries_claimed_elsewhere_are_skipped() {
    let h = exec_harness();
    let now = Utc::now();
    let profile = profile_with_hmac_key("user-7");
    h.store.put_profile(profile.clone());
    let mut entry = valid_send_entry("entry-7", "user-7", "ben@example.com");
    entry.status = vault_storage::EntryStatus::Sending;
    h.store.put_entry(entry.clone());

    let summary = h
        .executor
        .execute_for_profile(&profile, &[entry], Some(HMAC_KEY), now)
        .await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.sent, 0);
    assert_eq!(h.mailer.batch_count(), 0);
    // Still owned by the other runner
    assert_eq!(h.store.entry("entry-7").unwrap().status, EntryStatus::Sending);
}

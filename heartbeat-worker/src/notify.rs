//! Reminder and execution notifications
//!
//! Reminders fire at most once per check-in cycle: the stamp columns are
//! compared against `last_check_in`, so a fresh check-in re-arms every
//! trigger while concurrent runs at worst duplicate one send. Provider
//! failures are logged and swallowed — a delayed reminder is acceptable,
//! a crashed cycle is not.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{info, warn};
use vault_storage::{Profile, ReminderStage, VaultStore};

use crate::email::{render_html_document, EmailMessage, Mailer};
use crate::push::{PushGateway, PushNote, PushOutcome};
use crate::timer::{already_marked_in_cycle, is_paid, TimerState};

/// Urgency thresholds on the remaining fraction
const URGENT_BELOW: f64 = 0.10;
const CRITICAL_BELOW: f64 = 0.33;
const HALFWAY_BELOW: f64 = 0.66;

/// What a reminder pass did for one profile
#[derive(Debug, Default, Clone, Copy)]
pub struct ReminderActivity {
    /// Whether the 24 h warning email went out
    pub warning_email_sent: bool,
    /// Push notifications delivered across stages and devices
    pub pushes_sent: usize,
}

/// How an executed entry is described to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutedVerb {
    /// Delivered to the beneficiary
    Sent,
    /// Destroyed without delivery
    Destroyed,
}

/// Sends reminder email, staged pushes and post-execution notifications
pub struct NotificationDispatcher {
    store: Arc<dyn VaultStore>,
    mailer: Arc<dyn Mailer>,
    push: Option<Arc<dyn PushGateway>>,
    from_email: String,
}

impl NotificationDispatcher {
    /// Creates the dispatcher; `push` is `None` when the credential is
    /// absent
    #[must_use]
    pub fn new(
        store: Arc<dyn VaultStore>,
        mailer: Arc<dyn Mailer>,
        push: Option<Arc<dyn PushGateway>>,
        from_email: String,
    ) -> Self {
        Self {
            store,
            mailer,
            push,
            from_email,
        }
    }

    /// Runs every due-and-unsent reminder for a non-expired profile
    pub async fn process_reminders(
        &self,
        profile: &Profile,
        timer: &TimerState,
        now: DateTime<Utc>,
    ) -> ReminderActivity {
        let mut activity = ReminderActivity::default();
        let Some(last_check_in) = profile.last_check_in else {
            return activity;
        };

        if is_paid(profile.subscription_status.as_deref())
            && now >= timer.email_24h_at
            && !already_marked_in_cycle(profile.warning_sent_at, last_check_in)
        {
            activity.warning_email_sent = self.send_warning_email(profile, timer, now).await;
        }

        if now >= timer.push_66_at
            && !already_marked_in_cycle(profile.push_66_sent_at, last_check_in)
        {
            activity.pushes_sent += self
                .send_reminder_push(profile, ReminderStage::TwoThirds, timer, now)
                .await;
        }

        if now >= timer.push_33_at
            && !already_marked_in_cycle(profile.push_33_sent_at, last_check_in)
        {
            activity.pushes_sent += self
                .send_reminder_push(profile, ReminderStage::OneThird, timer, now)
                .await;
        }

        activity
    }

    /// Best-effort owner notification after an entry executed
    pub async fn send_executed_push(&self, user_id: &str, entry_title: &str, verb: ExecutedVerb) {
        let body = match verb {
            ExecutedVerb::Sent => format!("\"{entry_title}\" was delivered to its recipient."),
            ExecutedVerb::Destroyed => format!("\"{entry_title}\" was destroyed as instructed."),
        };
        let mut data = BTreeMap::new();
        data.insert("type".to_string(), "protocol_executed".to_string());
        data.insert(
            "action".to_string(),
            match verb {
                ExecutedVerb::Sent => "sent".to_string(),
                ExecutedVerb::Destroyed => "destroyed".to_string(),
            },
        );
        let note = PushNote {
            title: "Afterword".to_string(),
            body,
            data,
        };
        self.dispatch_to_devices(user_id, &note).await;
    }

    async fn send_warning_email(
        &self,
        profile: &Profile,
        timer: &TimerState,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(email) = profile.email.as_deref() else {
            return false;
        };

        let name = profile.display_name();
        let deadline_text = timer.deadline.format("%b %d, %Y").to_string();
        let urgency = urgency_line(timer.remaining_fraction);
        let text = format!(
            "Hi {name},\n\n{urgency}\n\nYour Afterword timer expires on {deadline_text}. \
             Open the app to check in and keep your vault secure.\n\n\
             If you are safe, open Afterword today to reset your timer."
        );
        let body_html = format!(
            "<p>Hi {name},</p><p>{urgency}</p>\
             <p>Your Afterword timer expires on <strong>{deadline_text}</strong>. \
             Open the app to check in and keep your vault secure.</p>\
             <p>If you are safe, open Afterword today to reset your timer.</p>"
        );
        let message = EmailMessage::new(
            &self.from_email,
            email,
            "Afterword warning: check in now",
            text,
            render_html_document("Afterword warning", &body_html),
        );
        let key = format!("warning-{}-{}", profile.id, now.format("%Y-%m-%d"));

        if let Err(e) = self.mailer.send(&message, Some(&key)).await {
            warn!(user_id = %profile.id, error = %e, "warning email failed");
            return false;
        }
        if let Err(e) = self.store.mark_warning_sent(&profile.id, now).await {
            warn!(user_id = %profile.id, error = %e, "could not stamp warning_sent_at");
        }
        info!(user_id = %profile.id, "warning email sent");
        true
    }

    async fn send_reminder_push(
        &self,
        profile: &Profile,
        stage: ReminderStage,
        timer: &TimerState,
        now: DateTime<Utc>,
    ) -> usize {
        let time_left = format_time_left(timer.remaining_seconds);
        let stage_label = match stage {
            ReminderStage::TwoThirds => "66",
            ReminderStage::OneThird => "33",
        };
        let mut data = BTreeMap::new();
        data.insert("type".to_string(), "check_in_reminder".to_string());
        data.insert("stage".to_string(), stage_label.to_string());
        let note = PushNote {
            title: "Afterword check-in needed".to_string(),
            body: format!("{time_left} left on your timer. Check in to keep your vault sealed."),
            data,
        };

        let delivered = self.dispatch_to_devices(&profile.id, &note).await;
        // Stamp even when the user has no devices so the cycle stops
        // re-evaluating this stage until the next check-in.
        if let Err(e) = self
            .store
            .mark_reminder_push_sent(&profile.id, stage, now)
            .await
        {
            warn!(user_id = %profile.id, error = %e, "could not stamp reminder push");
        }
        delivered
    }

    async fn dispatch_to_devices(&self, user_id: &str, note: &PushNote) -> usize {
        let Some(gateway) = self.push.as_ref() else {
            return 0;
        };
        let devices = match self.store.push_devices_for_user(user_id).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "could not list push devices");
                return 0;
            }
        };

        let sends = devices
            .iter()
            .map(|device| async move { (device, gateway.send(&device.token, note).await) });
        let results = join_all(sends).await;

        let mut delivered = 0;
        for (device, result) in results {
            match result {
                Ok(PushOutcome::Delivered) => delivered += 1,
                Ok(PushOutcome::InvalidToken) => {
                    info!(user_id = %user_id, "pruning dead device token");
                    if let Err(e) = self.store.delete_push_device(&device.token).await {
                        warn!(user_id = %user_id, error = %e, "device prune failed");
                    }
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "push send failed");
                }
            }
        }
        delivered
    }
}

/// Urgency phrasing for the warning email, by remaining fraction
#[must_use]
pub fn urgency_line(remaining_fraction: f64) -> &'static str {
    if remaining_fraction <= URGENT_BELOW {
        "URGENT: your timer is almost out."
    } else if remaining_fraction <= CRITICAL_BELOW {
        "Your timer is in its critical window."
    } else if remaining_fraction <= HALFWAY_BELOW {
        "Your timer is past the halfway mark."
    } else {
        "Your timer is counting down."
    }
}

/// Human-readable time remaining for push bodies
#[must_use]
pub fn format_time_left(remaining_seconds: i64) -> String {
    const HOUR: i64 = 3600;
    const DAY: i64 = 86_400;

    if remaining_seconds < HOUR {
        return "less than 1 hour".to_string();
    }
    if remaining_seconds < DAY {
        let hours = remaining_seconds / HOUR;
        if hours == 1 {
            return "about 1 hour".to_string();
        }
        return format!("about {hours} hours");
    }
    let days = remaining_seconds / DAY;
    if days == 1 {
        "about 1 day".to_string()
    } else {
        format!("about {days} days")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn time_left_phrasing() {
        assert_eq!(format_time_left(59), "less than 1 hour");
        assert_eq!(format_time_left(3599), "less than 1 hour");
        assert_eq!(format_time_left(3600), "about 1 hour");
        assert_eq!(format_time_left(7300), "about 2 hours");
        assert_eq!(format_time_left(86_400), "about 1 day");
        assert_eq!(format_time_left(86_400 * 12), "about 12 days");
    }

    #[test]
    fn urgency_buckets() {
        assert_eq!(urgency_line(0.05), "URGENT: your timer is almost out.");
        assert_eq!(urgency_line(0.2), "Your timer is in its critical window.");
        assert_eq!(urgency_line(0.5), "Your timer is past the halfway mark.");
        assert_eq!(urgency_line(0.9), "Your timer is counting down.");
    }
}

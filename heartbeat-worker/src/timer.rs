//! Pure countdown math
//!
//! Everything here is a function of `(last_check_in, timer_days, now)` so the
//! cycle can be tested at any instant. Reminder idempotence is the
//! "already marked in cycle" predicate: a stamp at or after the current
//! check-in means this cycle already fired, an older stamp belongs to a past
//! cycle and is ignored.

use chrono::{DateTime, Duration, Utc};

/// Subscription tiers that receive the 24 h warning email
const PAID_STATUSES: [&str; 3] = ["pro", "lifetime", "premium"];

const SECONDS_PER_DAY: i64 = 86_400;
/// The warning email fires this long before the deadline
const WARNING_WINDOW_SECS: i64 = SECONDS_PER_DAY;
/// Remaining fraction at which the first staged push fires
const PUSH_66_REMAINING: f64 = 0.66;
/// Remaining fraction at which the second staged push fires
const PUSH_33_REMAINING: f64 = 0.33;

/// One user's countdown at a single instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerState {
    /// When the timer expires
    pub deadline: DateTime<Utc>,
    /// Full countdown length in seconds
    pub total_seconds: i64,
    /// Seconds until the deadline, floored at zero
    pub remaining_seconds: i64,
    /// `remaining_seconds / total_seconds`
    pub remaining_fraction: f64,
    /// Instant the 66 %-remaining push becomes due
    pub push_66_at: DateTime<Utc>,
    /// Instant the 33 %-remaining push becomes due
    pub push_33_at: DateTime<Utc>,
    /// Instant the 24 h warning email becomes due, clamped to never precede
    /// the check-in
    pub email_24h_at: DateTime<Utc>,
}

impl TimerState {
    /// Whether the countdown has run out
    #[must_use]
    pub const fn expired(&self) -> bool {
        self.remaining_seconds <= 0
    }
}

/// Computes the timer state for one user
#[must_use]
pub fn build_timer_state(
    last_check_in: DateTime<Utc>,
    timer_days: i64,
    now: DateTime<Utc>,
) -> TimerState {
    let total_seconds = timer_days.max(1) * SECONDS_PER_DAY;
    let deadline = last_check_in + Duration::seconds(total_seconds);
    let remaining_seconds = (deadline - now).num_seconds().max(0);
    let remaining_fraction = remaining_seconds as f64 / total_seconds as f64;

    let trigger_at = |remaining: f64| {
        let elapsed = ((1.0 - remaining) * total_seconds as f64).round() as i64;
        last_check_in + Duration::seconds(elapsed)
    };

    let email_24h_at = (deadline - Duration::seconds(WARNING_WINDOW_SECS)).max(last_check_in);

    TimerState {
        deadline,
        total_seconds,
        remaining_seconds,
        remaining_fraction,
        push_66_at: trigger_at(PUSH_66_REMAINING),
        push_33_at: trigger_at(PUSH_33_REMAINING),
        email_24h_at,
    }
}

/// Whether a notification stamp already belongs to the current check-in
/// cycle
#[must_use]
pub fn already_marked_in_cycle(
    sent_at: Option<DateTime<Utc>>,
    last_check_in: DateTime<Utc>,
) -> bool {
    sent_at.is_some_and(|at| at >= last_check_in)
}

/// Whether the subscription tier receives the warning email
#[must_use]
pub fn is_paid(subscription_status: Option<&str>) -> bool {
    subscription_status.is_some_and(|status| {
        let status = status.to_ascii_lowercase();
        PAID_STATUSES.contains(&status.as_str())
    })
}

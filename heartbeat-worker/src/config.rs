//! Environment configuration for the heartbeat worker

use std::env;

use crate::error::HeartbeatError;

/// Runtime configuration, loaded once at startup
///
/// Every field except the push credential is required; the worker refuses to
/// start without them. A missing or unusable push credential only disables
/// push notifications.
#[derive(Debug, Clone)]
pub struct Config {
    /// Supabase project URL
    pub supabase_url: String,
    /// Service-role key used for all datastore surfaces
    pub supabase_service_role_key: String,
    /// Process-wide secret the envelope key is derived from
    pub server_secret: String,
    /// Resend API key
    pub resend_api_key: String,
    /// From address for all outbound email
    pub resend_from_email: String,
    /// Base URL of the beneficiary viewer app
    pub viewer_base_url: String,
    /// Firebase service-account JSON; push is disabled when absent
    pub firebase_service_account_json: Option<String>,
}

impl Config {
    /// Loads configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns `HeartbeatError::Config` naming the first missing or empty
    /// required variable
    pub fn from_env() -> Result<Self, HeartbeatError> {
        Ok(Self {
            supabase_url: require("SUPABASE_URL")?,
            supabase_service_role_key: require("SUPABASE_SERVICE_ROLE_KEY")?,
            server_secret: require("SERVER_SECRET")?,
            resend_api_key: require("RESEND_API_KEY")?,
            resend_from_email: require("RESEND_FROM_EMAIL")?,
            viewer_base_url: require("VIEWER_BASE_URL")?,
            firebase_service_account_json: optional("FIREBASE_SERVICE_ACCOUNT_JSON"),
        })
    }
}

fn require(name: &str) -> Result<String, HeartbeatError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(HeartbeatError::Config(format!(
            "missing required environment variable: {name}"
        ))),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const REQUIRED: [&str; 6] = [
        "SUPABASE_URL",
        "SUPABASE_SERVICE_ROLE_KEY",
        "SERVER_SECRET",
        "RESEND_API_KEY",
        "RESEND_FROM_EMAIL",
        "VIEWER_BASE_URL",
    ];

    fn set_all_required() {
        for name in REQUIRED {
            env::set_var(name, "value");
        }
    }

    fn clear_all() {
        for name in REQUIRED {
            env::remove_var(name);
        }
        env::remove_var("FIREBASE_SERVICE_ACCOUNT_JSON");
    }

    #[test]
    #[serial]
    fn loads_with_required_vars() {
        set_all_required();
        let config = Config::from_env().unwrap();
        assert_eq!(config.supabase_url, "value");
        assert!(config.firebase_service_account_json.is_none());
        clear_all();
    }

    #[test]
    #[serial]
    fn missing_required_var_is_fatal() {
        set_all_required();
        env::remove_var("SERVER_SECRET");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("SERVER_SECRET"));
        clear_all();
    }

    #[test]
    #[serial]
    fn empty_push_credential_reads_as_absent() {
        set_all_required();
        env::set_var("FIREBASE_SERVICE_ACCOUNT_JSON", "  ");
        let config = Config::from_env().unwrap();
        assert!(config.firebase_service_account_json.is_none());
        clear_all();
    }
}

//! Engine configuration.
//!
//! `PatrolConfig` carries the timing knobs of the lifecycle engine and
//! `BackendConfig` the public endpoint/key pair of the hosted session store.
//! Both are plain serde structs so clients can ship them as JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::eligibility::DEFAULT_GRACE_MINUTES;
use crate::location::LocationPolicy;
use crate::store::{normalize_rest_url, RestStoreConfig};
use crate::util::normalize_text_option;

const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 60;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HIGH_ACCURACY_TIMEOUT_SECS: u64 = 8;
const DEFAULT_LOW_ACCURACY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_LOW_ACCURACY_MAX_AGE_SECS: u64 = 300;

/// Timing configuration for the lifecycle engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct PatrolConfig {
    /// Minutes before a shift during which a session may start
    pub grace_minutes: i64,
    /// How often an active session re-checks its shift
    pub watchdog_interval_secs: u64,
    /// How often queued work is counted and retried
    pub sync_interval_secs: u64,
    /// Upper bound on a direct write before it falls back to the queue
    pub write_timeout_secs: u64,
    pub location: LocationConfig,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            grace_minutes: DEFAULT_GRACE_MINUTES,
            watchdog_interval_secs: DEFAULT_WATCHDOG_INTERVAL_SECS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            location: LocationConfig::default(),
        }
    }
}

impl PatrolConfig {
    /// Reject values that would disable a timer or the grace period arithmetic
    pub fn validate(&self) -> Result<(), String> {
        if self.grace_minutes < 0 {
            return Err("grace_minutes must not be negative".to_string());
        }
        for (field, value) in [
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("sync_interval_secs", self.sync_interval_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            (
                "location.high_accuracy_timeout_secs",
                self.location.high_accuracy_timeout_secs,
            ),
            (
                "location.low_accuracy_timeout_secs",
                self.location.low_accuracy_timeout_secs,
            ),
        ] {
            if value == 0 {
                return Err(format!("{field} must be greater than zero"));
            }
        }
        Ok(())
    }

    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub const fn location_policy(&self) -> LocationPolicy {
        LocationPolicy {
            high_accuracy_timeout: Duration::from_secs(self.location.high_accuracy_timeout_secs),
            low_accuracy_timeout: Duration::from_secs(self.location.low_accuracy_timeout_secs),
            low_accuracy_max_age: Duration::from_secs(self.location.low_accuracy_max_age_secs),
        }
    }
}

/// Geolocation acquisition timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct LocationConfig {
    pub high_accuracy_timeout_secs: u64,
    pub low_accuracy_timeout_secs: u64,
    pub low_accuracy_max_age_secs: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            high_accuracy_timeout_secs: DEFAULT_HIGH_ACCURACY_TIMEOUT_SECS,
            low_accuracy_timeout_secs: DEFAULT_LOW_ACCURACY_TIMEOUT_SECS,
            low_accuracy_max_age_secs: DEFAULT_LOW_ACCURACY_MAX_AGE_SECS,
        }
    }
}

/// Parse and validate a JSON engine configuration.
///
/// Missing fields take their defaults; unknown fields are an error.
pub fn parse_patrol_config(payload: &str) -> Result<PatrolConfig, String> {
    let config: PatrolConfig = serde_json::from_str(payload)
        .map_err(|error| format!("invalid patrol config JSON: {error}"))?;
    config.validate()?;
    Ok(config)
}

/// Public endpoint and key of the hosted session store.
///
/// These values are safe to ship; the access token belongs to the signed-in
/// guard and is supplied at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default)]
    pub store_url: Option<String>,
    #[serde(default)]
    pub anon_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl BackendConfig {
    /// Resolve into REST store settings.
    ///
    /// `Ok(None)` when no backend is configured; an error when only one of the
    /// URL and key is present or the URL is not http(s).
    pub fn resolve(&self, request_timeout: Duration) -> Result<Option<RestStoreConfig>, String> {
        let url = normalize_text_option(self.store_url.clone());
        let key = normalize_text_option(self.anon_key.clone());

        match (url, key) {
            (None, None) => Ok(None),
            (Some(url), Some(api_key)) => {
                let base_url = normalize_rest_url(&url).map_err(|error| error.to_string())?;
                Ok(Some(RestStoreConfig {
                    base_url,
                    api_key,
                    access_token: normalize_text_option(self.access_token.clone()),
                    request_timeout,
                }))
            }
            _ => Err("store_url and anon_key must be configured together".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_object_yields_defaults() {
        let config = parse_patrol_config("{}").unwrap();
        assert_eq!(config, PatrolConfig::default());
        assert_eq!(config.grace_minutes, 30);
        assert_eq!(config.watchdog_interval(), Duration::from_secs(60));
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.location_policy(), LocationPolicy::default());
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let error = parse_patrol_config(r#"{"grace_minutes": 15, "turbo": true}"#).unwrap_err();
        assert!(error.contains("unknown field"));
    }

    #[test]
    fn parse_rejects_zero_intervals() {
        let error = parse_patrol_config(r#"{"watchdog_interval_secs": 0}"#).unwrap_err();
        assert!(error.contains("watchdog_interval_secs"));

        let error =
            parse_patrol_config(r#"{"location": {"low_accuracy_timeout_secs": 0}}"#).unwrap_err();
        assert!(error.contains("location.low_accuracy_timeout_secs"));
    }

    #[test]
    fn parse_rejects_negative_grace() {
        let error = parse_patrol_config(r#"{"grace_minutes": -5}"#).unwrap_err();
        assert!(error.contains("grace_minutes"));
    }

    #[test]
    fn backend_resolve_requires_url_and_key_together() {
        let timeout = Duration::from_secs(10);
        assert_eq!(BackendConfig::default().resolve(timeout).unwrap(), None);

        let partial = BackendConfig {
            store_url: Some("https://demo.supabase.co".to_string()),
            ..Default::default()
        };
        assert!(partial.resolve(timeout).is_err());

        let full = BackendConfig {
            store_url: Some(" https://demo.supabase.co/ ".to_string()),
            anon_key: Some("anon".to_string()),
            access_token: Some("   ".to_string()),
        };
        let resolved = full.resolve(timeout).unwrap().unwrap();
        assert_eq!(resolved.base_url, "https://demo.supabase.co/rest/v1");
        assert_eq!(resolved.access_token, None);
    }

    #[test]
    fn backend_resolve_rejects_non_http_url() {
        let config = BackendConfig {
            store_url: Some("ftp://demo".to_string()),
            anon_key: Some("anon".to_string()),
            access_token: None,
        };
        assert!(config.resolve(Duration::from_secs(1)).is_err());
    }
}

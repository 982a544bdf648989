//! Captive-portal form handling for the two station settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{StationConfig, CREDENTIAL_LEN};

/// How long the portal waits for a submission before giving up.
pub const PORTAL_TIMEOUT: Duration = Duration::from_secs(240);
/// Sleep after a portal timeout before trying again.
pub const PORTAL_RETRY_SLEEP: Duration = Duration::from_secs(10 * 60);

/// 802.11 limits, matching the fixed-size fields of the WiFi driver config.
pub const MAX_WIFI_SSID_LEN: usize = 32;
pub const MAX_WIFI_PASS_LEN: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
    #[serde(rename = "updateInterval")]
    pub update_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigView {
    #[serde(rename = "apiKeySet")]
    pub api_key_set: bool,
    #[serde(rename = "updateInterval")]
    pub update_interval: u32,
}

pub fn build_config_view(config: &StationConfig) -> ConfigView {
    ConfigView {
        api_key_set: config.is_provisioned(),
        update_interval: config.interval_seconds,
    }
}

pub fn validate_config_update(update: &ConfigUpdate) -> Result<(), &'static str> {
    if update.update_interval == 0 {
        return Err("updateInterval must be at least 1 second");
    }

    if let Some(key) = update.api_key.as_deref() {
        let key = key.trim();
        if key.is_empty() {
            return Err("apiKey cannot be empty");
        }
        if key.len() > CREDENTIAL_LEN {
            return Err("apiKey must be at most 16 characters");
        }
        if !key.chars().all(|c| c.is_ascii_graphic()) {
            return Err("apiKey must be printable ASCII");
        }
    }

    Ok(())
}

/// Station credentials must fit the WiFi driver, or the next boot could not
/// even try to connect.
pub fn validate_wifi_update(ssid: &str, pass: Option<&str>) -> Result<(), &'static str> {
    let ssid = ssid.trim();
    if ssid.is_empty() {
        return Err("wifiSsid cannot be empty");
    }
    if ssid.len() > MAX_WIFI_SSID_LEN {
        return Err("wifiSsid must be at most 32 bytes");
    }
    if pass.is_some_and(|pass| pass.len() > MAX_WIFI_PASS_LEN) {
        return Err("wifiPass must be at most 64 bytes");
    }

    Ok(())
}

/// New configuration after a form submission. A missing key keeps the
/// current one.
pub fn apply_config_update(current: &StationConfig, update: &ConfigUpdate) -> StationConfig {
    let credential = update
        .api_key
        .as_deref()
        .map(str::trim)
        .unwrap_or(current.credential.as_str());

    StationConfig::new(credential, update.update_interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_portal_payload() {
        let update: ConfigUpdate =
            serde_json::from_slice(br#"{"apiKey":"ABCD1234EFGH5678","updateInterval":300}"#)
                .unwrap();

        assert_eq!(update.api_key.as_deref(), Some("ABCD1234EFGH5678"));
        assert_eq!(update.update_interval, 300);
        assert!(validate_config_update(&update).is_ok());
    }

    #[test]
    fn missing_key_keeps_current_credential() {
        let current = StationConfig::new("OLDKEY", 120);
        let update: ConfigUpdate = serde_json::from_slice(br#"{"updateInterval":600}"#).unwrap();

        let next = apply_config_update(&current, &update);

        assert_eq!(next, StationConfig::new("OLDKEY", 600));
    }

    #[test]
    fn rejects_bad_updates() {
        let zero = ConfigUpdate {
            api_key: Some("KEY".to_string()),
            update_interval: 0,
        };
        let long = ConfigUpdate {
            api_key: Some("0123456789ABCDEFG".to_string()),
            update_interval: 60,
        };
        let blank = ConfigUpdate {
            api_key: Some("   ".to_string()),
            update_interval: 60,
        };
        let accented = ConfigUpdate {
            api_key: Some("CLÉ12345".to_string()),
            update_interval: 60,
        };
        let control = ConfigUpdate {
            api_key: Some("AB\r\nX: 1".to_string()),
            update_interval: 60,
        };

        assert!(validate_config_update(&zero).is_err());
        assert!(validate_config_update(&long).is_err());
        assert!(validate_config_update(&blank).is_err());
        assert_eq!(
            validate_config_update(&accented),
            Err("apiKey must be printable ASCII")
        );
        assert_eq!(
            validate_config_update(&control),
            Err("apiKey must be printable ASCII")
        );
    }

    #[test]
    fn rejects_wifi_credentials_the_driver_cannot_hold() {
        let long_ssid = "s".repeat(MAX_WIFI_SSID_LEN + 1);
        let long_pass = "p".repeat(MAX_WIFI_PASS_LEN + 1);

        assert_eq!(
            validate_wifi_update(&long_ssid, None),
            Err("wifiSsid must be at most 32 bytes")
        );
        assert_eq!(
            validate_wifi_update("home", Some(&long_pass)),
            Err("wifiPass must be at most 64 bytes")
        );
        assert_eq!(
            validate_wifi_update("  ", None),
            Err("wifiSsid cannot be empty")
        );
    }

    #[test]
    fn accepts_wifi_credentials_at_the_limit() {
        let ssid = "s".repeat(MAX_WIFI_SSID_LEN);
        let pass = "p".repeat(MAX_WIFI_PASS_LEN);

        assert!(validate_wifi_update(&ssid, Some(&pass)).is_ok());
        assert!(validate_wifi_update("home", None).is_ok());
    }

    #[test]
    fn view_hides_key() {
        let view = build_config_view(&StationConfig::new("SECRET", 90));
        let json = serde_json::to_string(&view).unwrap();

        assert_eq!(json, r#"{"apiKeySet":true,"updateInterval":90}"#);
    }
}

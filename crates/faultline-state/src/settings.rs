//! Administrator-controlled tracking settings.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Field names redacted from captured bodies and headers out of the box.
pub const DEFAULT_REDACTED_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "id_token",
    "client_secret",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
    "set-cookie",
    "credit_card",
    "card_number",
    "cvv",
    "ssn",
];

/// The single settings row consulted on every interception decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub track_400_errors: bool,
    pub track_401_errors: bool,
    pub track_403_errors: bool,
    pub track_404_errors: bool,
    pub track_429_errors: bool,
    pub track_502_errors: bool,
    pub track_503_errors: bool,
    pub track_504_errors: bool,
    /// Comma-separated list of additional status codes, e.g. `"405,409,410"`.
    pub custom_tracked_codes: String,

    pub capture_request_body: bool,
    pub capture_response_body: bool,
    pub capture_headers: bool,
    /// Byte cap applied to each captured body.
    pub max_body_size: usize,
    /// Byte cap applied to each captured header value.
    pub max_header_value_length: usize,

    pub retention_period_days: u32,
    pub frontend_batch_interval_seconds: u32,

    /// Field names (or glob patterns) masked in bodies and headers.
    pub redacted_fields: Vec<String>,

    pub notify_on_new_group: bool,
    /// Occurrence count at which a group raises a threshold event (0 disables).
    pub notification_threshold: u64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            track_400_errors: true,
            track_401_errors: false,
            track_403_errors: true,
            track_404_errors: true,
            track_429_errors: true,
            track_502_errors: true,
            track_503_errors: true,
            track_504_errors: true,
            custom_tracked_codes: String::new(),
            capture_request_body: true,
            capture_response_body: false,
            capture_headers: true,
            max_body_size: 10 * 1024,
            max_header_value_length: 512,
            retention_period_days: 30,
            frontend_batch_interval_seconds: 10,
            redacted_fields: DEFAULT_REDACTED_FIELDS
                .iter()
                .map(|f| (*f).to_owned())
                .collect(),
            notify_on_new_group: true,
            notification_threshold: 100,
        }
    }
}

impl TrackingSettings {
    /// Whether failures with this status code should be recorded.
    ///
    /// 500 is always tracked. Other codes are tracked when their flag is set
    /// or when they appear in the custom list.
    pub fn is_status_tracked(&self, status_code: u16) -> bool {
        let flagged = match status_code {
            500 => return true,
            400 => self.track_400_errors,
            401 => self.track_401_errors,
            403 => self.track_403_errors,
            404 => self.track_404_errors,
            429 => self.track_429_errors,
            502 => self.track_502_errors,
            503 => self.track_503_errors,
            504 => self.track_504_errors,
            _ => false,
        };
        flagged || self.custom_codes().contains(&status_code)
    }

    /// Parsed custom code list. Unparseable entries are ignored.
    pub fn custom_codes(&self) -> Vec<u16> {
        self.custom_tracked_codes
            .split(',')
            .filter_map(|code| code.trim().parse::<u16>().ok())
            .collect()
    }

    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_period_days))
    }

    pub fn validate(&self) -> Result<(), InvalidSettings> {
        for raw in self.custom_tracked_codes.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.parse::<u16>() {
                Ok(code) if (100..=599).contains(&code) => {}
                _ => {
                    return Err(InvalidSettings(format!(
                        "custom_tracked_codes contains invalid status code {raw:?}"
                    )))
                }
            }
        }
        if self.max_body_size == 0 {
            return Err(InvalidSettings("max_body_size must be positive".to_owned()));
        }
        if self.max_header_value_length == 0 {
            return Err(InvalidSettings(
                "max_header_value_length must be positive".to_owned(),
            ));
        }
        if self.frontend_batch_interval_seconds == 0 {
            return Err(InvalidSettings(
                "frontend_batch_interval_seconds must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid tracking settings: {0}")]
pub struct InvalidSettings(pub String);

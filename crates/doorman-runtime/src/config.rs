//! Validated controller configuration.
//!
//! Values arrive from the environment through the CLI crate; everything here
//! is immutable once [`DoormanConfig::validate`] has accepted it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::gateway::{ChannelId, MemberId};
use crate::member_policy::{ChannelLabels, MemberPolicy};

pub const DEFAULT_OPEN_LABEL: &str = "燒肉Cafe：營業中";
pub const DEFAULT_CLOSED_LABEL: &str = "燒肉Cafe：已打烊";
pub const DEFAULT_RENAME_QUOTA_LIMIT: u32 = 2;
pub const DEFAULT_RENAME_QUOTA_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_RENAME_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_DEBOUNCE: Duration = Duration::from_secs(1);
pub const DEFAULT_LEAVE_GRACE: Duration = Duration::from_millis(800);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_NAME_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Configuration rejected at startup.
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Timing and quota knobs shared by the controller components.
pub struct ControllerTuning {
    pub rename_quota_limit: u32,
    pub rename_quota_window: Duration,
    pub rename_timeout: Duration,
    pub permission_timeout: Duration,
    pub event_debounce: Duration,
    pub leave_grace: Duration,
    pub sweep_interval: Duration,
    pub name_cache_ttl: Duration,
}

impl Default for ControllerTuning {
    fn default() -> Self {
        Self {
            rename_quota_limit: DEFAULT_RENAME_QUOTA_LIMIT,
            rename_quota_window: DEFAULT_RENAME_QUOTA_WINDOW,
            rename_timeout: DEFAULT_RENAME_TIMEOUT,
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
            event_debounce: DEFAULT_EVENT_DEBOUNCE,
            leave_grace: DEFAULT_LEAVE_GRACE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            name_cache_ttl: DEFAULT_NAME_CACHE_TTL,
        }
    }
}

impl ControllerTuning {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.rename_quota_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "DOORMAN_RENAME_QUOTA_LIMIT",
                message: "must be greater than zero".to_string(),
            });
        }
        let non_zero = [
            ("DOORMAN_RENAME_QUOTA_WINDOW_SECONDS", self.rename_quota_window),
            ("DOORMAN_RENAME_TIMEOUT_MS", self.rename_timeout),
            ("DOORMAN_PERMISSION_TIMEOUT_MS", self.permission_timeout),
            ("DOORMAN_SWEEP_INTERVAL_MS", self.sweep_interval),
            ("DOORMAN_NAME_CACHE_TTL_SECONDS", self.name_cache_ttl),
        ];
        for (key, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
/// Complete controller configuration.
pub struct DoormanConfig {
    pub token: String,
    pub channel_id: ChannelId,
    pub policy: MemberPolicy,
    pub labels: ChannelLabels,
    pub tuning: ControllerTuning,
}

impl fmt::Debug for DoormanConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DoormanConfig")
            .field("token", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .field("policy", &self.policy)
            .field("labels", &self.labels)
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl DoormanConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Missing("BOT_TOKEN"));
        }
        if self.channel_id.0 == 0 {
            return Err(ConfigError::Missing("VOICE_CHANNEL_ID"));
        }
        if self.policy.privileged_count() == 0 {
            return Err(ConfigError::Missing("SPECIAL_USER_IDS"));
        }
        if self.labels.open.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "OPEN_NAME",
                message: "must not be blank".to_string(),
            });
        }
        if self.labels.closed.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "CLOSED_NAME",
                message: "must not be blank".to_string(),
            });
        }
        if self.labels.open == self.labels.closed {
            return Err(ConfigError::Invalid {
                key: "CLOSED_NAME",
                message: "must differ from OPEN_NAME".to_string(),
            });
        }
        self.tuning.validate()?;
        Ok(self)
    }
}

/// Parses a comma separated id list, skipping blank entries.
pub fn parse_member_id_list(key: &'static str, raw: &str) -> Result<Vec<MemberId>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<u64>()
                .map(MemberId)
                .map_err(|_| ConfigError::Invalid {
                    key,
                    message: format!("'{entry}' is not a numeric id"),
                })
        })
        .collect()
}

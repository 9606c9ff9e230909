//! Command-line and environment surface for the doorman binary.
//!
//! Every setting can be supplied as a flag or through the environment; the
//! parsed [`Cli`] is turned into a validated [`DoormanConfig`] before any
//! platform connection is made.

use std::time::Duration;

use clap::{ArgAction, Parser};
use doorman_runtime::config::{
    parse_member_id_list, ConfigError, ControllerTuning, DoormanConfig, DEFAULT_CLOSED_LABEL,
    DEFAULT_OPEN_LABEL,
};
use doorman_runtime::gateway::ChannelId;
use doorman_runtime::member_policy::{ChannelLabels, MemberPolicy};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "doorman",
    about = "Opens a voice channel while privileged members are present and closes it when they leave",
    version
)]
pub struct Cli {
    #[arg(
        long = "bot-token",
        env = "BOT_TOKEN",
        hide_env_values = true,
        help = "Bot token used to authenticate with the platform"
    )]
    pub bot_token: Option<String>,

    #[arg(
        long = "voice-channel-id",
        env = "VOICE_CHANNEL_ID",
        help = "Id of the voice channel to control"
    )]
    pub voice_channel_id: Option<u64>,

    #[arg(
        long = "special-user-ids",
        env = "SPECIAL_USER_IDS",
        default_value = "",
        help = "Comma separated ids of members whose presence opens the channel"
    )]
    pub special_user_ids: String,

    #[arg(
        long = "excluded-user-ids",
        env = "EXCLUDED_USER_IDS",
        default_value = "",
        help = "Comma separated ids of members never evicted on close"
    )]
    pub excluded_user_ids: String,

    #[arg(
        long = "open-name",
        env = "OPEN_NAME",
        default_value = DEFAULT_OPEN_LABEL,
        help = "Channel name shown while open"
    )]
    pub open_name: String,

    #[arg(
        long = "closed-name",
        env = "CLOSED_NAME",
        default_value = DEFAULT_CLOSED_LABEL,
        help = "Channel name shown while closed"
    )]
    pub closed_name: String,

    #[arg(
        long = "rename-quota-limit",
        env = "DOORMAN_RENAME_QUOTA_LIMIT",
        default_value_t = 2,
        value_parser = parse_positive_u32,
        help = "Renames allowed per quota window"
    )]
    pub rename_quota_limit: u32,

    #[arg(
        long = "rename-quota-window-seconds",
        env = "DOORMAN_RENAME_QUOTA_WINDOW_SECONDS",
        default_value_t = 600,
        value_parser = parse_positive_u64,
        help = "Length of the rename quota window"
    )]
    pub rename_quota_window_seconds: u64,

    #[arg(
        long = "rename-timeout-ms",
        env = "DOORMAN_RENAME_TIMEOUT_MS",
        default_value_t = 8_000,
        value_parser = parse_positive_u64,
        help = "How long to wait on a rename before assuming it applied"
    )]
    pub rename_timeout_ms: u64,

    #[arg(
        long = "permission-timeout-ms",
        env = "DOORMAN_PERMISSION_TIMEOUT_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Upper bound for a single permission write or eviction"
    )]
    pub permission_timeout_ms: u64,

    #[arg(
        long = "event-debounce-ms",
        env = "DOORMAN_EVENT_DEBOUNCE_MS",
        default_value_t = 1_000,
        help = "Minimum spacing between handled presence events"
    )]
    pub event_debounce_ms: u64,

    #[arg(
        long = "leave-grace-ms",
        env = "DOORMAN_LEAVE_GRACE_MS",
        default_value_t = 800,
        help = "Delay before re-checking membership after a privileged leave"
    )]
    pub leave_grace_ms: u64,

    #[arg(
        long = "sweep-interval-ms",
        env = "DOORMAN_SWEEP_INTERVAL_MS",
        default_value_t = 3_000,
        value_parser = parse_positive_u64,
        help = "Reconciliation sweep interval"
    )]
    pub sweep_interval_ms: u64,

    #[arg(
        long = "name-cache-ttl-seconds",
        env = "DOORMAN_NAME_CACHE_TTL_SECONDS",
        default_value_t = 1_800,
        value_parser = parse_positive_u64,
        help = "Age after which remembered channel names are discarded"
    )]
    pub name_cache_ttl_seconds: u64,

    #[arg(
        long = "probe-rename",
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Rename the channel once, restore it, print a JSON latency report and exit"
    )]
    pub probe_rename: bool,

    #[arg(
        long = "probe-timeout-ms",
        env = "DOORMAN_PROBE_TIMEOUT_MS",
        default_value_t = 20_000,
        value_parser = parse_positive_u64,
        help = "Upper bound for each rename issued by --probe-rename"
    )]
    pub probe_timeout_ms: u64,
}

impl Cli {
    pub fn tuning(&self) -> ControllerTuning {
        ControllerTuning {
            rename_quota_limit: self.rename_quota_limit,
            rename_quota_window: Duration::from_secs(self.rename_quota_window_seconds),
            rename_timeout: Duration::from_millis(self.rename_timeout_ms),
            permission_timeout: Duration::from_millis(self.permission_timeout_ms),
            event_debounce: Duration::from_millis(self.event_debounce_ms),
            leave_grace: Duration::from_millis(self.leave_grace_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            name_cache_ttl: Duration::from_secs(self.name_cache_ttl_seconds),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn token(&self) -> Result<&str, ConfigError> {
        self.bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::Missing("BOT_TOKEN"))
    }

    pub fn channel_id(&self) -> Result<ChannelId, ConfigError> {
        match self.voice_channel_id {
            Some(0) | None => Err(ConfigError::Missing("VOICE_CHANNEL_ID")),
            Some(raw) => Ok(ChannelId(raw)),
        }
    }

    pub fn into_config(&self) -> Result<DoormanConfig, ConfigError> {
        let privileged = parse_member_id_list("SPECIAL_USER_IDS", &self.special_user_ids)?;
        let excluded = parse_member_id_list("EXCLUDED_USER_IDS", &self.excluded_user_ids)?;
        DoormanConfig {
            token: self.token()?.to_string(),
            channel_id: self.channel_id()?,
            policy: MemberPolicy::new(privileged, excluded),
            labels: ChannelLabels {
                open: self.open_name.clone(),
                closed: self.closed_name.clone(),
            },
            tuning: self.tuning(),
        }
        .validate()
    }
}

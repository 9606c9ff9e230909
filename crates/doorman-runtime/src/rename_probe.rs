//! One-shot rename latency probe.
//!
//! Renames the channel to a throwaway name, restores the original, and
//! classifies what the platform did. Useful to tell quota exhaustion apart
//! from a slow API before running the controller.

use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::gateway::{ChannelGateway, ChannelId, GatewayError};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenameProbeOutcome {
    Succeeded {
        rename_ms: u64,
        /// `None` when restoring the original name failed.
        restore_ms: Option<u64>,
    },
    RateLimited {
        elapsed_ms: u64,
    },
    TimedOut {
        elapsed_ms: u64,
    },
    Failed {
        elapsed_ms: u64,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameProbeReport {
    pub channel_id: ChannelId,
    pub original_name: String,
    pub probe_name: String,
    #[serde(flatten)]
    pub outcome: RenameProbeOutcome,
}

/// Toggles a trailing `.` so the probe name always differs from `original`.
pub fn probe_name_for(original: &str) -> String {
    match original.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => format!("{original}."),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub async fn run_rename_probe(
    gateway: &dyn ChannelGateway,
    channel: ChannelId,
    probe_timeout: Duration,
) -> Result<RenameProbeReport, GatewayError> {
    let original_name = gateway.fetch_channel_name(channel).await?;
    let probe_name = probe_name_for(&original_name);
    info!(channel = %channel, from = %original_name, to = %probe_name, "probing rename latency");

    let started = Instant::now();
    let outcome = match timeout(probe_timeout, gateway.rename_channel(channel, &probe_name)).await {
        Err(_) => RenameProbeOutcome::TimedOut {
            elapsed_ms: elapsed_ms(started),
        },
        Ok(Err(error)) if error.is_rate_limited() => RenameProbeOutcome::RateLimited {
            elapsed_ms: elapsed_ms(started),
        },
        Ok(Err(error)) => RenameProbeOutcome::Failed {
            elapsed_ms: elapsed_ms(started),
            error: error.to_string(),
        },
        Ok(Ok(())) => {
            let rename_ms = elapsed_ms(started);
            let restore_started = Instant::now();
            let restore_ms =
                match timeout(probe_timeout, gateway.rename_channel(channel, &original_name)).await {
                    Ok(Ok(())) => Some(elapsed_ms(restore_started)),
                    Ok(Err(error)) => {
                        warn!(channel = %channel, error = %error, "failed to restore original channel name");
                        None
                    }
                    Err(_) => {
                        warn!(channel = %channel, "restoring original channel name timed out");
                        None
                    }
                };
            RenameProbeOutcome::Succeeded {
                rename_ms,
                restore_ms,
            }
        }
    };

    Ok(RenameProbeReport {
        channel_id: channel,
        original_name,
        probe_name,
        outcome,
    })
}

//! Platform seam consumed by the controller.
//!
//! The controller never talks to a chat platform directly; it drives a
//! [`ChannelGateway`] implementation. Cheap reads (`channel_name`,
//! `current_members`) are expected to be served from a local cache, while
//! writes go over the network and may be slow or fail.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Platform identifier of a channel.
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Platform identifier of a guild member.
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Subject of a connect-permission overwrite.
pub enum PermissionTarget {
    /// The default role every member holds.
    Everyone,
    Member(MemberId),
}

impl fmt::Display for PermissionTarget {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everyone => formatter.write_str("everyone"),
            Self::Member(member) => write!(formatter, "member:{member}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Failure reported by a platform operation.
pub enum GatewayError {
    #[error("platform rate limit reached: {0}")]
    RateLimited(String),
    #[error("missing platform permission: {0}")]
    Forbidden(String),
    #[error("channel {0} not found")]
    NotFound(ChannelId),
    #[error("platform request failed: {0}")]
    Request(String),
}

impl GatewayError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

#[async_trait]
/// Operations the controller needs from the chat platform.
pub trait ChannelGateway: Send + Sync {
    /// Last known channel name from the local cache, if any.
    fn channel_name(&self, channel: ChannelId) -> Option<String>;

    /// Members currently connected to the channel, read fresh on every call.
    fn current_members(&self, channel: ChannelId) -> Result<Vec<MemberId>, GatewayError>;

    /// Whether the bot may rename the channel and edit its overwrites.
    fn can_manage_channel(&self, channel: ChannelId) -> Result<bool, GatewayError>;

    /// Whether `member` still belongs to the guild owning the channel.
    fn is_known_member(&self, member: MemberId) -> bool;

    /// Authoritative name read that bypasses the cache.
    async fn fetch_channel_name(&self, channel: ChannelId) -> Result<String, GatewayError>;

    async fn rename_channel(&self, channel: ChannelId, name: &str) -> Result<(), GatewayError>;

    /// Sets only the connect bit of `target`'s overwrite on `channel`.
    async fn set_connect_permission(
        &self,
        channel: ChannelId,
        target: PermissionTarget,
        allow: bool,
    ) -> Result<(), GatewayError>;

    /// Disconnects `member` from voice.
    async fn evict_member(
        &self,
        channel: ChannelId,
        member: MemberId,
        reason: &str,
    ) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::{ChannelId, GatewayError, MemberId, PermissionTarget};

    #[test]
    fn unit_permission_target_display_names_subject() {
        assert_eq!(PermissionTarget::Everyone.to_string(), "everyone");
        assert_eq!(
            PermissionTarget::Member(MemberId(42)).to_string(),
            "member:42"
        );
    }

    #[test]
    fn unit_gateway_error_rate_limit_is_recognized() {
        assert!(GatewayError::RateLimited("slow down".to_string()).is_rate_limited());
        assert!(!GatewayError::NotFound(ChannelId(7)).is_rate_limited());
        assert_eq!(
            GatewayError::NotFound(ChannelId(7)).to_string(),
            "channel 7 not found"
        );
    }
}

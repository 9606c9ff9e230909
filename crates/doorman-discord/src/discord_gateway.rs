//! [`ChannelGateway`] backed by the Discord REST API and gateway cache.

use std::sync::Arc;

use async_trait::async_trait;
use doorman_runtime::gateway::{ChannelGateway, ChannelId, GatewayError, MemberId, PermissionTarget};
use serenity::all::{
    Cache, ChannelId as DiscordChannelId, EditChannel, EditMember, GuildChannel, GuildId, Http,
    HttpError, PermissionOverwrite, PermissionOverwriteType, Permissions, RoleId, UserId,
};
use tracing::warn;

/// Discord error code returned when a channel was renamed too often.
pub const CHANNEL_RENAME_RATE_LIMIT_CODE: isize = 50028;

fn discord_channel(channel: ChannelId) -> DiscordChannelId {
    DiscordChannelId::new(channel.0)
}

/// Maps a failed REST response onto the controller's error vocabulary.
pub fn classify_response(status: u16, code: isize, message: &str) -> GatewayError {
    if code == CHANNEL_RENAME_RATE_LIMIT_CODE || status == 429 {
        return GatewayError::RateLimited(format!("{message} (code {code})"));
    }
    match status {
        401 | 403 => GatewayError::Forbidden(format!("{message} (code {code})")),
        _ => GatewayError::Request(format!("http {status}: {message} (code {code})")),
    }
}

fn map_serenity_error(error: serenity::Error) -> GatewayError {
    match &error {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => classify_response(
            response.status_code.as_u16(),
            response.error.code,
            &response.error.message,
        ),
        _ => GatewayError::Request(error.to_string()),
    }
}

/// Returns the `(allow, deny)` pair with only the connect bit changed.
pub fn merge_connect_overwrite(
    allow: Permissions,
    deny: Permissions,
    connect: bool,
) -> (Permissions, Permissions) {
    if connect {
        (allow | Permissions::CONNECT, deny - Permissions::CONNECT)
    } else {
        (allow - Permissions::CONNECT, deny | Permissions::CONNECT)
    }
}

pub struct DiscordChannelGateway {
    http: Arc<Http>,
    cache: Arc<Cache>,
    guild_id: GuildId,
}

impl DiscordChannelGateway {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>, guild_id: GuildId) -> Self {
        Self {
            http,
            cache,
            guild_id,
        }
    }

    /// Resolves the owning guild of `channel` from the cache.
    pub fn for_channel(
        http: Arc<Http>,
        cache: Arc<Cache>,
        channel: ChannelId,
    ) -> Result<Self, GatewayError> {
        let guild_id = cache
            .channel(discord_channel(channel))
            .map(|cached| cached.guild_id)
            .ok_or(GatewayError::NotFound(channel))?;
        Ok(Self::new(http, cache, guild_id))
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn cached_channel(&self, channel: ChannelId) -> Result<GuildChannel, GatewayError> {
        self.cache
            .channel(discord_channel(channel))
            .map(|cached| GuildChannel::clone(&cached))
            .ok_or(GatewayError::NotFound(channel))
    }

    fn overwrite_kind(&self, target: PermissionTarget) -> PermissionOverwriteType {
        match target {
            PermissionTarget::Everyone => {
                PermissionOverwriteType::Role(RoleId::new(self.guild_id.get()))
            }
            PermissionTarget::Member(member) => {
                PermissionOverwriteType::Member(UserId::new(member.0))
            }
        }
    }
}

#[async_trait]
impl ChannelGateway for DiscordChannelGateway {
    fn channel_name(&self, channel: ChannelId) -> Option<String> {
        self.cache
            .channel(discord_channel(channel))
            .map(|cached| cached.name.clone())
    }

    fn current_members(&self, channel: ChannelId) -> Result<Vec<MemberId>, GatewayError> {
        let guild = self
            .cache
            .guild(self.guild_id)
            .ok_or_else(|| GatewayError::Request(format!("guild {} is not cached", self.guild_id)))?;
        let target = discord_channel(channel);
        let mut members = guild
            .voice_states
            .values()
            .filter(|voice_state| voice_state.channel_id == Some(target))
            .map(|voice_state| MemberId(voice_state.user_id.get()))
            .collect::<Vec<_>>();
        members.sort_unstable();
        Ok(members)
    }

    fn can_manage_channel(&self, channel: ChannelId) -> Result<bool, GatewayError> {
        let guild_channel = self.cached_channel(channel)?;
        let bot_id = self.cache.current_user().id;
        let permissions = guild_channel
            .permissions_for_user(&self.cache, bot_id)
            .map_err(map_serenity_error)?;
        if !permissions.contains(Permissions::MOVE_MEMBERS) {
            warn!(channel = %channel, "bot lacks move-members permission; evictions will fail");
        }
        Ok(permissions.contains(Permissions::MANAGE_CHANNELS))
    }

    fn is_known_member(&self, member: MemberId) -> bool {
        self.cache.guild(self.guild_id).is_some_and(|guild| {
            guild.members.contains_key(&UserId::new(member.0))
        })
    }

    async fn fetch_channel_name(&self, channel: ChannelId) -> Result<String, GatewayError> {
        discord_channel(channel)
            .to_channel(&*self.http)
            .await
            .map_err(map_serenity_error)?
            .guild()
            .map(|guild_channel| guild_channel.name)
            .ok_or(GatewayError::NotFound(channel))
    }

    async fn rename_channel(&self, channel: ChannelId, name: &str) -> Result<(), GatewayError> {
        discord_channel(channel)
            .edit(&*self.http, EditChannel::new().name(name))
            .await
            .map(|_| ())
            .map_err(map_serenity_error)
    }

    async fn set_connect_permission(
        &self,
        channel: ChannelId,
        target: PermissionTarget,
        allow: bool,
    ) -> Result<(), GatewayError> {
        let guild_channel = self.cached_channel(channel)?;
        let kind = self.overwrite_kind(target);
        let (current_allow, current_deny) = guild_channel
            .permission_overwrites
            .iter()
            .find(|overwrite| overwrite.kind == kind)
            .map(|overwrite| (overwrite.allow, overwrite.deny))
            .unwrap_or((Permissions::empty(), Permissions::empty()));
        let (allow, deny) = merge_connect_overwrite(current_allow, current_deny, allow);
        discord_channel(channel)
            .create_permission(&*self.http, PermissionOverwrite { allow, deny, kind })
            .await
            .map_err(map_serenity_error)
    }

    async fn evict_member(
        &self,
        _channel: ChannelId,
        member: MemberId,
        reason: &str,
    ) -> Result<(), GatewayError> {
        self.guild_id
            .edit_member(
                &*self.http,
                UserId::new(member.0),
                EditMember::new().disconnect_member().audit_log_reason(reason),
            )
            .await
            .map(|_| ())
            .map_err(map_serenity_error)
    }
}

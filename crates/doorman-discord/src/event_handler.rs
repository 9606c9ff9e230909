//! Serenity event handler wiring gateway events into the controller.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use doorman_runtime::channel_controller::{ChannelController, StartupError};
use doorman_runtime::config::DoormanConfig;
use doorman_runtime::gateway::{ChannelId, MemberId};
use doorman_runtime::presence_router::PresenceUpdate;
use serenity::all::{
    ConnectionStage, Context, EventHandler, GuildId, Ready, ResumedEvent, ShardStageUpdateEvent,
    VoiceState,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::discord_gateway::DiscordChannelGateway;

/// Controller shared between the event handler and the shutdown path.
pub type ControllerSlot = Arc<OnceLock<Arc<ChannelController>>>;

fn presence_update(old: Option<&VoiceState>, new: &VoiceState) -> PresenceUpdate {
    PresenceUpdate {
        member: MemberId(new.user_id.get()),
        previous_channel: old
            .and_then(|voice_state| voice_state.channel_id)
            .map(|channel| ChannelId(channel.get())),
        current_channel: new.channel_id.map(|channel| ChannelId(channel.get())),
    }
}

pub struct DoormanHandler {
    config: DoormanConfig,
    controller: ControllerSlot,
    fatal: mpsc::UnboundedSender<StartupError>,
}

impl DoormanHandler {
    pub fn new(
        config: DoormanConfig,
        controller: ControllerSlot,
        fatal: mpsc::UnboundedSender<StartupError>,
    ) -> Self {
        Self {
            config,
            controller,
            fatal,
        }
    }

    fn controller(&self) -> Option<Arc<ChannelController>> {
        self.controller.get().cloned()
    }
}

#[async_trait]
impl EventHandler for DoormanHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "connected to discord gateway"
        );
    }

    async fn cache_ready(&self, ctx: Context, _guilds: Vec<GuildId>) {
        let controller = match self.controller() {
            Some(controller) => controller,
            None => {
                let gateway = match DiscordChannelGateway::for_channel(
                    ctx.http.clone(),
                    ctx.cache.clone(),
                    self.config.channel_id,
                ) {
                    Ok(gateway) => gateway,
                    Err(gateway_error) => {
                        let _ = self.fatal.send(StartupError::Gateway(gateway_error));
                        return;
                    }
                };
                info!(
                    channel = %self.config.channel_id,
                    guild = %gateway.guild_id(),
                    "resolved controlled voice channel"
                );
                let created = Arc::new(ChannelController::new(&self.config, Arc::new(gateway)));
                self.controller.get_or_init(|| created).clone()
            }
        };
        match controller.start().await {
            Ok(true) => {}
            Ok(false) => debug!("cache ready again; controller already running"),
            Err(startup_error) => {
                let _ = self.fatal.send(startup_error);
            }
        }
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(controller) = self.controller() else {
            return;
        };
        let update = presence_update(old.as_ref(), &new);
        tokio::spawn(async move {
            let decision = controller.handle_presence(update).await;
            debug!(member = %update.member, ?decision, "presence update handled");
        });
    }

    async fn resume(&self, _ctx: Context, _event: ResumedEvent) {
        if let Some(controller) = self.controller() {
            controller.connection_resumed();
        }
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        debug!(old = ?event.old, new = ?event.new, "shard stage changed");
        if event.new != ConnectionStage::Disconnected {
            return;
        }
        if let Some(controller) = self.controller() {
            controller.connection_lost();
        }
    }
}

//! Discord adapter and process entry points for the doorman controller.

pub mod discord_gateway;
pub mod event_handler;

use std::sync::{Arc, OnceLock};

use anyhow::{Context as _, Result};
use doorman_cli::Cli;
use doorman_runtime::config::DoormanConfig;
use doorman_runtime::rename_probe::run_rename_probe;
use serenity::all::{Cache, Client, GatewayIntents, Http};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::discord_gateway::DiscordChannelGateway;
use crate::event_handler::{ControllerSlot, DoormanHandler};

pub fn gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES | GatewayIntents::GUILD_MEMBERS
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(signal_error) => {
                error!(error = %signal_error, "failed to install SIGTERM handler");
            }
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Connects to Discord and runs the controller until a signal or fatal startup error.
pub async fn run_controller(config: DoormanConfig) -> Result<()> {
    let controller: ControllerSlot = Arc::new(OnceLock::new());
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let handler = DoormanHandler::new(config.clone(), controller.clone(), fatal_tx);

    let mut client = Client::builder(&config.token, gateway_intents())
        .event_handler(handler)
        .await
        .context("failed to build discord client")?;
    let shard_manager = client.shard_manager.clone();

    info!(channel = %config.channel_id, "starting doorman");
    let mut outcome = Ok(());
    tokio::select! {
        result = client.start() => {
            if let Err(client_error) = result {
                outcome = Err(anyhow::Error::new(client_error).context("discord client stopped"));
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown requested");
        }
        Some(startup_error) = fatal_rx.recv() => {
            error!(error = %startup_error, "controller startup failed");
            outcome = Err(anyhow::Error::new(startup_error).context("controller startup failed"));
        }
    }

    if let Some(controller) = controller.get() {
        controller.shutdown().await;
    }
    shard_manager.shutdown_all().await;
    outcome
}

/// Renames the configured channel once, restores it and prints a JSON report.
pub async fn run_probe(cli: &Cli) -> Result<()> {
    let token = cli.token()?;
    let channel = cli.channel_id()?;
    let http = Arc::new(Http::new(token));
    let guild_id = channel_guild(&http, channel).await?;
    let gateway = DiscordChannelGateway::new(http, Arc::new(Cache::new()), guild_id);

    let report = run_rename_probe(&gateway, channel, cli.probe_timeout())
        .await
        .context("rename probe could not read the channel")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render probe report")?
    );
    Ok(())
}

async fn channel_guild(
    http: &Http,
    channel: doorman_runtime::gateway::ChannelId,
) -> Result<serenity::all::GuildId> {
    let fetched = serenity::all::ChannelId::new(channel.0)
        .to_channel(http)
        .await
        .with_context(|| format!("failed to fetch channel {channel}"))?;
    fetched
        .guild()
        .map(|guild_channel| guild_channel.guild_id)
        .with_context(|| format!("channel {channel} is not a guild channel"))
}

pub async fn run(cli: Cli) -> Result<()> {
    if cli.probe_rename {
        return run_probe(&cli).await;
    }
    let config = cli.into_config().context("invalid configuration")?;
    info!(?config, "configuration loaded");
    run_controller(config).await
}

#[cfg(test)]
mod tests {
    use serenity::all::GatewayIntents;

    use super::gateway_intents;

    #[test]
    fn unit_gateway_intents_cover_voice_presence_and_members() {
        let intents = gateway_intents();
        assert!(intents.contains(GatewayIntents::GUILD_VOICE_STATES));
        assert!(intents.contains(GatewayIntents::GUILD_MEMBERS));
        assert!(!intents.contains(GatewayIntents::MESSAGE_CONTENT));
    }
}

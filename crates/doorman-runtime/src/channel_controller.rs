//! Assembles the scheduler, state machine, router and sweeper for one channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::channel_state::{ChannelState, ChannelStateMachine, TransitionOutcome};
use crate::config::{ControllerTuning, DoormanConfig};
use crate::gateway::{ChannelGateway, ChannelId, GatewayError};
use crate::presence_router::{PresenceDecision, PresenceRouter, PresenceUpdate};
use crate::reconcile_sweeper::{start_reconcile_sweeper, ReconcileSweeper, ReconcileSweeperHandle};
use crate::rename_scheduler::{RenameScheduler, RenameSchedulerConfig};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("bot lacks manage-channel permission on channel {0}")]
    MissingManagePermission(ChannelId),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("failed to start reconcile sweeper: {0}")]
    Sweeper(anyhow::Error),
}

pub struct ChannelController {
    gateway: Arc<dyn ChannelGateway>,
    channel: ChannelId,
    tuning: ControllerTuning,
    scheduler: Arc<RenameScheduler>,
    state_machine: Arc<ChannelStateMachine>,
    router: PresenceRouter,
    sweeper: Arc<ReconcileSweeper>,
    sweeper_handle: tokio::sync::Mutex<Option<ReconcileSweeperHandle>>,
    started: AtomicBool,
}

impl ChannelController {
    pub fn new(config: &DoormanConfig, gateway: Arc<dyn ChannelGateway>) -> Self {
        let tuning = config.tuning.clone();
        let scheduler = Arc::new(RenameScheduler::new(
            gateway.clone(),
            RenameSchedulerConfig::from(&tuning),
        ));
        let state_machine = Arc::new(ChannelStateMachine::new(
            gateway.clone(),
            scheduler.clone(),
            config.channel_id,
            config.policy.clone(),
            config.labels.clone(),
            tuning.permission_timeout,
        ));
        let router = PresenceRouter::new(
            state_machine.clone(),
            gateway.clone(),
            tuning.event_debounce,
            tuning.leave_grace,
        );
        let sweeper = Arc::new(ReconcileSweeper::new(
            state_machine.clone(),
            scheduler.clone(),
            gateway.clone(),
        ));
        Self {
            gateway,
            channel: config.channel_id,
            tuning,
            scheduler,
            state_machine,
            router,
            sweeper,
            sweeper_handle: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> Option<ChannelState> {
        self.state_machine.state()
    }

    pub fn scheduler(&self) -> &Arc<RenameScheduler> {
        &self.scheduler
    }

    /// Establishes the initial state from current membership.
    pub async fn initialize(&self) -> Result<TransitionOutcome, StartupError> {
        if !self.gateway.can_manage_channel(self.channel)? {
            return Err(StartupError::MissingManagePermission(self.channel));
        }
        let members = self.gateway.current_members(self.channel)?;
        let initial = if self.state_machine.policy().any_privileged(&members) {
            ChannelState::Open
        } else {
            ChannelState::Closed
        };
        info!(
            channel = %self.channel,
            name = %self.gateway.channel_name(self.channel).unwrap_or_default(),
            members = members.len(),
            initial = initial.as_str(),
            "initializing channel state"
        );
        let outcome = self.state_machine.transition_to(initial).await;
        if matches!(outcome, TransitionOutcome::Aborted(_)) {
            warn!(
                channel = %self.channel,
                initial = initial.as_str(),
                "initial transition aborted; the sweeper will retry"
            );
        }
        Ok(outcome)
    }

    /// Initializes once and starts the sweeper; later calls are no-ops.
    ///
    /// Returns `false` when the controller was already running.
    pub async fn start(&self) -> Result<bool, StartupError> {
        if self.started.swap(true, Ordering::SeqCst) {
            info!(channel = %self.channel, "controller already running");
            return Ok(false);
        }
        if let Err(startup_error) = self.initialize().await {
            self.started.store(false, Ordering::SeqCst);
            error!(channel = %self.channel, error = %startup_error, "controller startup failed");
            return Err(startup_error);
        }
        let handle = start_reconcile_sweeper(self.sweeper.clone(), self.tuning.sweep_interval)
            .map_err(|sweeper_error| {
                self.started.store(false, Ordering::SeqCst);
                StartupError::Sweeper(sweeper_error)
            })?;
        *self.sweeper_handle.lock().await = Some(handle);
        info!(channel = %self.channel, "controller started");
        Ok(true)
    }

    pub async fn handle_presence(&self, update: PresenceUpdate) -> PresenceDecision {
        self.router.handle(update).await
    }

    pub fn connection_lost(&self) {
        warn!(channel = %self.channel, "platform connection lost");
    }

    pub fn connection_resumed(&self) {
        info!(
            channel = %self.channel,
            state = self.state().map(|state| state.as_str()).unwrap_or("unknown"),
            "platform connection resumed"
        );
    }

    /// Stops the sweeper. In-flight renames are left to finish on their own.
    pub async fn shutdown(&self) {
        if let Some(mut handle) = self.sweeper_handle.lock().await.take() {
            handle.shutdown().await;
        }
        info!(
            channel = %self.channel,
            in_flight_renames = self.scheduler.in_flight(),
            "controller stopped"
        );
    }
}

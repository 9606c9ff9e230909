//! Periodic drift correction for the monitored channel.
//!
//! Each tick compares privileged presence against the desired state, compares
//! the live channel name against the desired label, and prunes the rename
//! scheduler's name cache. Nothing a tick does can stop later ticks. A
//! channel whose initial transition was aborted has no desired state yet and
//! is treated as drifted, so the sweep eventually establishes one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel_state::{ChannelState, ChannelStateMachine};
use crate::gateway::ChannelGateway;
use crate::rename_scheduler::RenameScheduler;

/// Consecutive ticks a presence mismatch must persist before it is corrected.
const PRESENCE_DRIFT_CONFIRMATION_TICKS: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub desired_state: Option<ChannelState>,
    pub observed_name: Option<String>,
    pub presence_drift: bool,
    pub corrected_state: Option<ChannelState>,
    pub rename_requested: bool,
    pub cache_invalidated: bool,
    pub pruned_cache_entries: usize,
}

pub struct ReconcileSweeper {
    state_machine: Arc<ChannelStateMachine>,
    scheduler: Arc<RenameScheduler>,
    gateway: Arc<dyn ChannelGateway>,
    presence_drift_ticks: AtomicU32,
}

impl ReconcileSweeper {
    pub fn new(
        state_machine: Arc<ChannelStateMachine>,
        scheduler: Arc<RenameScheduler>,
        gateway: Arc<dyn ChannelGateway>,
    ) -> Self {
        Self {
            state_machine,
            scheduler,
            gateway,
            presence_drift_ticks: AtomicU32::new(0),
        }
    }

    pub async fn run_tick(&self) -> SweepReport {
        let mut report = SweepReport {
            desired_state: self.state_machine.state(),
            ..SweepReport::default()
        };
        self.reconcile_presence(&mut report).await;
        report.desired_state = self.state_machine.state();
        if let Some(state) = report.desired_state {
            self.reconcile_name(state, &mut report);
        }
        report.pruned_cache_entries = self.scheduler.prune_stale_cache();
        report
    }

    async fn reconcile_presence(&self, report: &mut SweepReport) {
        let channel = self.state_machine.channel();
        let members = match self.gateway.current_members(channel) {
            Ok(members) => members,
            Err(error) => {
                warn!(channel = %channel, error = %error, "sweep could not read membership");
                return;
            }
        };
        let expected = if self.state_machine.policy().any_privileged(&members) {
            ChannelState::Open
        } else {
            ChannelState::Closed
        };
        if report.desired_state == Some(expected) {
            self.presence_drift_ticks.store(0, Ordering::Relaxed);
            return;
        }

        report.presence_drift = true;
        let ticks = self.presence_drift_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks < PRESENCE_DRIFT_CONFIRMATION_TICKS {
            debug!(channel = %channel, expected = expected.as_str(), ticks, "presence drift observed");
            return;
        }
        self.presence_drift_ticks.store(0, Ordering::Relaxed);
        info!(channel = %channel, expected = expected.as_str(), "correcting presence drift");
        if self.state_machine.transition_to(expected).await.is_applied() {
            report.corrected_state = Some(expected);
        }
    }

    fn reconcile_name(&self, state: ChannelState, report: &mut SweepReport) {
        let channel = self.state_machine.channel();
        let label = self.state_machine.labels().for_state(state);
        let Some(observed) = self.gateway.channel_name(channel) else {
            warn!(channel = %channel, "sweep could not read channel name");
            return;
        };
        if observed != label {
            info!(
                channel = %channel,
                state = state.as_str(),
                observed = %observed,
                expected = label,
                "channel name drifted"
            );
            report.cache_invalidated = self.scheduler.invalidate_if_diverged(channel, &observed);
            self.scheduler.background_rename(channel, label);
            report.rename_requested = true;
        }
        report.observed_name = Some(observed);
    }
}

#[derive(Debug)]
/// Handle to a running sweep loop.
pub struct ReconcileSweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReconcileSweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub fn start_reconcile_sweeper(
    sweeper: Arc<ReconcileSweeper>,
    interval: Duration,
) -> Result<ReconcileSweeperHandle> {
    if interval.is_zero() {
        anyhow::bail!("reconcile sweep interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("reconcile sweeper requires an active Tokio runtime")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(run_reconcile_loop(sweeper, interval, shutdown_rx));
    info!(interval_ms = interval.as_millis() as u64, "reconcile sweeper started");
    Ok(ReconcileSweeperHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_reconcile_loop(
    sweeper: Arc<ReconcileSweeper>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tick_count = 0_u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick_count = tick_count.saturating_add(1);
                let report = sweeper.run_tick().await;
                debug!(
                    tick_count,
                    rename_requested = report.rename_requested,
                    presence_drift = report.presence_drift,
                    pruned = report.pruned_cache_entries,
                    "reconcile sweep finished"
                );
            }
            _ = &mut shutdown_rx => {
                info!(tick_count, "reconcile sweeper stopped");
                break;
            }
        }
    }
}

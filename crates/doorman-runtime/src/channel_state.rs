//! Open/closed state machine for the monitored channel.
//!
//! Transitions are serialized and idempotent: a transition into the state
//! the channel already holds does nothing. The desired state only changes
//! once the default-role permission write is confirmed.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::gateway::{ChannelGateway, ChannelId, GatewayError, MemberId, PermissionTarget};
use crate::member_policy::{ChannelLabels, MemberPolicy};
use crate::rename_scheduler::RenameScheduler;

const EVICTION_REASON: &str = "channel closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The channel already held the requested state.
    AlreadyInState,
    Applied(TransitionReport),
    /// The default-role permission write failed or timed out.
    Aborted(TransitionReport),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn report(&self) -> Option<&TransitionReport> {
        match self {
            Self::AlreadyInState => None,
            Self::Applied(report) | Self::Aborted(report) => Some(report),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionReport {
    pub evicted: Vec<MemberId>,
    pub eviction_failures: Vec<MemberId>,
    pub regrant_failures: Vec<MemberId>,
    pub rename_queued: bool,
    pub elapsed: Duration,
}

pub struct ChannelStateMachine {
    gateway: Arc<dyn ChannelGateway>,
    scheduler: Arc<RenameScheduler>,
    channel: ChannelId,
    policy: MemberPolicy,
    labels: ChannelLabels,
    permission_timeout: Duration,
    state: Mutex<Option<ChannelState>>,
    transition_lock: tokio::sync::Mutex<()>,
}

impl ChannelStateMachine {
    pub fn new(
        gateway: Arc<dyn ChannelGateway>,
        scheduler: Arc<RenameScheduler>,
        channel: ChannelId,
        policy: MemberPolicy,
        labels: ChannelLabels,
        permission_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            scheduler,
            channel,
            policy,
            labels,
            permission_timeout,
            state: Mutex::new(None),
            transition_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Desired state, or `None` before the first successful transition.
    pub fn state(&self) -> Option<ChannelState> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn labels(&self) -> &ChannelLabels {
        &self.labels
    }

    pub fn policy(&self) -> &MemberPolicy {
        &self.policy
    }

    pub async fn transition_to(&self, state: ChannelState) -> TransitionOutcome {
        match state {
            ChannelState::Open => self.transition_to_open().await,
            ChannelState::Closed => self.transition_to_close().await,
        }
    }

    pub async fn transition_to_open(&self) -> TransitionOutcome {
        let _transition = self.transition_lock.lock().await;
        if self.state() == Some(ChannelState::Open) {
            return TransitionOutcome::AlreadyInState;
        }
        info!(channel = %self.channel, "opening channel");
        let started = Instant::now();
        let mut report = TransitionReport::default();

        if let Err(error) = self
            .write_connect_permission(PermissionTarget::Everyone, true)
            .await
        {
            error!(channel = %self.channel, error = %error, "failed to open channel");
            report.elapsed = started.elapsed();
            return TransitionOutcome::Aborted(report);
        }

        self.scheduler
            .background_rename(self.channel, self.labels.for_state(ChannelState::Open));
        report.rename_queued = true;
        self.set_state(ChannelState::Open);
        report.elapsed = started.elapsed();
        info!(
            channel = %self.channel,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "channel opened"
        );
        TransitionOutcome::Applied(report)
    }

    pub async fn transition_to_close(&self) -> TransitionOutcome {
        let _transition = self.transition_lock.lock().await;
        if self.state() == Some(ChannelState::Closed) {
            return TransitionOutcome::AlreadyInState;
        }
        info!(channel = %self.channel, "closing channel");
        let started = Instant::now();
        let mut report = TransitionReport::default();

        let evictable = match self.gateway.current_members(self.channel) {
            Ok(members) => members
                .into_iter()
                .filter(|member| self.policy.is_evictable(*member))
                .collect::<Vec<_>>(),
            Err(error) => {
                warn!(channel = %self.channel, error = %error, "could not list members to evict");
                Vec::new()
            }
        };

        let evictions = join_all(evictable.iter().map(|member| self.evict(*member)));
        let revoke = self.write_connect_permission(PermissionTarget::Everyone, false);
        let (eviction_results, revoke_result) = tokio::join!(evictions, revoke);

        for (member, result) in evictable.iter().zip(eviction_results) {
            match result {
                Ok(()) => report.evicted.push(*member),
                Err(error) => {
                    warn!(channel = %self.channel, member = %member, error = %error, "failed to evict member");
                    report.eviction_failures.push(*member);
                }
            }
        }

        report.regrant_failures = self.regrant_privileged().await;

        if let Err(error) = revoke_result {
            error!(channel = %self.channel, error = %error, "failed to close channel");
            report.elapsed = started.elapsed();
            return TransitionOutcome::Aborted(report);
        }

        self.scheduler
            .background_rename(self.channel, self.labels.for_state(ChannelState::Closed));
        report.rename_queued = true;
        self.set_state(ChannelState::Closed);
        report.elapsed = started.elapsed();
        info!(
            channel = %self.channel,
            evicted = report.evicted.len(),
            eviction_failures = report.eviction_failures.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "channel closed"
        );
        TransitionOutcome::Applied(report)
    }

    async fn write_connect_permission(
        &self,
        target: PermissionTarget,
        allow: bool,
    ) -> Result<(), GatewayError> {
        match timeout(
            self.permission_timeout,
            self.gateway
                .set_connect_permission(self.channel, target, allow),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Request(format!(
                "permission write for {target} timed out after {}ms",
                self.permission_timeout.as_millis()
            ))),
        }
    }

    async fn evict(&self, member: MemberId) -> Result<(), GatewayError> {
        match timeout(
            self.permission_timeout,
            self.gateway
                .evict_member(self.channel, member, EVICTION_REASON),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Request(format!(
                "eviction of {member} timed out"
            ))),
        }
    }

    /// Keeps privileged members able to join a closed channel.
    ///
    /// Configured ids that no longer resolve to a guild member are skipped.
    async fn regrant_privileged(&self) -> Vec<MemberId> {
        let (privileged, unknown): (Vec<_>, Vec<_>) = self
            .policy
            .privileged()
            .partition(|member| self.gateway.is_known_member(*member));
        if !unknown.is_empty() {
            debug!(channel = %self.channel, unknown = ?unknown, "skipping re-grant for unknown privileged ids");
        }
        let results = join_all(
            privileged
                .iter()
                .map(|member| self.write_connect_permission(PermissionTarget::Member(*member), true)),
        )
        .await;
        privileged
            .into_iter()
            .zip(results)
            .filter_map(|(member, result)| match result {
                Ok(()) => None,
                Err(error) => {
                    warn!(channel = %self.channel, member = %member, error = %error, "failed to re-grant privileged member");
                    Some(member)
                }
            })
            .collect()
    }
}

//! Routes voice membership changes of privileged members into transitions.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel_state::{ChannelStateMachine, TransitionOutcome};
use crate::gateway::{ChannelGateway, ChannelId, MemberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A member's voice channel before and after a platform update.
pub struct PresenceUpdate {
    pub member: MemberId,
    pub previous_channel: Option<ChannelId>,
    pub current_channel: Option<ChannelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceMovement {
    Joined,
    Left,
    /// Mute toggles, moves between other channels and the like.
    Unrelated,
}

impl PresenceUpdate {
    pub fn movement(&self, monitored: ChannelId) -> PresenceMovement {
        let was_inside = self.previous_channel == Some(monitored);
        let is_inside = self.current_channel == Some(monitored);
        match (was_inside, is_inside) {
            (false, true) => PresenceMovement::Joined,
            (true, false) => PresenceMovement::Left,
            _ => PresenceMovement::Unrelated,
        }
    }
}

#[derive(Debug)]
/// Admits at most one event per `min_interval`, process wide.
pub struct EventDebouncer {
    min_interval: Duration,
    last_admitted: Mutex<Option<Instant>>,
}

impl EventDebouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_admitted: Mutex::new(None),
        }
    }

    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut last = self
            .last_admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            if now.saturating_duration_since(previous) < self.min_interval {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceDecision {
    IgnoredUnprivileged,
    IgnoredUnrelated,
    Debounced,
    Opened(TransitionOutcome),
    Closed(TransitionOutcome),
    /// A privileged member was still connected after the leave grace period.
    PrivilegedStillPresent,
    MembershipUnavailable,
}

pub struct PresenceRouter {
    state_machine: Arc<ChannelStateMachine>,
    gateway: Arc<dyn ChannelGateway>,
    debouncer: EventDebouncer,
    leave_grace: Duration,
}

impl PresenceRouter {
    pub fn new(
        state_machine: Arc<ChannelStateMachine>,
        gateway: Arc<dyn ChannelGateway>,
        debounce: Duration,
        leave_grace: Duration,
    ) -> Self {
        Self {
            state_machine,
            gateway,
            debouncer: EventDebouncer::new(debounce),
            leave_grace,
        }
    }

    pub async fn handle(&self, update: PresenceUpdate) -> PresenceDecision {
        let channel = self.state_machine.channel();
        if !self.state_machine.policy().is_privileged(update.member) {
            return PresenceDecision::IgnoredUnprivileged;
        }
        let movement = update.movement(channel);
        if movement == PresenceMovement::Unrelated {
            return PresenceDecision::IgnoredUnrelated;
        }
        if !self.debouncer.admit() {
            debug!(channel = %channel, member = %update.member, "presence event debounced");
            return PresenceDecision::Debounced;
        }

        match movement {
            PresenceMovement::Joined => {
                info!(channel = %channel, member = %update.member, "privileged member joined");
                PresenceDecision::Opened(self.state_machine.transition_to_open().await)
            }
            PresenceMovement::Left => {
                info!(channel = %channel, member = %update.member, "privileged member left");
                tokio::time::sleep(self.leave_grace).await;
                // Membership must be read after the grace period, not before.
                match self.gateway.current_members(channel) {
                    Ok(members) if self.state_machine.policy().any_privileged(&members) => {
                        debug!(channel = %channel, "privileged member still present after grace period");
                        PresenceDecision::PrivilegedStillPresent
                    }
                    Ok(_) => PresenceDecision::Closed(self.state_machine.transition_to_close().await),
                    Err(error) => {
                        warn!(channel = %channel, error = %error, "could not re-check membership after leave");
                        PresenceDecision::MembershipUnavailable
                    }
                }
            }
            PresenceMovement::Unrelated => PresenceDecision::IgnoredUnrelated,
        }
    }
}

//! Presence-driven access control for a single voice channel.
//!
//! Opens the channel while a privileged member is connected and closes it
//! (evicting everyone else) once the last one leaves. Channel renames go
//! through a quota-aware scheduler and a periodic sweeper repairs drift
//! between the desired state and what the platform reports.

pub mod channel_controller;
pub mod channel_state;
pub mod config;
pub mod gateway;
pub mod member_policy;
pub mod presence_router;
pub mod reconcile_sweeper;
pub mod rename_probe;
pub mod rename_scheduler;

#[cfg(test)]
mod test_support;

pub use channel_controller::{ChannelController, StartupError};
pub use channel_state::{ChannelState, ChannelStateMachine, TransitionOutcome, TransitionReport};
pub use config::{parse_member_id_list, ConfigError, ControllerTuning, DoormanConfig};
pub use gateway::{ChannelGateway, ChannelId, GatewayError, MemberId, PermissionTarget};
pub use member_policy::{ChannelLabels, MemberPolicy};
pub use presence_router::{PresenceDecision, PresenceRouter, PresenceUpdate};
pub use reconcile_sweeper::{start_reconcile_sweeper, ReconcileSweeper, ReconcileSweeperHandle};
pub use rename_probe::{run_rename_probe, RenameProbeOutcome, RenameProbeReport};
pub use rename_scheduler::{RenameOutcome, RenameScheduler, RenameSchedulerConfig};

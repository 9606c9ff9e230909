//! Scripted in-memory gateway shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::{ChannelGateway, ChannelId, GatewayError, MemberId, PermissionTarget};

#[derive(Debug, Default)]
struct ScriptedState {
    name: String,
    members: Vec<MemberId>,
    manage_allowed: bool,
    rename_delay: Duration,
    rename_failures: VecDeque<GatewayError>,
    permission_delay: Duration,
    permission_failures: VecDeque<GatewayError>,
    evict_failures: HashSet<MemberId>,
    unknown_members: HashSet<MemberId>,
    rename_attempts: Vec<String>,
    permission_writes: Vec<(PermissionTarget, bool)>,
    evictions: Vec<MemberId>,
}

#[derive(Debug)]
pub(crate) struct ScriptedGateway {
    state: Mutex<ScriptedState>,
}

impl ScriptedGateway {
    pub(crate) fn new(name: &str, members: &[MemberId]) -> Self {
        Self {
            state: Mutex::new(ScriptedState {
                name: name.to_string(),
                members: members.to_vec(),
                manage_allowed: true,
                ..ScriptedState::default()
            }),
        }
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut ScriptedState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|error| error.into_inner());
        apply(&mut state)
    }

    pub(crate) fn set_members(&self, members: &[MemberId]) {
        self.with_state(|state| state.members = members.to_vec());
    }

    pub(crate) fn set_name(&self, name: &str) {
        self.with_state(|state| state.name = name.to_string());
    }

    pub(crate) fn set_manage_allowed(&self, allowed: bool) {
        self.with_state(|state| state.manage_allowed = allowed);
    }

    pub(crate) fn set_rename_delay(&self, delay: Duration) {
        self.with_state(|state| state.rename_delay = delay);
    }

    pub(crate) fn push_rename_failure(&self, error: GatewayError) {
        self.with_state(|state| state.rename_failures.push_back(error));
    }

    pub(crate) fn set_permission_delay(&self, delay: Duration) {
        self.with_state(|state| state.permission_delay = delay);
    }

    pub(crate) fn push_permission_failure(&self, error: GatewayError) {
        self.with_state(|state| state.permission_failures.push_back(error));
    }

    pub(crate) fn fail_eviction_of(&self, member: MemberId) {
        self.with_state(|state| {
            state.evict_failures.insert(member);
        });
    }

    pub(crate) fn forget_member(&self, member: MemberId) {
        self.with_state(|state| {
            state.unknown_members.insert(member);
        });
    }

    pub(crate) fn name(&self) -> String {
        self.with_state(|state| state.name.clone())
    }

    pub(crate) fn rename_attempts(&self) -> Vec<String> {
        self.with_state(|state| state.rename_attempts.clone())
    }

    pub(crate) fn permission_writes(&self) -> Vec<(PermissionTarget, bool)> {
        self.with_state(|state| state.permission_writes.clone())
    }

    pub(crate) fn evictions(&self) -> Vec<MemberId> {
        self.with_state(|state| state.evictions.clone())
    }
}

#[async_trait]
impl ChannelGateway for ScriptedGateway {
    fn channel_name(&self, _channel: ChannelId) -> Option<String> {
        Some(self.name())
    }

    fn current_members(&self, _channel: ChannelId) -> Result<Vec<MemberId>, GatewayError> {
        Ok(self.with_state(|state| state.members.clone()))
    }

    fn can_manage_channel(&self, _channel: ChannelId) -> Result<bool, GatewayError> {
        Ok(self.with_state(|state| state.manage_allowed))
    }

    fn is_known_member(&self, member: MemberId) -> bool {
        self.with_state(|state| !state.unknown_members.contains(&member))
    }

    async fn fetch_channel_name(&self, _channel: ChannelId) -> Result<String, GatewayError> {
        Ok(self.name())
    }

    async fn rename_channel(&self, _channel: ChannelId, name: &str) -> Result<(), GatewayError> {
        let (delay, failure) = self.with_state(|state| {
            state.rename_attempts.push(name.to_string());
            (state.rename_delay, state.rename_failures.pop_front())
        });
        tokio::time::sleep(delay).await;
        if let Some(error) = failure {
            return Err(error);
        }
        self.set_name(name);
        Ok(())
    }

    async fn set_connect_permission(
        &self,
        _channel: ChannelId,
        target: PermissionTarget,
        allow: bool,
    ) -> Result<(), GatewayError> {
        let (delay, failure) = self.with_state(|state| {
            state.permission_writes.push((target, allow));
            (state.permission_delay, state.permission_failures.pop_front())
        });
        tokio::time::sleep(delay).await;
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn evict_member(
        &self,
        _channel: ChannelId,
        member: MemberId,
        _reason: &str,
    ) -> Result<(), GatewayError> {
        self.with_state(|state| {
            if state.evict_failures.contains(&member) {
                return Err(GatewayError::Forbidden(format!("cannot move {member}")));
            }
            state.evictions.push(member);
            state.members.retain(|present| *present != member);
            Ok(())
        })
    }
}

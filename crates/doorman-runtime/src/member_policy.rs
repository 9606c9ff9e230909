use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::channel_state::ChannelState;
use crate::gateway::MemberId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Static member sets that drive opening and eviction.
pub struct MemberPolicy {
    privileged: BTreeSet<MemberId>,
    excluded: BTreeSet<MemberId>,
}

impl MemberPolicy {
    pub fn new(
        privileged: impl IntoIterator<Item = MemberId>,
        excluded: impl IntoIterator<Item = MemberId>,
    ) -> Self {
        Self {
            privileged: privileged.into_iter().collect(),
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn privileged(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.privileged.iter().copied()
    }

    pub fn privileged_count(&self) -> usize {
        self.privileged.len()
    }

    pub fn is_privileged(&self, member: MemberId) -> bool {
        self.privileged.contains(&member)
    }

    pub fn is_excluded(&self, member: MemberId) -> bool {
        self.excluded.contains(&member)
    }

    /// Members that must be disconnected when the channel closes.
    pub fn is_evictable(&self, member: MemberId) -> bool {
        !self.is_privileged(member) && !self.is_excluded(member)
    }

    pub fn any_privileged(&self, members: &[MemberId]) -> bool {
        members.iter().any(|member| self.is_privileged(*member))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Channel names advertised for each state.
pub struct ChannelLabels {
    pub open: String,
    pub closed: String,
}

impl ChannelLabels {
    pub fn for_state(&self, state: ChannelState) -> &str {
        match state {
            ChannelState::Open => &self.open,
            ChannelState::Closed => &self.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelLabels, MemberPolicy};
    use crate::channel_state::ChannelState;
    use crate::gateway::MemberId;

    #[test]
    fn unit_member_policy_never_evicts_privileged_or_excluded() {
        let policy = MemberPolicy::new([MemberId(1)], [MemberId(2)]);
        assert!(!policy.is_evictable(MemberId(1)));
        assert!(!policy.is_evictable(MemberId(2)));
        assert!(policy.is_evictable(MemberId(3)));
        assert!(!policy.is_privileged(MemberId(2)));
    }

    #[test]
    fn unit_member_policy_detects_privileged_presence() {
        let policy = MemberPolicy::new([MemberId(10), MemberId(11)], []);
        assert!(policy.any_privileged(&[MemberId(5), MemberId(11)]));
        assert!(!policy.any_privileged(&[MemberId(5)]));
        assert!(!policy.any_privileged(&[]));
    }

    #[test]
    fn unit_channel_labels_map_states() {
        let labels = ChannelLabels {
            open: "open".to_string(),
            closed: "closed".to_string(),
        };
        assert_eq!(labels.for_state(ChannelState::Open), "open");
        assert_eq!(labels.for_state(ChannelState::Closed), "closed");
    }
}

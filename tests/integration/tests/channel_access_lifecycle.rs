use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use doorman_runtime::{
    run_rename_probe, ChannelController, ChannelGateway, ChannelId, ChannelLabels, ChannelState,
    ControllerTuning, DoormanConfig, GatewayError, MemberId, MemberPolicy, PermissionTarget,
    PresenceDecision, PresenceUpdate, RenameScheduler, RenameSchedulerConfig,
};
use serde_json::Value;

const CHANNEL: ChannelId = ChannelId(4_242);
const LOBBY: ChannelId = ChannelId(4_243);
const OWNER: MemberId = MemberId(10);
const REGULAR: MemberId = MemberId(20);
const GUEST: MemberId = MemberId(30);
const OPEN_LABEL: &str = "cafe: open";
const CLOSED_LABEL: &str = "cafe: closed";

#[derive(Default)]
struct GuildState {
    name: String,
    members: Vec<MemberId>,
    rename_delay: Duration,
    rename_failures: VecDeque<GatewayError>,
    remote_renames: Vec<String>,
    permission_writes: Vec<(PermissionTarget, bool)>,
    evictions: Vec<(MemberId, String)>,
}

/// In-memory guild that applies writes the way the platform would.
struct SimulatedGuild {
    state: Mutex<GuildState>,
}

impl SimulatedGuild {
    fn new(name: &str, members: &[MemberId]) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GuildState {
                name: name.to_string(),
                members: members.to_vec(),
                ..GuildState::default()
            }),
        })
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut GuildState) -> T) -> T {
        let mut state = self.state.lock().expect("guild state lock");
        apply(&mut state)
    }

    fn connect(&self, member: MemberId) {
        self.with_state(|state| state.members.push(member));
    }

    fn disconnect(&self, member: MemberId) {
        self.with_state(|state| state.members.retain(|present| *present != member));
    }

    fn name(&self) -> String {
        self.with_state(|state| state.name.clone())
    }

    fn remote_renames(&self) -> Vec<String> {
        self.with_state(|state| state.remote_renames.clone())
    }

    fn permission_writes(&self) -> Vec<(PermissionTarget, bool)> {
        self.with_state(|state| state.permission_writes.clone())
    }

    fn evicted(&self) -> Vec<MemberId> {
        self.with_state(|state| state.evictions.iter().map(|(member, _)| *member).collect())
    }
}

#[async_trait]
impl ChannelGateway for SimulatedGuild {
    fn channel_name(&self, _channel: ChannelId) -> Option<String> {
        Some(self.name())
    }

    fn current_members(&self, _channel: ChannelId) -> Result<Vec<MemberId>, GatewayError> {
        Ok(self.with_state(|state| state.members.clone()))
    }

    fn can_manage_channel(&self, _channel: ChannelId) -> Result<bool, GatewayError> {
        Ok(true)
    }

    fn is_known_member(&self, _member: MemberId) -> bool {
        true
    }

    async fn fetch_channel_name(&self, _channel: ChannelId) -> Result<String, GatewayError> {
        Ok(self.name())
    }

    async fn rename_channel(&self, _channel: ChannelId, name: &str) -> Result<(), GatewayError> {
        let (delay, failure) =
            self.with_state(|state| (state.rename_delay, state.rename_failures.pop_front()));
        tokio::time::sleep(delay).await;
        if let Some(error) = failure {
            return Err(error);
        }
        self.with_state(|state| {
            state.remote_renames.push(name.to_string());
            state.name = name.to_string();
        });
        Ok(())
    }

    async fn set_connect_permission(
        &self,
        _channel: ChannelId,
        target: PermissionTarget,
        allow: bool,
    ) -> Result<(), GatewayError> {
        self.with_state(|state| state.permission_writes.push((target, allow)));
        Ok(())
    }

    async fn evict_member(
        &self,
        _channel: ChannelId,
        member: MemberId,
        reason: &str,
    ) -> Result<(), GatewayError> {
        self.with_state(|state| {
            state.members.retain(|present| *present != member);
            state.evictions.push((member, reason.to_string()));
        });
        Ok(())
    }
}

fn config() -> DoormanConfig {
    DoormanConfig {
        token: "integration-token".to_string(),
        channel_id: CHANNEL,
        policy: MemberPolicy::new([OWNER], [REGULAR]),
        labels: ChannelLabels {
            open: OPEN_LABEL.to_string(),
            closed: CLOSED_LABEL.to_string(),
        },
        tuning: ControllerTuning::default(),
    }
    .validate()
    .expect("valid integration config")
}

fn controller(guild: &Arc<SimulatedGuild>) -> ChannelController {
    let gateway: Arc<dyn ChannelGateway> = guild.clone();
    ChannelController::new(&config(), gateway)
}

fn joined(member: MemberId) -> PresenceUpdate {
    PresenceUpdate {
        member,
        previous_channel: Some(LOBBY),
        current_channel: Some(CHANNEL),
    }
}

fn left(member: MemberId) -> PresenceUpdate {
    PresenceUpdate {
        member,
        previous_channel: Some(CHANNEL),
        current_channel: None,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn integration_rename_quota_blocks_third_request_until_window_elapses() {
    let guild = SimulatedGuild::new("initial", &[]);
    let gateway: Arc<dyn ChannelGateway> = guild.clone();
    let scheduler = RenameScheduler::new(gateway, RenameSchedulerConfig::default());

    assert!(scheduler.request_rename(CHANNEL, "first").await);
    assert!(scheduler.request_rename(CHANNEL, "second").await);
    assert!(!scheduler.request_rename(CHANNEL, "third").await);
    assert_eq!(guild.remote_renames(), vec!["first", "second"]);

    tokio::time::advance(Duration::from_secs(10 * 60 + 1)).await;
    assert!(scheduler.request_rename(CHANNEL, "fourth").await);
    assert_eq!(guild.remote_renames(), vec!["first", "second", "fourth"]);
}

#[tokio::test(start_paused = true)]
async fn integration_privileged_join_opens_closed_channel() {
    let guild = SimulatedGuild::new(CLOSED_LABEL, &[GUEST]);
    let controller = controller(&guild);
    assert!(controller.start().await.expect("start controller"));
    assert_eq!(controller.state(), Some(ChannelState::Closed));
    assert_eq!(guild.evicted(), vec![GUEST]);

    guild.connect(OWNER);
    let decision = controller.handle_presence(joined(OWNER)).await;
    assert!(matches!(decision, PresenceDecision::Opened(ref outcome) if outcome.is_applied()));
    assert_eq!(controller.state(), Some(ChannelState::Open));
    assert_eq!(
        guild.permission_writes().last(),
        Some(&(PermissionTarget::Everyone, true))
    );

    settle().await;
    assert_eq!(guild.name(), OPEN_LABEL);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn integration_last_privileged_leave_closes_and_evicts() {
    let guild = SimulatedGuild::new(OPEN_LABEL, &[OWNER, REGULAR, GUEST]);
    let controller = controller(&guild);
    assert!(controller.start().await.expect("start controller"));
    assert_eq!(controller.state(), Some(ChannelState::Open));

    tokio::time::advance(Duration::from_secs(2)).await;
    guild.disconnect(OWNER);
    let started = tokio::time::Instant::now();
    let decision = controller.handle_presence(left(OWNER)).await;
    assert!(started.elapsed() >= Duration::from_millis(800));
    assert!(matches!(decision, PresenceDecision::Closed(ref outcome) if outcome.is_applied()));
    assert_eq!(controller.state(), Some(ChannelState::Closed));

    assert_eq!(guild.evicted(), vec![GUEST]);
    let writes = guild.permission_writes();
    assert!(writes.contains(&(PermissionTarget::Everyone, false)));
    assert!(writes.contains(&(PermissionTarget::Member(OWNER), true)));

    settle().await;
    assert_eq!(guild.name(), CLOSED_LABEL);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn integration_slow_rename_is_assumed_applied_after_timeout() {
    let guild = SimulatedGuild::new("initial", &[]);
    guild.with_state(|state| state.rename_delay = Duration::from_secs(30));
    let gateway: Arc<dyn ChannelGateway> = guild.clone();
    let scheduler = RenameScheduler::new(gateway, RenameSchedulerConfig::default());

    let started = tokio::time::Instant::now();
    assert!(scheduler.request_rename(CHANNEL, OPEN_LABEL).await);
    assert!(started.elapsed() < Duration::from_secs(9));
    assert_eq!(scheduler.cached_name(CHANNEL).as_deref(), Some(OPEN_LABEL));
    assert_eq!(guild.name(), "initial");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(guild.name(), OPEN_LABEL);
}

#[tokio::test(start_paused = true)]
async fn integration_sweeper_restores_externally_changed_name() {
    let guild = SimulatedGuild::new(OPEN_LABEL, &[OWNER]);
    let controller = controller(&guild);
    assert!(controller.start().await.expect("start controller"));

    guild.with_state(|state| state.name = "renamed by a moderator".to_string());
    tokio::time::sleep(Duration::from_secs(4)).await;
    // A fresh cache entry is trusted for one rename timeout.
    assert_eq!(guild.name(), "renamed by a moderator");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(guild.name(), OPEN_LABEL);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn integration_sweeper_closes_channel_after_missed_leave_event() {
    let guild = SimulatedGuild::new(OPEN_LABEL, &[OWNER, GUEST]);
    let controller = controller(&guild);
    assert!(controller.start().await.expect("start controller"));

    guild.disconnect(OWNER);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(controller.state(), Some(ChannelState::Closed));
    assert_eq!(guild.evicted(), vec![GUEST]);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn regression_rate_limited_rename_frees_quota_slot() {
    let guild = SimulatedGuild::new("initial", &[]);
    guild.with_state(|state| {
        state
            .rename_failures
            .push_back(GatewayError::RateLimited("code 50028".to_string()))
    });
    let gateway: Arc<dyn ChannelGateway> = guild.clone();
    let scheduler = RenameScheduler::new(gateway, RenameSchedulerConfig::default());

    assert!(!scheduler.request_rename(CHANNEL, "first").await);
    assert_eq!(scheduler.quota_used(), 0);
    assert!(scheduler.request_rename(CHANNEL, "second").await);
    assert!(scheduler.request_rename(CHANNEL, "third").await);
}

#[tokio::test(start_paused = true)]
async fn integration_rename_probe_report_is_json() {
    let guild = SimulatedGuild::new(CLOSED_LABEL, &[]);
    let report = run_rename_probe(guild.as_ref(), CHANNEL, Duration::from_secs(20))
        .await
        .expect("probe report");
    let value: Value = serde_json::to_value(&report).expect("serialize report");
    assert_eq!(value["outcome"], "succeeded");
    assert_eq!(value["original_name"], CLOSED_LABEL);
    assert_eq!(guild.name(), CLOSED_LABEL);
}

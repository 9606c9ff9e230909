//! Quota-aware, deduplicating channel rename scheduler.
//!
//! Renames are expensive on the platform side: only a handful are accepted
//! per window and a single call can stall for seconds. The scheduler
//! collapses duplicate requests, short-circuits renames that would not change
//! anything, reserves a quota slot before touching the network, and bounds
//! how long a caller waits for the remote call. Every failure is converted
//! into a [`RenameOutcome`] plus one log line.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{
    ControllerTuning, DEFAULT_NAME_CACHE_TTL, DEFAULT_RENAME_QUOTA_LIMIT,
    DEFAULT_RENAME_QUOTA_WINDOW, DEFAULT_RENAME_TIMEOUT,
};
use crate::gateway::{ChannelGateway, ChannelId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameSchedulerConfig {
    pub quota_limit: u32,
    pub quota_window: Duration,
    pub rename_timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for RenameSchedulerConfig {
    fn default() -> Self {
        Self {
            quota_limit: DEFAULT_RENAME_QUOTA_LIMIT,
            quota_window: DEFAULT_RENAME_QUOTA_WINDOW,
            rename_timeout: DEFAULT_RENAME_TIMEOUT,
            cache_ttl: DEFAULT_NAME_CACHE_TTL,
        }
    }
}

impl From<&ControllerTuning> for RenameSchedulerConfig {
    fn from(tuning: &ControllerTuning) -> Self {
        Self {
            quota_limit: tuning.rename_quota_limit,
            quota_window: tuning.rename_quota_window,
            rename_timeout: tuning.rename_timeout,
            cache_ttl: tuning.name_cache_ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Identity of a rename request; equal keys collapse into one remote call.
pub struct RenameKey {
    pub channel: ChannelId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of one pass through [`RenameScheduler::try_rename`].
pub enum RenameOutcome {
    /// An identical request is still in flight.
    AlreadyPending,
    /// The name cache already records the desired name.
    CachedName,
    /// The live channel name already matches.
    AlreadyNamed,
    QuotaExhausted { retry_after: Duration },
    Renamed,
    /// The remote call outlived the timeout and is assumed to land.
    AssumedAfterTimeout,
    RateLimited,
    Failed,
}

impl RenameOutcome {
    /// Whether the channel is believed to carry the desired name afterwards.
    pub fn applied(&self) -> bool {
        matches!(
            self,
            Self::CachedName | Self::AlreadyNamed | Self::Renamed | Self::AssumedAfterTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyPending => "already_pending",
            Self::CachedName => "cached_name",
            Self::AlreadyNamed => "already_named",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::Renamed => "renamed",
            Self::AssumedAfterTimeout => "assumed_after_timeout",
            Self::RateLimited => "rate_limited",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Quota slot taken by an in-flight rename.
pub struct QuotaReservation {
    window_start: Instant,
}

#[derive(Debug, Clone)]
/// Fixed rename window; resets once `duration` has fully elapsed.
pub struct QuotaWindow {
    window_start: Instant,
    used: u32,
    limit: u32,
    duration: Duration,
}

impl QuotaWindow {
    pub fn new(limit: u32, duration: Duration, now: Instant) -> Self {
        Self {
            window_start: now,
            used: 0,
            limit,
            duration,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) > self.duration {
            self.used = 0;
            self.window_start = now;
        }
    }

    /// Resets an elapsed window, then takes a slot or reports the wait left.
    pub fn try_reserve(&mut self, now: Instant) -> Result<QuotaReservation, Duration> {
        self.roll(now);
        if self.used < self.limit {
            self.used += 1;
            Ok(QuotaReservation {
                window_start: self.window_start,
            })
        } else {
            // At the exact boundary the window has not rolled yet.
            Err(self.remaining(now).max(Duration::from_millis(1)))
        }
    }

    /// Returns a slot, unless its window has already rolled over.
    pub fn refund(&mut self, reservation: QuotaReservation) {
        if reservation.window_start == self.window_start {
            self.used = self.used.saturating_sub(1);
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        (self.window_start + self.duration).saturating_duration_since(now)
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedName {
    pub name: String,
    pub recorded_at: Instant,
    /// False when the entry was written optimistically after a timeout.
    pub confirmed: bool,
}

#[derive(Debug, Default)]
/// Best-effort memory of the last name written per channel.
pub struct NameCache {
    entries: HashMap<ChannelId, CachedName>,
}

impl NameCache {
    pub fn get(&self, channel: ChannelId) -> Option<&CachedName> {
        self.entries.get(&channel)
    }

    pub fn record(&mut self, channel: ChannelId, name: &str, now: Instant, confirmed: bool) {
        self.entries.insert(
            channel,
            CachedName {
                name: name.to_string(),
                recorded_at: now,
                confirmed,
            },
        );
    }

    pub fn remove(&mut self, channel: ChannelId) -> Option<CachedName> {
        self.entries.remove(&channel)
    }

    /// Evicts entries recorded more than `ttl` ago.
    pub fn prune(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.recorded_at) <= ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type PendingSet = Arc<Mutex<HashSet<RenameKey>>>;

/// Membership in the pending set, released on drop.
///
/// Owned so it can travel into the detached remote call and outlive a
/// caller that stopped waiting.
struct PendingGuard {
    pending: PendingSet,
    key: RenameKey,
}

impl PendingGuard {
    fn acquire(pending: &PendingSet, key: RenameKey) -> Option<Self> {
        if !lock(pending).insert(key.clone()) {
            return None;
        }
        Some(Self {
            pending: Arc::clone(pending),
            key,
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.key);
    }
}

pub struct RenameScheduler {
    gateway: Arc<dyn ChannelGateway>,
    config: RenameSchedulerConfig,
    quota: Mutex<QuotaWindow>,
    cache: Mutex<NameCache>,
    pending: PendingSet,
}

impl RenameScheduler {
    pub fn new(gateway: Arc<dyn ChannelGateway>, config: RenameSchedulerConfig) -> Self {
        let quota = QuotaWindow::new(config.quota_limit, config.quota_window, Instant::now());
        Self {
            gateway,
            config,
            quota: Mutex::new(quota),
            cache: Mutex::new(NameCache::default()),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &RenameSchedulerConfig {
        &self.config
    }

    /// Boolean form of [`Self::try_rename`].
    pub async fn request_rename(&self, channel: ChannelId, desired: &str) -> bool {
        self.try_rename(channel, desired).await.applied()
    }

    pub async fn try_rename(&self, channel: ChannelId, desired: &str) -> RenameOutcome {
        let key = RenameKey {
            channel,
            name: desired.to_string(),
        };
        let Some(pending) = PendingGuard::acquire(&self.pending, key) else {
            info!(channel = %channel, name = desired, "rename already in flight");
            return RenameOutcome::AlreadyPending;
        };

        let cached = lock(&self.cache)
            .get(channel)
            .is_some_and(|entry| entry.name == desired);
        if cached {
            debug!(channel = %channel, name = desired, "name cache already holds desired name");
            return RenameOutcome::CachedName;
        }

        if self.gateway.channel_name(channel).as_deref() == Some(desired) {
            lock(&self.cache).record(channel, desired, Instant::now(), true);
            debug!(channel = %channel, name = desired, "channel already carries desired name");
            return RenameOutcome::AlreadyNamed;
        }

        let reservation = match lock(&self.quota).try_reserve(Instant::now()) {
            Ok(reservation) => reservation,
            Err(retry_after) => {
                info!(
                    channel = %channel,
                    name = desired,
                    retry_after_secs = retry_after.as_secs(),
                    "rename quota exhausted"
                );
                return RenameOutcome::QuotaExhausted { retry_after };
            }
        };

        // The remote call runs detached so a timeout abandons only our wait.
        // It keeps the pending entry until the platform answers.
        let gateway = Arc::clone(&self.gateway);
        let name = desired.to_string();
        let remote = tokio::spawn(async move {
            let _pending = pending;
            gateway.rename_channel(channel, &name).await
        });

        match tokio::time::timeout(self.config.rename_timeout, remote).await {
            Err(_) => {
                lock(&self.cache).record(channel, desired, Instant::now(), false);
                info!(
                    channel = %channel,
                    name = desired,
                    timeout_ms = self.config.rename_timeout.as_millis() as u64,
                    "rename timed out; assuming it completes remotely"
                );
                RenameOutcome::AssumedAfterTimeout
            }
            Ok(Ok(Ok(()))) => {
                lock(&self.cache).record(channel, desired, Instant::now(), true);
                let (used, limit) = {
                    let quota = lock(&self.quota);
                    (quota.used(), quota.limit())
                };
                info!(channel = %channel, name = desired, used, limit, "channel renamed");
                RenameOutcome::Renamed
            }
            Ok(Ok(Err(gateway_error))) if gateway_error.is_rate_limited() => {
                lock(&self.quota).refund(reservation);
                info!(
                    channel = %channel,
                    name = desired,
                    error = %gateway_error,
                    "platform rejected rename with rate limit"
                );
                RenameOutcome::RateLimited
            }
            Ok(Ok(Err(gateway_error))) => {
                lock(&self.quota).refund(reservation);
                error!(channel = %channel, name = desired, error = %gateway_error, "rename failed");
                RenameOutcome::Failed
            }
            Ok(Err(join_error)) => {
                lock(&self.quota).refund(reservation);
                error!(channel = %channel, name = desired, error = %join_error, "rename task aborted");
                RenameOutcome::Failed
            }
        }
    }

    /// Starts a rename without waiting for it.
    ///
    /// Callers get no ordering or completion guarantee; the outcome only
    /// shows up in the logs and, on success, in the name cache.
    pub fn background_rename(self: &Arc<Self>, channel: ChannelId, desired: &str) {
        let scheduler = Arc::clone(self);
        let desired = desired.to_string();
        info!(channel = %channel, name = %desired, "background rename queued");
        tokio::spawn(async move {
            let outcome = scheduler.try_rename(channel, &desired).await;
            debug!(channel = %channel, name = %desired, outcome = outcome.as_str(), "background rename settled");
        });
    }

    /// Drops cache entries older than the configured TTL.
    pub fn prune_stale_cache(&self) -> usize {
        let pruned = lock(&self.cache).prune(Instant::now(), self.config.cache_ttl);
        if pruned > 0 {
            debug!(pruned, "pruned stale name cache entries");
        }
        pruned
    }

    /// Forgets a cache entry that a live read contradicts.
    ///
    /// Entries younger than the rename timeout, or whose remote write is
    /// still in flight, are kept because the platform may not have published
    /// the write yet.
    pub fn invalidate_if_diverged(&self, channel: ChannelId, observed: &str) -> bool {
        let mut cache = lock(&self.cache);
        let diverged = cache.get(channel).is_some_and(|entry| {
            entry.name != observed
                && Instant::now().saturating_duration_since(entry.recorded_at)
                    >= self.config.rename_timeout
                && !lock(&self.pending).contains(&RenameKey {
                    channel,
                    name: entry.name.clone(),
                })
        });
        if diverged {
            if let Some(entry) = cache.remove(channel) {
                warn!(
                    channel = %channel,
                    cached = %entry.name,
                    observed,
                    confirmed = entry.confirmed,
                    "name cache contradicted by live channel name"
                );
            }
        }
        diverged
    }

    pub fn cached_name(&self, channel: ChannelId) -> Option<String> {
        lock(&self.cache).get(channel).map(|entry| entry.name.clone())
    }

    pub fn quota_used(&self) -> u32 {
        lock(&self.quota).used()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }
}

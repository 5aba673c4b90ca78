use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use maxx_common::{CooldownReason, Dialect};
use maxx_storage::{CooldownRow, Storage};

use crate::events::{Event, EventHub};

/// Fallback durations used when the upstream supplied no reset instant.
#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    pub server_error_base: Duration,
    pub server_error_cap: Duration,
    pub network_error_step: Duration,
    pub network_error_cap: Duration,
    pub rate_limit: Duration,
    pub quota_exhausted: Duration,
    pub concurrent_limit: Duration,
    pub unknown: Duration,
    /// Failure counters idle longer than this restart escalation.
    pub failure_idle: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            server_error_base: Duration::from_secs(10),
            server_error_cap: Duration::from_secs(600),
            network_error_step: Duration::from_secs(5),
            network_error_cap: Duration::from_secs(60),
            rate_limit: Duration::from_secs(60),
            quota_exhausted: Duration::from_secs(3600),
            concurrent_limit: Duration::from_secs(10),
            unknown: Duration::from_secs(60),
            failure_idle: Duration::from_secs(24 * 3600),
        }
    }
}

impl CooldownPolicy {
    /// Defaults overlaid with the operator's settings, when present.
    pub fn from_settings(snapshot: &maxx_storage::StorageSnapshot) -> Self {
        let mut policy = Self::default();
        if let Some(raw) = snapshot.setting(maxx_common::settings::COOLDOWN_POLICY)
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(raw)
        {
            let secs = |key: &str| value.get(key).and_then(|v| v.as_u64());
            if let Some(v) = secs("server_error_base_secs") {
                policy.server_error_base = Duration::from_secs(v);
            }
            if let Some(v) = secs("server_error_cap_secs") {
                policy.server_error_cap = Duration::from_secs(v);
            }
            if let Some(v) = secs("network_error_step_secs") {
                policy.network_error_step = Duration::from_secs(v);
            }
            if let Some(v) = secs("network_error_cap_secs") {
                policy.network_error_cap = Duration::from_secs(v);
            }
            if let Some(v) = secs("rate_limit_secs") {
                policy.rate_limit = Duration::from_secs(v);
            }
            if let Some(v) = secs("quota_exhausted_secs") {
                policy.quota_exhausted = Duration::from_secs(v);
            }
            if let Some(v) = secs("concurrent_limit_secs") {
                policy.concurrent_limit = Duration::from_secs(v);
            }
            if let Some(v) = secs("unknown_secs") {
                policy.unknown = Duration::from_secs(v);
            }
        }
        if let Some(secs) = snapshot
            .setting(maxx_common::settings::FAILURE_COUNT_IDLE_SECS)
            .and_then(|v| v.parse::<u64>().ok())
        {
            policy.failure_idle = Duration::from_secs(secs);
        }
        policy
    }

    /// Delay before the next call to a failing (provider, dialect).
    pub fn delay(&self, reason: CooldownReason, failure_count: i64) -> Duration {
        let count = failure_count.max(1) as u32;
        match reason {
            CooldownReason::ServerError => {
                let factor = 2u32.saturating_pow(count.saturating_sub(1).min(16));
                (self.server_error_base * factor).min(self.server_error_cap)
            }
            CooldownReason::NetworkError => {
                (self.network_error_step * count).min(self.network_error_cap)
            }
            CooldownReason::RateLimit => self.rate_limit,
            CooldownReason::QuotaExhausted => self.quota_exhausted,
            CooldownReason::ConcurrentLimit => self.concurrent_limit,
            CooldownReason::Unknown => self.unknown,
        }
    }
}

/// Per-(provider, dialect) quarantine with persistent failure counters.
///
/// Process-wide singleton constructed at bootstrap; all mutations persist
/// through the storage contract.
pub struct CooldownController {
    storage: Arc<dyn Storage>,
    events: EventHub,
    entries: Mutex<HashMap<(i64, Dialect), CooldownRow>>,
    policy: CooldownPolicy,
}

impl CooldownController {
    pub fn new(storage: Arc<dyn Storage>, events: EventHub, policy: CooldownPolicy) -> Self {
        Self {
            storage,
            events,
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Warm the in-memory map from storage, dropping expired rows.
    pub async fn load(&self) -> Result<(), maxx_storage::StorageError> {
        let now = OffsetDateTime::now_utc();
        let rows = self.storage.list_cooldowns().await?;
        let mut entries = self.entries.lock().await;
        for row in rows {
            if row.until_time > now {
                entries.insert((row.provider_id, row.dialect), row);
            } else {
                self.storage
                    .delete_cooldown(row.provider_id, row.dialect)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn is_cooling(&self, provider_id: i64, dialect: Dialect) -> bool {
        self.cooling_until(provider_id, dialect).await.is_some()
    }

    pub async fn cooling_until(
        &self,
        provider_id: i64,
        dialect: Dialect,
    ) -> Option<OffsetDateTime> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.lock().await;
        match entries.get(&(provider_id, dialect)) {
            Some(row) if row.until_time > now => Some(row.until_time),
            Some(_) => {
                // Expired entries behave as absent and are collected here.
                entries.remove(&(provider_id, dialect));
                drop(entries);
                let _ = self.storage.delete_cooldown(provider_id, dialect).await;
                None
            }
            None => None,
        }
    }

    /// Upsert the quarantine entry and bump the failure counter.
    ///
    /// An explicit until-time is used verbatim; policy delays get ±20%
    /// jitter.
    pub async fn record_failure(
        &self,
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
        explicit_until: Option<OffsetDateTime>,
    ) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();

        let prior = self
            .storage
            .get_failure_count(provider_id, dialect, reason)
            .await
            .ok()
            .flatten();
        let stale = prior
            .as_ref()
            .map(|row| now - row.last_failure_at > self.policy.failure_idle)
            .unwrap_or(false);
        let stored = self
            .storage
            .increment_failure_count(provider_id, dialect, reason, now)
            .await
            .unwrap_or(1);
        let count = if stale { 1 } else { stored };

        let until = match explicit_until {
            Some(until) => until,
            None => now + jitter(self.policy.delay(reason, count)),
        };

        let row = CooldownRow {
            provider_id,
            dialect,
            until_time: until,
            reason,
            updated_at: now,
        };
        self.entries
            .lock()
            .await
            .insert((provider_id, dialect), row.clone());
        let _ = self.storage.upsert_cooldown(&row).await;
        self.events
            .emit(Event::CooldownStarted {
                provider_id,
                dialect,
                reason,
                until,
                at: now,
            })
            .await;
        until
    }

    /// Reset failure counters. An existing cooldown stays: it may encode a
    /// future quota reset the caller already knows about.
    pub async fn record_success(&self, provider_id: i64, dialect: Dialect) {
        let _ = self.storage.reset_failure_counts(provider_id, dialect).await;
    }

    /// Late update once an asynchronous quota lookup resolves.
    pub async fn update_cooldown(
        &self,
        provider_id: i64,
        dialect: Dialect,
        new_until: OffsetDateTime,
    ) {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.lock().await;
        let row = match entries.get_mut(&(provider_id, dialect)) {
            Some(row) => {
                row.until_time = new_until;
                row.updated_at = now;
                row.clone()
            }
            None => {
                let row = CooldownRow {
                    provider_id,
                    dialect,
                    until_time: new_until,
                    reason: CooldownReason::QuotaExhausted,
                    updated_at: now,
                };
                entries.insert((provider_id, dialect), row.clone());
                row
            }
        };
        drop(entries);
        let _ = self.storage.upsert_cooldown(&row).await;
    }

    pub async fn clear(&self, provider_id: i64, dialect: Dialect) {
        self.entries.lock().await.remove(&(provider_id, dialect));
        let _ = self.storage.delete_cooldown(provider_id, dialect).await;
        self.events
            .emit(Event::CooldownCleared {
                provider_id,
                dialect,
                at: OffsetDateTime::now_utc(),
            })
            .await;
    }
}

fn jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..=1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxx_storage::MemoryStorage;

    fn controller() -> CooldownController {
        CooldownController::new(
            Arc::new(MemoryStorage::new()),
            EventHub::new(16),
            CooldownPolicy::default(),
        )
    }

    #[tokio::test]
    async fn explicit_until_is_used_verbatim() {
        let controller = controller();
        let until = OffsetDateTime::now_utc() + time::Duration::hours(2);
        let applied = controller
            .record_failure(1, Dialect::Claude, CooldownReason::QuotaExhausted, Some(until))
            .await;
        assert_eq!(applied, until);
        assert!(controller.is_cooling(1, Dialect::Claude).await);
        assert!(!controller.is_cooling(1, Dialect::Gemini).await);
        assert!(!controller.is_cooling(2, Dialect::Claude).await);
    }

    #[tokio::test]
    async fn policy_delay_applied_with_jitter_bounds() {
        let controller = controller();
        let before = OffsetDateTime::now_utc();
        let until = controller
            .record_failure(1, Dialect::Claude, CooldownReason::RateLimit, None)
            .await;
        let delta = until - before;
        assert!(delta >= time::Duration::seconds(45));
        assert!(delta <= time::Duration::seconds(75));
    }

    #[tokio::test]
    async fn server_errors_escalate_exponentially() {
        let policy = CooldownPolicy::default();
        assert_eq!(
            policy.delay(CooldownReason::ServerError, 1),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.delay(CooldownReason::ServerError, 3),
            Duration::from_secs(40)
        );
        assert_eq!(
            policy.delay(CooldownReason::ServerError, 20),
            Duration::from_secs(600)
        );
    }

    #[tokio::test]
    async fn expired_entries_behave_as_absent() {
        let controller = controller();
        let past = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        controller
            .record_failure(1, Dialect::Claude, CooldownReason::ServerError, Some(past))
            .await;
        assert!(!controller.is_cooling(1, Dialect::Claude).await);
    }

    #[tokio::test]
    async fn success_resets_counters_but_keeps_cooldown() {
        let storage = Arc::new(MemoryStorage::new());
        let controller = CooldownController::new(
            storage.clone(),
            EventHub::new(16),
            CooldownPolicy::default(),
        );
        let until = OffsetDateTime::now_utc() + time::Duration::hours(1);
        controller
            .record_failure(1, Dialect::Claude, CooldownReason::QuotaExhausted, Some(until))
            .await;
        controller.record_success(1, Dialect::Claude).await;

        let counter = storage
            .get_failure_count(1, Dialect::Claude, CooldownReason::QuotaExhausted)
            .await
            .unwrap();
        assert!(counter.is_none());
        assert!(controller.is_cooling(1, Dialect::Claude).await);
    }

    #[tokio::test]
    async fn late_quota_update_moves_reset() {
        let controller = controller();
        controller
            .record_failure(1, Dialect::Claude, CooldownReason::QuotaExhausted, None)
            .await;
        let new_until = OffsetDateTime::now_utc() + time::Duration::hours(6);
        controller
            .update_cooldown(1, Dialect::Claude, new_until)
            .await;
        assert_eq!(
            controller.cooling_until(1, Dialect::Claude).await,
            Some(new_until)
        );
    }

    #[test]
    fn settings_override_policy_durations() {
        let mut snapshot = maxx_storage::StorageSnapshot::default();
        snapshot.settings.push((
            maxx_common::settings::COOLDOWN_POLICY.to_string(),
            r#"{"rate_limit_secs": 120, "quota_exhausted_secs": 7200}"#.to_string(),
        ));
        snapshot.settings.push((
            maxx_common::settings::FAILURE_COUNT_IDLE_SECS.to_string(),
            "600".to_string(),
        ));
        let policy = CooldownPolicy::from_settings(&snapshot);
        assert_eq!(policy.rate_limit, Duration::from_secs(120));
        assert_eq!(policy.quota_exhausted, Duration::from_secs(7200));
        assert_eq!(policy.failure_idle, Duration::from_secs(600));
        assert_eq!(policy.unknown, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn clear_removes_entry() {
        let controller = controller();
        controller
            .record_failure(1, Dialect::Claude, CooldownReason::ServerError, None)
            .await;
        controller.clear(1, Dialect::Claude).await;
        assert!(!controller.is_cooling(1, Dialect::Claude).await);
    }
}

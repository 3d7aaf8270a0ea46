//! Execution rate limiting.
//!
//! Fixed-window counters keyed on the user or, for organisation plans, the
//! owning organisation. Three counters per key (sync, async, api-endpoint);
//! the window plus all counters reset together. The conditional
//! reset-or-increment is committed atomically by the store; this module owns
//! plan limits, key/counter selection and the fail-open policy.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::store::{CounterKind, StoreError, WorkflowStore};

const DEFAULT_WINDOW_MS: i64 = 60_000;
const DEFAULT_MANUAL_LIMIT: u64 = 999_999;

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Team,
    Enterprise,
}

impl Plan {
    /// Unknown plan names fall back to free.
    pub fn parse(name: &str) -> Plan {
        match name {
            "pro" => Plan::Pro,
            "team" => Plan::Team,
            "enterprise" => Plan::Enterprise,
            _ => Plan::Free,
        }
    }

    fn env_name(&self) -> &'static str {
        match self {
            Plan::Free => "FREE",
            Plan::Pro => "PRO",
            Plan::Team => "TEAM",
            Plan::Enterprise => "ENTERPRISE",
        }
    }

    /// Organisation plans pool usage under the subscription's reference id.
    pub fn is_organization(&self) -> bool {
        matches!(self, Plan::Team | Plan::Enterprise)
    }
}

/// A user's highest-priority subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub plan: Plan,
    pub reference_id: String,
}

/// Identity/billing lookup, implemented outside this crate.
#[async_trait::async_trait]
pub trait SubscriptionLookup: Send + Sync {
    async fn highest_priority_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, StoreError>;
}

/// In-memory subscription table for dev servers and tests. Users without an
/// entry run on the free plan.
#[derive(Default)]
pub struct MemorySubscriptions {
    subscriptions: std::sync::Mutex<std::collections::HashMap<String, Subscription>>,
}

impl MemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: &str, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id.to_string(), subscription);
    }
}

#[async_trait::async_trait]
impl SubscriptionLookup for MemorySubscriptions {
    async fn highest_priority_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
            .cloned())
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub sync_per_window: u64,
    pub async_per_window: u64,
    pub api_endpoint_per_window: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_ms: i64,
    pub manual_limit: u64,
    free: PlanLimits,
    pro: PlanLimits,
    team: PlanLimits,
    enterprise: PlanLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            manual_limit: DEFAULT_MANUAL_LIMIT,
            free: PlanLimits {
                sync_per_window: 10,
                async_per_window: 50,
                api_endpoint_per_window: 10,
            },
            pro: PlanLimits {
                sync_per_window: 25,
                async_per_window: 200,
                api_endpoint_per_window: 30,
            },
            team: PlanLimits {
                sync_per_window: 75,
                async_per_window: 500,
                api_endpoint_per_window: 60,
            },
            enterprise: PlanLimits {
                sync_per_window: 150,
                async_per_window: 1000,
                api_endpoint_per_window: 120,
            },
        }
    }
}

impl RateLimitConfig {
    /// Defaults overridden by `RATE_LIMIT_WINDOW_MS`,
    /// `MANUAL_EXECUTION_LIMIT` and `RATE_LIMIT_{PLAN}_{SYNC,ASYNC}`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.window_ms = env_parse("RATE_LIMIT_WINDOW_MS", config.window_ms);
        config.manual_limit = env_parse("MANUAL_EXECUTION_LIMIT", config.manual_limit);
        for plan in [Plan::Free, Plan::Pro, Plan::Team, Plan::Enterprise] {
            let limits = config.limits_mut(plan);
            limits.sync_per_window = env_parse(
                &format!("RATE_LIMIT_{}_SYNC", plan.env_name()),
                limits.sync_per_window,
            );
            limits.async_per_window = env_parse(
                &format!("RATE_LIMIT_{}_ASYNC", plan.env_name()),
                limits.async_per_window,
            );
        }
        config
    }

    pub fn limits_for(&self, plan: Plan) -> &PlanLimits {
        match plan {
            Plan::Free => &self.free,
            Plan::Pro => &self.pro,
            Plan::Team => &self.team,
            Plan::Enterprise => &self.enterprise,
        }
    }

    fn limits_mut(&mut self, plan: Plan) -> &mut PlanLimits {
        match plan {
            Plan::Free => &mut self.free,
            Plan::Pro => &mut self.pro,
            Plan::Team => &mut self.team,
            Plan::Enterprise => &mut self.enterprise,
        }
    }

    fn limit(&self, plan: Plan, counter: CounterKind) -> u64 {
        let limits = self.limits_for(plan);
        match counter {
            CounterKind::Sync => limits.sync_per_window,
            CounterKind::Async => limits.async_per_window,
            CounterKind::ApiEndpoint => limits.api_endpoint_per_window,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// Key and counter selection
// ============================================================================

/// How a workflow execution entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Interactive runs are unconditionally allowed
    Manual,
    /// Direct API-endpoint invocations
    ApiEndpoint,
    /// Everything else (API-driven workflow executions)
    Api,
}

impl TriggerType {
    pub fn parse(name: &str) -> TriggerType {
        match name {
            "manual" => TriggerType::Manual,
            "api-endpoint" => TriggerType::ApiEndpoint,
            _ => TriggerType::Api,
        }
    }
}

pub fn counter_for(trigger: TriggerType, is_async: bool) -> CounterKind {
    match trigger {
        TriggerType::ApiEndpoint => CounterKind::ApiEndpoint,
        _ if is_async => CounterKind::Async,
        _ => CounterKind::Sync,
    }
}

/// Team and enterprise subscriptions whose reference id is not the user
/// itself account against the shared organisational pool.
pub fn rate_limit_key(user_id: &str, subscription: Option<&Subscription>) -> String {
    match subscription {
        Some(sub) if sub.plan.is_organization() && sub.reference_id != user_id => {
            sub.reference_id.clone()
        }
        _ => user_id.to_string(),
    }
}

// ============================================================================
// Limiter
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    store: Arc<dyn WorkflowStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WorkflowStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Check-and-consume one execution slot. Storage failures fail open so
    /// users are never blocked by limiter outages.
    pub async fn check(
        &self,
        user_id: &str,
        subscription: Option<&Subscription>,
        trigger: TriggerType,
        is_async: bool,
    ) -> RateLimitDecision {
        self.check_at(user_id, subscription, trigger, is_async, Utc::now())
            .await
    }

    pub(crate) async fn check_at(
        &self,
        user_id: &str,
        subscription: Option<&Subscription>,
        trigger: TriggerType,
        is_async: bool,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let window = Duration::milliseconds(self.config.window_ms);

        if trigger == TriggerType::Manual {
            return RateLimitDecision {
                allowed: true,
                remaining: self.config.manual_limit,
                reset_at: now + window,
            };
        }

        let plan = subscription.map(|s| s.plan).unwrap_or(Plan::Free);
        let key = rate_limit_key(user_id, subscription);
        let counter = counter_for(trigger, is_async);
        let limit = self.config.limit(plan, counter);

        let committed = match self
            .store
            .rate_limit_consume(&key, counter, now, self.config.window_ms)
            .await
        {
            Ok(committed) => committed,
            Err(err) => {
                log::warn!("rate limiter failing open for {}: {}", key, err);
                return RateLimitDecision {
                    allowed: true,
                    remaining: 0,
                    reset_at: now + window,
                };
            }
        };

        let reset_at = committed.window_start + window;
        if committed.count > limit {
            if let Err(err) = self.store.rate_limit_mark_limited(&key, reset_at).await {
                log::warn!("failed to mark {} rate limited: {}", key, err);
            }
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }

        RateLimitDecision {
            allowed: true,
            remaining: limit - committed.count,
            reset_at,
        }
    }

    /// Read-only usage report; never consumes.
    pub async fn status(
        &self,
        user_id: &str,
        subscription: Option<&Subscription>,
        trigger: TriggerType,
        is_async: bool,
    ) -> RateLimitStatus {
        self.status_at(user_id, subscription, trigger, is_async, Utc::now())
            .await
    }

    pub(crate) async fn status_at(
        &self,
        user_id: &str,
        subscription: Option<&Subscription>,
        trigger: TriggerType,
        is_async: bool,
        now: DateTime<Utc>,
    ) -> RateLimitStatus {
        let window = Duration::milliseconds(self.config.window_ms);

        if trigger == TriggerType::Manual {
            return RateLimitStatus {
                used: 0,
                limit: self.config.manual_limit,
                remaining: self.config.manual_limit,
                reset_at: now + window,
            };
        }

        let plan = subscription.map(|s| s.plan).unwrap_or(Plan::Free);
        let key = rate_limit_key(user_id, subscription);
        let counter = counter_for(trigger, is_async);
        let limit = self.config.limit(plan, counter);

        let record = match self.store.rate_limit_read(&key).await {
            Ok(record) => record,
            Err(err) => {
                log::warn!("rate limit status read failed for {}: {}", key, err);
                None
            }
        };

        match record {
            Some(record) if now - record.window_start < window => {
                let used = record.counter(counter).min(limit);
                RateLimitStatus {
                    used,
                    limit,
                    remaining: limit - used,
                    reset_at: record.window_start + window,
                }
            }
            // No record, or the stored window already expired
            _ => RateLimitStatus {
                used: 0,
                limit,
                remaining: limit,
                reset_at: now + window,
            },
        }
    }

    /// Delete the record for this key.
    pub async fn reset(&self, user_id: &str, subscription: Option<&Subscription>) {
        let key = rate_limit_key(user_id, subscription);
        if let Err(err) = self.store.rate_limit_reset(&key).await {
            log::warn!("rate limit reset failed for {}: {}", key, err);
        }
    }
}

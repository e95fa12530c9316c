//! Multi-tier rate limiting over an external counter store.
//!
//! The limiter itself keeps no state: every decision is one atomic round trip
//! against a [`CounterStore`], so concurrent dispatch calls never race on a
//! shared in-process table.

pub mod store;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{domain::SenderId, Result};

pub use store::{CounterStore, CounterValue, MemoryCounterStore, SlidingHit};

const GLOBAL_KEY: &str = "global";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitTier {
    Global,
    User,
    Premium,
    Command,
    Ai,
    Download,
}

impl RateLimitTier {
    pub const ALL: [RateLimitTier; 6] = [
        RateLimitTier::Global,
        RateLimitTier::User,
        RateLimitTier::Premium,
        RateLimitTier::Command,
        RateLimitTier::Ai,
        RateLimitTier::Download,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitTier::Global => "global",
            RateLimitTier::User => "user",
            RateLimitTier::Premium => "premium",
            RateLimitTier::Command => "command",
            RateLimitTier::Ai => "ai",
            RateLimitTier::Download => "download",
        }
    }

    /// Tiers that guard an expensive class of resources shared by several
    /// commands rather than one command.
    pub fn is_resource_class(self) -> bool {
        matches!(self, RateLimitTier::Ai | RateLimitTier::Download)
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    /// Counter reset at fixed boundaries (cheap, one increment per check).
    Fixed,
    /// Continuously moving window of timestamped requests.
    Sliding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    pub requests: u32,
    pub window: Duration,
    pub strategy: WindowStrategy,
}

impl TierLimit {
    pub const fn fixed(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window: Duration::from_secs(window_secs),
            strategy: WindowStrategy::Fixed,
        }
    }

    pub const fn sliding(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window: Duration::from_secs(window_secs),
            strategy: WindowStrategy::Sliding,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub tiers: HashMap<RateLimitTier, TierLimit>,
}

impl RateLimitConfig {
    pub fn default_limit(tier: RateLimitTier) -> TierLimit {
        match tier {
            RateLimitTier::Global => TierLimit::fixed(100, 60),
            RateLimitTier::User => TierLimit::fixed(30, 60),
            RateLimitTier::Premium => TierLimit::fixed(100, 60),
            RateLimitTier::Command => TierLimit::fixed(10, 60),
            RateLimitTier::Ai => TierLimit::sliding(5, 300),
            RateLimitTier::Download => TierLimit::fixed(3, 60),
        }
    }

    pub fn limit_for(&self, tier: RateLimitTier) -> TierLimit {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or_else(|| Self::default_limit(tier))
    }

    pub fn with_tier(mut self, tier: RateLimitTier, limit: TierLimit) -> Self {
        self.tiers.insert(tier, limit);
        self
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: RateLimitTier::ALL
                .into_iter()
                .map(|t| (t, Self::default_limit(t)))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current: u64,
    pub limit: u32,
    pub remaining: u64,
    /// Time until the window frees up again.
    pub reset_after: Option<Duration>,
    /// Set when the store failed and the decision was made fail-open.
    pub error: Option<String>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            current: 0,
            limit: u32::MAX,
            remaining: u64::from(u32::MAX),
            reset_after: None,
            error: None,
        }
    }

    fn fail_open(limit: u32, error: String) -> Self {
        Self {
            allowed: true,
            current: 0,
            limit,
            remaining: u64::from(limit),
            reset_after: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TierCheck {
    pub key: String,
    pub tier: RateLimitTier,
}

impl TierCheck {
    pub fn new(key: impl Into<String>, tier: RateLimitTier) -> Self {
        Self {
            key: key.into(),
            tier,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TierResult {
    pub check: TierCheck,
    pub decision: RateLimitDecision,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompositeDecision {
    pub allowed: bool,
    /// First tier that rejected the request.
    pub failed: Option<TierCheck>,
    /// Results computed before short-circuiting (the failing one included).
    pub results: Vec<TierResult>,
}

impl CompositeDecision {
    pub fn retry_after(&self) -> Option<Duration> {
        let failed = self.failed.as_ref()?;
        self.results
            .iter()
            .find(|r| &r.check == failed)
            .and_then(|r| r.decision.reset_after)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TierUsage {
    pub tier: RateLimitTier,
    pub current: u64,
    pub limit: u32,
    pub reset_in: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct RateLimitStatus {
    pub identity_tier: RateLimitTier,
    pub tiers: Vec<TierUsage>,
}

#[derive(Clone)]
pub struct RateLimiter {
    cfg: RateLimitConfig,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self { cfg, store }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    fn store_key(tier: RateLimitTier, strategy: WindowStrategy, key: &str) -> String {
        match strategy {
            WindowStrategy::Fixed => format!("ratelimit:{tier}:{key}"),
            WindowStrategy::Sliding => format!("sliding:{tier}:{key}"),
        }
    }

    /// Check one tier for one key, consuming a slot if allowed.
    pub async fn check(&self, key: &str, tier: RateLimitTier) -> RateLimitDecision {
        if !self.cfg.enabled {
            return RateLimitDecision::unlimited();
        }

        let limit = self.cfg.limit_for(tier);
        let result = match limit.strategy {
            WindowStrategy::Fixed => self.check_fixed(key, tier, limit).await,
            WindowStrategy::Sliding => self.check_sliding(key, tier, limit).await,
        };

        match result {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::warn!(
                        key,
                        tier = %tier,
                        current = decision.current,
                        limit = decision.limit,
                        reset_after_ms = decision.reset_after.map(|d| d.as_millis() as u64),
                        "rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                tracing::error!(key, tier = %tier, error = %e, "rate limiter store failed; allowing request");
                RateLimitDecision::fail_open(limit.requests, e.to_string())
            }
        }
    }

    async fn check_fixed(
        &self,
        key: &str,
        tier: RateLimitTier,
        limit: TierLimit,
    ) -> Result<RateLimitDecision> {
        let store_key = Self::store_key(tier, WindowStrategy::Fixed, key);
        let value = self.store.incr_with_expiry(&store_key, limit.window).await?;
        let max = u64::from(limit.requests);

        Ok(RateLimitDecision {
            allowed: value.count <= max,
            current: value.count,
            limit: limit.requests,
            remaining: max.saturating_sub(value.count),
            reset_after: Some(value.ttl),
            error: None,
        })
    }

    async fn check_sliding(
        &self,
        key: &str,
        tier: RateLimitTier,
        limit: TierLimit,
    ) -> Result<RateLimitDecision> {
        let store_key = Self::store_key(tier, WindowStrategy::Sliding, key);
        let hit = self
            .store
            .sliding_hit(&store_key, limit.window, limit.requests)
            .await?;
        let max = u64::from(limit.requests);

        Ok(RateLimitDecision {
            allowed: hit.recorded,
            current: if hit.recorded { hit.count } else { hit.count + 1 },
            limit: limit.requests,
            remaining: max.saturating_sub(hit.count),
            reset_after: Some(hit.reset_after),
            error: None,
        })
    }

    /// Evaluate tiers in order, stopping at the first rejection.
    pub async fn check_all(&self, checks: &[TierCheck]) -> CompositeDecision {
        let mut results = Vec::with_capacity(checks.len());

        for check in checks {
            let decision = self.check(&check.key, check.tier).await;
            let allowed = decision.allowed;
            results.push(TierResult {
                check: check.clone(),
                decision,
            });

            if !allowed {
                return CompositeDecision {
                    allowed: false,
                    failed: Some(check.clone()),
                    results,
                };
            }
        }

        CompositeDecision {
            allowed: true,
            failed: None,
            results,
        }
    }

    /// Canonical tier list for one command invocation: global budget first,
    /// then the identity, then the action.
    pub fn command_checks(
        sender: &SenderId,
        command: &str,
        identity_tier: RateLimitTier,
        action_tier: RateLimitTier,
    ) -> Vec<TierCheck> {
        let mut checks = vec![
            TierCheck::new(GLOBAL_KEY, RateLimitTier::Global),
            TierCheck::new(sender.0.clone(), identity_tier),
            TierCheck::new(format!("{sender}:{command}"), RateLimitTier::Command),
        ];

        if action_tier.is_resource_class() {
            checks.push(TierCheck::new(
                format!("{sender}:{}", action_tier.as_str()),
                action_tier,
            ));
        }

        checks
    }

    /// Current usage for an identity, without consuming anything.
    pub async fn status(
        &self,
        sender: &SenderId,
        identity_tier: RateLimitTier,
    ) -> Result<RateLimitStatus> {
        let mut tiers = Vec::new();
        let checks = [
            (identity_tier, sender.0.clone()),
            (RateLimitTier::Ai, format!("{sender}:ai")),
            (RateLimitTier::Download, format!("{sender}:download")),
        ];

        for (tier, key) in checks {
            let limit = self.cfg.limit_for(tier);
            let store_key = Self::store_key(tier, limit.strategy, &key);
            let value = match limit.strategy {
                WindowStrategy::Fixed => CounterValue {
                    count: self.store.get(&store_key).await?.unwrap_or(0),
                    ttl: self.store.ttl(&store_key).await?.unwrap_or_default(),
                },
                WindowStrategy::Sliding => self
                    .store
                    .sliding_peek(&store_key, limit.window)
                    .await?
                    .unwrap_or(CounterValue {
                        count: 0,
                        ttl: Duration::ZERO,
                    }),
            };
            tiers.push(TierUsage {
                tier,
                current: value.count,
                limit: limit.requests,
                reset_in: value.ttl,
            });
        }

        Ok(RateLimitStatus {
            identity_tier,
            tiers,
        })
    }

    /// Drop every counter owned by `sender`.
    pub async fn reset_identity(&self, sender: &SenderId) -> Result<usize> {
        let id = sender.0.clone();
        let removed = self
            .store
            .remove_where(&move |k: &str| key_belongs_to(k, &id))
            .await?;
        tracing::info!(sender = %sender, removed, "rate limits reset");
        Ok(removed)
    }
}

fn key_belongs_to(store_key: &str, sender: &str) -> bool {
    let Some(rest) = store_key
        .strip_prefix("ratelimit:")
        .or_else(|| store_key.strip_prefix("sliding:"))
    else {
        return false;
    };
    let Some((_tier, key)) = rest.split_once(':') else {
        return false;
    };
    key == sender
        || key
            .strip_prefix(sender)
            .map(|tail| tail.starts_with(':'))
            .unwrap_or(false)
}

//! Per-category rate limit policies.
//!
//! Each traffic category owns one limiter for the life of the process, with
//! its own window, threshold and store. Categories never share counters: a
//! client throttled on uploads is unaffected on the general API.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::adaptive::{AdaptiveLimiter, AdaptiveSettings, SystemLoad};
use super::clock::{Clock, SystemClock};
use super::decision::{Decision, Rejection, STATUS_TOO_MANY_REQUESTS};
use super::fixed_window::FixedWindowLimiter;
use super::key::{KeyResolver, KeyStrategy, RequestContext};
use super::sliding_window::SlidingWindowLimiter;
use super::store::StoreSettings;
use super::strategy::{Algorithm, CountingStrategy};
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;

/// A traffic category with its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Api,
    Auth,
    Upload,
    Stream,
    LiveStream,
    Analytics,
    Drm,
    Webhook,
}

impl Category {
    /// Every category, in table order.
    pub const ALL: [Category; 8] = [
        Category::Api,
        Category::Auth,
        Category::Upload,
        Category::Stream,
        Category::LiveStream,
        Category::Analytics,
        Category::Drm,
        Category::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Auth => "auth",
            Category::Upload => "upload",
            Category::Stream => "stream",
            Category::LiveStream => "liveStream",
            Category::Analytics => "analytics",
            Category::Drm => "drm",
            Category::Webhook => "webhook",
        }
    }

    /// The built-in policy for this category.
    pub fn default_config(&self) -> PolicyConfig {
        let (window_ms, max_requests, key, message) = match self {
            Category::Api => (
                15 * MINUTE_MS,
                100,
                KeyStrategy::Ip,
                "Too many requests from this IP, please try again later.",
            ),
            Category::Auth => (
                15 * MINUTE_MS,
                5,
                KeyStrategy::Ip,
                "Too many authentication attempts, please try again later.",
            ),
            Category::Upload => (
                60 * MINUTE_MS,
                50,
                KeyStrategy::User,
                "Upload limit exceeded, please try again later.",
            ),
            Category::Stream => (
                60 * SECOND_MS,
                100,
                KeyStrategy::Ip,
                "Too many streaming requests, please slow down.",
            ),
            Category::LiveStream => (
                60 * MINUTE_MS,
                10,
                KeyStrategy::User,
                "Live stream limit exceeded, please try again later.",
            ),
            Category::Analytics => (
                60 * SECOND_MS,
                60,
                KeyStrategy::User,
                "Too many analytics requests, please slow down.",
            ),
            Category::Drm => (
                60 * SECOND_MS,
                30,
                KeyStrategy::Ip,
                "Too many license requests, please try again later.",
            ),
            Category::Webhook => (
                60 * SECOND_MS,
                200,
                KeyStrategy::Ip,
                "Webhook rate limit exceeded.",
            ),
        };

        PolicyConfig {
            window_ms,
            max_requests,
            message: message.to_string(),
            key,
            algorithm: Algorithm::Fixed,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| TurnstileError::UnknownPolicy(s.to_string()))
    }
}

/// The full definition of one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per key per window
    pub max_requests: u64,
    /// Body text for rejected requests
    pub message: String,
    /// How requests are keyed
    pub key: KeyStrategy,
    /// How requests are counted
    pub algorithm: Algorithm,
    /// Reserved; every request is counted regardless of outcome
    #[serde(default)]
    pub skip_successful_requests: bool,
    /// Reserved; every request is counted regardless of outcome
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl PolicyConfig {
    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_ms == 0 {
            return Err(TurnstileError::InvalidPolicy {
                policy: name.to_string(),
                reason: "window_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Optional adaptive wrapping for a policy.
#[derive(Debug, Clone)]
pub struct AdaptiveBinding {
    pub settings: AdaptiveSettings,
    pub load: Arc<SystemLoad>,
}

/// A named limiter plus the key resolver that feeds it.
pub struct Policy {
    name: String,
    config: PolicyConfig,
    resolver: Box<dyn KeyResolver>,
    limiter: Box<dyn CountingStrategy>,
}

impl Policy {
    /// Build a policy and start its store sweep when a runtime is available.
    pub fn build(
        name: &str,
        config: PolicyConfig,
        settings: StoreSettings,
        clock: Arc<dyn Clock>,
        adaptive: Option<AdaptiveBinding>,
    ) -> Result<Self> {
        config.validate(name)?;

        let limiter: Box<dyn CountingStrategy> = match config.algorithm {
            Algorithm::Fixed => {
                let limiter = FixedWindowLimiter::new(
                    name,
                    config.window(),
                    config.max_requests,
                    settings,
                    clock,
                );
                limiter.start_sweep(settings.sweep_interval);
                Box::new(limiter)
            }
            Algorithm::Sliding => {
                let limiter = SlidingWindowLimiter::new(
                    name,
                    config.window(),
                    config.max_requests,
                    settings,
                    clock,
                );
                limiter.start_sweep(settings.sweep_interval);
                Box::new(limiter)
            }
        };

        let limiter: Box<dyn CountingStrategy> = match adaptive {
            Some(binding) => Box::new(AdaptiveLimiter::with_load(
                limiter,
                binding.settings,
                binding.load,
            )),
            None => limiter,
        };

        Ok(Self {
            name: name.to_string(),
            resolver: config.key.resolver(),
            config,
            limiter,
        })
    }

    /// Replace the key resolver, e.g. with a closure.
    pub fn with_key_resolver(mut self, resolver: impl KeyResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// The rejection body text.
    pub fn message(&self) -> &str {
        &self.config.message
    }

    /// The counter key this policy derives for `request`.
    pub fn key_for(&self, request: &RequestContext) -> String {
        self.resolver.resolve(request)
    }

    /// Record `request` and decide whether it is admitted.
    pub fn check(&self, request: &RequestContext) -> Decision {
        let key = self.key_for(request);
        self.check_key(&key)
    }

    /// Record a request for an already-derived key.
    pub fn check_key(&self, key: &str) -> Decision {
        let decision = self.limiter.check_limit(key);
        if !decision.allowed {
            debug!(
                policy = %self.name,
                key = %key,
                retry_after = ?decision.retry_after_secs,
                "Request rejected"
            );
        }
        decision
    }

    /// The 429 response for a denied decision, `None` if it was allowed.
    pub fn rejection(&self, decision: &Decision) -> Option<Rejection> {
        if decision.allowed {
            return None;
        }
        Some(Rejection {
            status: STATUS_TOO_MANY_REQUESTS,
            message: self.config.message.clone(),
            headers: decision.headers(),
        })
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.tracked_keys()
    }

    /// Stop the sweep and drop all counters. Idempotent.
    pub fn destroy(&self) {
        self.limiter.destroy();
    }
}

/// The fixed set of category policies, built once at startup.
pub struct PolicyRegistry {
    policies: HashMap<Category, Policy>,
    load: Arc<SystemLoad>,
}

impl PolicyRegistry {
    /// Build the built-in table against the system clock.
    pub fn new() -> Result<Self> {
        Self::from_config(&TurnstileConfig::default())
    }

    /// Build the table with configured overrides against the system clock.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build the table with configured overrides against `clock`.
    pub fn with_clock(config: &TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let load = Arc::new(SystemLoad::new());
        let settings = config.store.settings();
        let mut policies = HashMap::with_capacity(Category::ALL.len());

        for category in Category::ALL {
            let base = category.default_config();
            let policy_config = match config.policy_override(category) {
                Some(o) => o.apply(base),
                None => base,
            };
            let adaptive = config.adaptive_for(category).then(|| AdaptiveBinding {
                settings: config.adaptive.settings(),
                load: Arc::clone(&load),
            });

            debug!(
                policy = %category,
                window_ms = policy_config.window_ms,
                max_requests = policy_config.max_requests,
                key = ?policy_config.key,
                algorithm = ?policy_config.algorithm,
                adaptive = adaptive.is_some(),
                "Creating policy"
            );

            let policy = Policy::build(
                category.as_str(),
                policy_config,
                settings,
                Arc::clone(&clock),
                adaptive,
            )?;
            policies.insert(category, policy);
        }

        info!(policies = policies.len(), "Policy registry initialized");
        Ok(Self { policies, load })
    }

    /// The policy for `category`.
    pub fn get(&self, category: Category) -> &Policy {
        // Every category is inserted at construction.
        &self.policies[&category]
    }

    /// The policy registered under `name`.
    pub fn get_by_name(&self, name: &str) -> Result<&Policy> {
        Ok(self.get(name.parse()?))
    }

    /// Replace the key resolver of one category.
    pub fn set_key_resolver(&mut self, category: Category, resolver: impl KeyResolver + 'static) {
        if let Some(policy) = self.policies.remove(&category) {
            self.policies
                .insert(category, policy.with_key_resolver(resolver));
        }
    }

    /// Record `request` against `category`.
    pub fn check(&self, category: Category, request: &RequestContext) -> Decision {
        self.get(category).check(request)
    }

    /// Report system load to every adaptive policy.
    pub fn update_system_load(&self, load: f64) {
        self.load.set(load);
    }

    /// The latest reported system load.
    pub fn system_load(&self) -> f64 {
        self.load.get()
    }

    /// Tear down every policy. Idempotent.
    pub fn destroy(&self) {
        for policy in self.policies.values() {
            policy.destroy();
        }
        info!("Policy registry destroyed");
    }
}

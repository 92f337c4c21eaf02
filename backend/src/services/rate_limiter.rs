//! Rate Limiter Service
//!
//! Ultra-conservative multi-window rate limiting. Every action is checked
//! against four fixed calendar windows at once: the action's hourly and daily
//! caps and the cross-action global hourly and daily caps. Caps sit at roughly
//! 15% of the platform's real limits and are scaled by an adaptive multiplier
//! that tightens quickly when the fleet sees failures and relaxes rarely.
//!
//! Counters live in the `SafetyStore`, keyed by (user, action, window), and
//! expire at the end of their window so a count never leaks into the next one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::activity_log::{ActivityLog, failure_rate};
use super::clock::Clock;
use super::store::{SafetyStore, StoreKey};
use crate::error::SafetyError;
use crate::models::{ActionType, ActivityEntry, validate_user_id};

/// Hourly and daily cap for one action type (or for all actions combined)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLimit {
    pub hourly: u32,
    pub daily: u32,
}

impl ActionLimit {
    pub const fn new(hourly: u32, daily: u32) -> Self {
        Self { hourly, daily }
    }

    fn scaled(&self, multiplier: f64) -> Self {
        Self {
            hourly: scale_cap(self.hourly, multiplier),
            daily: scale_cap(self.daily, multiplier),
        }
    }
}

/// Default caps across all action types
pub const GLOBAL_LIMIT: ActionLimit = ActionLimit::new(20, 100);

/// Default per-action caps, about 15% of the platform's own limits
pub fn default_action_limits() -> HashMap<ActionType, ActionLimit> {
    let mut limits = HashMap::new();

    // Connection requests are the most scrutinised action
    limits.insert(ActionType::Invitation, ActionLimit::new(4, 15));
    limits.insert(ActionType::Follow, ActionLimit::new(4, 15));

    limits.insert(ActionType::Message, ActionLimit::new(6, 25));

    // Passive actions
    limits.insert(ActionType::ProfileView, ActionLimit::new(8, 30));
    limits.insert(ActionType::Like, ActionLimit::new(8, 30));

    limits.insert(ActionType::Comment, ActionLimit::new(3, 8));

    limits
}

/// Rate limiting policy
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub action_limits: HashMap<ActionType, ActionLimit>,
    /// Caps across all action types
    pub global: ActionLimit,
    /// Lower bound of the adaptive multiplier
    pub min_multiplier: f64,
    /// Upper bound of the adaptive multiplier (the configured ceiling)
    pub max_multiplier: f64,
    /// Multiplier is scaled by this when the failure rate is too high
    pub tighten_factor: f64,
    /// Amount added to the multiplier on a successful relax roll
    pub relax_step: f64,
    /// Chance of relaxing when no failures were observed
    pub relax_probability: f64,
    /// Failure rate above which caps tighten
    pub failure_rate_threshold: f64,
    /// Number of most recent fleet outcomes considered
    pub sample_size: usize,
    /// Fewer samples than this leaves the multiplier alone
    pub min_samples: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            action_limits: default_action_limits(),
            global: GLOBAL_LIMIT,
            min_multiplier: 0.25,
            max_multiplier: 1.0,
            tighten_factor: 0.8,
            relax_step: 0.05,
            relax_probability: 0.1,
            failure_rate_threshold: 0.05,
            sample_size: 100,
            min_samples: 20,
        }
    }
}

/// Which cap a window enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowScope {
    ActionHourly,
    ActionDaily,
    GlobalHourly,
    GlobalDaily,
}

/// Count and cap for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowUsage {
    pub scope: WindowScope,
    /// `None` for global windows
    pub action: Option<ActionType>,
    pub window: String,
    pub count: u64,
    pub limit: u32,
    pub remaining: u32,
    pub resets_at: DateTime<Utc>,
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Minimum headroom across every applicable window
    pub remaining: u32,
    /// Cap of the most restrictive window
    pub limit: u32,
    /// Seconds until the nearest exhausted window resets; `None` when allowed
    pub retry_after: Option<u64>,
    pub reset_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub windows: Vec<WindowUsage>,
}

/// Every window for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUsage {
    pub user_id: String,
    pub multiplier: f64,
    pub windows: Vec<WindowUsage>,
}

/// Caps currently enforced after applying the adaptive multiplier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveLimits {
    pub multiplier: f64,
    pub actions: BTreeMap<ActionType, ActionLimit>,
    pub global: ActionLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentDirection {
    Tightened,
    Relaxed,
    Unchanged,
}

/// Outcome of one recalibration pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitAdjustment {
    pub previous_multiplier: f64,
    pub multiplier: f64,
    pub failure_rate: Option<f64>,
    pub samples: usize,
    pub direction: AdjustmentDirection,
}

/// Adaptive state: the multiplier and the random source that gates relaxing
#[derive(Debug)]
struct Tuning {
    multiplier: f64,
    rng: StdRng,
}

/// Fixed calendar window a counter belongs to
#[derive(Debug, Clone)]
struct Window {
    scope: WindowScope,
    action: Option<ActionType>,
    id: String,
    ends_at: DateTime<Utc>,
}

impl Window {
    fn key(&self, user_id: &str) -> StoreKey {
        StoreKey::counter(user_id, self.action.map(|a| a.as_str()), &self.id)
    }
}

/// Rate Limiter Service
pub struct RateLimiterService {
    config: RateLimitConfig,
    store: Arc<dyn SafetyStore>,
    clock: Arc<dyn Clock>,
    activity: ActivityLog,
    tuning: Mutex<Tuning>,
}

impl RateLimiterService {
    pub fn new(store: Arc<dyn SafetyStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self::with_rng(store, clock, config, StdRng::from_entropy())
    }

    /// Create a limiter whose relax decisions are reproducible (for testing)
    pub fn with_seed(
        store: Arc<dyn SafetyStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(store, clock, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        store: Arc<dyn SafetyStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
        rng: StdRng,
    ) -> Self {
        let multiplier = config.max_multiplier;
        Self {
            activity: ActivityLog::new(store.clone(), clock.clone()),
            config,
            store,
            clock,
            tuning: Mutex::new(Tuning { multiplier, rng }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Current adaptive multiplier
    pub async fn multiplier(&self) -> f64 {
        self.tuning.lock().await.multiplier
    }

    /// Check whether one more action fits in every applicable window.
    ///
    /// Never raises: an invalid user id yields a structured refusal and an
    /// unreachable store fails open.
    pub async fn check_rate_limit(&self, user_id: &str, action: ActionType) -> RateLimitResult {
        let now = self.clock.now();

        if let Err(msg) = validate_user_id(user_id) {
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                limit: 0,
                retry_after: None,
                reset_at: now,
                reason: Some(msg),
                windows: Vec::new(),
            };
        }

        let multiplier = self.multiplier().await;
        let windows = action_windows(action, now);
        let keys: Vec<StoreKey> = windows.iter().map(|w| w.key(user_id)).collect();

        let counts = match self.store.get_counts(&keys).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    action = %action,
                    error = %e,
                    "Rate limit state unavailable, failing open"
                );
                let limit = self.cap_for(&windows[0], multiplier);
                return RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    limit,
                    retry_after: None,
                    reset_at: windows[0].ends_at,
                    reason: Some("rate limit state unavailable".to_string()),
                    windows: Vec::new(),
                };
            }
        };

        let usage: Vec<WindowUsage> = windows
            .iter()
            .zip(counts)
            .map(|(window, count)| self.window_usage(window, count, multiplier))
            .collect();

        let result = evaluate(usage, now);
        if !result.allowed {
            debug!(
                user_id = %user_id,
                action = %action,
                retry_after = ?result.retry_after,
                "Rate limit reached"
            );
        }
        result
    }

    /// Count one performed action in every applicable window and append it to
    /// the user's activity log.
    pub async fn record_request(
        &self,
        user_id: &str,
        action: ActionType,
        success: bool,
    ) -> Result<(), SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let now = self.clock.now();
        let counters: Vec<(StoreKey, DateTime<Utc>)> = action_windows(action, now)
            .iter()
            .map(|w| (w.key(user_id), w.ends_at))
            .collect();

        let counts = self.store.increment_all(&counters).await?;
        debug!(user_id = %user_id, action = %action, ?counts, "Recorded request");

        self.activity
            .append(
                user_id,
                &ActivityEntry {
                    action,
                    success,
                    at: now,
                },
            )
            .await?;

        Ok(())
    }

    /// Recalibrate the adaptive multiplier from recent fleet outcomes.
    ///
    /// Tightening is immediate whenever the failure rate is above the
    /// threshold. Relaxing needs a clean record and a low-probability roll.
    pub async fn adjust_limits_based_on_errors(&self) -> Result<LimitAdjustment, SafetyError> {
        let outcomes = self.activity.recent_outcomes(self.config.sample_size).await?;
        let samples = outcomes.len();
        let rate = failure_rate(outcomes.iter().map(|o| o.success));

        let mut tuning = self.tuning.lock().await;
        let previous = tuning.multiplier;
        let mut direction = AdjustmentDirection::Unchanged;

        if samples >= self.config.min_samples {
            match rate {
                Some(rate) if rate > self.config.failure_rate_threshold => {
                    tuning.multiplier =
                        (previous * self.config.tighten_factor).max(self.config.min_multiplier);
                    direction = AdjustmentDirection::Tightened;
                }
                Some(rate)
                    if rate == 0.0
                        && previous < self.config.max_multiplier
                        && tuning.rng.gen_bool(self.config.relax_probability) =>
                {
                    tuning.multiplier =
                        (previous + self.config.relax_step).min(self.config.max_multiplier);
                    direction = AdjustmentDirection::Relaxed;
                }
                _ => {}
            }
        }

        if tuning.multiplier == previous {
            direction = AdjustmentDirection::Unchanged;
        }

        match direction {
            AdjustmentDirection::Tightened => warn!(
                failure_rate = ?rate,
                samples,
                previous,
                multiplier = tuning.multiplier,
                "Tightened rate limits"
            ),
            AdjustmentDirection::Relaxed => info!(
                samples,
                previous,
                multiplier = tuning.multiplier,
                "Relaxed rate limits"
            ),
            AdjustmentDirection::Unchanged => {
                debug!(failure_rate = ?rate, samples, multiplier = previous, "Rate limits unchanged")
            }
        }

        Ok(LimitAdjustment {
            previous_multiplier: previous,
            multiplier: tuning.multiplier,
            failure_rate: rate,
            samples,
            direction,
        })
    }

    /// Every window for a user across all action types
    pub async fn usage(&self, user_id: &str) -> Result<UserUsage, SafetyError> {
        validate_user_id(user_id).map_err(SafetyError::Validation)?;

        let now = self.clock.now();
        let multiplier = self.multiplier().await;

        let mut windows = Vec::new();
        for action in ActionType::ALL {
            windows.extend(action_windows(action, now).into_iter().take(2));
        }
        windows.extend(global_windows(now));

        let keys: Vec<StoreKey> = windows.iter().map(|w| w.key(user_id)).collect();
        let counts = self.store.get_counts(&keys).await?;

        Ok(UserUsage {
            user_id: user_id.to_string(),
            multiplier,
            windows: windows
                .iter()
                .zip(counts)
                .map(|(window, count)| self.window_usage(window, count, multiplier))
                .collect(),
        })
    }

    /// Usage ratio (count / cap) of the fullest window, 0.0 when unused
    pub async fn max_usage_ratio(&self, user_id: &str) -> Result<f64, SafetyError> {
        let usage = self.usage(user_id).await?;
        Ok(usage
            .windows
            .iter()
            .map(|w| w.count as f64 / f64::from(w.limit.max(1)))
            .fold(0.0, f64::max))
    }

    pub async fn effective_limits(&self) -> EffectiveLimits {
        let multiplier = self.multiplier().await;
        EffectiveLimits {
            multiplier,
            actions: self
                .config
                .action_limits
                .iter()
                .map(|(action, limit)| (*action, limit.scaled(multiplier)))
                .collect(),
            global: self.config.global.scaled(multiplier),
        }
    }

    fn base_limit(&self, action: Option<ActionType>) -> ActionLimit {
        match action {
            Some(action) => self
                .config
                .action_limits
                .get(&action)
                .copied()
                .unwrap_or(ActionLimit::new(1, 1)),
            None => self.config.global,
        }
    }

    fn cap_for(&self, window: &Window, multiplier: f64) -> u32 {
        let base = self.base_limit(window.action);
        let cap = match window.scope {
            WindowScope::ActionHourly | WindowScope::GlobalHourly => base.hourly,
            WindowScope::ActionDaily | WindowScope::GlobalDaily => base.daily,
        };
        scale_cap(cap, multiplier)
    }

    fn window_usage(&self, window: &Window, count: u64, multiplier: f64) -> WindowUsage {
        let limit = self.cap_for(window, multiplier);
        let used = u32::try_from(count).unwrap_or(u32::MAX);
        WindowUsage {
            scope: window.scope,
            action: window.action,
            window: window.id.clone(),
            count,
            limit,
            remaining: limit.saturating_sub(used),
            resets_at: window.ends_at,
        }
    }
}

/// Combine per-window usage into the most restrictive outcome
fn evaluate(windows: Vec<WindowUsage>, now: DateTime<Utc>) -> RateLimitResult {
    let allowed = windows.iter().all(|w| w.remaining > 0);

    let tightest = windows.iter().min_by_key(|w| w.remaining);
    let remaining = tightest.map_or(0, |w| w.remaining);
    let limit = tightest.map_or(0, |w| w.limit);

    let nearest_reset = windows
        .iter()
        .filter(|w| w.remaining == 0)
        .map(|w| w.resets_at)
        .min();

    let (retry_after, reset_at, reason) = match nearest_reset {
        Some(reset_at) if !allowed => {
            let secs = (reset_at - now).num_seconds().max(1) as u64;
            let exhausted: Vec<&str> = windows
                .iter()
                .filter(|w| w.remaining == 0)
                .map(|w| scope_label(w.scope))
                .collect();
            (
                Some(secs),
                reset_at,
                Some(format!("{} limit reached", exhausted.join(", "))),
            )
        }
        _ => (None, tightest.map_or(now, |w| w.resets_at), None),
    };

    RateLimitResult {
        allowed,
        remaining,
        limit,
        retry_after,
        reset_at,
        reason,
        windows,
    }
}

fn scope_label(scope: WindowScope) -> &'static str {
    match scope {
        WindowScope::ActionHourly => "hourly action",
        WindowScope::ActionDaily => "daily action",
        WindowScope::GlobalHourly => "hourly global",
        WindowScope::GlobalDaily => "daily global",
    }
}

/// Effective cap, never below 1
fn scale_cap(base: u32, multiplier: f64) -> u32 {
    ((f64::from(base) * multiplier).floor() as u32).max(1)
}

fn truncate(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    let ts = now.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or(now)
}

fn hour_window(now: DateTime<Utc>) -> (String, DateTime<Utc>) {
    let start = truncate(now, 3600);
    (start.format("h%Y%m%d%H").to_string(), start + Duration::hours(1))
}

fn day_window(now: DateTime<Utc>) -> (String, DateTime<Utc>) {
    let start = truncate(now, 86_400);
    (start.format("d%Y%m%d").to_string(), start + Duration::days(1))
}

fn global_windows(now: DateTime<Utc>) -> [Window; 2] {
    let (hour_id, hour_end) = hour_window(now);
    let (day_id, day_end) = day_window(now);
    [
        Window {
            scope: WindowScope::GlobalHourly,
            action: None,
            id: hour_id,
            ends_at: hour_end,
        },
        Window {
            scope: WindowScope::GlobalDaily,
            action: None,
            id: day_id,
            ends_at: day_end,
        },
    ]
}

/// The four windows an action is checked against, action windows first
fn action_windows(action: ActionType, now: DateTime<Utc>) -> Vec<Window> {
    let (hour_id, hour_end) = hour_window(now);
    let (day_id, day_end) = day_window(now);

    let mut windows = vec![
        Window {
            scope: WindowScope::ActionHourly,
            action: Some(action),
            id: hour_id,
            ends_at: hour_end,
        },
        Window {
            scope: WindowScope::ActionDaily,
            action: Some(action),
            id: day_id,
            ends_at: day_end,
        },
    ];
    windows.extend(global_windows(now));
    windows
}

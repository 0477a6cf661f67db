//! Throttle Core (C3, design §4.3) — the only admission decision point
//! between the dispatcher and the transport.
//!
//! Shared mutable counters are the hottest state in the system (design
//! §5, §9): each key gets its own `parking_lot::Mutex` rather than one
//! lock guarding every key, so concurrent campaigns touching different
//! domains never contend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::{ThrottleCounters, ThrottleKey, ThrottleLimits, ThrottleScope};
use crate::services::isp::isp_for_domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Ok,
    DeniedGlobal,
    DeniedIsp,
    DeniedDomain,
    Backpressure,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::DeniedGlobal => "denied_global",
            Self::DeniedIsp => "denied_isp",
            Self::DeniedDomain => "denied_domain",
            Self::Backpressure => "backpressure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DenyReason,
}

impl Decision {
    fn ok() -> Self {
        Self {
            allowed: true,
            reason: DenyReason::Ok,
        }
    }

    fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

struct KeyState {
    limits: ThrottleLimits,
    hour_window_start: DateTime<Utc>,
    hour_count: u32,
    day_window_start: DateTime<Utc>,
    day_count: u32,
    burst_tokens: f64,
    last_refill: DateTime<Utc>,
    backpressure_until: Option<DateTime<Utc>>,
}

impl KeyState {
    fn new(limits: ThrottleLimits, now: DateTime<Utc>) -> Self {
        Self {
            burst_tokens: limits.burst as f64,
            limits,
            hour_window_start: now,
            hour_count: 0,
            day_window_start: now,
            day_count: 0,
            last_refill: now,
            backpressure_until: None,
        }
    }

    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now - self.hour_window_start >= ChronoDuration::hours(1) {
            self.hour_window_start = now;
            self.hour_count = 0;
        }
        if now - self.day_window_start >= ChronoDuration::days(1) {
            self.day_window_start = now;
            self.day_count = 0;
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        let refill = elapsed * self.limits.refill_rate_per_sec();
        self.burst_tokens = (self.burst_tokens + refill).min(self.limits.burst as f64);
        self.last_refill = now;
    }

    fn check(&mut self, now: DateTime<Utc>) -> bool {
        self.roll_windows(now);
        self.refill(now);
        if let Some(until) = self.backpressure_until {
            if now < until {
                return false;
            }
        }
        self.hour_count < self.limits.hourly
            && self.day_count < self.limits.daily
            && self.burst_tokens >= 1.0
    }

    fn in_backpressure(&self, now: DateTime<Utc>) -> bool {
        self.backpressure_until.map(|until| now < until).unwrap_or(false)
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.roll_windows(now);
        self.refill(now);
        self.hour_count += 1;
        self.day_count += 1;
        self.burst_tokens = (self.burst_tokens - 1.0).max(0.0);
    }

    fn snapshot(&self) -> ThrottleCounters {
        ThrottleCounters {
            sent_last_hour: self.hour_count,
            sent_last_day: self.day_count,
            hourly_limit: self.limits.hourly,
            daily_limit: self.limits.daily,
            burst_limit: self.limits.burst,
            backpressure_until: self.backpressure_until,
        }
    }
}

/// Thresholds `AutoAdjust` steps limits by; configuration, not hardcoded
/// (design §4.3).
#[derive(Debug, Clone, Copy)]
pub struct AutoAdjustConfig {
    pub healthy_bounce_ratio: f64,
    pub unhealthy_bounce_ratio: f64,
    pub raise_step: f64,
    pub lower_step: f64,
}

impl Default for AutoAdjustConfig {
    fn default() -> Self {
        Self {
            healthy_bounce_ratio: 0.01,
            unhealthy_bounce_ratio: 0.05,
            raise_step: 1.1,
            lower_step: 0.7,
        }
    }
}

/// Health inputs `AutoAdjust` uses to decide whether to raise or lower a
/// key's limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryHealth {
    pub delivered: u64,
    pub bounced: u64,
    pub complaints: u64,
}

impl DeliveryHealth {
    fn bounce_ratio(self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.bounced as f64 / self.delivered as f64
        }
    }

    fn complaint_ratio(self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.complaints as f64 / self.delivered as f64
        }
    }
}

pub struct ThrottleCore {
    keys: RwLock<HashMap<ThrottleKey, Arc<Mutex<KeyState>>>>,
    default_limits: ThrottleLimits,
    isp_overrides: RwLock<HashMap<String, ThrottleLimits>>,
    domain_overrides: RwLock<HashMap<String, ThrottleLimits>>,
}

impl ThrottleCore {
    pub fn new(default_limits: ThrottleLimits) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            default_limits,
            isp_overrides: RwLock::new(HashMap::new()),
            domain_overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_isp_limit(&self, isp: impl Into<String>, limits: ThrottleLimits) {
        self.isp_overrides.write().insert(isp.into(), limits);
    }

    pub fn set_domain_limit(&self, domain: impl Into<String>, limits: ThrottleLimits) {
        self.domain_overrides.write().insert(domain.into(), limits);
    }

    pub fn default_limits(&self) -> ThrottleLimits {
        self.default_limits
    }

    pub fn isp_overrides(&self) -> HashMap<String, ThrottleLimits> {
        self.isp_overrides.read().clone()
    }

    pub fn domain_overrides(&self) -> HashMap<String, ThrottleLimits> {
        self.domain_overrides.read().clone()
    }

    fn limits_for(&self, key: &ThrottleKey) -> ThrottleLimits {
        match &key.scope {
            ThrottleScope::Global => self.default_limits,
            ThrottleScope::Isp(isp) => self
                .isp_overrides
                .read()
                .get(isp)
                .copied()
                .unwrap_or(self.default_limits),
            ThrottleScope::Domain(domain) => self
                .domain_overrides
                .read()
                .get(domain)
                .copied()
                .unwrap_or(self.default_limits),
        }
    }

    fn entry(&self, key: &ThrottleKey) -> Arc<Mutex<KeyState>> {
        if let Some(existing) = self.keys.read().get(key) {
            return existing.clone();
        }
        let mut keys = self.keys.write();
        keys.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(KeyState::new(self.limits_for(key), Utc::now()))))
            .clone()
    }

    fn domain_and_isp(email: &str) -> (String, &'static str) {
        let domain = email.rsplit('@').next().unwrap_or("").to_lowercase();
        let isp = isp_for_domain(&domain);
        (domain, isp)
    }

    /// Consults global, ISP, domain keys in that order; the first deny
    /// wins (design §4.3).
    pub fn can_send(&self, org: Uuid, email: &str) -> Decision {
        let (domain, isp) = Self::domain_and_isp(email);
        let now = Utc::now();

        let global_key = ThrottleKey::global(org);
        let global_state = self.entry(&global_key);
        if !global_state.lock().check(now) {
            return Decision::deny(DenyReason::DeniedGlobal);
        }

        let isp_key = ThrottleKey::isp(org, isp);
        let isp_state = self.entry(&isp_key);
        if !isp_state.lock().check(now) {
            return Decision::deny(DenyReason::DeniedIsp);
        }

        let domain_key = ThrottleKey::domain(org, domain.clone());
        let domain_state = self.entry(&domain_key);
        {
            let locked = domain_state.lock();
            if locked.in_backpressure(now) {
                return Decision::deny(DenyReason::Backpressure);
            }
        }
        if !domain_state.lock().check(now) {
            return Decision::deny(DenyReason::DeniedDomain);
        }

        Decision::ok()
    }

    /// Vectorised form. Each lookup takes only its own key's lock, so
    /// concurrent domains don't contend (design §4.3).
    pub fn can_send_batch(&self, org: Uuid, emails: &[String]) -> Vec<Decision> {
        emails.iter().map(|email| self.can_send(org, email)).collect()
    }

    /// Debits all three keys (design §4.3). Not atomic with a prior
    /// `can_send` call across keys — intentional given the burst-bucket
    /// allowance (design §5).
    pub fn record_send(&self, org: Uuid, email: &str) {
        let (domain, isp) = Self::domain_and_isp(email);
        let now = Utc::now();
        self.entry(&ThrottleKey::global(org)).lock().record(now);
        self.entry(&ThrottleKey::isp(org, isp)).lock().record(now);
        self.entry(&ThrottleKey::domain(org, domain)).lock().record(now);
    }

    pub fn apply_backpressure(&self, org: Uuid, domain: &str, seconds: i64) {
        let key = ThrottleKey::domain(org, domain.to_lowercase());
        let state = self.entry(&key);
        let mut locked = state.lock();
        locked.backpressure_until = Some(Utc::now() + ChronoDuration::seconds(seconds));
    }

    pub fn snapshot(&self, org: Uuid, scope: ThrottleScope) -> ThrottleCounters {
        let key = ThrottleKey { org, scope };
        self.entry(&key).lock().snapshot()
    }

    /// Raises limits for keys with healthy delivery/bounce/complaint
    /// ratios and lowers them for unhealthy ones (design §4.3).
    pub fn auto_adjust(&self, key: &ThrottleKey, health: DeliveryHealth, config: AutoAdjustConfig) {
        let state = self.entry(key);
        let mut locked = state.lock();
        let bounce_ratio = health.bounce_ratio();
        let complaint_ratio = health.complaint_ratio();

        let step = if bounce_ratio <= config.healthy_bounce_ratio && complaint_ratio <= config.healthy_bounce_ratio {
            config.raise_step
        } else if bounce_ratio >= config.unhealthy_bounce_ratio || complaint_ratio >= config.unhealthy_bounce_ratio {
            config.lower_step
        } else {
            1.0
        };

        if (step - 1.0).abs() < f64::EPSILON {
            return;
        }

        locked.limits.hourly = ((locked.limits.hourly as f64 * step).round() as u32).max(1);
        locked.limits.daily = ((locked.limits.daily as f64 * step).round() as u32).max(1);
        locked.limits.burst = ((locked.limits.burst as f64 * step).round() as u32).max(1);

        match &key.scope {
            ThrottleScope::Isp(isp) => {
                self.isp_overrides.write().insert(isp.clone(), locked.limits);
            }
            ThrottleScope::Domain(domain) => {
                self.domain_overrides.write().insert(domain.clone(), locked.limits);
            }
            ThrottleScope::Global => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(hourly: u32, daily: u32, burst: u32) -> ThrottleLimits {
        ThrottleLimits { hourly, daily, burst }
    }

    #[test]
    fn burst_of_one_admits_exactly_one_per_window() {
        let core = ThrottleCore::new(limits(1, 1000, 1));
        let org = Uuid::new_v4();
        assert!(core.can_send(org, "a@x.com").allowed);
        core.record_send(org, "a@x.com");
        assert!(!core.can_send(org, "a@x.com").allowed);
    }

    #[test]
    fn backpressure_denies_only_the_domain() {
        let core = ThrottleCore::new(limits(1000, 10000, 1000));
        let org = Uuid::new_v4();
        core.apply_backpressure(org, "x.com", 60);
        let decision = core.can_send(org, "a@x.com");
        assert_eq!(decision.reason, DenyReason::Backpressure);
        assert!(core.can_send(org, "b@y.com").allowed);
    }

    #[test]
    fn first_deny_wins_in_global_isp_domain_order() {
        let core = ThrottleCore::new(limits(1000, 10000, 1000));
        let org = Uuid::new_v4();
        core.set_isp_limit("gmail", limits(0, 10000, 1000));
        let decision = core.can_send(org, "a@gmail.com");
        assert_eq!(decision.reason, DenyReason::DeniedIsp);
    }

    #[test]
    fn record_send_is_happens_before_for_later_can_send() {
        let core = ThrottleCore::new(limits(2, 1000, 2));
        let org = Uuid::new_v4();
        core.record_send(org, "a@x.com");
        core.record_send(org, "b@x.com");
        assert!(!core.can_send(org, "c@x.com").allowed);
    }

    #[test]
    fn auto_adjust_lowers_limits_for_unhealthy_domain() {
        let core = ThrottleCore::new(limits(1000, 10000, 1000));
        let org = Uuid::new_v4();
        let key = ThrottleKey::domain(org, "bad.com".to_string());
        core.auto_adjust(
            &key,
            DeliveryHealth {
                delivered: 100,
                bounced: 20,
                complaints: 0,
            },
            AutoAdjustConfig::default(),
        );
        let snapshot = core.snapshot(org, key.scope.clone());
        assert!(snapshot.hourly_limit < 1000);
    }
}

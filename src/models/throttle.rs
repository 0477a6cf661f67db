//! Throttle keys and counters (design §3, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three scopes a throttle key can be anchored to, checked in this
/// order by `CanSend` (design §4.3): global first, then ISP, then domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThrottleScope {
    Global,
    Isp(String),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThrottleKey {
    pub org: Uuid,
    pub scope: ThrottleScope,
}

impl ThrottleKey {
    pub fn global(org: Uuid) -> Self {
        Self {
            org,
            scope: ThrottleScope::Global,
        }
    }

    pub fn isp(org: Uuid, isp: impl Into<String>) -> Self {
        Self {
            org,
            scope: ThrottleScope::Isp(isp.into()),
        }
    }

    pub fn domain(org: Uuid, domain: impl Into<String>) -> Self {
        Self {
            org,
            scope: ThrottleScope::Domain(domain.into()),
        }
    }
}

/// Limits carried by a throttle key. Hourly/daily are sliding windows;
/// burst is a token bucket refilled at `hourly / 3600` tokens/sec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThrottleLimits {
    pub hourly: u32,
    pub daily: u32,
    pub burst: u32,
}

impl ThrottleLimits {
    pub fn refill_rate_per_sec(&self) -> f64 {
        self.hourly as f64 / 3600.0
    }
}

/// Externally observable snapshot of one key's counters (design §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleCounters {
    pub sent_last_hour: u32,
    pub sent_last_day: u32,
    pub hourly_limit: u32,
    pub daily_limit: u32,
    pub burst_limit: u32,
    pub backpressure_until: Option<DateTime<Utc>>,
}

//! Scheduler/Ticker (C10, design §4.10).
//!
//! A single named worker wakes at one-minute intervals and drives every
//! time-based action in the system: A/B auto-selection once
//! `winner_wait_hours` elapses, warm-up day rollover, retry buffer
//! drains, and throttle auto-adjust cycles (design §9 "background
//! goroutines launched from handlers -> named worker pools").

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::gateway::PersistenceGateway;
use crate::models::ab_test::AbTestStatus;
use crate::services::ab_controller::AbController;
use crate::services::dispatcher::Dispatcher;
use crate::services::throttle::{AutoAdjustConfig, DeliveryHealth, ThrottleCore};
use crate::models::ThrottleKey;

pub const TICK_INTERVAL_SECS: u64 = 60;

/// A day-by-day IP/domain warm-up plan (design §4.10 "warm-up day
/// rollover"). Not persisted through the gateway; campaigns that need
/// one hold it alongside their throttle overrides in the caller's own
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct WarmUpPlan {
    pub key: ThrottleKey,
    pub started_on: DateTime<Utc>,
    pub current_day: u32,
    pub daily_volumes: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmUpStatus {
    OnTrack,
    Behind,
    Ahead,
}

impl WarmUpPlan {
    pub fn new(key: ThrottleKey, daily_volumes: Vec<u32>) -> Self {
        Self {
            key,
            started_on: Utc::now(),
            current_day: 0,
            daily_volumes,
        }
    }

    fn day_for(&self, now: DateTime<Utc>) -> u32 {
        (now - self.started_on).num_days().max(0) as u32
    }

    /// Advances `current_day` if a new calendar day has elapsed,
    /// returning the new day's planned volume.
    pub fn roll(&mut self, now: DateTime<Utc>) -> Option<u32> {
        let day = self.day_for(now);
        if day <= self.current_day && self.current_day != 0 {
            return None;
        }
        self.current_day = day;
        self.daily_volumes.get(day as usize).copied()
    }

    /// Compares actual sends so far today against the planned volume
    /// (design §4.10).
    pub fn status(&self, actual_sent_today: u32) -> WarmUpStatus {
        let planned = self.daily_volumes.get(self.current_day as usize).copied().unwrap_or(0);
        if planned == 0 {
            return WarmUpStatus::OnTrack;
        }
        let ratio = actual_sent_today as f64 / planned as f64;
        if ratio < 0.9 {
            WarmUpStatus::Behind
        } else if ratio > 1.1 {
            WarmUpStatus::Ahead
        } else {
            WarmUpStatus::OnTrack
        }
    }
}

pub struct Scheduler {
    gateway: Arc<dyn PersistenceGateway>,
    ab_controller: Arc<AbController>,
    dispatcher: Arc<Dispatcher>,
    throttle: Arc<ThrottleCore>,
}

impl Scheduler {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        ab_controller: Arc<AbController>,
        dispatcher: Arc<Dispatcher>,
        throttle: Arc<ThrottleCore>,
    ) -> Self {
        Self {
            gateway,
            ab_controller,
            dispatcher,
            throttle,
        }
    }

    /// Runs forever at [`TICK_INTERVAL_SECS`], logging and continuing
    /// past any single org's tick failure rather than taking the whole
    /// scheduler down (design §5 "named worker pools").
    pub async fn run(self: Arc<Self>, orgs: impl Fn() -> Vec<Uuid> + Send + Sync + 'static) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SECS));
        loop {
            interval.tick().await;
            for org in orgs() {
                if let Err(err) = self.tick(org).await {
                    error!(%err, %org, "scheduler tick failed");
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self, org: Uuid) -> Result<(), crate::error::AppError> {
        self.auto_select_expired_winners(org).await?;
        self.dispatcher.drain_retries().await?;
        info!(%org, "scheduler tick completed");
        Ok(())
    }

    /// A/B `waiting -> winner_selected` once `winner_wait_hours` has
    /// elapsed since `started_at` (design §4.10).
    async fn auto_select_expired_winners(&self, org: Uuid) -> Result<(), crate::error::AppError> {
        let tests = self.gateway.list_ab_tests(org).await?;
        let now = Utc::now();
        for test in tests {
            if test.status != AbTestStatus::Waiting {
                continue;
            }
            let Some(started_at) = test.started_at else { continue };
            if now - started_at >= ChronoDuration::hours(test.winner_wait_hours) {
                self.ab_controller.select_winner_auto(test).await?;
            }
        }
        Ok(())
    }

    /// Applies one auto-adjust pass to the given key from fresh delivery
    /// health data (design §4.3, §4.10). Health collection itself is
    /// fed from the webhook/bounce-processing path, external to this
    /// tick.
    pub fn apply_auto_adjust(&self, key: &ThrottleKey, health: DeliveryHealth, config: AutoAdjustConfig) {
        self.throttle.auto_adjust(key, health, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warm_up_plan_advances_one_day_at_a_time() {
        let key = ThrottleKey::domain(Uuid::new_v4(), "warm.example.com".to_string());
        let mut plan = WarmUpPlan::new(key, vec![100, 200, 400, 800]);
        assert_eq!(plan.current_day, 0);
        let same_day = plan.roll(plan.started_on + ChronoDuration::hours(2));
        assert!(same_day.is_none());
        let next_day = plan.roll(plan.started_on + ChronoDuration::hours(26));
        assert_eq!(next_day, Some(200));
        assert_eq!(plan.current_day, 1);
    }

    #[test]
    fn warm_up_status_flags_behind_and_ahead() {
        let key = ThrottleKey::domain(Uuid::new_v4(), "warm.example.com".to_string());
        let plan = WarmUpPlan::new(key, vec![1000]);
        assert_eq!(plan.status(500), WarmUpStatus::Behind);
        assert_eq!(plan.status(1000), WarmUpStatus::OnTrack);
        assert_eq!(plan.status(1500), WarmUpStatus::Ahead);
    }

    #[tokio::test]
    async fn tick_promotes_expired_waiting_test_to_winner_selected() {
        use crate::gateway::memory::InMemoryGateway;
        use crate::models::ab_test::{AbTestType, WinnerMetric};
        use crate::services::dispatcher::Dispatcher;
        use crate::services::events::EventBus;
        use crate::services::resolver::RecipientResolver;
        use crate::services::signing::UrlSigner;
        use crate::services::suppression::SuppressionIndex;
        use crate::delivery::TransportRegistry;
        use crate::models::ThrottleLimits;

        let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
        let org = Uuid::new_v4();
        let test = crate::models::AbTest {
            id: Uuid::new_v4(),
            org,
            campaign: None,
            test_type: AbTestType::Subject,
            sample_percent: 100,
            winner_metric: WinnerMetric::OpenRate,
            winner_wait_hours: 1,
            confidence_threshold: 0.95,
            min_sample: 1,
            status: AbTestStatus::Waiting,
            variants: vec![],
            winner_variant: None,
            audience_size: 0,
            test_sample_size: 0,
            started_at: Some(Utc::now() - ChronoDuration::hours(2)),
            created_at: Utc::now(),
        };
        gateway.upsert_ab_test(test.clone()).await.unwrap();

        let ab_controller = Arc::new(AbController::new(gateway.clone()));
        let throttle = Arc::new(ThrottleCore::new(ThrottleLimits {
            hourly: 1000,
            daily: 10000,
            burst: 1000,
        }));
        let resolver = Arc::new(RecipientResolver::new(gateway.clone()));
        let signer = Arc::new(UrlSigner::new(b"secret", None::<&[u8]>));
        let events = Arc::new(EventBus::new());
        let dispatcher = Arc::new(Dispatcher::new(
            gateway.clone(),
            Arc::new(SuppressionIndex::new(gateway.clone())),
            throttle.clone(),
            resolver,
            Arc::new(TransportRegistry::new()),
            events,
            signer,
            "https://track.example.com".into(),
        ));
        let scheduler = Scheduler::new(gateway.clone(), ab_controller, dispatcher, throttle);

        scheduler.tick(org).await.unwrap();
        let updated = gateway.get_ab_test(org, test.id).await.unwrap();
        assert_eq!(updated.status, AbTestStatus::WinnerSelected);
    }
}

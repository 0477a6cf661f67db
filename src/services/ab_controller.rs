//! A/B Controller (C8, design §4.8).
//!
//! Sample selection, significance evaluation, and winner promotion.
//! Shuffling uses a seed derived from the test id so a restarted
//! controller reproduces the same sample and partition (design §4.8,
//! §8 determinism law).

use std::sync::Arc;

use chrono::Utc;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::PersistenceGateway;
use crate::models::ab_test::{AbTest, AbTestStatus, Assignment, AssignmentStatus, Cohort, Variant};
use crate::models::{Recipient, RecipientStatus};

pub struct AbController {
    gateway: Arc<dyn PersistenceGateway>,
}

/// Per-variant significance result against the control (design §4.8).
#[derive(Debug, Clone, Copy)]
pub struct SignificanceResult {
    pub confidence: f64,
    pub significant: bool,
    pub lift_vs_control: f64,
}

impl AbController {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    fn seed_from_test(test: Uuid) -> u64 {
        let bytes = test.as_bytes();
        u64::from_le_bytes(bytes[0..8].try_into().unwrap())
    }

    /// `ceil(audience * sample_percent / 100)`, floored at `min_sample`
    /// and at one recipient per variant (design §4.8).
    fn sample_size(audience: u32, sample_percent: u8, min_sample: u32, variant_count: u32) -> u32 {
        let raw = (audience as u64 * sample_percent as u64 + 99) / 100;
        (raw as u32).max(min_sample).max(variant_count).min(audience)
    }

    /// Shuffles the eligible audience deterministically and splits it
    /// across variants by `split_percent`, reconciling rounding so the
    /// partition sums to the sample size exactly (design §4.8).
    ///
    /// When the audience is smaller than the variant count, one
    /// recipient is handed to each variant in order until the audience
    /// is exhausted; trailing variants get none.
    pub async fn start(
        &self,
        mut test: AbTest,
        eligible: Vec<Recipient>,
    ) -> Result<AbTest, AppError> {
        let variant_count = test.variants.len() as u32;
        let audience = eligible.len() as u32;
        test.audience_size = audience;

        let sample = Self::sample_size(audience, test.sample_percent, test.min_sample, variant_count);
        let mut rng = ChaCha8Rng::seed_from_u64(Self::seed_from_test(test.id));
        let mut shuffled = eligible;
        shuffled.shuffle(&mut rng);
        let sampled: Vec<Recipient> = shuffled.into_iter().take(sample as usize).collect();
        test.test_sample_size = sampled.len() as u32;

        let partitions = if sampled.len() < test.variants.len() {
            // Open Question decision #2: one recipient per variant in
            // order until the sample is exhausted.
            sampled.iter().map(|r| vec![r.clone()]).collect::<Vec<_>>()
        } else {
            partition_by_split(&sampled, &test.variants)
        };

        let mut assignments = Vec::new();
        for (variant, group) in test.variants.iter().zip(partitions.into_iter()) {
            for recipient in group {
                assignments.push(Assignment {
                    test: test.id,
                    variant: variant.id,
                    recipient: recipient.id,
                    cohort: Cohort::Test,
                    status: AssignmentStatus::Pending,
                    sent_at: None,
                });
            }
        }

        self.gateway.insert_assignments(assignments).await?;
        test.status = AbTestStatus::Testing;
        test.started_at = Some(Utc::now());
        self.gateway.upsert_ab_test(test).await
    }

    /// Two-proportion z-test of each non-control variant against
    /// control (design §4.8).
    pub fn evaluate_significance(&self, test: &AbTest) -> Vec<(Uuid, SignificanceResult)> {
        let Some(control) = test.control() else {
            return Vec::new();
        };
        let control_rate = control.metric_value(test.winner_metric);
        let control_n = control.delivered;

        test.variants
            .iter()
            .filter(|v| !v.is_control)
            .map(|v| {
                let rate = v.metric_value(test.winner_metric);
                let z = two_proportion_z(rate, v.delivered, control_rate, control_n);
                let confidence = confidence_for(z.abs());
                let enough_sample = v.delivered as u32 >= test.min_sample && control_n as u32 >= test.min_sample;
                let significant = confidence >= test.confidence_threshold && enough_sample;
                let lift_vs_control = if control_rate.abs() > f64::EPSILON {
                    (rate - control_rate) / control_rate * 100.0
                } else {
                    0.0
                };
                (
                    v.id,
                    SignificanceResult {
                        confidence,
                        significant,
                        lift_vs_control,
                    },
                )
            })
            .collect()
    }

    /// Writes `confidence_score`/`significant`/`lift_vs_control` back
    /// onto each variant.
    pub fn apply_significance(&self, test: &mut AbTest) {
        let results = self.evaluate_significance(test);
        for (variant_id, result) in results {
            if let Some(variant) = test.variants.iter_mut().find(|v| v.id == variant_id) {
                variant.confidence_score = Some(result.confidence);
                variant.significant = result.significant;
                variant.lift_vs_control = Some(result.lift_vs_control);
            }
        }
    }

    /// Manual winner selection: set `is_winner` on exactly one variant
    /// (design §4.8).
    pub async fn select_winner_manual(&self, mut test: AbTest, variant_id: Uuid) -> Result<AbTest, AppError> {
        if !test.variants.iter().any(|v| v.id == variant_id) {
            return Err(AppError::NotFound(format!("variant {variant_id}")));
        }
        for variant in test.variants.iter_mut() {
            variant.is_winner = variant.id == variant_id;
        }
        test.winner_variant = Some(variant_id);
        test.status = AbTestStatus::WinnerSelected;
        self.gateway.upsert_ab_test(test).await
    }

    /// Auto winner selection after `winner_wait_hours` (design §4.8):
    /// among significant, positive-lift non-control variants pick the
    /// one maximising `winner_metric`; ties broken by lowest variant
    /// name, control never wins a tie (decision #1).
    pub async fn select_winner_auto(&self, mut test: AbTest) -> Result<AbTest, AppError> {
        self.apply_significance(&mut test);

        let mut candidates: Vec<&Variant> = test
            .variants
            .iter()
            .filter(|v| !v.is_control && v.significant && v.lift_vs_control.unwrap_or(0.0) > 0.0)
            .collect();

        candidates.sort_by(|a, b| {
            let a_metric = a.metric_value(test.winner_metric);
            let b_metric = b.metric_value(test.winner_metric);
            b_metric
                .partial_cmp(&a_metric)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });

        let winner_id = candidates.first().map(|v| v.id).or_else(|| test.control().map(|c| c.id));

        if let Some(id) = winner_id {
            for variant in test.variants.iter_mut() {
                variant.is_winner = variant.id == id;
            }
            test.winner_variant = Some(id);
        }
        test.status = AbTestStatus::WinnerSelected;
        self.gateway.upsert_ab_test(test).await
    }

    /// Enqueues the winning variant's content for every audience member
    /// with no assignment and an eligible status (design §4.8). Returns
    /// the recipients to hand to the dispatcher.
    pub async fn promote_winner(
        &self,
        mut test: AbTest,
        audience: Vec<Recipient>,
    ) -> Result<(AbTest, Variant, Vec<Recipient>), AppError> {
        let winner_id = test.winner_variant.ok_or_else(|| {
            AppError::StateViolation(format!("ab_test {} has no winner selected", test.id))
        })?;
        let winner = test
            .variants
            .iter()
            .find(|v| v.id == winner_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("variant {winner_id}")))?;

        let mut remainder = Vec::new();
        let mut remainder_assignments = Vec::new();
        for recipient in audience {
            if recipient.status.excludes_from_send() {
                continue;
            }
            if self.gateway.get_assignment(test.id, recipient.id).await?.is_some() {
                continue;
            }
            remainder_assignments.push(Assignment {
                test: test.id,
                variant: winner_id,
                recipient: recipient.id,
                cohort: Cohort::Remainder,
                status: AssignmentStatus::Pending,
                sent_at: None,
            });
            remainder.push(recipient);
        }
        self.gateway.insert_assignments(remainder_assignments).await?;

        test.status = AbTestStatus::SendingWinner;
        test = self.gateway.upsert_ab_test(test).await?;
        Ok((test, winner, remainder))
    }
}

/// Splits `sample` across `variants` by `split_percent`, adjusting the
/// last group so the total matches exactly (design §4.8 "rounding so
/// totals match").
fn partition_by_split(sample: &[Recipient], variants: &[Variant]) -> Vec<Vec<Recipient>> {
    let total = sample.len();
    let mut sizes: Vec<usize> = variants
        .iter()
        .map(|v| total * v.split_percent as usize / 100)
        .collect();
    let assigned: usize = sizes.iter().sum();
    if let Some(last) = sizes.last_mut() {
        *last += total.saturating_sub(assigned);
    }

    let mut groups = Vec::with_capacity(variants.len());
    let mut cursor = 0;
    for size in sizes {
        let end = (cursor + size).min(total);
        groups.push(sample[cursor..end].to_vec());
        cursor = end;
    }
    groups
}

/// Two-proportion z-test statistic; `0.0` when either side has no
/// sends to avoid a division by zero (design §4.8).
fn two_proportion_z(p1: f64, n1: i64, p2: f64, n2: i64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }
    let (n1, n2) = (n1 as f64, n2 as f64);
    let pooled = (p1 * n1 + p2 * n2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se <= f64::EPSILON {
        return 0.0;
    }
    (p1 - p2) / se
}

/// Step function mapping `|z|` to a confidence level (design §4.8).
fn confidence_for(abs_z: f64) -> f64 {
    if abs_z >= 2.576 {
        0.99
    } else if abs_z >= 1.96 {
        0.95
    } else if abs_z >= 1.645 {
        0.90
    } else if abs_z >= 1.28 {
        0.80
    } else {
        abs_z / 2.576
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::InMemoryGateway;
    use crate::models::ab_test::{AbTestType, WinnerMetric};
    use rust_decimal::Decimal;

    fn variant(name: &str, is_control: bool, split: u8) -> Variant {
        Variant {
            id: Uuid::new_v4(),
            test: Uuid::new_v4(),
            name: name.into(),
            label: name.into(),
            subject: None,
            from_name: None,
            preheader: None,
            html: None,
            text: None,
            cta_label: None,
            cta_url: None,
            send_hour: None,
            send_day: None,
            split_percent: split,
            is_control,
            is_winner: false,
            sent: 0,
            delivered: 0,
            opens: 0,
            opens_unique: 0,
            clicks: 0,
            clicks_unique: 0,
            bounces: 0,
            complaints: 0,
            unsubscribes: 0,
            conversions: 0,
            revenue: Decimal::ZERO,
            confidence_score: None,
            lift_vs_control: None,
            significant: false,
        }
    }

    fn test_with(variants: Vec<Variant>) -> AbTest {
        AbTest {
            id: Uuid::new_v4(),
            org: Uuid::new_v4(),
            campaign: None,
            test_type: AbTestType::Subject,
            sample_percent: 100,
            winner_metric: WinnerMetric::OpenRate,
            winner_wait_hours: 24,
            confidence_threshold: 0.95,
            min_sample: 1,
            status: AbTestStatus::Draft,
            variants,
            winner_variant: None,
            audience_size: 0,
            test_sample_size: 0,
            started_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sample_size_respects_min_sample_and_variant_floor() {
        assert_eq!(AbController::sample_size(1000, 10, 5, 2), 100);
        assert_eq!(AbController::sample_size(10, 1, 50, 2), 10);
        assert_eq!(AbController::sample_size(1, 50, 1, 4), 1);
    }

    #[test]
    fn partition_respects_split_and_accounts_for_rounding() {
        let sample: Vec<Recipient> = (0..10)
            .map(|i| Recipient::new(Uuid::new_v4(), None, &format!("u{i}@x.com")))
            .collect();
        let variants = vec![variant("a", true, 33), variant("b", false, 33), variant("c", false, 34)];
        let groups = partition_by_split(&sample, &variants);
        let total: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn confidence_step_function_matches_thresholds() {
        assert_eq!(confidence_for(3.0), 0.99);
        assert_eq!(confidence_for(2.0), 0.95);
        assert_eq!(confidence_for(1.7), 0.90);
        assert_eq!(confidence_for(1.3), 0.80);
        assert!(confidence_for(0.5) < 0.80);
    }

    #[test]
    fn identical_rates_are_not_significant() {
        let mut control = variant("control", true, 50);
        control.delivered = 1000;
        control.opens_unique = 100;
        let mut treatment = variant("b", false, 50);
        treatment.delivered = 1000;
        treatment.opens_unique = 100;
        let test = test_with(vec![control, treatment]);

        let gateway = Arc::new(InMemoryGateway::new());
        let controller = AbController::new(gateway);
        let results = controller.evaluate_significance(&test);
        assert_eq!(results.len(), 1);
        assert!(!results[0].1.significant);
    }

    #[test]
    fn tie_break_prefers_lowest_variant_name_over_control() {
        let mut control = variant("control", true, 34);
        control.delivered = 1000;
        control.opens_unique = 100;
        let mut b = variant("b", false, 33);
        b.delivered = 1000;
        b.opens_unique = 300;
        let mut a = variant("a", false, 33);
        a.delivered = 1000;
        a.opens_unique = 300;
        let mut test = test_with(vec![control, b, a]);

        let gateway = Arc::new(InMemoryGateway::new());
        let controller = AbController::new(gateway);
        controller.apply_significance(&mut test);
        let mut sorted: Vec<&Variant> = test.variants.iter().filter(|v| !v.is_control).collect();
        sorted.sort_by(|x, y| {
            y.metric_value(test.winner_metric)
                .partial_cmp(&x.metric_value(test.winner_metric))
                .unwrap()
                .then_with(|| x.name.cmp(&y.name))
        });
        assert_eq!(sorted[0].name, "a");
    }

    #[tokio::test]
    async fn small_audience_assigns_one_recipient_per_variant() {
        let gateway = Arc::new(InMemoryGateway::new());
        let controller = AbController::new(gateway.clone());
        let variants = vec![variant("control", true, 50), variant("b", false, 50)];
        let test = test_with(variants);
        let eligible = vec![Recipient::new(test.org, None, "only@x.com")];

        let started = controller.start(test, eligible).await.unwrap();
        assert_eq!(started.test_sample_size, 1);
        assert_eq!(started.status, AbTestStatus::Testing);
    }
}

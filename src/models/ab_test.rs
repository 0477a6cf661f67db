//! A/B test, variant, and assignment entities (design §3, §4.8).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestType {
    Subject,
    FromName,
    Content,
    SendTime,
    Preheader,
    Cta,
    FullVariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestStatus {
    Draft,
    Testing,
    Waiting,
    WinnerSelected,
    SendingWinner,
    Completed,
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    Test,
    Remainder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub id: Uuid,
    pub org: Uuid,
    pub campaign: Option<Uuid>,
    pub test_type: AbTestType,
    pub sample_percent: u8,
    pub winner_metric: WinnerMetric,
    pub winner_wait_hours: i64,
    pub confidence_threshold: f64,
    pub min_sample: u32,
    pub status: AbTestStatus,
    pub variants: Vec<Variant>,
    pub winner_variant: Option<Uuid>,
    pub audience_size: u32,
    pub test_sample_size: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerMetric {
    OpenRate,
    ClickRate,
    ConversionRate,
    Revenue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub test: Uuid,
    pub name: String,
    pub label: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub preheader: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub cta_label: Option<String>,
    pub cta_url: Option<String>,
    pub send_hour: Option<u8>,
    pub send_day: Option<u8>,
    pub split_percent: u8,
    pub is_control: bool,
    pub is_winner: bool,

    pub sent: i64,
    pub delivered: i64,
    pub opens: i64,
    pub opens_unique: i64,
    pub clicks: i64,
    pub clicks_unique: i64,
    pub bounces: i64,
    pub complaints: i64,
    pub unsubscribes: i64,
    pub conversions: i64,
    pub revenue: Decimal,

    pub confidence_score: Option<f64>,
    pub lift_vs_control: Option<f64>,
    pub significant: bool,
}

impl Variant {
    pub fn open_rate(&self) -> f64 {
        rate(self.opens_unique, self.delivered)
    }

    pub fn click_rate(&self) -> f64 {
        rate(self.clicks_unique, self.delivered)
    }

    pub fn conversion_rate(&self) -> f64 {
        rate(self.conversions, self.delivered)
    }

    pub fn metric_value(&self, metric: WinnerMetric) -> f64 {
        match metric {
            WinnerMetric::OpenRate => self.open_rate(),
            WinnerMetric::ClickRate => self.click_rate(),
            WinnerMetric::ConversionRate => self.conversion_rate(),
            WinnerMetric::Revenue => self.revenue.to_string().parse().unwrap_or(0.0),
        }
    }
}

fn rate(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Sent,
    Skipped,
}

/// `(test, recipient)` is unique (design §3, §8 invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub test: Uuid,
    pub variant: Uuid,
    pub recipient: Uuid,
    pub cohort: Cohort,
    pub status: AssignmentStatus,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Significance result for one variant, as returned over the wire
/// (design §4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceSummary {
    pub variant: Uuid,
    pub confidence: f64,
    pub significant: bool,
    pub lift_vs_control: f64,
}

impl AbTest {
    /// `Σ variant.split_percent ∈ [100 − n, 100]` (design §8 invariant 2).
    pub fn split_percent_within_rounding_slack(&self) -> bool {
        let total: u32 = self.variants.iter().map(|v| v.split_percent as u32).sum();
        let n = self.variants.len() as u32;
        total <= 100 && total >= 100u32.saturating_sub(n)
    }

    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control)
    }
}

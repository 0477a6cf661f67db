//! Recipient entity (design §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Confirmed,
    Unsubscribed,
    Bounced,
    Complained,
}

impl RecipientStatus {
    /// Statuses that exclude a recipient from winner promotion (design §4.8).
    pub fn excludes_from_send(self) -> bool {
        matches!(
            self,
            Self::Unsubscribed | Self::Bounced | Self::Complained
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub org: Uuid,
    pub list: Option<Uuid>,
    pub email: String,
    pub email_hash: String,
    pub status: RecipientStatus,
    pub engagement_score: f64,
    pub last_open_at: Option<DateTime<Utc>>,
    pub last_click_at: Option<DateTime<Utc>>,
    pub total_sent: i64,
    pub total_opens: i64,
    pub total_clicks: i64,
    pub total_bounces: i64,
    pub total_complaints: i64,
    pub optimal_send_hour: Option<u8>,
    pub optimal_send_day: Option<u8>,
    pub custom_fields: serde_json::Value,
}

impl Recipient {
    /// Normalize and hash an email the way ingress does (lower-cased,
    /// `email_hash = SHA256(email)`, design §3).
    pub fn new(org: Uuid, list: Option<Uuid>, email: &str) -> Self {
        let email = email.trim().to_lowercase();
        let email_hash = hash_email(&email);
        Self {
            id: Uuid::new_v4(),
            org,
            list,
            email,
            email_hash,
            status: RecipientStatus::Pending,
            engagement_score: 0.0,
            last_open_at: None,
            last_click_at: None,
            total_sent: 0,
            total_opens: 0,
            total_clicks: 0,
            total_bounces: 0,
            total_complaints: 0,
            optimal_send_hour: None,
            optimal_send_day: None,
            custom_fields: serde_json::Value::Null,
        }
    }

    pub fn domain(&self) -> &str {
        self.email.rsplit('@').next().unwrap_or("")
    }

    /// Engagement score decays with inactivity and rises on open/click;
    /// the exact weights are configuration-shaped constants here (design
    /// glossary: "Engagement score").
    pub fn recompute_engagement_score(&mut self, now: DateTime<Utc>) {
        let open_weight = 0.4;
        let click_weight = 0.6;
        let open_rate = if self.total_sent > 0 {
            self.total_opens as f64 / self.total_sent as f64
        } else {
            0.0
        };
        let click_rate = if self.total_opens > 0 {
            self.total_clicks as f64 / self.total_opens as f64
        } else {
            0.0
        };
        let mut score = (open_rate * open_weight + click_rate * click_weight) * 100.0;

        let last_activity = self.last_click_at.or(self.last_open_at);
        if let Some(last) = last_activity {
            let days_idle = (now - last).num_days().max(0) as f64;
            let decay = (1.0 - (days_idle / 180.0).min(1.0)).max(0.0);
            score *= decay;
        } else {
            score = 0.0;
        }

        self.engagement_score = score.clamp(0.0, 100.0);
    }
}

pub fn hash_email(email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hex::encode(hasher.finalize())
}

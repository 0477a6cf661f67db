//! Campaign entity and its state machine (design §3, §4.6).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
    Cancelled,
    Failed,
    // A/B-only states.
    Testing,
    Waiting,
    WinnerSelected,
    SendingWinner,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether `self -> next` is an allowed transition per the state
    /// machine in design §4.6.
    pub fn can_transition_to(self, next: Self) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Sending)
                | (Sending, Paused)
                | (Paused, Sending)
                | (Sending, Completed)
                | (Sending, Cancelled)
                | (Paused, Cancelled)
                | (Scheduled, Cancelled)
                | (Draft, Cancelled)
                | (_, Failed)
                | (Sending, Testing)
                | (Testing, Waiting)
                | (Waiting, WinnerSelected)
                | (WinnerSelected, SendingWinner)
                | (SendingWinner, Completed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CampaignAudience {
    List(Uuid),
    Segment(Uuid),
    AbTest(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContent {
    pub subject: String,
    pub from_name: String,
    pub from_email: String,
    pub reply_to: Option<String>,
    pub html: String,
    pub text: Option<String>,
    pub tracking_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub org: Uuid,
    pub audience: CampaignAudience,
    pub content: CampaignContent,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,

    // Counters, eventually consistent with events (design §3).
    pub sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub complaints: i64,
    pub opened_unique: i64,
    pub clicked_unique: i64,
    pub revenue: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(org: Uuid, audience: CampaignAudience, content: CampaignContent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org,
            audience,
            content,
            status: CampaignStatus::Draft,
            scheduled_at: None,
            sent: 0,
            delivered: 0,
            bounced: 0,
            complaints: 0,
            opened_unique: 0,
            clicked_unique: 0,
            revenue: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state transition, returning `state_violation` if the
    /// requested move isn't allowed from the current status.
    pub fn transition(&mut self, next: CampaignStatus) -> Result<(), crate::error::AppError> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::AppError::StateViolation(format!(
                "campaign {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fraction of sends in this campaign that were permanent rejects,
    /// used by the dispatcher to decide whether to auto-pause (design §7).
    pub fn permanent_reject_ratio(&self, permanent_rejects: i64) -> Decimal {
        if self.sent == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(permanent_rejects) / Decimal::from(self.sent)
    }
}

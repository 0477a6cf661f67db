//! Tracking event entity (design §3, §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventKind {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    Suppressed,
    Deferred,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEventMetadata {
    #[serde(default)]
    pub robotic: bool,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
}

impl Default for TrackingEventMetadata {
    fn default() -> Self {
        Self {
            robotic: false,
            target_url: None,
            error: None,
            provider_message_id: None,
        }
    }
}

/// `(campaign, email_id, kind)` is unique for idempotency (design §3, §8
/// "Idempotence" law).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: Uuid,
    pub campaign: Uuid,
    pub recipient: Uuid,
    pub email_id: String,
    pub kind: TrackingEventKind,
    pub occurred_at: DateTime<Utc>,
    pub metadata: TrackingEventMetadata,
}

impl TrackingEvent {
    pub fn new(
        campaign: Uuid,
        recipient: Uuid,
        email_id: impl Into<String>,
        kind: TrackingEventKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign,
            recipient,
            email_id: email_id.into(),
            kind,
            occurred_at: Utc::now(),
            metadata: TrackingEventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: TrackingEventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Unique key used for idempotent inserts.
    pub fn idempotency_key(&self) -> (Uuid, String, TrackingEventKind) {
        (self.campaign, self.email_id.clone(), self.kind)
    }
}

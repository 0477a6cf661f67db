//! Tracking Ingest (C7, design §4.7).
//!
//! Verifies the signed pixel/click URL, classifies unique vs repeat
//! opens, records the event idempotently, and updates recipient and
//! variant counters. Robotic opens (prefetchers, safe-link scanners)
//! are still counted but flagged (design §4.7, Open Question decision 3).

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::gateway::PersistenceGateway;
use crate::models::tracking::TrackingEventMetadata;
use crate::models::{TrackingEvent, TrackingEventKind};
use crate::services::events::{ChangeEvent, EventBus};
use crate::services::signing::{UrlSigner, VerifyError};

pub struct TrackingOutcome {
    pub recipient: Uuid,
    pub campaign: Uuid,
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingError {
    InvalidSignature,
    NotFound,
}

impl From<VerifyError> for TrackingError {
    fn from(_: VerifyError) -> Self {
        TrackingError::InvalidSignature
    }
}

pub struct TrackingIngest {
    gateway: Arc<dyn PersistenceGateway>,
    signer: Arc<UrlSigner>,
    events: Arc<EventBus>,
    robotic_user_agents: Vec<String>,
}

impl TrackingIngest {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        signer: Arc<UrlSigner>,
        events: Arc<EventBus>,
        config: &AppConfig,
    ) -> Self {
        Self {
            gateway,
            signer,
            events,
            robotic_user_agents: config.robotic_user_agents.clone(),
        }
    }

    /// A request looks like an automated prefetch if its User-Agent
    /// contains any of the configured substrings, case-insensitively
    /// (design §4.7, Open Question decision 3).
    fn is_robotic(&self, user_agent: Option<&str>) -> bool {
        let Some(user_agent) = user_agent else {
            return false;
        };
        let lowered = user_agent.to_lowercase();
        self.robotic_user_agents
            .iter()
            .any(|needle| lowered.contains(&needle.to_lowercase()))
    }

    /// Verifies and records an open beacon hit.
    pub async fn record_open(
        &self,
        path_segment: &str,
        user_agent: Option<&str>,
    ) -> Result<TrackingOutcome, TrackingError> {
        let payload = self.signer.verify_path(path_segment)?;
        let robotic = self.is_robotic(user_agent);

        let unique = !self
            .gateway
            .has_event(payload.campaign, payload.recipient, TrackingEventKind::Opened)
            .await
            .unwrap_or(false);

        let event = TrackingEvent::new(
            payload.campaign,
            payload.recipient,
            payload.email_id.as_str(),
            TrackingEventKind::Opened,
        )
        .with_metadata(TrackingEventMetadata {
            robotic,
            ..Default::default()
        });
        let inserted = self.gateway.record_event(event).await.unwrap_or(false);

        if inserted {
            self.bump_recipient_open(payload.org, payload.recipient).await;
            self.bump_variant_counter(payload.org, payload.campaign, payload.recipient, Counter::Open { unique })
                .await;
            self.publish(payload.campaign, "tracking.opened", unique, robotic);
        }

        Ok(TrackingOutcome {
            recipient: payload.recipient,
            campaign: payload.campaign,
            redirect_to: None,
        })
    }

    /// Verifies and records a click, returning the original target URL
    /// for the caller to redirect to.
    ///
    /// A click implies an open: if no `opened` event exists yet for this
    /// `(campaign, recipient)`, one is recorded alongside the click
    /// (design §8 invariant 5).
    pub async fn record_click(
        &self,
        path_segment: &str,
        user_agent: Option<&str>,
    ) -> Result<TrackingOutcome, TrackingError> {
        let payload = self.signer.verify_path(path_segment)?;
        let target = payload.target_url.clone().ok_or(TrackingError::NotFound)?;
        let robotic = self.is_robotic(user_agent);

        let no_prior_open = !self
            .gateway
            .has_event(payload.campaign, payload.recipient, TrackingEventKind::Opened)
            .await
            .unwrap_or(false);
        if no_prior_open {
            let implied_open = TrackingEvent::new(
                payload.campaign,
                payload.recipient,
                payload.email_id.as_str(),
                TrackingEventKind::Opened,
            )
            .with_metadata(TrackingEventMetadata {
                robotic,
                ..Default::default()
            });
            if self.gateway.record_event(implied_open).await.unwrap_or(false) {
                self.bump_recipient_open(payload.org, payload.recipient).await;
                self.bump_variant_counter(payload.org, payload.campaign, payload.recipient, Counter::Open { unique: true })
                    .await;
                self.publish(payload.campaign, "tracking.opened", true, robotic);
            }
        }

        let unique = !self
            .gateway
            .has_event(payload.campaign, payload.recipient, TrackingEventKind::Clicked)
            .await
            .unwrap_or(false);

        let event = TrackingEvent::new(
            payload.campaign,
            payload.recipient,
            payload.email_id.as_str(),
            TrackingEventKind::Clicked,
        )
        .with_metadata(TrackingEventMetadata {
            robotic,
            target_url: Some(target.clone()),
            ..Default::default()
        });
        let inserted = self.gateway.record_event(event).await.unwrap_or(false);

        if inserted {
            self.bump_recipient_click(payload.org, payload.recipient).await;
            self.bump_variant_counter(payload.org, payload.campaign, payload.recipient, Counter::Click { unique })
                .await;
            self.publish(payload.campaign, "tracking.clicked", unique, robotic);
        }

        Ok(TrackingOutcome {
            recipient: payload.recipient,
            campaign: payload.campaign,
            redirect_to: Some(target),
        })
    }

    async fn bump_recipient_open(&self, org: Uuid, recipient_id: Uuid) {
        if let Ok(mut recipient) = self.gateway.get_recipient(org, recipient_id).await {
            recipient.total_opens += 1;
            recipient.last_open_at = Some(Utc::now());
            recipient.recompute_engagement_score(Utc::now());
            let _ = self.gateway.upsert_recipient(recipient).await;
        }
    }

    async fn bump_recipient_click(&self, org: Uuid, recipient_id: Uuid) {
        if let Ok(mut recipient) = self.gateway.get_recipient(org, recipient_id).await {
            recipient.total_clicks += 1;
            recipient.last_click_at = Some(Utc::now());
            recipient.recompute_engagement_score(Utc::now());
            let _ = self.gateway.upsert_recipient(recipient).await;
        }
    }

    /// Finds the A/B test backing a campaign (if any) and bumps the
    /// recipient's assigned variant's counters (design §4.7 "update
    /// variant counters if the recipient has an assignment").
    async fn bump_variant_counter(&self, org: Uuid, campaign_id: Uuid, recipient_id: Uuid, counter: Counter) {
        let Ok(campaign) = self.gateway.get_campaign(org, campaign_id).await else {
            return;
        };
        let crate::models::CampaignAudience::AbTest(test_id) = campaign.audience else {
            return;
        };
        let Ok(Some(assignment)) = self.gateway.get_assignment(test_id, recipient_id).await else {
            return;
        };
        let Ok(mut test) = self.gateway.get_ab_test(org, test_id).await else {
            return;
        };
        if let Some(variant) = test.variants.iter_mut().find(|v| v.id == assignment.variant) {
            match counter {
                Counter::Open { unique } => {
                    variant.opens += 1;
                    if unique {
                        variant.opens_unique += 1;
                    }
                }
                Counter::Click { unique } => {
                    variant.clicks += 1;
                    if unique {
                        variant.clicks_unique += 1;
                    }
                }
            }
        }
        let _ = self.gateway.upsert_ab_test(test).await;
    }

    fn publish(&self, campaign: Uuid, kind: &str, unique: bool, robotic: bool) {
        self.events.publish(ChangeEvent::new(
            campaign,
            kind,
            serde_json::json!({"unique": unique, "robotic": robotic}),
        ));
    }
}

enum Counter {
    Open { unique: bool },
    Click { unique: bool },
}

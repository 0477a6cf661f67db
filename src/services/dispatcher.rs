//! Dispatcher (C6, design §4.6) — per-campaign state machine and send
//! loop.
//!
//! Each campaign runs on its own worker (design §5); cancellation is a
//! cooperative flag checked between recipients rather than a forceful
//! abort, so an in-flight submit always finishes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::delivery::{DeliveryError, Envelope, SendResult, TransportRegistry};
use crate::error::AppError;
use crate::gateway::PersistenceGateway;
use crate::models::ab_test::{AbTestStatus, Assignment, AssignmentStatus, Cohort, Variant};
use crate::models::{
    Campaign, CampaignAudience, CampaignStatus, Recipient, RecipientStatus, SuppressionEntry,
    SuppressionReason, SuppressionScope, ThrottleLimits, ThrottleScope, TrackingEvent,
    TrackingEventKind,
};
use crate::services::resolver::RecipientResolver;
use crate::services::signing::{TrackingPayload, UrlSigner};
use crate::services::suppression::SuppressionIndex;
use crate::services::throttle::{DenyReason, ThrottleCore};

const RETRY_BASE_SECS: i64 = 30;
const RETRY_FACTOR: i64 = 2;
const RETRY_CAP_SECS: i64 = 30 * 60;
const RETRY_MAX_ATTEMPTS: u32 = 5;
/// Campaign-wide failure threshold that pauses a campaign instead of
/// letting it run to `failed` (design §7).
const PERMANENT_REJECT_PAUSE_RATIO: f64 = 0.10;
const PERMANENT_REJECT_PAUSE_WINDOW: i64 = 1000;

#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub org: Uuid,
    pub campaign: Uuid,
    pub recipient: Recipient,
    pub variant: Option<VariantContext>,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// The A/B test a per-recipient send is attributed to, so `process_one`
/// can credit the right variant's counters and mark the assignment sent
/// (design §4.6 step 5, §4.8).
#[derive(Debug, Clone)]
pub struct VariantContext {
    pub test_id: Uuid,
    pub variant: Variant,
}

/// Backoff schedule: base 30s, factor 2, cap 30 min, jitter +-20%
/// (design §4.6).
fn backoff_delay(attempt: u32) -> ChronoDuration {
    let raw = (RETRY_BASE_SECS * RETRY_FACTOR.pow(attempt.saturating_sub(1))).min(RETRY_CAP_SECS);
    let jitter_frac = rand::thread_rng().gen_range(-0.20..=0.20);
    let jittered = (raw as f64 * (1.0 + jitter_frac)).max(1.0) as i64;
    ChronoDuration::seconds(jittered)
}

pub struct Dispatcher {
    gateway: Arc<dyn PersistenceGateway>,
    suppression: Arc<SuppressionIndex>,
    throttle: Arc<ThrottleCore>,
    resolver: Arc<RecipientResolver>,
    transports: Arc<TransportRegistry>,
    events: Arc<crate::services::events::EventBus>,
    signer: Arc<UrlSigner>,
    tracking_url: String,
    pacing_enabled: bool,
    cancel_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    retry_buffer: Mutex<VecDeque<PendingRetry>>,
}

pub struct DispatchOutcome {
    pub sent: u64,
    pub suppressed: u64,
    pub deferred: u64,
    pub failed: u64,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        suppression: Arc<SuppressionIndex>,
        throttle: Arc<ThrottleCore>,
        resolver: Arc<RecipientResolver>,
        transports: Arc<TransportRegistry>,
        events: Arc<crate::services::events::EventBus>,
        signer: Arc<UrlSigner>,
        tracking_url: String,
    ) -> Self {
        Self {
            gateway,
            suppression,
            throttle,
            resolver,
            transports,
            events,
            signer,
            tracking_url,
            pacing_enabled: true,
            cancel_flags: Mutex::new(HashMap::new()),
            retry_buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Disables the inter-send pacing sleep; used by tests so the loop
    /// runs at full speed without weakening the production default.
    pub fn without_pacing(mut self) -> Self {
        self.pacing_enabled = false;
        self
    }

    pub fn cancel(&self, campaign: Uuid) {
        if let Some(flag) = self.cancel_flags.lock().get(&campaign) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn cancel_flag(&self, campaign: Uuid) -> Arc<AtomicBool> {
        self.cancel_flags
            .lock()
            .entry(campaign)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Expands the campaign's audience into recipients (design §4.4,
    /// §4.6). A/B audiences are handled by [`Self::send_ab_test_cohort`]
    /// instead, since a test's recipients come from its assignments
    /// rather than a plain list/segment resolve.
    async fn recipients_for(&self, campaign: &Campaign) -> Result<Vec<Recipient>, AppError> {
        match &campaign.audience {
            CampaignAudience::List(list) => self.resolver.resolve_list(campaign.org, *list).await,
            CampaignAudience::Segment(segment) => {
                let predicate = self.gateway.get_segment_predicate(campaign.org, *segment).await?;
                self.resolver.resolve_segment(campaign.org, &predicate).await
            }
            CampaignAudience::AbTest(_) => Ok(Vec::new()),
        }
    }

    /// Public wrapper over audience expansion, used by HTTP handlers that
    /// need the raw recipient list ahead of a winner promotion.
    pub async fn recipients_for_campaign(&self, campaign: &Campaign) -> Result<Vec<Recipient>, AppError> {
        self.recipients_for(campaign).await
    }

    /// Sends the winning variant's content to the promoted remainder of
    /// an A/B test's audience (design §4.8 "send-winner").
    #[instrument(skip(self, campaign, recipients, variant), fields(campaign_id = %campaign.id))]
    pub async fn send_winner(
        &self,
        mut campaign: Campaign,
        test_id: Uuid,
        variant: Variant,
        recipients: Vec<Recipient>,
    ) -> Result<Campaign, AppError> {
        let cancel_flag = self.cancel_flag(campaign.id);

        for recipient in recipients {
            if cancel_flag.load(Ordering::SeqCst) {
                info!("campaign cancelled, stopping before next recipient");
                break;
            }
            let fresh = self.gateway.get_campaign(campaign.org, campaign.id).await?;
            if matches!(fresh.status, CampaignStatus::Paused | CampaignStatus::Cancelled) {
                return Ok(fresh);
            }
            if self
                .gateway
                .has_event(campaign.id, recipient.id, TrackingEventKind::Sent)
                .await?
            {
                continue;
            }
            let ctx = VariantContext { test_id, variant: variant.clone() };
            self.process_one(&mut campaign, recipient, Some(ctx)).await?;
            if self.pacing_enabled {
                sleep(Duration::from_millis(50)).await;
            }
        }

        if campaign.status == CampaignStatus::SendingWinner {
            campaign.transition(CampaignStatus::Completed)?;
            campaign = self.gateway.upsert_campaign(campaign).await?;
            self.publish(&campaign, "campaign.completed", serde_json::json!({}));
        }
        Ok(campaign)
    }

    /// Streams an A/B test's sampled `Test`-cohort assignments through
    /// the send path (design §4.8 "per-variant send", C8), then moves
    /// the test and its owning campaign from `Testing` to `Waiting` so
    /// the scheduler's auto winner-selection can fire (design §4.10).
    #[instrument(skip(self, campaign), fields(campaign_id = %campaign.id, test_id = %test_id))]
    async fn send_ab_test_cohort(&self, mut campaign: Campaign, test_id: Uuid) -> Result<Campaign, AppError> {
        if campaign.status == CampaignStatus::Sending {
            campaign.transition(CampaignStatus::Testing)?;
            campaign = self.gateway.upsert_campaign(campaign).await?;
        }

        let test = self.gateway.get_ab_test(campaign.org, test_id).await?;
        let cancel_flag = self.cancel_flag(campaign.id);
        let assignments: Vec<Assignment> = self
            .gateway
            .list_assignments(test_id)
            .await?
            .into_iter()
            .filter(|a| a.cohort == Cohort::Test && a.status == AssignmentStatus::Pending)
            .collect();

        for assignment in assignments {
            if cancel_flag.load(Ordering::SeqCst) {
                info!("campaign cancelled, stopping before next recipient");
                break;
            }
            let fresh = self.gateway.get_campaign(campaign.org, campaign.id).await?;
            if matches!(fresh.status, CampaignStatus::Paused | CampaignStatus::Cancelled) {
                return Ok(fresh);
            }
            let Some(variant) = test.variants.iter().find(|v| v.id == assignment.variant).cloned() else {
                continue;
            };
            let recipient = self.gateway.get_recipient(campaign.org, assignment.recipient).await?;
            let ctx = VariantContext { test_id, variant };
            self.process_one(&mut campaign, recipient, Some(ctx)).await?;
            if self.pacing_enabled {
                sleep(Duration::from_millis(50)).await;
            }
        }

        if campaign.status == CampaignStatus::Testing {
            campaign.transition(CampaignStatus::Waiting)?;
            campaign = self.gateway.upsert_campaign(campaign).await?;
        }
        let mut test = self.gateway.get_ab_test(campaign.org, test_id).await?;
        if test.status == AbTestStatus::Testing {
            test.status = AbTestStatus::Waiting;
            self.gateway.upsert_ab_test(test).await?;
        }
        self.publish(&campaign, "ab_test.waiting", serde_json::json!({"test": test_id}));
        Ok(campaign)
    }

    /// Runs one campaign's send loop end to end (design §4.6).
    #[instrument(skip(self, campaign), fields(campaign_id = %campaign.id))]
    pub async fn send_campaign(&self, mut campaign: Campaign) -> Result<Campaign, AppError> {
        if campaign.status == CampaignStatus::Scheduled {
            campaign.transition(CampaignStatus::Sending)?;
            campaign = self.gateway.upsert_campaign(campaign).await?;
        }

        if let CampaignAudience::AbTest(test_id) = campaign.audience {
            return self.send_ab_test_cohort(campaign, test_id).await;
        }

        let recipients = self.recipients_for(&campaign).await?;
        let cancel_flag = self.cancel_flag(campaign.id);
        let mut permanent_rejects: u64 = 0;
        let mut window_sent: u64 = 0;

        for recipient in recipients {
            if cancel_flag.load(Ordering::SeqCst) {
                info!("campaign cancelled, stopping before next recipient");
                break;
            }

            let fresh = self.gateway.get_campaign(campaign.org, campaign.id).await?;
            if fresh.status == CampaignStatus::Paused {
                debug!("campaign paused, exiting loop cleanly");
                return Ok(fresh);
            }
            if fresh.status == CampaignStatus::Cancelled {
                return Ok(fresh);
            }

            if self
                .gateway
                .has_event(campaign.id, recipient.id, TrackingEventKind::Sent)
                .await?
            {
                continue; // resumed after pause/crash: already terminal for this recipient
            }

            let outcome = self.process_one(&mut campaign, recipient, None).await?;
            if outcome.is_permanent_reject {
                permanent_rejects += 1;
            }
            if outcome.counted_toward_window {
                window_sent += 1;
            }

            if window_sent >= PERMANENT_REJECT_PAUSE_WINDOW as u64 {
                let ratio = permanent_rejects as f64 / window_sent as f64;
                if ratio > PERMANENT_REJECT_PAUSE_RATIO {
                    warn!(ratio, "permanent reject ratio exceeded threshold, pausing campaign");
                    campaign.transition(CampaignStatus::Paused)?;
                    campaign = self.gateway.upsert_campaign(campaign).await?;
                    self.publish(&campaign, "campaign.alert", serde_json::json!({"reason": "high_permanent_reject_ratio"}));
                    return Ok(campaign);
                }
                permanent_rejects = 0;
                window_sent = 0;
            }

            if self.pacing_enabled {
                sleep(self.pacing_delay(&campaign, &outcome)).await;
            }
        }

        if campaign.status == CampaignStatus::Sending {
            campaign.transition(CampaignStatus::Completed)?;
            campaign = self.gateway.upsert_campaign(campaign).await?;
            self.publish(&campaign, "campaign.completed", serde_json::json!({}));
        }
        Ok(campaign)
    }

    fn pacing_delay(&self, campaign: &Campaign, outcome: &RecipientOutcome) -> Duration {
        let domain = outcome.domain.clone();
        let snapshot = self.throttle.snapshot(
            campaign.org,
            crate::models::ThrottleScope::Domain(domain),
        );
        let hourly = snapshot.hourly_limit.max(1);
        let per_send_secs = 3600.0 / hourly as f64;
        Duration::from_secs_f64(per_send_secs.clamp(0.0, 5.0))
    }

    /// Runs the five-step per-recipient pipeline (design §4.6 steps 1-5).
    async fn process_one(
        &self,
        campaign: &mut Campaign,
        recipient: Recipient,
        variant: Option<VariantContext>,
    ) -> Result<RecipientOutcome, AppError> {
        let email_id = Uuid::new_v4().to_string();
        let domain = recipient.domain().to_string();

        // 1. Suppression gate.
        if self.suppression.is_suppressed(campaign.org, &recipient.email) {
            let event = TrackingEvent::new(campaign.id, recipient.id, email_id.as_str(), TrackingEventKind::Suppressed);
            self.gateway.record_event(event).await?;
            self.publish(campaign, "tracking.suppressed", serde_json::json!({"recipient": recipient.id}));
            return Ok(RecipientOutcome {
                domain,
                is_permanent_reject: false,
                counted_toward_window: false,
            });
        }

        // 2. Throttle gate.
        let decision = self.throttle.can_send(campaign.org, &recipient.email);
        if !decision.allowed {
            if matches!(decision.reason, DenyReason::Backpressure) {
                self.enqueue_retry(campaign.org, campaign.id, recipient.clone(), variant.clone(), 1);
            } else {
                let event = TrackingEvent::new(campaign.id, recipient.id, email_id.as_str(), TrackingEventKind::Deferred)
                    .with_metadata(crate::models::tracking::TrackingEventMetadata {
                        error: Some(decision.reason.as_str().to_string()),
                        ..Default::default()
                    });
                self.gateway.record_event(event).await?;
            }
            return Ok(RecipientOutcome {
                domain,
                is_permanent_reject: false,
                counted_toward_window: false,
            });
        }

        // 3 & 4. Message build (variant content + tracking injection).
        let envelope = self.build_envelope(campaign, &recipient, variant.as_ref().map(|c| &c.variant), &email_id);

        // 5. Submit.
        let transport = self
            .transports
            .default_transport()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("no delivery transport configured")))?;
        let result = transport.send(envelope).await;

        match result {
            SendResult::Accepted { provider_message_id } => {
                self.throttle.record_send(campaign.org, &recipient.email);
                let event = TrackingEvent::new(campaign.id, recipient.id, email_id.as_str(), TrackingEventKind::Sent)
                    .with_metadata(crate::models::tracking::TrackingEventMetadata {
                        provider_message_id: Some(provider_message_id),
                        ..Default::default()
                    });
                self.gateway.record_event(event).await?;
                campaign.sent += 1;
                *campaign = self.gateway.upsert_campaign(campaign.clone()).await?;
                self.publish(campaign, "tracking.sent", serde_json::json!({"recipient": recipient.id}));

                if let Some(ctx) = &variant {
                    self.credit_variant_send(campaign.org, ctx.test_id, ctx.variant.id).await?;
                    self.gateway.mark_assignment_sent(ctx.test_id, recipient.id).await?;
                }

                Ok(RecipientOutcome {
                    domain,
                    is_permanent_reject: false,
                    counted_toward_window: true,
                })
            }
            SendResult::Rejected(DeliveryError::TemporaryDefer(_)) | SendResult::Rejected(DeliveryError::NetworkError(_)) => {
                self.enqueue_retry(campaign.org, campaign.id, recipient.clone(), variant.clone(), 1);
                Ok(RecipientOutcome {
                    domain,
                    is_permanent_reject: false,
                    counted_toward_window: false,
                })
            }
            SendResult::Rejected(DeliveryError::RateLimitedUpstream(_)) => {
                self.throttle.apply_backpressure(campaign.org, &domain, 60);
                self.enqueue_retry(campaign.org, campaign.id, recipient.clone(), variant.clone(), 1);
                Ok(RecipientOutcome {
                    domain,
                    is_permanent_reject: false,
                    counted_toward_window: false,
                })
            }
            SendResult::Rejected(err) => {
                let event = TrackingEvent::new(campaign.id, recipient.id, email_id.as_str(), TrackingEventKind::Failed)
                    .with_metadata(crate::models::tracking::TrackingEventMetadata {
                        error: Some(err.to_string()),
                        ..Default::default()
                    });
                let entry = SuppressionEntry::new(
                    campaign.org,
                    SuppressionScope::Email,
                    recipient.email.clone(),
                    SuppressionReason::InvalidAddress,
                    "delivery_adapter",
                );
                self.gateway.suppress_and_record(entry.clone(), event).await?;
                self.suppression.apply_add(campaign.org, &entry);
                Ok(RecipientOutcome {
                    domain,
                    is_permanent_reject: true,
                    counted_toward_window: true,
                })
            }
        }
    }

    /// Increments the sent variant's own counter and persists the owning
    /// test (design §4.6 step 5 "variant counters are incremented",
    /// §8 invariant 1).
    async fn credit_variant_send(&self, org: Uuid, test_id: Uuid, variant_id: Uuid) -> Result<(), AppError> {
        let mut test = self.gateway.get_ab_test(org, test_id).await?;
        if let Some(variant) = test.variants.iter_mut().find(|v| v.id == variant_id) {
            variant.sent += 1;
        }
        self.gateway.upsert_ab_test(test).await?;
        Ok(())
    }

    fn build_envelope(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        variant: Option<&Variant>,
        email_id: &str,
    ) -> Envelope {
        let subject = variant
            .and_then(|v| v.subject.clone())
            .unwrap_or_else(|| campaign.content.subject.clone());
        let from_name = variant
            .and_then(|v| v.from_name.clone())
            .unwrap_or_else(|| campaign.content.from_name.clone());
        let html_body = variant.and_then(|v| v.html.clone()).unwrap_or_else(|| campaign.content.html.clone());

        let pixel_url = self.open_pixel_url(campaign, recipient, email_id);
        let html = inject_tracking(&html_body, self, campaign, recipient, email_id, &pixel_url);

        Envelope {
            to: recipient.email.clone(),
            from: format!("{} <{}>", from_name, campaign.content.from_email),
            reply_to: campaign.content.reply_to.clone(),
            subject,
            html,
            text: variant.and_then(|v| v.text.clone()).or_else(|| campaign.content.text.clone()),
            headers: HashMap::new(),
            tracking_enabled: true,
            message_id: Some(email_id.to_string()),
        }
    }

    fn open_pixel_url(&self, campaign: &Campaign, recipient: &Recipient, email_id: &str) -> String {
        let payload = TrackingPayload {
            org: campaign.org,
            campaign: campaign.id,
            recipient: recipient.id,
            email_id: email_id.to_string(),
            target_url: None,
        };
        format!("{}/track/open/{}", self.tracking_url, self.signer.sign(&payload))
    }

    fn click_url(&self, campaign: &Campaign, recipient: &Recipient, email_id: &str, target: &str) -> String {
        let payload = TrackingPayload {
            org: campaign.org,
            campaign: campaign.id,
            recipient: recipient.id,
            email_id: email_id.to_string(),
            target_url: Some(target.to_string()),
        };
        format!("{}/track/click/{}", self.tracking_url, self.signer.sign(&payload))
    }

    fn enqueue_retry(&self, org: Uuid, campaign: Uuid, recipient: Recipient, variant: Option<VariantContext>, attempt: u32) {
        if attempt > RETRY_MAX_ATTEMPTS {
            return;
        }
        let next_attempt_at = Utc::now() + backoff_delay(attempt);
        self.retry_buffer.lock().push_back(PendingRetry {
            org,
            campaign,
            recipient,
            variant,
            attempt,
            next_attempt_at,
        });
    }

    /// Drains due retries, called by the scheduler tick (design §4.10).
    pub async fn drain_retries(&self) -> Result<(), AppError> {
        let now = Utc::now();
        let due: Vec<PendingRetry> = {
            let mut buffer = self.retry_buffer.lock();
            let mut due = Vec::new();
            let mut remaining = VecDeque::new();
            while let Some(item) = buffer.pop_front() {
                if item.next_attempt_at <= now {
                    due.push(item);
                } else {
                    remaining.push_back(item);
                }
            }
            *buffer = remaining;
            due
        };

        for item in due {
            if self.suppression.is_suppressed(item.org, &item.recipient.email) {
                continue;
            }
            let decision = self.throttle.can_send(item.org, &item.recipient.email);
            if !decision.allowed {
                self.enqueue_retry(item.org, item.campaign, item.recipient, item.variant, item.attempt + 1);
                continue;
            }
            let mut campaign = self.gateway.get_campaign(item.org, item.campaign).await?;
            self.process_one(&mut campaign, item.recipient, item.variant).await?;
        }
        Ok(())
    }

    pub fn retry_buffer_len(&self) -> usize {
        self.retry_buffer.lock().len()
    }

    fn publish(&self, campaign: &Campaign, kind: &str, summary: serde_json::Value) {
        self.events.publish(crate::services::events::ChangeEvent::new(campaign.id, kind, summary));
    }
}

struct RecipientOutcome {
    domain: String,
    is_permanent_reject: bool,
    counted_toward_window: bool,
}

fn inject_tracking(
    html: &str,
    dispatcher: &Dispatcher,
    campaign: &Campaign,
    recipient: &Recipient,
    email_id: &str,
    pixel_url: &str,
) -> String {
    // Rewrite href attributes into signed click URLs, then append the
    // open pixel (design §4.1, §4.5).
    let mut rewritten = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find("href=\"") {
        rewritten.push_str(&rest[..start]);
        let after_quote = &rest[start + 6..];
        if let Some(end) = after_quote.find('"') {
            let target = &after_quote[..end];
            if target.starts_with("http://") || target.starts_with("https://") {
                let tracked = dispatcher.click_url(campaign, recipient, email_id, target);
                rewritten.push_str("href=\"");
                rewritten.push_str(&tracked);
                rewritten.push('"');
            } else {
                rewritten.push_str("href=\"");
                rewritten.push_str(target);
                rewritten.push('"');
            }
            rest = &after_quote[end + 1..];
        } else {
            rewritten.push_str("href=\"");
            rest = after_quote;
        }
    }
    rewritten.push_str(rest);
    rewritten.push_str(&format!(
        "<img src=\"{pixel_url}\" width=\"1\" height=\"1\" alt=\"\" />"
    ));
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::gateway::memory::InMemoryGateway;
    use crate::models::{CampaignAudience, CampaignContent};

    fn content() -> CampaignContent {
        CampaignContent {
            subject: "Hi".into(),
            from_name: "Acme".into(),
            from_email: "acme@example.com".into(),
            reply_to: None,
            html: "<p>hi <a href=\"https://example.com/deal\">deal</a></p>".into(),
            text: None,
            tracking_domain: "track.example.com".into(),
        }
    }

    fn make_dispatcher(gateway: Arc<dyn PersistenceGateway>) -> Dispatcher {
        let suppression = Arc::new(SuppressionIndex::new(gateway.clone()));
        let throttle = Arc::new(ThrottleCore::new(ThrottleLimits {
            hourly: 100_000,
            daily: 1_000_000,
            burst: 100_000,
        }));
        let resolver = Arc::new(RecipientResolver::new(gateway.clone()));
        let mut transports = TransportRegistry::new();
        transports.register(Arc::new(AlwaysAccept));
        let events = Arc::new(crate::services::events::EventBus::new());
        let signer = Arc::new(UrlSigner::new(b"secret", None::<&[u8]>));
        Dispatcher::new(
            gateway,
            suppression,
            throttle,
            resolver,
            Arc::new(transports),
            events,
            signer,
            "https://track.example.com".into(),
        )
        .without_pacing()
    }

    struct AlwaysAccept;
    #[async_trait::async_trait]
    impl crate::delivery::Transport for AlwaysAccept {
        fn name(&self) -> &'static str {
            "test"
        }
        async fn send(&self, _envelope: Envelope) -> SendResult {
            SendResult::Accepted {
                provider_message_id: "test-1".into(),
            }
        }
    }

    #[tokio::test]
    async fn simple_send_reaches_all_confirmed_recipients() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
        let org = Uuid::new_v4();
        let list = Uuid::new_v4();
        for email in ["a@x.com", "b@y.com", "c@x.com"] {
            let mut r = Recipient::new(org, Some(list), email);
            r.status = RecipientStatus::Confirmed;
            gateway.upsert_recipient(r).await.unwrap();
        }

        let mut campaign = Campaign::new(org, CampaignAudience::List(list), content());
        campaign.transition(CampaignStatus::Scheduled).unwrap();
        campaign = gateway.upsert_campaign(campaign).await.unwrap();

        let dispatcher = make_dispatcher(gateway.clone());
        let finished = dispatcher.send_campaign(campaign).await.unwrap();

        assert_eq!(finished.status, CampaignStatus::Completed);
        assert_eq!(finished.sent, 3);
    }

    #[tokio::test]
    async fn segment_audience_resolves_through_the_stored_predicate() {
        use crate::gateway::memory::InMemoryGateway;
        use crate::models::segment::{SegmentClause, SegmentField, SegmentOperator, SegmentPredicate};

        let memory_gateway = InMemoryGateway::new();
        let org = Uuid::new_v4();
        let segment = Uuid::new_v4();
        for (email, plan) in [("a@x.com", "pro"), ("b@y.com", "free")] {
            let mut r = Recipient::new(org, None, email);
            r.status = RecipientStatus::Confirmed;
            r.custom_fields = serde_json::json!({"plan": plan});
            memory_gateway.upsert_recipient(r).await.unwrap();
        }
        memory_gateway.put_segment_predicate(
            org,
            segment,
            SegmentPredicate {
                clauses: vec![SegmentClause {
                    field: SegmentField::parse("custom.plan"),
                    operator: SegmentOperator::Equals,
                    value: crate::models::segment::AttributeValue::String("pro".into()),
                }],
            },
        );

        let gateway: Arc<dyn PersistenceGateway> = Arc::new(memory_gateway);
        let mut campaign = Campaign::new(org, CampaignAudience::Segment(segment), content());
        campaign.transition(CampaignStatus::Scheduled).unwrap();
        campaign = gateway.upsert_campaign(campaign).await.unwrap();

        let dispatcher = make_dispatcher(gateway.clone());
        let finished = dispatcher.send_campaign(campaign).await.unwrap();

        assert_eq!(finished.status, CampaignStatus::Completed);
        assert_eq!(finished.sent, 1);
    }

    #[tokio::test]
    async fn suppressed_recipient_never_consumes_a_throttle_token() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
        let org = Uuid::new_v4();
        let list = Uuid::new_v4();
        for email in ["a@x.com", "b@y.com"] {
            let mut r = Recipient::new(org, Some(list), email);
            r.status = RecipientStatus::Confirmed;
            gateway.upsert_recipient(r).await.unwrap();
        }

        let mut campaign = Campaign::new(org, CampaignAudience::List(list), content());
        campaign.transition(CampaignStatus::Scheduled).unwrap();
        campaign = gateway.upsert_campaign(campaign).await.unwrap();

        let dispatcher = make_dispatcher(gateway.clone());
        dispatcher
            .suppression
            .add(
                org,
                crate::models::SuppressionScope::Email,
                "b@y.com",
                crate::models::SuppressionReason::Manual,
                "admin",
            )
            .await
            .unwrap();

        let finished = dispatcher.send_campaign(campaign).await.unwrap();
        assert_eq!(finished.sent, 1);
        let events = gateway.list_events(finished.id).await.unwrap();
        assert!(events.iter().any(|e| e.kind == TrackingEventKind::Suppressed));
    }

    fn test_variant(id: Uuid, test_id: Uuid, name: &str, is_control: bool) -> crate::models::ab_test::Variant {
        crate::models::ab_test::Variant {
            id,
            test: test_id,
            name: name.into(),
            label: name.into(),
            subject: Some(format!("{name} subject")),
            from_name: None,
            preheader: None,
            html: Some("<p>hi</p>".into()),
            text: None,
            cta_label: None,
            cta_url: None,
            send_hour: None,
            send_day: None,
            split_percent: 50,
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
            revenue: rust_decimal::Decimal::ZERO,
            confidence_score: None,
            lift_vs_control: None,
            significant: false,
        }
    }

    #[tokio::test]
    async fn ab_test_cohort_dispatch_credits_variants_and_moves_to_waiting() {
        use crate::models::ab_test::{AbTest, AbTestType, WinnerMetric};

        let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
        let org = Uuid::new_v4();
        let test_id = Uuid::new_v4();

        let mut campaign = Campaign::new(org, CampaignAudience::AbTest(test_id), content());
        campaign.transition(CampaignStatus::Scheduled).unwrap();
        campaign = gateway.upsert_campaign(campaign).await.unwrap();

        let control_id = Uuid::new_v4();
        let treatment_id = Uuid::new_v4();
        let test = AbTest {
            id: test_id,
            org,
            campaign: Some(campaign.id),
            test_type: AbTestType::Subject,
            sample_percent: 100,
            winner_metric: WinnerMetric::OpenRate,
            winner_wait_hours: 4,
            confidence_threshold: 0.95,
            min_sample: 1,
            status: AbTestStatus::Testing,
            variants: vec![
                test_variant(control_id, test_id, "control", true),
                test_variant(treatment_id, test_id, "b", false),
            ],
            winner_variant: None,
            audience_size: 2,
            test_sample_size: 2,
            started_at: Some(Utc::now()),
            created_at: Utc::now(),
        };
        gateway.upsert_ab_test(test).await.unwrap();

        let recipient_a = Recipient::new(org, None, "a@x.com");
        let recipient_b = Recipient::new(org, None, "b@x.com");
        gateway.upsert_recipient(recipient_a.clone()).await.unwrap();
        gateway.upsert_recipient(recipient_b.clone()).await.unwrap();
        gateway
            .insert_assignments(vec![
                Assignment {
                    test: test_id,
                    variant: control_id,
                    recipient: recipient_a.id,
                    cohort: Cohort::Test,
                    status: AssignmentStatus::Pending,
                    sent_at: None,
                },
                Assignment {
                    test: test_id,
                    variant: treatment_id,
                    recipient: recipient_b.id,
                    cohort: Cohort::Test,
                    status: AssignmentStatus::Pending,
                    sent_at: None,
                },
            ])
            .await
            .unwrap();

        let dispatcher = make_dispatcher(gateway.clone());
        let finished = dispatcher.send_campaign(campaign).await.unwrap();

        assert_eq!(finished.status, CampaignStatus::Waiting);
        assert_eq!(finished.sent, 2);

        let updated_test = gateway.get_ab_test(org, test_id).await.unwrap();
        assert_eq!(updated_test.status, AbTestStatus::Waiting);
        for variant in &updated_test.variants {
            assert_eq!(variant.sent, 1);
        }

        let assignments = gateway.list_assignments(test_id).await.unwrap();
        assert!(assignments.iter().all(|a| a.status == AssignmentStatus::Sent));
    }

    struct AlwaysRejectPermanent;
    #[async_trait::async_trait]
    impl crate::delivery::Transport for AlwaysRejectPermanent {
        fn name(&self) -> &'static str {
            "test"
        }
        async fn send(&self, _envelope: Envelope) -> SendResult {
            SendResult::Rejected(DeliveryError::PermanentReject("mailbox does not exist".into()))
        }
    }

    #[tokio::test]
    async fn permanent_reject_adds_recipient_to_suppression() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
        let org = Uuid::new_v4();
        let list = Uuid::new_v4();
        let mut r = Recipient::new(org, Some(list), "bad@x.com");
        r.status = RecipientStatus::Confirmed;
        gateway.upsert_recipient(r).await.unwrap();

        let mut campaign = Campaign::new(org, CampaignAudience::List(list), content());
        campaign.transition(CampaignStatus::Scheduled).unwrap();
        campaign = gateway.upsert_campaign(campaign).await.unwrap();

        let suppression = Arc::new(SuppressionIndex::new(gateway.clone()));
        let throttle = Arc::new(ThrottleCore::new(ThrottleLimits {
            hourly: 100_000,
            daily: 1_000_000,
            burst: 100_000,
        }));
        let resolver = Arc::new(RecipientResolver::new(gateway.clone()));
        let mut transports = TransportRegistry::new();
        transports.register(Arc::new(AlwaysRejectPermanent));
        let events = Arc::new(crate::services::events::EventBus::new());
        let signer = Arc::new(UrlSigner::new(b"secret", None::<&[u8]>));
        let dispatcher = Dispatcher::new(
            gateway.clone(),
            suppression.clone(),
            throttle,
            resolver,
            Arc::new(transports),
            events,
            signer,
            "https://track.example.com".into(),
        )
        .without_pacing();

        dispatcher.send_campaign(campaign).await.unwrap();

        assert!(suppression.is_suppressed(org, "bad@x.com"));
        let entries = gateway.list_suppressions(org).await.unwrap();
        assert!(entries.iter().any(|e| e.value == "bad@x.com" && e.active));
    }
}

//! In-memory persistence gateway.
//!
//! The donor plugin's models are plain structs with no live database in
//! this pack (design SPEC_FULL note); an in-memory fake behind the same
//! trait the `sqlx` backend implements is the idiomatic stand-in and is
//! what the rest of the unit test suite exercises.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::PersistenceGateway;
use crate::models::segment::SegmentPredicate;
use crate::models::{
    AbTest, Assignment, Campaign, Recipient, SuppressionEntry, SuppressionScope, TrackingEvent,
    TrackingEventKind,
};

#[derive(Default)]
struct Store {
    campaigns: HashMap<Uuid, Campaign>,
    recipients: HashMap<Uuid, Recipient>,
    suppressions: HashMap<Uuid, SuppressionEntry>,
    ab_tests: HashMap<Uuid, AbTest>,
    assignments: HashMap<(Uuid, Uuid), Assignment>,
    events: HashMap<(Uuid, String, TrackingEventKindKey), TrackingEvent>,
    segments: HashMap<Uuid, (Uuid, SegmentPredicate)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TrackingEventKindKey(u8);

impl From<TrackingEventKind> for TrackingEventKindKey {
    fn from(kind: TrackingEventKind) -> Self {
        Self(kind as u8)
    }
}

pub struct InMemoryGateway {
    store: Arc<Mutex<Store>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
        }
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    /// Test/seed helper: stores a segment's compiled predicate directly,
    /// standing in for the external segmentation engine's output.
    pub fn put_segment_predicate(&self, org: Uuid, segment: Uuid, predicate: SegmentPredicate) {
        self.store.lock().segments.insert(segment, (org, predicate));
    }
}

fn not_found(what: &str, id: Uuid) -> AppError {
    AppError::NotFound(format!("{what} {id}"))
}

fn guard_org(entity_org: Uuid, requested_org: Uuid, what: &str, id: Uuid) -> Result<(), AppError> {
    if entity_org != requested_org {
        return Err(not_found(what, id));
    }
    Ok(())
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn list_orgs(&self) -> Result<Vec<Uuid>, AppError> {
        let store = self.store.lock();
        let mut orgs: Vec<Uuid> = store.campaigns.values().map(|c| c.org).collect();
        orgs.sort();
        orgs.dedup();
        Ok(orgs)
    }

    async fn get_campaign(&self, org: Uuid, id: Uuid) -> Result<Campaign, AppError> {
        let store = self.store.lock();
        let campaign = store.campaigns.get(&id).ok_or_else(|| not_found("campaign", id))?;
        guard_org(campaign.org, org, "campaign", id)?;
        Ok(campaign.clone())
    }

    async fn upsert_campaign(&self, campaign: Campaign) -> Result<Campaign, AppError> {
        let mut store = self.store.lock();
        store.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn list_campaigns(&self, org: Uuid) -> Result<Vec<Campaign>, AppError> {
        let store = self.store.lock();
        Ok(store.campaigns.values().filter(|c| c.org == org).cloned().collect())
    }

    async fn get_recipient(&self, org: Uuid, id: Uuid) -> Result<Recipient, AppError> {
        let store = self.store.lock();
        let recipient = store.recipients.get(&id).ok_or_else(|| not_found("recipient", id))?;
        guard_org(recipient.org, org, "recipient", id)?;
        Ok(recipient.clone())
    }

    async fn upsert_recipient(&self, recipient: Recipient) -> Result<Recipient, AppError> {
        let mut store = self.store.lock();
        store.recipients.insert(recipient.id, recipient.clone());
        Ok(recipient)
    }

    async fn list_recipients(&self, org: Uuid) -> Result<Vec<Recipient>, AppError> {
        let store = self.store.lock();
        Ok(store.recipients.values().filter(|r| r.org == org).cloned().collect())
    }

    async fn list_recipients_by_list(&self, org: Uuid, list: Uuid) -> Result<Vec<Recipient>, AppError> {
        let store = self.store.lock();
        Ok(store
            .recipients
            .values()
            .filter(|r| r.org == org && r.list == Some(list))
            .cloned()
            .collect())
    }

    async fn find_recipient_by_email(&self, org: Uuid, email: &str) -> Result<Option<Recipient>, AppError> {
        let email = email.to_lowercase();
        let store = self.store.lock();
        Ok(store
            .recipients
            .values()
            .find(|r| r.org == org && r.email == email)
            .cloned())
    }

    async fn get_segment_predicate(&self, org: Uuid, segment: Uuid) -> Result<SegmentPredicate, AppError> {
        let store = self.store.lock();
        let (seg_org, predicate) = store
            .segments
            .get(&segment)
            .ok_or_else(|| not_found("segment", segment))?;
        guard_org(*seg_org, org, "segment", segment)?;
        Ok(predicate.clone())
    }

    async fn list_suppressions(&self, org: Uuid) -> Result<Vec<SuppressionEntry>, AppError> {
        let store = self.store.lock();
        Ok(store.suppressions.values().filter(|e| e.org == org).cloned().collect())
    }

    async fn add_suppression(&self, entry: SuppressionEntry) -> Result<SuppressionEntry, AppError> {
        let mut store = self.store.lock();
        store.suppressions.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn remove_suppression(&self, org: Uuid, scope: SuppressionScope, value: &str) -> Result<(), AppError> {
        let mut store = self.store.lock();
        for entry in store.suppressions.values_mut() {
            if entry.org == org && entry.scope == scope && entry.value == value {
                entry.active = false;
            }
        }
        Ok(())
    }

    async fn suppress_and_record(
        &self,
        entry: SuppressionEntry,
        event: TrackingEvent,
    ) -> Result<(), AppError> {
        let mut store = self.store.lock();
        store.suppressions.insert(entry.id, entry);
        let key = (event.campaign, event.email_id.clone(), event.kind.into());
        store.events.insert(key, event);
        Ok(())
    }

    async fn get_ab_test(&self, org: Uuid, id: Uuid) -> Result<AbTest, AppError> {
        let store = self.store.lock();
        let test = store.ab_tests.get(&id).ok_or_else(|| not_found("ab_test", id))?;
        guard_org(test.org, org, "ab_test", id)?;
        Ok(test.clone())
    }

    async fn upsert_ab_test(&self, test: AbTest) -> Result<AbTest, AppError> {
        let mut store = self.store.lock();
        store.ab_tests.insert(test.id, test.clone());
        Ok(test)
    }

    async fn list_ab_tests(&self, org: Uuid) -> Result<Vec<AbTest>, AppError> {
        let store = self.store.lock();
        Ok(store.ab_tests.values().filter(|t| t.org == org).cloned().collect())
    }

    async fn insert_assignments(&self, assignments: Vec<Assignment>) -> Result<(), AppError> {
        let mut store = self.store.lock();
        for assignment in assignments {
            store
                .assignments
                .insert((assignment.test, assignment.recipient), assignment);
        }
        Ok(())
    }

    async fn get_assignment(&self, test: Uuid, recipient: Uuid) -> Result<Option<Assignment>, AppError> {
        let store = self.store.lock();
        Ok(store.assignments.get(&(test, recipient)).cloned())
    }

    async fn list_assignments(&self, test: Uuid) -> Result<Vec<Assignment>, AppError> {
        let store = self.store.lock();
        Ok(store
            .assignments
            .values()
            .filter(|a| a.test == test)
            .cloned()
            .collect())
    }

    async fn mark_assignment_sent(&self, test: Uuid, recipient: Uuid) -> Result<(), AppError> {
        let mut store = self.store.lock();
        if let Some(assignment) = store.assignments.get_mut(&(test, recipient)) {
            assignment.status = crate::models::ab_test::AssignmentStatus::Sent;
            assignment.sent_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn record_event(&self, event: TrackingEvent) -> Result<bool, AppError> {
        let mut store = self.store.lock();
        let key = (event.campaign, event.email_id.clone(), event.kind.into());
        if store.events.contains_key(&key) {
            return Ok(false);
        }
        store.events.insert(key, event);
        Ok(true)
    }

    async fn list_events(&self, campaign: Uuid) -> Result<Vec<TrackingEvent>, AppError> {
        let store = self.store.lock();
        Ok(store
            .events
            .values()
            .filter(|e| e.campaign == campaign)
            .cloned()
            .collect())
    }

    async fn has_event(
        &self,
        campaign: Uuid,
        recipient: Uuid,
        kind: TrackingEventKind,
    ) -> Result<bool, AppError> {
        let store = self.store.lock();
        Ok(store
            .events
            .values()
            .any(|e| e.campaign == campaign && e.recipient == recipient && e.kind == kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Campaign, CampaignAudience, CampaignContent};

    fn content() -> CampaignContent {
        CampaignContent {
            subject: "Hi".into(),
            from_name: "Acme".into(),
            from_email: "acme@example.com".into(),
            reply_to: None,
            html: "<p>hi</p>".into(),
            text: None,
            tracking_domain: "track.example.com".into(),
        }
    }

    #[tokio::test]
    async fn cross_org_read_is_rejected() {
        let gateway = InMemoryGateway::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let campaign = Campaign::new(org_a, CampaignAudience::List(Uuid::new_v4()), content());
        let id = campaign.id;
        gateway.upsert_campaign(campaign).await.unwrap();

        assert!(gateway.get_campaign(org_a, id).await.is_ok());
        assert!(gateway.get_campaign(org_b, id).await.is_err());
    }

    #[tokio::test]
    async fn event_recording_is_idempotent() {
        let gateway = InMemoryGateway::new();
        let campaign = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let event = TrackingEvent::new(campaign, recipient, "e1", TrackingEventKind::Opened);
        assert!(gateway.record_event(event.clone()).await.unwrap());
        let mut replay = event.clone();
        replay.id = Uuid::new_v4();
        assert!(!gateway.record_event(replay).await.unwrap());
        assert_eq!(gateway.list_events(campaign).await.unwrap().len(), 1);
    }
}

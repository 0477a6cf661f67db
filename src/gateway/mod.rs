//! Persistence Gateway (C11, design §4.11).
//!
//! Every read and write funnels through named, org-scoped operations;
//! the concrete relational schema is external per the spec's Non-goals.
//! `PersistenceGateway` is the trait both the real `sqlx` backend and
//! the in-memory test double implement, the same shape the donor
//! plugin's `PaymentGateway` trait gives each vendor integration.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::segment::SegmentPredicate;
use crate::models::{
    AbTest, Assignment, Campaign, Recipient, SuppressionEntry, SuppressionScope, TrackingEvent,
};

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Every org with at least one campaign, used by the scheduler to
    /// know which orgs to tick (design §4.10).
    async fn list_orgs(&self) -> Result<Vec<Uuid>, AppError>;

    // Campaigns
    async fn get_campaign(&self, org: Uuid, id: Uuid) -> Result<Campaign, AppError>;
    async fn upsert_campaign(&self, campaign: Campaign) -> Result<Campaign, AppError>;
    async fn list_campaigns(&self, org: Uuid) -> Result<Vec<Campaign>, AppError>;

    // Recipients
    async fn get_recipient(&self, org: Uuid, id: Uuid) -> Result<Recipient, AppError>;
    async fn upsert_recipient(&self, recipient: Recipient) -> Result<Recipient, AppError>;
    async fn list_recipients(&self, org: Uuid) -> Result<Vec<Recipient>, AppError>;
    async fn list_recipients_by_list(&self, org: Uuid, list: Uuid) -> Result<Vec<Recipient>, AppError>;
    async fn find_recipient_by_email(&self, org: Uuid, email: &str) -> Result<Option<Recipient>, AppError>;

    /// Fetches the compiled predicate a segment reference resolves to.
    /// The segmentation engine that compiles segment expressions into
    /// this predicate is external (spec.md Non-goals); the gateway only
    /// stores and returns its output.
    async fn get_segment_predicate(&self, org: Uuid, segment: Uuid) -> Result<SegmentPredicate, AppError>;

    // Suppression
    async fn list_suppressions(&self, org: Uuid) -> Result<Vec<SuppressionEntry>, AppError>;
    async fn add_suppression(&self, entry: SuppressionEntry) -> Result<SuppressionEntry, AppError>;
    async fn remove_suppression(&self, org: Uuid, scope: SuppressionScope, value: &str) -> Result<(), AppError>;

    /// Transactional: suppression add + event write together (design
    /// §4.11 (a)).
    async fn suppress_and_record(
        &self,
        entry: SuppressionEntry,
        event: TrackingEvent,
    ) -> Result<(), AppError>;

    // A/B tests
    async fn get_ab_test(&self, org: Uuid, id: Uuid) -> Result<AbTest, AppError>;
    async fn upsert_ab_test(&self, test: AbTest) -> Result<AbTest, AppError>;
    async fn list_ab_tests(&self, org: Uuid) -> Result<Vec<AbTest>, AppError>;

    /// Transactional: assignment insert on A/B sample partitioning
    /// (design §4.11 (b)).
    async fn insert_assignments(&self, assignments: Vec<Assignment>) -> Result<(), AppError>;
    async fn get_assignment(&self, test: Uuid, recipient: Uuid) -> Result<Option<Assignment>, AppError>;
    async fn list_assignments(&self, test: Uuid) -> Result<Vec<Assignment>, AppError>;
    async fn mark_assignment_sent(&self, test: Uuid, recipient: Uuid) -> Result<(), AppError>;

    // Tracking events
    async fn record_event(&self, event: TrackingEvent) -> Result<bool, AppError>;
    async fn list_events(&self, campaign: Uuid) -> Result<Vec<TrackingEvent>, AppError>;
    async fn has_event(
        &self,
        campaign: Uuid,
        recipient: Uuid,
        kind: crate::models::TrackingEventKind,
    ) -> Result<bool, AppError>;
}

//! Recipient Resolver (C4, design §4.4).
//!
//! Expands a campaign's audience into an ordered, restartable recipient
//! stream. The segmentation engine itself is external; this consumes
//! only the compiled [`SegmentPredicate`] it returns.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::PersistenceGateway;
use crate::models::segment::{AttributeSource, AttributeValue};
use crate::models::{Recipient, RecipientStatus, SegmentPredicate};

/// Recipient-as-attribute-source, the typed accessor design §9 calls for:
/// known columns resolve directly, everything else falls through to the
/// custom-fields document.
impl AttributeSource for Recipient {
    fn column(&self, name: &str) -> AttributeValue {
        match name {
            "email" => AttributeValue::String(self.email.clone()),
            "status" => AttributeValue::String(format!("{:?}", self.status).to_lowercase()),
            "engagement_score" => AttributeValue::Number(self.engagement_score),
            "total_sent" => AttributeValue::Number(self.total_sent as f64),
            "total_opens" => AttributeValue::Number(self.total_opens as f64),
            "total_clicks" => AttributeValue::Number(self.total_clicks as f64),
            "last_open_at" => self
                .last_open_at
                .map(AttributeValue::DateTime)
                .unwrap_or(AttributeValue::Null),
            "last_click_at" => self
                .last_click_at
                .map(AttributeValue::DateTime)
                .unwrap_or(AttributeValue::Null),
            _ => AttributeValue::Null,
        }
    }

    fn custom(&self, key: &str) -> AttributeValue {
        self.custom_fields
            .get(key)
            .map(AttributeValue::from_json)
            .unwrap_or(AttributeValue::Null)
    }
}

pub struct RecipientResolver {
    gateway: Arc<dyn PersistenceGateway>,
}

impl RecipientResolver {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Confirmed subscribers of a list, in stable (id) order (design
    /// §4.4). The ordering plus only reading `status == confirmed` is
    /// what makes the stream restartable: a resumed dispatcher sees the
    /// same recipients up to ones whose status has since changed.
    pub async fn resolve_list(&self, org: Uuid, list: Uuid) -> Result<Vec<Recipient>, AppError> {
        let mut recipients = self.gateway.list_recipients_by_list(org, list).await?;
        recipients.retain(|r| r.status == RecipientStatus::Confirmed);
        recipients.sort_by_key(|r| r.id);
        Ok(recipients)
    }

    /// Evaluate a compiled predicate over every recipient in the org.
    pub async fn resolve_segment(
        &self,
        org: Uuid,
        predicate: &SegmentPredicate,
    ) -> Result<Vec<Recipient>, AppError> {
        let mut recipients = self.gateway.list_recipients(org).await?;
        let now = Utc::now();
        recipients.retain(|r| r.status == RecipientStatus::Confirmed && predicate.matches(r, now));
        recipients.sort_by_key(|r| r.id);
        Ok(recipients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::InMemoryGateway;
    use crate::models::segment::{SegmentClause, SegmentField, SegmentOperator};

    #[tokio::test]
    async fn list_resolution_excludes_unconfirmed_and_sorts_stably() {
        let gateway = Arc::new(InMemoryGateway::new());
        let org = Uuid::new_v4();
        let list = Uuid::new_v4();
        let mut confirmed = Recipient::new(org, Some(list), "a@x.com");
        confirmed.status = RecipientStatus::Confirmed;
        let mut pending = Recipient::new(org, Some(list), "b@x.com");
        pending.status = RecipientStatus::Pending;
        gateway.upsert_recipient(confirmed.clone()).await.unwrap();
        gateway.upsert_recipient(pending).await.unwrap();

        let resolver = RecipientResolver::new(gateway);
        let resolved = resolver.resolve_list(org, list).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, confirmed.id);
    }

    #[tokio::test]
    async fn segment_predicate_filters_by_custom_field() {
        let gateway = Arc::new(InMemoryGateway::new());
        let org = Uuid::new_v4();
        let mut pro = Recipient::new(org, None, "pro@x.com");
        pro.status = RecipientStatus::Confirmed;
        pro.custom_fields = serde_json::json!({"plan": "pro"});
        let mut free = Recipient::new(org, None, "free@x.com");
        free.status = RecipientStatus::Confirmed;
        free.custom_fields = serde_json::json!({"plan": "free"});
        gateway.upsert_recipient(pro.clone()).await.unwrap();
        gateway.upsert_recipient(free).await.unwrap();

        let predicate = SegmentPredicate {
            clauses: vec![SegmentClause {
                field: SegmentField::parse("custom.plan"),
                operator: SegmentOperator::Equals,
                value: AttributeValue::String("pro".into()),
            }],
        };

        let resolver = RecipientResolver::new(gateway);
        let resolved = resolver.resolve_segment(org, &predicate).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, pro.id);
    }
}

//! Suppression entry entity (design §3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionScope {
    Email,
    Domain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Bounced,
    Complained,
    Unsubscribed,
    Manual,
    InvalidAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub id: Uuid,
    pub org: Uuid,
    pub scope: SuppressionScope,
    pub value: String,
    pub reason: SuppressionReason,
    pub source: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn new(
        org: Uuid,
        scope: SuppressionScope,
        value: impl Into<String>,
        reason: SuppressionReason,
        source: impl Into<String>,
    ) -> Self {
        let value = match scope {
            SuppressionScope::Email => value.into().trim().to_lowercase(),
            SuppressionScope::Domain => value.into().trim().to_lowercase(),
        };
        Self {
            id: Uuid::new_v4(),
            org,
            scope,
            value,
            reason,
            source: source.into(),
            active: true,
            created_at: Utc::now(),
        }
    }
}

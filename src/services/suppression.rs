//! Suppression Index (C2, design §4.2).
//!
//! A process-local set mirrored from storage. `parking_lot::RwLock`
//! guards it the way the donor plugin guards its in-process state
//! (`RustCommercePlugin`'s `RwLock<PluginState>`): readers take a
//! shared lock, writers take an exclusive one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::gateway::PersistenceGateway;
use crate::models::{SuppressionEntry, SuppressionReason, SuppressionScope};

#[derive(Default)]
struct OrgSet {
    emails: HashSet<String>,
    domains: HashSet<String>,
}

/// O(1) veto over email and domain suppression, checked before every
/// throttle accounting (design §4.2 invariant).
pub struct SuppressionIndex {
    gateway: Arc<dyn PersistenceGateway>,
    sets: RwLock<HashMap<Uuid, OrgSet>>,
}

impl SuppressionIndex {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            gateway,
            sets: RwLock::new(HashMap::new()),
        }
    }

    /// Load the in-memory mirror for one org from storage. Call once at
    /// startup and whenever an org is first seen.
    pub async fn hydrate(&self, org: Uuid) -> Result<(), crate::error::AppError> {
        let entries = self.gateway.list_suppressions(org).await?;
        let mut set = OrgSet::default();
        for entry in entries.into_iter().filter(|e| e.active) {
            match entry.scope {
                SuppressionScope::Email => {
                    set.emails.insert(entry.value);
                }
                SuppressionScope::Domain => {
                    set.domains.insert(entry.value);
                }
            }
        }
        self.sets.write().insert(org, set);
        Ok(())
    }

    pub fn is_suppressed(&self, org: Uuid, email: &str) -> bool {
        let email = email.to_lowercase();
        let domain = email.rsplit('@').next().unwrap_or("");
        let sets = self.sets.read();
        match sets.get(&org) {
            Some(set) => set.emails.contains(&email) || set.domains.contains(domain),
            None => false,
        }
    }

    /// Write through to storage and update the in-memory set atomically
    /// (design §4.2).
    pub async fn add(
        &self,
        org: Uuid,
        scope: SuppressionScope,
        value: &str,
        reason: SuppressionReason,
        source: &str,
    ) -> Result<SuppressionEntry, crate::error::AppError> {
        let entry = SuppressionEntry::new(org, scope, value, reason, source);
        self.gateway.add_suppression(entry.clone()).await?;
        self.apply_add(org, &entry);
        Ok(entry)
    }

    /// Used by the transactional bounce/complaint path (C11) once the
    /// gateway write has already happened, to keep the in-memory mirror
    /// in lock-step without a second write-through.
    pub fn apply_add(&self, org: Uuid, entry: &SuppressionEntry) {
        let mut sets = self.sets.write();
        let set = sets.entry(org).or_default();
        match entry.scope {
            SuppressionScope::Email => {
                set.emails.insert(entry.value.clone());
            }
            SuppressionScope::Domain => {
                set.domains.insert(entry.value.clone());
            }
        }
    }

    pub async fn remove(
        &self,
        org: Uuid,
        scope: SuppressionScope,
        value: &str,
    ) -> Result<(), crate::error::AppError> {
        let value = value.to_lowercase();
        self.gateway.remove_suppression(org, scope, &value).await?;
        let mut sets = self.sets.write();
        if let Some(set) = sets.get_mut(&org) {
            match scope {
                SuppressionScope::Email => {
                    set.emails.remove(&value);
                }
                SuppressionScope::Domain => {
                    set.domains.remove(&value);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::InMemoryGateway;

    #[tokio::test]
    async fn veto_applies_to_email_and_domain_scopes() {
        let gateway = Arc::new(InMemoryGateway::new());
        let index = SuppressionIndex::new(gateway);
        let org = Uuid::new_v4();

        assert!(!index.is_suppressed(org, "a@x.com"));
        index
            .add(org, SuppressionScope::Email, "a@x.com", SuppressionReason::Bounced, "webhook")
            .await
            .unwrap();
        assert!(index.is_suppressed(org, "A@X.com"));
        assert!(!index.is_suppressed(org, "b@x.com"));

        index
            .add(org, SuppressionScope::Domain, "y.com", SuppressionReason::Complained, "webhook")
            .await
            .unwrap();
        assert!(index.is_suppressed(org, "anyone@y.com"));
    }

    #[tokio::test]
    async fn remove_clears_veto() {
        let gateway = Arc::new(InMemoryGateway::new());
        let index = SuppressionIndex::new(gateway);
        let org = Uuid::new_v4();
        index
            .add(org, SuppressionScope::Email, "a@x.com", SuppressionReason::Manual, "admin")
            .await
            .unwrap();
        assert!(index.is_suppressed(org, "a@x.com"));
        index.remove(org, SuppressionScope::Email, "a@x.com").await.unwrap();
        assert!(!index.is_suppressed(org, "a@x.com"));
    }
}

//! Data model for the send pipeline.
//!
//! These are the entities described in the design's §3: organizations,
//! campaigns, recipients, suppression entries, A/B tests and variants,
//! throttle counters, and tracking events. The relational schema behind
//! them is an external concern (see [`crate::gateway`]); these structs
//! are the shapes every component agrees on.

pub mod ab_test;
pub mod campaign;
pub mod recipient;
pub mod segment;
pub mod suppression;
pub mod throttle;
pub mod tracking;

pub use ab_test::{AbTest, AbTestStatus, AbTestType, Assignment, Cohort, Variant};
pub use campaign::{Campaign, CampaignAudience, CampaignContent, CampaignStatus};
pub use recipient::{Recipient, RecipientStatus};
pub use segment::{AttributeValue, SegmentClause, SegmentOperator, SegmentPredicate};
pub use suppression::{SuppressionEntry, SuppressionReason, SuppressionScope};
pub use throttle::{ThrottleCounters, ThrottleKey, ThrottleLimits, ThrottleScope};
pub use tracking::{TrackingEvent, TrackingEventKind};

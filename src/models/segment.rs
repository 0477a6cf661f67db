//! Compiled segment predicates (design §4.4, §9 "attribute store with
//! typed accessor").
//!
//! The segmentation engine itself is an external collaborator; the core
//! only consumes a compiled predicate — a conjunction of clauses over a
//! column or a `custom.<key>` attribute. This module is that consumer
//! side: the clause/operator vocabulary and the typed accessor over a
//! recipient's custom-fields document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Gt,
    Lt,
    Gte,
    Lte,
    IsNull,
    IsNotNull,
    In,
    NotIn,
    InLastDays,
    MoreThanDaysAgo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Null,
}

impl AttributeValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    Self::DateTime(dt.with_timezone(&Utc))
                } else {
                    Self::String(s.clone())
                }
            }
            other => Self::String(other.to_string()),
        }
    }
}

/// A field reference: either a known column on the recipient or a key
/// inside the custom-fields JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentField {
    Column(String),
    Custom(String),
}

impl SegmentField {
    pub fn parse(field: &str) -> Self {
        match field.strip_prefix("custom.") {
            Some(key) => Self::Custom(key.to_string()),
            None => Self::Column(field.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentClause {
    pub field: SegmentField,
    pub operator: SegmentOperator,
    pub value: AttributeValue,
}

/// A compiled predicate: conjunction of clauses (design §4.4 — "a
/// conjunction of clauses").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentPredicate {
    pub clauses: Vec<SegmentClause>,
}

/// Anything the predicate compiler can read attributes off of. The
/// recipient's column values plus its custom-fields document implement
/// this; the accessor surfaces a typed value or `Null` for unknown keys.
pub trait AttributeSource {
    fn column(&self, name: &str) -> AttributeValue;
    fn custom(&self, key: &str) -> AttributeValue;
}

impl SegmentPredicate {
    pub fn matches(&self, source: &impl AttributeSource, now: DateTime<Utc>) -> bool {
        self.clauses.iter().all(|clause| clause.matches(source, now))
    }
}

impl SegmentClause {
    fn resolve<'a>(&self, source: &'a impl AttributeSource) -> AttributeValue {
        match &self.field {
            SegmentField::Column(name) => source.column(name),
            SegmentField::Custom(key) => source.custom(key),
        }
    }

    fn matches(&self, source: &impl AttributeSource, now: DateTime<Utc>) -> bool {
        let actual = self.resolve(source);
        match self.operator {
            SegmentOperator::IsNull => matches!(actual, AttributeValue::Null),
            SegmentOperator::IsNotNull => !matches!(actual, AttributeValue::Null),
            SegmentOperator::Equals => values_equal(&actual, &self.value),
            SegmentOperator::Contains => match (&actual, &self.value) {
                (AttributeValue::String(a), AttributeValue::String(b)) => a.contains(b.as_str()),
                _ => false,
            },
            SegmentOperator::StartsWith => match (&actual, &self.value) {
                (AttributeValue::String(a), AttributeValue::String(b)) => a.starts_with(b.as_str()),
                _ => false,
            },
            SegmentOperator::EndsWith => match (&actual, &self.value) {
                (AttributeValue::String(a), AttributeValue::String(b)) => a.ends_with(b.as_str()),
                _ => false,
            },
            SegmentOperator::Gt => numeric_cmp(&actual, &self.value).map(|o| o.is_gt()).unwrap_or(false),
            SegmentOperator::Lt => numeric_cmp(&actual, &self.value).map(|o| o.is_lt()).unwrap_or(false),
            SegmentOperator::Gte => numeric_cmp(&actual, &self.value).map(|o| o.is_ge()).unwrap_or(false),
            SegmentOperator::Lte => numeric_cmp(&actual, &self.value).map(|o| o.is_le()).unwrap_or(false),
            SegmentOperator::In => match (&actual, &self.value) {
                (AttributeValue::String(a), AttributeValue::String(list)) => {
                    list.split(',').any(|item| item.trim() == a)
                }
                _ => false,
            },
            SegmentOperator::NotIn => match (&actual, &self.value) {
                (AttributeValue::String(a), AttributeValue::String(list)) => {
                    !list.split(',').any(|item| item.trim() == a)
                }
                _ => true,
            },
            SegmentOperator::InLastDays => match (&actual, &self.value) {
                (AttributeValue::DateTime(at), AttributeValue::Number(days)) => {
                    let age = now.signed_duration_since(*at);
                    age.num_seconds() >= 0 && age.num_days() <= *days as i64
                }
                _ => false,
            },
            SegmentOperator::MoreThanDaysAgo => match (&actual, &self.value) {
                (AttributeValue::DateTime(at), AttributeValue::Number(days)) => {
                    now.signed_duration_since(*at).num_days() > *days as i64
                }
                _ => false,
            },
        }
    }
}

fn values_equal(a: &AttributeValue, b: &AttributeValue) -> bool {
    match (a, b) {
        (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
        (AttributeValue::Number(a), AttributeValue::Number(b)) => (a - b).abs() < f64::EPSILON,
        (AttributeValue::Bool(a), AttributeValue::Bool(b)) => a == b,
        (AttributeValue::DateTime(a), AttributeValue::DateTime(b)) => a == b,
        (AttributeValue::Null, AttributeValue::Null) => true,
        _ => false,
    }
}

fn numeric_cmp(a: &AttributeValue, b: &AttributeValue) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (AttributeValue::Number(a), AttributeValue::Number(b)) => a.partial_cmp(b),
        (AttributeValue::DateTime(a), AttributeValue::DateTime(b)) => a.partial_cmp(b),
        _ => None,
    }
}

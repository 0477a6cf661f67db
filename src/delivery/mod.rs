//! Delivery Adapter (C5): a uniform `Transport` capability over the
//! upstream vendor APIs, modeled directly on this codebase family's
//! `PaymentGateway` trait — one capability, one variant per provider,
//! a registry that looks one up by name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub mod mailgun;
pub mod pmta;
pub mod ses;
pub mod sendgrid;
pub mod smtp;
pub mod sparkpost;

/// Common error taxonomy every adapter maps its vendor-specific failures
/// onto (design §4.5, §7).
#[derive(Debug, Clone)]
pub enum DeliveryError {
    PermanentReject(String),
    TemporaryDefer(String),
    AuthFailed(String),
    RateLimitedUpstream(String),
    NetworkError(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermanentReject(msg) => write!(f, "permanent reject: {msg}"),
            Self::TemporaryDefer(msg) => write!(f, "temporary defer: {msg}"),
            Self::AuthFailed(msg) => write!(f, "auth failed: {msg}"),
            Self::RateLimitedUpstream(msg) => write!(f, "rate limited upstream: {msg}"),
            Self::NetworkError(msg) => write!(f, "network error: {msg}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl DeliveryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermanentReject(_) => "permanent_reject",
            Self::TemporaryDefer(_) => "temporary_defer",
            Self::AuthFailed(_) => "auth_failed",
            Self::RateLimitedUpstream(_) => "rate_limited_upstream",
            Self::NetworkError(_) => "network_error",
        }
    }
}

/// A fully-built outbound message, ready to submit (design §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub to: String,
    pub from: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub headers: HashMap<String, String>,
    pub tracking_enabled: bool,
    pub message_id: Option<String>,
}

/// Outcome of a single submit. `Accepted` carries the provider message id
/// (synthesized if the vendor didn't return one).
#[derive(Debug, Clone)]
pub enum SendResult {
    Accepted { provider_message_id: String },
    Rejected(DeliveryError),
}

/// Uniform capability implemented by a variant per vendor (design §4.5,
/// §9 "duck-typed transports -> capability abstraction").
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, envelope: Envelope) -> SendResult;
}

fn synthesize_message_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Registry of configured transports, looked up by vendor name — the
/// delivery-side analogue of `PaymentGatewayRegistry`.
#[derive(Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
    default: Option<String>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: HashMap::new(),
            default: None,
        }
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        let name = transport.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.transports.insert(name, transport);
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).cloned()
    }

    pub fn default_transport(&self) -> Option<Arc<dyn Transport>> {
        self.default.as_ref().and_then(|name| self.get(name))
    }
}

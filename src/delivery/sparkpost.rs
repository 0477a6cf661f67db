//! SparkPost transport (design §4.5).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{synthesize_message_id, DeliveryError, Envelope, SendResult, Transport};

#[derive(Debug, Clone)]
pub struct SparkPostConfig {
    pub api_key: String,
    pub base_url: String,
}

impl Default for SparkPostConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.sparkpost.com/api/v1".to_string(),
        }
    }
}

pub struct SparkPostTransport {
    config: SparkPostConfig,
    client: Client,
}

impl SparkPostTransport {
    pub fn new(config: SparkPostConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SparkPostRecipient<'a> {
    address: &'a str,
}

#[derive(Debug, Serialize)]
struct SparkPostContent<'a> {
    from: &'a str,
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(rename = "reply_to", skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SparkPostTransmission<'a> {
    recipients: Vec<SparkPostRecipient<'a>>,
    content: SparkPostContent<'a>,
}

#[derive(Debug, Deserialize)]
struct SparkPostResponse {
    results: Option<SparkPostResults>,
}

#[derive(Debug, Deserialize)]
struct SparkPostResults {
    id: Option<String>,
}

#[async_trait]
impl Transport for SparkPostTransport {
    fn name(&self) -> &'static str {
        "sparkpost"
    }

    async fn send(&self, envelope: Envelope) -> SendResult {
        let body = SparkPostTransmission {
            recipients: vec![SparkPostRecipient {
                address: &envelope.to,
            }],
            content: SparkPostContent {
                from: &envelope.from,
                subject: &envelope.subject,
                html: &envelope.html,
                text: envelope.text.as_deref(),
                reply_to: envelope.reply_to.as_deref(),
            },
        };

        let response = self
            .client
            .post(format!("{}/transmissions", self.config.base_url))
            .header("Authorization", &self.config.api_key)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) => classify_response(resp).await,
            Err(err) => SendResult::Rejected(classify_reqwest_error(&err)),
        }
    }
}

async fn classify_response(resp: reqwest::Response) -> SendResult {
    let status = resp.status();
    if status.is_success() {
        let id = resp
            .json::<SparkPostResponse>()
            .await
            .ok()
            .and_then(|r| r.results)
            .and_then(|r| r.id)
            .unwrap_or_else(|| synthesize_message_id("sparkpost"));
        return SendResult::Accepted {
            provider_message_id: id,
        };
    }
    let message = resp
        .text()
        .await
        .unwrap_or_else(|_| status.to_string());
    SendResult::Rejected(classify_status(status, message))
}

fn classify_status(status: StatusCode, message: String) -> DeliveryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryError::AuthFailed(message),
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimitedUpstream(message),
        s if s.as_u16() == 422 || s.is_client_error() => DeliveryError::PermanentReject(message),
        s if s.is_server_error() => DeliveryError::TemporaryDefer(message),
        _ => DeliveryError::TemporaryDefer(message),
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() || err.is_connect() {
        DeliveryError::NetworkError(err.to_string())
    } else {
        DeliveryError::TemporaryDefer(err.to_string())
    }
}

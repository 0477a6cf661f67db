//! PowerMTA (PMTA) transport, via PMTA's HTTP injection API (design §4.5).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::{synthesize_message_id, DeliveryError, Envelope, SendResult, Transport};

#[derive(Debug, Clone)]
pub struct PmtaConfig {
    pub inject_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct PmtaTransport {
    config: PmtaConfig,
    client: Client,
}

impl PmtaTransport {
    pub fn new(config: PmtaConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PmtaInjectRequest<'a> {
    envelope_from: &'a str,
    envelope_to: &'a str,
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[async_trait]
impl Transport for PmtaTransport {
    fn name(&self) -> &'static str {
        "pmta"
    }

    async fn send(&self, envelope: Envelope) -> SendResult {
        let request = PmtaInjectRequest {
            envelope_from: &envelope.from,
            envelope_to: &envelope.to,
            subject: &envelope.subject,
            html: &envelope.html,
            text: envelope.text.as_deref(),
        };

        let mut builder = self.client.post(&self.config.inject_url).json(&request);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.basic_auth(user, Some(pass));
        }

        match builder.send().await {
            Ok(resp) => classify_response(resp).await,
            Err(err) => SendResult::Rejected(classify_reqwest_error(&err)),
        }
    }
}

async fn classify_response(resp: reqwest::Response) -> SendResult {
    let status = resp.status();
    if status.is_success() {
        #[derive(serde::Deserialize)]
        struct Accepted {
            #[serde(default)]
            queue_id: Option<String>,
        }
        let id = resp
            .json::<Accepted>()
            .await
            .ok()
            .and_then(|a| a.queue_id)
            .unwrap_or_else(|| synthesize_message_id("pmta"));
        return SendResult::Accepted {
            provider_message_id: id,
        };
    }
    let message = resp.text().await.unwrap_or_else(|_| status.to_string());
    SendResult::Rejected(classify_status(status, message))
}

fn classify_status(status: StatusCode, message: String) -> DeliveryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryError::AuthFailed(message),
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimitedUpstream(message),
        s if s.as_u16() == 400 || s.as_u16() == 422 => DeliveryError::PermanentReject(message),
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

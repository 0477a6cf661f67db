//! Mailgun transport (design §4.5).

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};

use super::{synthesize_message_id, DeliveryError, Envelope, SendResult, Transport};

#[derive(Debug, Clone)]
pub struct MailgunConfig {
    pub api_key: String,
    pub domain: String,
    pub base_url: String,
}

impl Default for MailgunConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            domain: String::new(),
            base_url: "https://api.mailgun.net/v3".to_string(),
        }
    }
}

pub struct MailgunTransport {
    config: MailgunConfig,
    client: Client,
}

impl MailgunTransport {
    pub fn new(config: MailgunConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Transport for MailgunTransport {
    fn name(&self) -> &'static str {
        "mailgun"
    }

    async fn send(&self, envelope: Envelope) -> SendResult {
        let mut form = multipart::Form::new()
            .text("from", envelope.from.clone())
            .text("to", envelope.to.clone())
            .text("subject", envelope.subject.clone())
            .text("html", envelope.html.clone());
        if let Some(text) = envelope.text.clone() {
            form = form.text("text", text);
        }
        if let Some(reply_to) = envelope.reply_to.clone() {
            form = form.text("h:Reply-To", reply_to);
        }

        let response = self
            .client
            .post(format!("{}/{}/messages", self.config.base_url, self.config.domain))
            .basic_auth("api", Some(&self.config.api_key))
            .multipart(form)
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
        #[derive(serde::Deserialize)]
        struct Accepted {
            id: Option<String>,
        }
        let id = resp
            .json::<Accepted>()
            .await
            .ok()
            .and_then(|a| a.id)
            .unwrap_or_else(|| synthesize_message_id("mailgun"));
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
        s if s.as_u16() == 400 => DeliveryError::PermanentReject(message),
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

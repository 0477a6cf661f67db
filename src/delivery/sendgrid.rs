//! SendGrid transport (design §4.5).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::{synthesize_message_id, DeliveryError, Envelope, SendResult, Transport};

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub base_url: String,
}

impl Default for SendGridConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.sendgrid.com/v3".to_string(),
        }
    }
}

pub struct SendGridTransport {
    config: SendGridConfig,
    client: Client,
}

impl SendGridTransport {
    pub fn new(config: SendGridConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct FromAddress<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    mime_type: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct SendGridMail<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: FromAddress<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    #[serde(rename = "reply_to", skip_serializing_if = "Option::is_none")]
    reply_to: Option<FromAddress<'a>>,
}

#[async_trait]
impl Transport for SendGridTransport {
    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(&self, envelope: Envelope) -> SendResult {
        let mut content = vec![Content {
            mime_type: "text/html",
            value: &envelope.html,
        }];
        if let Some(text) = envelope.text.as_deref() {
            content.insert(
                0,
                Content {
                    mime_type: "text/plain",
                    value: text,
                },
            );
        }

        let mail = SendGridMail {
            personalizations: vec![Personalization {
                to: vec![Address { email: &envelope.to }],
            }],
            from: FromAddress { email: &envelope.from },
            subject: &envelope.subject,
            content,
            reply_to: envelope.reply_to.as_deref().map(|email| FromAddress { email }),
        };

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&mail)
            .send()
            .await;

        match response {
            Ok(resp) => classify_response(resp),
            Err(err) => SendResult::Rejected(classify_reqwest_error(&err)),
        }
    }
}

fn classify_response(resp: reqwest::Response) -> SendResult {
    let status = resp.status();
    if status.is_success() {
        // SendGrid returns the message id in the `X-Message-Id` header,
        // not the (empty) 202 body.
        let id = resp
            .headers()
            .get("X-Message-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| synthesize_message_id("sendgrid"));
        return SendResult::Accepted {
            provider_message_id: id,
        };
    }
    SendResult::Rejected(classify_status(status))
}

fn classify_status(status: StatusCode) -> DeliveryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryError::AuthFailed(status.to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimitedUpstream(status.to_string()),
        s if s.as_u16() == 400 => DeliveryError::PermanentReject(status.to_string()),
        s if s.is_server_error() => DeliveryError::TemporaryDefer(status.to_string()),
        _ => DeliveryError::TemporaryDefer(status.to_string()),
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() || err.is_connect() {
        DeliveryError::NetworkError(err.to_string())
    } else {
        DeliveryError::TemporaryDefer(err.to_string())
    }
}

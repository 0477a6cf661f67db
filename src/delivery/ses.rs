//! Amazon SES transport, signed with AWS SigV4 using the same
//! `hmac`/`sha2` primitives the signed URL codec (C1) already depends
//! on, rather than pulling in a full AWS SDK.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{synthesize_message_id, DeliveryError, Envelope, SendResult, Transport};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct SesConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

pub struct SesTransport {
    config: SesConfig,
    client: Client,
}

impl SesTransport {
    pub fn new(config: SesConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn host(&self) -> String {
        format!("email.{}.amazonaws.com", self.config.region)
    }

    /// AWS SigV4 Authorization header for a single POST request with an
    /// already-serialized JSON body.
    fn sign(&self, body: &str, amz_date: &str, date_stamp: &str) -> String {
        let service = "ses";
        let host = self.host();
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));

        let canonical_headers = format!(
            "content-type:application/json\nhost:{host}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "content-type;host;x-amz-date";
        let canonical_request = format!(
            "POST\n/v2/email/outbound-emails\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/{service}/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = derive_signing_key(
            &self.config.secret_access_key,
            date_stamp,
            &self.config.region,
            service,
        );
        let signature = hex::encode(hmac_bytes(&signing_key, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key_id
        )
    }
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_bytes(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_bytes(&k_date, region.as_bytes());
    let k_service = hmac_bytes(&k_region, service.as_bytes());
    hmac_bytes(&k_service, b"aws4_request")
}

#[derive(Debug, Serialize)]
struct SesDestination<'a> {
    #[serde(rename = "ToAddresses")]
    to_addresses: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct SesBody<'a> {
    #[serde(rename = "FromEmailAddress")]
    from_email_address: &'a str,
    #[serde(rename = "Destination")]
    destination: SesDestination<'a>,
    #[serde(rename = "Content")]
    content: serde_json::Value,
}

#[async_trait]
impl Transport for SesTransport {
    fn name(&self) -> &'static str {
        "ses"
    }

    async fn send(&self, envelope: Envelope) -> SendResult {
        let content = serde_json::json!({
            "Simple": {
                "Subject": { "Data": envelope.subject },
                "Body": {
                    "Html": { "Data": envelope.html },
                    "Text": { "Data": envelope.text.clone().unwrap_or_default() },
                },
            }
        });
        let body = SesBody {
            from_email_address: &envelope.from,
            destination: SesDestination {
                to_addresses: vec![&envelope.to],
            },
            content,
        };
        let payload = match serde_json::to_string(&body) {
            Ok(p) => p,
            Err(err) => return SendResult::Rejected(DeliveryError::PermanentReject(err.to_string())),
        };

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let authorization = self.sign(&payload, &amz_date, &date_stamp);

        let response = self
            .client
            .post(format!("https://{}/v2/email/outbound-emails", self.host()))
            .header("content-type", "application/json")
            .header("x-amz-date", &amz_date)
            .header("Authorization", authorization)
            .body(payload)
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
            #[serde(rename = "MessageId")]
            message_id: Option<String>,
        }
        let id = resp
            .json::<Accepted>()
            .await
            .ok()
            .and_then(|a| a.message_id)
            .unwrap_or_else(|| synthesize_message_id("ses"));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_key_derivation_is_deterministic() {
        let a = derive_signing_key("secret", "20260101", "us-east-1", "ses");
        let b = derive_signing_key("secret", "20260101", "us-east-1", "ses");
        assert_eq!(a, b);
        let c = derive_signing_key("other", "20260101", "us-east-1", "ses");
        assert_ne!(a, c);
    }
}

//! Signing & URL codec (C1, design §4.1, §6 "Signed URL format").
//!
//! Every outbound tracking URL encodes `(org, campaign, recipient,
//! email_id[, target_url])` as a URL-safe base64 payload plus a keyed
//! HMAC-SHA256 MAC. Verification runs in constant time and accepts the
//! current key and one previous key during rotation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingPayload {
    pub org: Uuid,
    pub campaign: Uuid,
    pub recipient: Uuid,
    pub email_id: String,
    pub target_url: Option<String>,
}

impl TrackingPayload {
    fn encode(&self) -> String {
        match &self.target_url {
            Some(target) => format!(
                "{}|{}|{}|{}|{}",
                self.org, self.campaign, self.recipient, self.email_id, target
            ),
            None => format!(
                "{}|{}|{}|{}",
                self.org, self.campaign, self.recipient, self.email_id
            ),
        }
    }

    fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(5, '|');
        let org = Uuid::parse_str(parts.next()?).ok()?;
        let campaign = Uuid::parse_str(parts.next()?).ok()?;
        let recipient = Uuid::parse_str(parts.next()?).ok()?;
        let email_id = parts.next()?.to_string();
        let target_url = parts.next().map(str::to_string);
        Some(Self {
            org,
            campaign,
            recipient,
            email_id,
            target_url,
        })
    }
}

/// Key rotation: verify accepts the current key and one previous key
/// (design §4.1).
#[derive(Clone)]
pub struct UrlSigner {
    current_key: Vec<u8>,
    previous_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    MalformedPayload,
    MacMismatch,
}

impl UrlSigner {
    pub fn new(current_key: impl AsRef<[u8]>, previous_key: Option<impl AsRef<[u8]>>) -> Self {
        Self {
            current_key: current_key.as_ref().to_vec(),
            previous_key: previous_key.map(|k| k.as_ref().to_vec()),
        }
    }

    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self::new(
            config.tracking_secret.as_bytes(),
            config.tracking_secret_prev.as_deref(),
        )
    }

    /// `base64url(payload) + "/" + base64url(mac)` (design §6).
    pub fn sign(&self, payload: &TrackingPayload) -> String {
        let encoded_payload = URL_SAFE_NO_PAD.encode(payload.encode());
        let mac = mac_for(&self.current_key, encoded_payload.as_bytes());
        let encoded_mac = URL_SAFE_NO_PAD.encode(mac);
        format!("{encoded_payload}/{encoded_mac}")
    }

    /// Verify a `payload/mac` pair in constant time, trying the current
    /// key then the previous one. Never distinguishes "bad mac" from
    /// "bad key" in its return shape — callers must give a neutral
    /// response on any failure (design §4.1, §7).
    pub fn verify(&self, encoded_payload: &str, encoded_mac: &str) -> Result<TrackingPayload, VerifyError> {
        let given_mac = URL_SAFE_NO_PAD
            .decode(encoded_mac)
            .map_err(|_| VerifyError::MalformedPayload)?;

        let current_mac = mac_for(&self.current_key, encoded_payload.as_bytes());
        let mut ok = current_mac.ct_eq(&given_mac).into();
        if !ok {
            if let Some(prev) = &self.previous_key {
                let prev_mac = mac_for(prev, encoded_payload.as_bytes());
                ok = prev_mac.ct_eq(&given_mac).into();
            }
        }
        if !ok {
            return Err(VerifyError::MacMismatch);
        }

        let raw = URL_SAFE_NO_PAD
            .decode(encoded_payload)
            .map_err(|_| VerifyError::MalformedPayload)?;
        let raw = String::from_utf8(raw).map_err(|_| VerifyError::MalformedPayload)?;
        TrackingPayload::decode(&raw).ok_or(VerifyError::MalformedPayload)
    }

    /// Split a `/`-joined `payload/mac` URL segment and verify it.
    pub fn verify_path(&self, segment: &str) -> Result<TrackingPayload, VerifyError> {
        let (payload, mac) = segment.split_once('/').ok_or(VerifyError::MalformedPayload)?;
        self.verify(payload, mac)
    }
}

fn mac_for(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> TrackingPayload {
        TrackingPayload {
            org: Uuid::new_v4(),
            campaign: Uuid::new_v4(),
            recipient: Uuid::new_v4(),
            email_id: "e1".into(),
            target_url: None,
        }
    }

    #[test]
    fn round_trip_law() {
        let signer = UrlSigner::new(b"secret", None::<&[u8]>);
        let p = payload();
        let signed = signer.sign(&p);
        let decoded = signer.verify_path(&signed).expect("verifies");
        assert_eq!(decoded, p);
    }

    #[test]
    fn tampered_mac_rejected() {
        let signer = UrlSigner::new(b"secret", None::<&[u8]>);
        let signed = signer.sign(&payload());
        let (payload_part, mac_part) = signed.split_once('/').unwrap();
        let mut mac_bytes = URL_SAFE_NO_PAD.decode(mac_part).unwrap();
        mac_bytes[0] ^= 0xFF;
        let tampered_mac = URL_SAFE_NO_PAD.encode(mac_bytes);
        let tampered = format!("{payload_part}/{tampered_mac}");
        assert_eq!(signer.verify_path(&tampered), Err(VerifyError::MacMismatch));
    }

    #[test]
    fn previous_key_accepted_during_rotation() {
        let old_signer = UrlSigner::new(b"old-secret", None::<&[u8]>);
        let signed = old_signer.sign(&payload());

        let rotated = UrlSigner::new(b"new-secret", Some(b"old-secret".as_slice()));
        assert!(rotated.verify_path(&signed).is_ok());

        let no_previous = UrlSigner::new(b"new-secret", None::<&[u8]>);
        assert_eq!(no_previous.verify_path(&signed), Err(VerifyError::MacMismatch));
    }

    #[test]
    fn click_payload_carries_target_url() {
        let signer = UrlSigner::new(b"secret", None::<&[u8]>);
        let mut p = payload();
        p.target_url = Some("https://example.com/landing".to_string());
        let signed = signer.sign(&p);
        let decoded = signer.verify_path(&signed).unwrap();
        assert_eq!(decoded.target_url.as_deref(), Some("https://example.com/landing"));
    }
}

//! Signature verification for inbound identity-provider webhooks.
//!
//! The provider signs deliveries Svix-style: `svix-id`, `svix-timestamp` and
//! `svix-signature` headers, where the signature is a space separated list of
//! `v1,<base64 hmac-sha256>` over `"{id}.{timestamp}.{body}"`.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::now_millis;
use crate::types::{ComponentHealth, HealthLevel, WebhookEvent, WebhookRequest};

type HmacSha256 = Hmac<Sha256>;

const ID_HEADER: &str = "svix-id";
const TIMESTAMP_HEADER: &str = "svix-timestamp";
const SIGNATURE_HEADER: &str = "svix-signature";
const SECRET_PREFIX: &str = "whsec_";
const DEFAULT_TOLERANCE_SECS: u64 = 5 * 60;

/// Verification failures are never retried.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("invalid timestamp header")]
    InvalidTimestamp,
    #[error("timestamp outside tolerance")]
    TimestampOutOfRange,
    #[error("no matching signature")]
    InvalidSignature,
    #[error("invalid signing secret")]
    InvalidSecret,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

pub trait Verifier: Send + Sync {
    fn verify_webhook(&self, request: &WebhookRequest) -> Result<WebhookEvent, VerificationError>;

    /// Reported under `verifier` in the pipeline health check.
    fn health(&self) -> ComponentHealth {
        ComponentHealth {
            status: HealthLevel::Healthy,
            detail: Some("no self-check".to_string()),
        }
    }
}

#[derive(Deserialize)]
struct IdentityPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

pub struct SvixVerifier {
    key: Vec<u8>,
    tolerance_secs: u64,
}

impl SvixVerifier {
    /// Accepts the secret as issued (`whsec_<base64>`) or as bare base64.
    pub fn new(secret: &str) -> Result<Self, VerificationError> {
        let encoded = secret.trim().strip_prefix(SECRET_PREFIX).unwrap_or(secret.trim());
        let key = STANDARD
            .decode(encoded)
            .map_err(|_| VerificationError::InvalidSecret)?;
        if key.is_empty() {
            return Err(VerificationError::InvalidSecret);
        }
        Ok(Self {
            key,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        })
    }

    pub fn with_tolerance_secs(mut self, tolerance_secs: u64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Produces the `v1,<base64>` signature for a delivery.
    pub fn sign(&self, msg_id: &str, timestamp: i64, body: &str) -> Result<String, VerificationError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| VerificationError::InvalidSecret)?;
        mac.update(format!("{msg_id}.{timestamp}.{body}").as_bytes());
        Ok(format!("v1,{}", STANDARD.encode(mac.finalize().into_bytes())))
    }

    fn check_timestamp(&self, raw: &str) -> Result<i64, VerificationError> {
        let timestamp: i64 = raw
            .trim()
            .parse()
            .map_err(|_| VerificationError::InvalidTimestamp)?;
        let now = now_millis() / 1000;
        if now.abs_diff(timestamp) > self.tolerance_secs {
            return Err(VerificationError::TimestampOutOfRange);
        }
        Ok(timestamp)
    }
}

impl Verifier for SvixVerifier {
    fn verify_webhook(&self, request: &WebhookRequest) -> Result<WebhookEvent, VerificationError> {
        let msg_id = request
            .header(ID_HEADER)
            .ok_or(VerificationError::MissingHeader(ID_HEADER))?;
        let raw_timestamp = request
            .header(TIMESTAMP_HEADER)
            .ok_or(VerificationError::MissingHeader(TIMESTAMP_HEADER))?;
        let signatures = request
            .header(SIGNATURE_HEADER)
            .ok_or(VerificationError::MissingHeader(SIGNATURE_HEADER))?;

        let timestamp = self.check_timestamp(raw_timestamp)?;
        let expected = self.sign(msg_id, timestamp, &request.body)?;

        let matched = signatures
            .split_whitespace()
            .filter(|candidate| candidate.starts_with("v1,"))
            .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));
        if !matched {
            return Err(VerificationError::InvalidSignature);
        }

        let payload: serde_json::Value = serde_json::from_str(&request.body)
            .map_err(|err| VerificationError::MalformedPayload(err.to_string()))?;
        let parsed: IdentityPayload = serde_json::from_value(payload.clone())
            .map_err(|err| VerificationError::MalformedPayload(err.to_string()))?;

        let user_id = parsed
            .data
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string);

        Ok(WebhookEvent {
            id: msg_id.to_string(),
            event_type: parsed.event_type,
            user_id,
            payload,
            received_at: now_millis(),
        })
    }

    fn health(&self) -> ComponentHealth {
        ComponentHealth {
            status: HealthLevel::Healthy,
            detail: Some(format!(
                "svix hmac-sha256, {}-byte key, {}s tolerance",
                self.key.len(),
                self.tolerance_secs
            )),
        }
    }
}

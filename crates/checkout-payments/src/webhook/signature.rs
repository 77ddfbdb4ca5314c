//! Webhook signature verification
//!
//! Stripe signs `"{timestamp}.{raw body}"` with HMAC-SHA256 and sends
//! `Stripe-Signature: t=<unix secs>,v1=<hex>[,v1=<hex>...]`. Any `v1` entry
//! that `stripe::Webhook` accepts authenticates the body. The body itself is
//! decoded by the ingestor, so a payload the SDK cannot model still passes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Webhook, WebhookError};

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Maximum age (and clock skew) of a signed delivery, as enforced by `stripe::Webhook`
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies gateway webhook signatures
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(PaymentError::Config("webhook secret must not be empty".into()));
        }
        Ok(Self {
            secret: secret.to_string(),
        })
    }

    /// Signature header value for a body, as the gateway would send it
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        // Hmac accepts keys of any length
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return String::new();
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> Result<()> {
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PaymentError::WebhookSignature("missing signature header".into()))?;
        let payload = std::str::from_utf8(payload)
            .map_err(|_| PaymentError::WebhookSignature("body is not UTF-8".into()))?;

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| PaymentError::WebhookSignature("missing timestamp".into()))?;
        if candidates.is_empty() {
            return Err(PaymentError::WebhookSignature("no v1 signature".into()));
        }

        let mut last = WebhookError::BadSignature;
        for candidate in candidates {
            let single = format!("t={timestamp},v1={candidate}");
            match Webhook::construct_event(payload, &single, &self.secret) {
                Ok(_) | Err(WebhookError::BadParse(_)) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(rejection(&last))
    }
}

fn rejection(error: &WebhookError) -> PaymentError {
    let reason = match error {
        WebhookError::BadTimestamp(_) => "timestamp outside tolerance",
        WebhookError::BadHeader(_) => "malformed signature header",
        WebhookError::BadKey => "unusable webhook secret",
        _ => "no matching signature",
    };
    PaymentError::WebhookSignature(reason.into())
}

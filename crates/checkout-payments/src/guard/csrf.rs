//! CSRF Tokens
//!
//! Stateless, signed tokens bound to a session:
//!
//! ```text
//! token = base64( "{session_id}|{issued_ms}|{nonce}" + "." + hex(hmac_sha256(secret, payload)) )
//! ```
//!
//! Nothing is stored. Validation recomputes the signature, then checks the
//! session binding and the age of the token.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the token
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// An issued token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Why a token was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrfRejection {
    Malformed,
    BadSignature,
    SessionMismatch,
    Expired,
}

impl CsrfRejection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::BadSignature => "bad signature",
            Self::SessionMismatch => "session mismatch",
            Self::Expired => "expired",
        }
    }
}

/// Issues and checks CSRF tokens
#[derive(Clone)]
pub struct CsrfGuard {
    mac: HmacSha256,
    ttl: Duration,
}

impl std::fmt::Debug for CsrfGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfGuard").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl CsrfGuard {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(PaymentError::Config("CSRF secret must not be empty".into()));
        }
        if ttl <= Duration::zero() {
            return Err(PaymentError::Config("CSRF token lifetime must be positive".into()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| PaymentError::Config(format!("CSRF secret: {e}")))?;
        Ok(Self { mac, ttl })
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for a session
    pub fn issue_token(&self, session_id: &str) -> CsrfToken {
        self.issue_token_at(session_id, Utc::now())
    }

    pub fn issue_token_at(&self, session_id: &str, now: DateTime<Utc>) -> CsrfToken {
        let nonce = Uuid::new_v4().simple().to_string();
        let payload = format!("{session_id}|{}|{nonce}", now.timestamp_millis());
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        CsrfToken {
            token: STANDARD.encode(format!("{payload}.{signature}")),
            expires_at: now + self.ttl,
        }
    }

    /// Whether `token` is valid for `session_id` right now
    pub fn validate_token(&self, token: &str, session_id: &str) -> bool {
        self.verify(token, session_id, Utc::now()).is_ok()
    }

    /// Check a token, reporting why it was refused
    pub fn verify(&self, token: &str, session_id: &str, now: DateTime<Utc>) -> std::result::Result<(), CsrfRejection> {
        let decoded = STANDARD
            .decode(token.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(CsrfRejection::Malformed)?;
        let (payload, signature) = decoded.rsplit_once('.').ok_or(CsrfRejection::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| CsrfRejection::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CsrfRejection::BadSignature)?;

        // Session ids may contain '|', so peel fields from the right
        let mut fields = payload.rsplitn(3, '|');
        let (Some(_nonce), Some(issued_ms), Some(token_session)) = (fields.next(), fields.next(), fields.next()) else {
            return Err(CsrfRejection::Malformed);
        };
        if token_session != session_id {
            return Err(CsrfRejection::SessionMismatch);
        }
        let issued = issued_ms
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or(CsrfRejection::Malformed)?;
        if now - issued > self.ttl {
            return Err(CsrfRejection::Expired);
        }
        Ok(())
    }
}

/// Whether a request must carry a CSRF token. Safe methods and the webhook
/// endpoint (authenticated by the gateway signature) are exempt.
pub fn requires_csrf(method: &str, path: &str, webhook_path: &str) -> bool {
    let safe = matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD" | "OPTIONS");
    !safe && path != webhook_path
}

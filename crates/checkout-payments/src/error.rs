//! Payment Error Types

use chrono::{DateTime, Utc};
use thiserror::Error;

use checkout_core::{CircuitOpen, Classify, FailureKind, StoreError};

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Order id unknown
    #[error("Order not found: {0}")]
    InvalidSubmission(String),

    /// Order already carries a subscription
    #[error("Order {0} already has a subscription")]
    AlreadyPaid(String),

    /// Add-on codes outside the catalog
    #[error("Invalid language codes: {}", .0.join(", "))]
    InvalidLanguageCodes(Vec<String>),

    /// No usable email on the order
    #[error("Customer email not found in order")]
    MissingCustomerEmail,

    /// Coupon unknown or no longer valid at the gateway
    #[error("Discount code '{0}' is not valid or has expired")]
    InvalidDiscountCode(String),

    /// Too many attempts in the current window
    #[error("Rate limit exceeded until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// No CSRF token on a state-changing request
    #[error("CSRF token missing")]
    CsrfMissing,

    /// CSRF token failed validation
    #[error("CSRF token invalid: {0}")]
    CsrfInvalid(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// A webhook handler ran and failed
    #[error("Webhook handler failed for {event_id}: {message}")]
    WebhookHandler { event_id: String, message: String },

    /// Gateway answered with an error
    #[error("Gateway error during {operation} ({status:?}): {message}")]
    Gateway {
        operation: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    /// Gateway could not be reached
    #[error("Network error during {operation}: {message}")]
    Network { operation: String, message: String },

    /// Gateway did not answer in time
    #[error("Timed out during {0}")]
    Timeout(String),

    /// Dependency short-circuited by its breaker
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Payments are not configured on this deployment
    #[error("Payments not configured")]
    PaymentsDisabled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_transient()
    }

    /// Stable machine-readable code
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidSubmission(_) => "INVALID_SUBMISSION_ID",
            Self::AlreadyPaid(_) => "PAYMENT_ALREADY_COMPLETED",
            Self::InvalidLanguageCodes(_) => "INVALID_LANGUAGE_CODE",
            Self::MissingCustomerEmail => "MISSING_CUSTOMER_EMAIL",
            Self::InvalidDiscountCode(_) => "INVALID_DISCOUNT_CODE",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::CsrfMissing => "CSRF_TOKEN_MISSING",
            Self::CsrfInvalid(_) => "CSRF_TOKEN_INVALID",
            Self::WebhookSignature(_) => "INVALID_SIGNATURE",
            Self::WebhookParse(_) => "INVALID_PAYLOAD",
            Self::WebhookHandler { .. } => "WEBHOOK_HANDLER_FAILED",
            Self::Gateway { .. } | Self::Network { .. } | Self::Timeout(_) => "STRIPE_API_ERROR",
            Self::CircuitOpen(_) => "SERVICE_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::PaymentsDisabled => "PAYMENTS_DISABLED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// HTTP status class for this error
    pub const fn status(&self) -> u16 {
        match self {
            Self::InvalidSubmission(_)
            | Self::InvalidLanguageCodes(_)
            | Self::MissingCustomerEmail
            | Self::InvalidDiscountCode(_)
            | Self::WebhookSignature(_)
            | Self::WebhookParse(_) => 400,
            Self::CsrfMissing | Self::CsrfInvalid(_) => 403,
            Self::AlreadyPaid(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::Gateway { .. } | Self::Network { .. } => 502,
            Self::CircuitOpen(_) | Self::PaymentsDisabled => 503,
            Self::Timeout(_) => 504,
            Self::WebhookHandler { .. } | Self::Storage(_) | Self::Config(_) => 500,
        }
    }

    /// Message safe to show to the caller
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidSubmission(_) => "Submission not found or not in submitted status".into(),
            Self::AlreadyPaid(_) => "This submission has already been paid".into(),
            Self::InvalidLanguageCodes(codes) => format!("Invalid language codes: {}", codes.join(", ")),
            Self::MissingCustomerEmail => "Customer email not found in submission".into(),
            Self::InvalidDiscountCode(code) => {
                format!("Discount code '{code}' is not valid or has expired")
            }
            Self::RateLimited { .. } => "Too many payment attempts. Please try again in 1 hour.".into(),
            Self::CsrfMissing => "CSRF token missing. Include X-CSRF-Token header.".into(),
            Self::CsrfInvalid(_) => "Invalid or expired CSRF token. Please refresh and try again.".into(),
            Self::WebhookSignature(_) => "Invalid signature".into(),
            Self::WebhookParse(_) => "Invalid webhook payload".into(),
            Self::WebhookHandler { .. } => "Webhook processing failed".into(),
            Self::Gateway { .. } | Self::Network { .. } | Self::Timeout(_) => {
                "Failed to create checkout session. Please try again.".into()
            }
            Self::CircuitOpen(_) => "Payment service temporarily unavailable. Please try again shortly.".into(),
            Self::PaymentsDisabled => "Payments not configured".into(),
            Self::Storage(_) | Self::Config(_) => "An error occurred processing your request.".into(),
        }
    }
}

impl Classify for PaymentError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Gateway { status: Some(s), .. } if *s >= 500 => FailureKind::Server(*s),
            Self::Gateway { status: Some(s), .. } => FailureKind::Client(*s),
            Self::Gateway { status: None, .. } | Self::Network { .. } => FailureKind::Network,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::CircuitOpen(_) => FailureKind::CircuitOpen,
            Self::Storage(StoreError::Unavailable(_)) => FailureKind::Network,
            _ => FailureKind::Permanent,
        }
    }
}

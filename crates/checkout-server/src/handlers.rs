//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use checkout_core::{OrderId, OrderStatus, SessionId};
use checkout_payments::webhook::SIGNATURE_HEADER;
use checkout_payments::{CheckoutRequest, CheckoutSession, DiscountPreview, PaymentError};

use crate::state::{AppState, Payments};

/// Header naming the caller's onboarding session
pub const SESSION_HEADER: &str = "X-Session-Id";

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub payments_configured: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_codes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            invalid_codes: None,
            reset_at: None,
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a domain error onto a status and a body that leaks nothing internal
pub fn api_error(e: &PaymentError) -> ApiError {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(code = e.code(), error = %e, "Request failed");
    } else {
        tracing::warn!(code = e.code(), error = %e, "Request rejected");
    }

    let mut body = ErrorResponse::new(e.code(), e.user_message());
    match e {
        PaymentError::InvalidLanguageCodes(codes) => body.invalid_codes = Some(codes.clone()),
        PaymentError::RateLimited { reset_at } => body.reset_at = Some(*reset_at),
        _ => {}
    }
    (status, Json(body))
}

fn bad_request(code: &str, message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(code, message)))
}

fn payments(state: &AppState) -> Result<&Arc<Payments>, ApiError> {
    state
        .payments
        .as_ref()
        .ok_or_else(|| api_error(&PaymentError::PaymentsDisabled))
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Count a guarded request against its session's budget for `scope`
async fn throttle(state: &AppState, headers: &HeaderMap, scope: &str) -> Result<(), ApiError> {
    // The CSRF layer has already required this header.
    let session = session_header(headers).unwrap_or("anonymous");
    let decision = state.limiter.check(&format!("{scope}:{session}")).await;
    if decision.allowed {
        Ok(())
    } else {
        Err(api_error(&PaymentError::RateLimited {
            reset_at: decision.reset_at,
        }))
    }
}

#[derive(Debug, Deserialize)]
pub struct CsrfTokenQuery {
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CsrfTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateDiscountRequest {
    #[serde(alias = "discountCode")]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub subscription_ref: Option<String>,
    pub subscription_status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub received: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        payments_configured: state.payments.is_some(),
    })
}

/// Issue a CSRF token for a live session
pub async fn csrf_token(
    State(state): State<AppState>,
    Query(query): Query<CsrfTokenQuery>,
) -> Result<Json<CsrfTokenResponse>, ApiError> {
    let session_id = query
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("SESSION_ID_REQUIRED", "Session ID is required"))?;

    let session = state
        .sessions
        .get(&SessionId::from_string(session_id.clone()))
        .await
        .map_err(|e| api_error(&PaymentError::from(e)))?;
    if session.is_none() {
        tracing::warn!(session_id = %session_id, "CSRF token requested for unknown session");
        return Err(bad_request("INVALID_SESSION", "Session not found or expired"));
    }

    let token = state.csrf.issue_token(&session_id);
    Ok(Json(CsrfTokenResponse {
        token: token.token,
        expires_at: token.expires_at,
    }))
}

/// Start checkout for a submitted order
pub async fn create_checkout_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutSession>, ApiError> {
    let payments = payments(&state)?;
    let Json(request) = payload.map_err(|e| bad_request("INVALID_REQUEST", e.body_text()))?;

    throttle(&state, &headers, "checkout").await?;

    let session = payments
        .checkout
        .create_checkout_session(&request)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(session))
}

/// Preview a discount code against the base fee
pub async fn validate_discount(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ValidateDiscountRequest>, JsonRejection>,
) -> Result<Json<DiscountPreview>, ApiError> {
    let payments = payments(&state)?;
    let Json(request) = payload.map_err(|e| bad_request("INVALID_REQUEST", e.body_text()))?;
    throttle(&state, &headers, "discount").await?;
    let preview = payments
        .checkout
        .validate_discount(request.code.trim())
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(preview))
}

/// Payment state of an order, for client polling
pub async fn payment_status(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<PaymentStatusResponse>, ApiError> {
    let order = state
        .orders
        .get(&OrderId::from_string(order_id))
        .await
        .map_err(|e| api_error(&PaymentError::from(e)))?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("ORDER_NOT_FOUND", "Order not found")),
            )
        })?;

    Ok(Json(PaymentStatusResponse {
        order_id: order.id,
        status: order.status,
        payment_completed_at: order.payment_completed_at,
        subscription_ref: order.subscription_ref,
        subscription_status: order.subscription_status,
    }))
}

/// Stripe webhook endpoint. Takes the raw body; the signature covers its bytes.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let payments = payments(&state)?;
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let outcome = payments
        .webhooks
        .receive(&body, signature)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(WebhookResponse {
        received: true,
        duplicate: outcome.is_duplicate().then_some(true),
    }))
}

//! Router and Access Guard middleware

use std::time::Duration;

use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use checkout_payments::PaymentError;
use checkout_payments::guard::{CSRF_HEADER, requires_csrf};

use crate::handlers::{
    SESSION_HEADER, api_error, create_checkout_session, csrf_token, health_check, payment_status,
    stripe_webhook, validate_discount,
};
use crate::state::AppState;

/// Gateway callbacks; signed by the gateway, so exempt from CSRF
pub const WEBHOOK_PATH: &str = "/webhook";

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/csrf-token", get(csrf_token))
        .route("/checkout-session", post(create_checkout_session))
        .route("/api/stripe/validate-discount", post(validate_discount))
        .route("/api/payment/status/{order_id}", get(payment_status))
        .route(WEBHOOK_PATH, post(stripe_webhook))
        .route_layer(middleware::from_fn_with_state(state.clone(), csrf_protect))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

/// Require a session-bound CSRF token on state-changing requests
async fn csrf_protect(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !requires_csrf(request.method().as_str(), request.uri().path(), WEBHOOK_PATH) {
        return next.run(request).await;
    }

    let verdict = {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        match (header(CSRF_HEADER), header(SESSION_HEADER)) {
            (Some(token), Some(session_id)) => state
                .csrf
                .verify(token, session_id, Utc::now())
                .map_err(|reason| PaymentError::CsrfInvalid(reason.as_str().into())),
            _ => Err(PaymentError::CsrfMissing),
        }
    };

    match verdict {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::warn!(
                method = %request.method(),
                path = %request.uri().path(),
                error = %e,
                "CSRF check failed"
            );
            api_error(&e).into_response()
        }
    }
}

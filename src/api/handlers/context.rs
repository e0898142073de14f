//! Context evaluation and verification endpoints.

use axum::{
    Json,
    extract::{ConnectInfo, Extension},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::types::{EvaluateRequest, OutcomeResponse, VerifyContextRequest};
use super::utils::{ClientIpSource, ServiceToken};
use crate::engine::error::EngineError;
use crate::engine::orchestrator::SignInOrchestrator;
use crate::engine::outcome::Outcome;

/// Evaluate the request context for an account whose credentials the caller
/// already verified. No session is issued.
///
/// Callers authenticate with the configured service token as a bearer
/// credential; nothing is read or written before that check passes.
#[utoipa::path(
    post,
    path = "/v1/auth/context/evaluate",
    request_body = EvaluateRequest,
    responses(
        (status = 200, description = "Decision made", body = OutcomeResponse),
        (status = 400, description = "Missing payload", body = String),
        (status = 401, description = "Missing or wrong service token", body = String),
        (status = 403, description = "No service token configured", body = String),
        (status = 503, description = "Context could not be captured or the store is unreachable", body = OutcomeResponse),
        (status = 500, description = "Evaluation failed", body = String)
    ),
    tag = "context"
)]
pub async fn evaluate(
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    orchestrator: Extension<Arc<SignInOrchestrator>>,
    client_ip: Extension<Arc<ClientIpSource>>,
    service_token: Extension<Arc<ServiceToken>>,
    payload: Option<Json<EvaluateRequest>>,
) -> impl IntoResponse {
    if let Err(status) = service_token.verify(&headers) {
        warn!(status = status.as_u16(), "rejected context evaluation caller");
        return (status, "Unauthorized".to_string()).into_response();
    }

    let request: EvaluateRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let context = client_ip.request_context(&headers, connect.map(|ConnectInfo(addr)| addr));
    match orchestrator.evaluate(request.account_id, &context).await {
        Ok(outcome) => {
            let status = match outcome {
                Outcome::ContextUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::OK,
            };
            (status, Json(OutcomeResponse::from(&outcome))).into_response()
        }
        Err(err) => {
            error!(account = %request.account_id, "context evaluation failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Evaluation failed".to_string(),
            )
                .into_response()
        }
    }
}

/// Consume a verification code and trust the context it was issued for.
#[utoipa::path(
    post,
    path = "/v1/auth/context/verify",
    request_body = VerifyContextRequest,
    responses(
        (status = 204, description = "Context verified"),
        (status = 400, description = "Invalid, expired or already used code", body = String),
        (status = 500, description = "Verification failed", body = String)
    ),
    tag = "context"
)]
pub async fn verify(
    orchestrator: Extension<Arc<SignInOrchestrator>>,
    payload: Option<Json<VerifyContextRequest>>,
) -> impl IntoResponse {
    let request: VerifyContextRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let code = request.code.trim();
    if code.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing code".to_string()).into_response();
    }

    let code = SecretString::from(code.to_string());
    match orchestrator.consume_verification(&code, request.account_id).await {
        Ok(trusted) => {
            info!(account = %trusted.account, device_key = %trusted.device_key, "context verified");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(EngineError::Validation(err)) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        Err(err) => {
            error!("context verification failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Verification failed".to_string(),
            )
                .into_response()
        }
    }
}

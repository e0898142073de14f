//! Sign-in endpoint.

use axum::{
    Json,
    extract::{ConnectInfo, Extension},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use super::types::{SignInRequest, SignInResponse};
use super::utils::ClientIpSource;
use crate::engine::orchestrator::{Credentials, SignInOrchestrator, SignInResult};

/// Verify credentials, then admit the sign-in only from a trusted context.
#[utoipa::path(
    post,
    path = "/v1/auth/signin",
    request_body = SignInRequest,
    responses(
        (status = 200, description = "Session issued", body = SignInResponse),
        (status = 400, description = "Missing email or password", body = String),
        (status = 401, description = "Invalid credentials", body = SignInResponse),
        (status = 403, description = "Unrecognized context, verification email sent", body = SignInResponse),
        (status = 423, description = "Device temporarily or permanently blocked", body = SignInResponse),
        (status = 500, description = "No decision could be made", body = SignInResponse)
    ),
    tag = "auth"
)]
pub async fn signin(
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    orchestrator: Extension<Arc<SignInOrchestrator>>,
    client_ip: Extension<Arc<ClientIpSource>>,
    payload: Option<Json<SignInRequest>>,
) -> impl IntoResponse {
    let request: SignInRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let email = request.email.trim().to_lowercase();
    if email.is_empty() || request.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing email or password".to_string()).into_response();
    }

    let context = client_ip.request_context(&headers, connect.map(|ConnectInfo(addr)| addr));
    let credentials = Credentials {
        email,
        password: SecretString::from(request.password),
    };

    let result = orchestrator.sign_in(&credentials, &context).await;
    debug!(status = result.status(), "sign-in decided");

    (status_code(&result), Json(SignInResponse::from_result(&result))).into_response()
}

fn status_code(result: &SignInResult) -> StatusCode {
    match result {
        SignInResult::Granted(_) => StatusCode::OK,
        SignInResult::InvalidCredentials => StatusCode::UNAUTHORIZED,
        SignInResult::VerificationRequired { .. } => StatusCode::FORBIDDEN,
        SignInResult::TemporarilyBlocked { .. } | SignInResult::PermanentlyBlocked { .. } => {
            StatusCode::LOCKED
        }
        SignInResult::ServiceError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{ContextField, TrustedContext};
    use crate::engine::test_support::{
        CountingSessions, FakeCredentials, FakeGeo, HOME_IP, Harness, MAC_CHROME, PASSWORD,
        mac_chrome_attributes,
    };
    use anyhow::Result;
    use axum::body::to_bytes;
    use axum::http::{HeaderValue, header::USER_AGENT};
    use axum::response::Response;
    use chrono::Utc;
    use std::net::IpAddr;
    use uuid::Uuid;

    const EMAIL: &str = "ada@example.test";

    struct Fixture {
        harness: Harness,
        sessions: Arc<CountingSessions>,
        orchestrator: Arc<SignInOrchestrator>,
        account: Uuid,
    }

    fn fixture(geo: FakeGeo) -> Result<Fixture> {
        let harness = Harness::new()?;
        let sessions = Arc::new(CountingSessions::default());
        let account = Uuid::now_v7();
        let orchestrator = Arc::new(harness.orchestrator(
            FakeCredentials::default().with_account(EMAIL, account),
            sessions.clone(),
            geo,
        )?);
        harness.store.seed_trusted(TrustedContext::new(
            account,
            mac_chrome_attributes("US", "Austin"),
            Utc::now(),
        ))?;
        Ok(Fixture {
            harness,
            sessions,
            orchestrator,
            account,
        })
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(MAC_CHROME));
        headers
    }

    fn peer() -> Option<ConnectInfo<SocketAddr>> {
        Some(ConnectInfo(SocketAddr::new(IpAddr::from(HOME_IP), 51_000)))
    }

    fn body(email: &str, password: &str) -> Option<Json<SignInRequest>> {
        Some(Json(SignInRequest {
            email: email.to_string(),
            password: password.to_string(),
        }))
    }

    async fn call(fixture: &Fixture, payload: Option<Json<SignInRequest>>) -> Response {
        signin(
            headers(),
            peer(),
            Extension(fixture.orchestrator.clone()),
            Extension(Arc::new(ClientIpSource::default())),
            payload,
        )
        .await
        .into_response()
    }

    async fn decode(response: Response) -> Result<SignInResponse> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn trusted_context_gets_a_session() -> Result<()> {
        let fixture = fixture(FakeGeo::located("US", "Austin"))?;
        let response = call(&fixture, body(" Ada@Example.test ", PASSWORD)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = decode(response).await?;
        assert_eq!(body.status, "granted");
        assert_eq!(body.account_id, Some(fixture.account));
        assert_eq!(body.session_token.as_deref(), Some("session-0"));
        assert_eq!(fixture.sessions.issued(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() -> Result<()> {
        let fixture = fixture(FakeGeo::located("US", "Austin"))?;
        let response = call(&fixture, body(EMAIL, "hunter2")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = decode(response).await?;
        assert_eq!(body.status, "invalid_credentials");
        assert!(body.session_token.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn new_country_requires_verification() -> Result<()> {
        let fixture = fixture(FakeGeo::located("FR", "Paris"))?;
        let response = call(&fixture, body(EMAIL, PASSWORD)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = decode(response).await?;
        assert_eq!(body.status, "verification_required");
        assert_eq!(body.fields, vec![ContextField::Country, ContextField::City]);
        assert!(body.session_token.is_none());
        assert_eq!(fixture.harness.delivery.count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn blocked_states_are_locked_and_distinct() -> Result<()> {
        let fixture = fixture(FakeGeo::located("FR", "Paris"))?;
        let mut seen = Vec::new();
        for _ in 0..6 {
            let response = call(&fixture, body(EMAIL, PASSWORD)).await;
            let status = response.status();
            seen.push((status, decode(response).await?.status));
        }
        assert_eq!(seen[2], (StatusCode::LOCKED, "temporarily_blocked".to_string()));
        assert_eq!(seen[5], (StatusCode::LOCKED, "permanently_blocked".to_string()));
        assert_eq!(fixture.sessions.issued(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn lookup_outage_is_a_server_error() -> Result<()> {
        let fixture = fixture(FakeGeo::failing())?;
        let response = call(&fixture, body(EMAIL, PASSWORD)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(decode(response).await?.status, "service_error");
        Ok(())
    }

    #[tokio::test]
    async fn missing_fields_are_bad_requests() -> Result<()> {
        let fixture = fixture(FakeGeo::located("US", "Austin"))?;
        assert_eq!(call(&fixture, None).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(call(&fixture, body("  ", PASSWORD)).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(call(&fixture, body(EMAIL, "")).await.status(), StatusCode::BAD_REQUEST);
        assert!(fixture.harness.store.events()?.is_empty());
        Ok(())
    }
}

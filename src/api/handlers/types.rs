//! Request/response types for the sign-in and context endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::context::{ContextField, TrustedContext};
use crate::engine::orchestrator::SignInResult;
use crate::engine::outcome::Outcome;
use crate::store::BlockEntry;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SignInResponse {
    /// `granted`, `invalid_credentials`, `verification_required`,
    /// `temporarily_blocked`, `permanently_blocked` or `service_error`.
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Context fields that did not match a trusted context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ContextField>,
}

impl SignInResponse {
    /// The session token is the only secret ever exposed, and only for `Granted`.
    #[must_use]
    pub fn from_result(result: &SignInResult) -> Self {
        use secrecy::ExposeSecret;

        let mut response = Self {
            status: result.status().to_string(),
            message: result.message().to_string(),
            account_id: None,
            session_token: None,
            expires_at: None,
            fields: Vec::new(),
        };
        match result {
            SignInResult::Granted(grant) => {
                response.account_id = Some(grant.account);
                response.session_token = Some(grant.token.expose_secret().to_string());
                response.expires_at = Some(grant.expires_at);
            }
            SignInResult::VerificationRequired { account, fields } => {
                response.account_id = Some(*account);
                response.fields.clone_from(fields);
            }
            SignInResult::TemporarilyBlocked { account } | SignInResult::PermanentlyBlocked { account } => {
                response.account_id = Some(*account);
            }
            SignInResult::InvalidCredentials | SignInResult::ServiceError => {}
        }
        response
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EvaluateRequest {
    pub account_id: Uuid,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockView {
    pub permanent: bool,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
}

impl From<&BlockEntry> for BlockView {
    fn from(entry: &BlockEntry) -> Self {
        Self {
            permanent: entry.permanent,
            reason: entry.reason.clone(),
            blocked_at: entry.blocked_at,
        }
    }
}

/// Wire form of an [`Outcome`]. Token codes and hashes never leave the service.
#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct OutcomeResponse {
    /// `ok`, `mismatch`, `suspicious`, `blocked` or `context_unavailable`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ContextField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Matched context for `ok`, closest trusted context for `mismatch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TrustedContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&Outcome> for OutcomeResponse {
    fn from(outcome: &Outcome) -> Self {
        let mut response = Self {
            outcome: outcome.label().to_string(),
            fields: Vec::new(),
            attempts: None,
            context: None,
            verification_expires_at: None,
            block: None,
            reason: None,
        };
        match outcome {
            Outcome::Ok { context } => response.context = Some(context.clone()),
            Outcome::Mismatch {
                fields,
                reference,
                attempts,
            } => {
                response.fields.clone_from(fields);
                response.context.clone_from(reference);
                response.attempts = Some(*attempts);
            }
            Outcome::Suspicious { token, attempts } => {
                response.attempts = Some(*attempts);
                response.verification_expires_at = Some(token.expires_at);
            }
            Outcome::Blocked { block } => response.block = Some(BlockView::from(block)),
            Outcome::ContextUnavailable { reason } => response.reason = Some(reason.to_string()),
        }
        response
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyContextRequest {
    pub code: String,
    #[serde(default)]
    pub account_id: Option<Uuid>,
}

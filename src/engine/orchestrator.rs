//! Sign-in orchestrator: credentials, capture, evaluation, session.
//!
//! Only [`Outcome::Ok`] (or an account that opted out of context checks)
//! leads to a session. Every other branch returns a distinct result so a
//! security block is never confused with "we could not decide".

use anyhow::Result;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::BoxFuture;
use super::capture::ContextCapture;
use super::context::{AccountId, Capture, ContextField, DeviceKey, RequestContext, TrustedContext};
use super::error::EngineError;
use super::evaluator::RiskEvaluator;
use super::notifier::VerificationNotifier;
use super::outcome::Outcome;
use crate::store::{ContextStore, EventKind, EventLevel, SignInEvent, within};

#[derive(Debug)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

/// Password verification collaborator. `Ok(None)` means wrong credentials.
pub trait CredentialVerifier: Send + Sync {
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Option<AccountId>>>;
}

#[derive(Clone, Debug)]
pub struct SessionGrant {
    pub account: AccountId,
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Session issuance collaborator, called only once admission is decided.
pub trait SessionIssuer: Send + Sync {
    fn issue(&self, account: AccountId) -> BoxFuture<'_, Result<SessionGrant>>;
}

/// What the caller of a sign-in sees.
#[derive(Debug)]
pub enum SignInResult {
    Granted(SessionGrant),
    InvalidCredentials,
    VerificationRequired {
        account: AccountId,
        fields: Vec<ContextField>,
    },
    TemporarilyBlocked {
        account: AccountId,
    },
    PermanentlyBlocked {
        account: AccountId,
    },
    ServiceError,
}

impl SignInResult {
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Granted(_) => "granted",
            Self::InvalidCredentials => "invalid_credentials",
            Self::VerificationRequired { .. } => "verification_required",
            Self::TemporarilyBlocked { .. } => "temporarily_blocked",
            Self::PermanentlyBlocked { .. } => "permanently_blocked",
            Self::ServiceError => "service_error",
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::Granted(_) => "Signed in.",
            Self::InvalidCredentials => "Invalid email or password.",
            Self::VerificationRequired { .. } => {
                "We don't recognize this sign-in. Check your email to confirm it."
            }
            Self::TemporarilyBlocked { .. } => {
                "Sign-in from this device is temporarily blocked. Use the verification link sent to your email."
            }
            Self::PermanentlyBlocked { .. } => {
                "Sign-in from this device has been blocked. Contact support."
            }
            Self::ServiceError => "Sign-in is unavailable right now. Please try again later.",
        }
    }
}

pub struct SignInOrchestrator {
    credentials: Arc<dyn CredentialVerifier>,
    sessions: Arc<dyn SessionIssuer>,
    capture: ContextCapture,
    evaluator: Arc<RiskEvaluator>,
    notifier: Arc<VerificationNotifier>,
    store: Arc<dyn ContextStore>,
}

impl SignInOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialVerifier>,
        sessions: Arc<dyn SessionIssuer>,
        capture: ContextCapture,
        evaluator: Arc<RiskEvaluator>,
        notifier: Arc<VerificationNotifier>,
        store: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            credentials,
            sessions,
            capture,
            evaluator,
            notifier,
            store,
        }
    }

    #[instrument(skip_all, fields(ip = ?request.ip))]
    pub async fn sign_in(&self, credentials: &Credentials, request: &RequestContext) -> SignInResult {
        let account = match self.credentials.verify(credentials).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                info!("invalid credentials");
                return SignInResult::InvalidCredentials;
            }
            Err(err) => {
                error!("credential verification failed: {err:#}");
                return SignInResult::ServiceError;
            }
        };
        self.audit(account, None, request.ip, EventKind::Attempt, EventLevel::Info, "credentials verified")
            .await;

        let enabled = match within(
            self.evaluator.policy().store_timeout(),
            self.store.context_auth_enabled(account),
        )
        .await
        {
            Ok(enabled) => enabled,
            Err(err) => {
                error!(account = %account, "failed to read sign-in preference: {err}");
                self.audit(account, None, request.ip, EventKind::ContextError, EventLevel::Error, &err.to_string())
                    .await;
                return SignInResult::ServiceError;
            }
        };
        if !enabled {
            info!(account = %account, "context checks disabled for account");
            return self.grant(account, None, request.ip).await;
        }

        match self.evaluate(account, request).await {
            Ok(Outcome::Ok { context }) => self.grant(account, Some(context.device_key), request.ip).await,
            Ok(Outcome::Mismatch { fields, .. }) => SignInResult::VerificationRequired { account, fields },
            Ok(Outcome::Suspicious { .. }) => SignInResult::TemporarilyBlocked { account },
            Ok(Outcome::Blocked { .. }) => SignInResult::PermanentlyBlocked { account },
            Ok(Outcome::ContextUnavailable { .. }) | Err(_) => SignInResult::ServiceError,
        }
    }

    /// Capture the request context and classify it for an already authenticated account.
    ///
    /// A mismatch below the escalation threshold triggers a verification
    /// message naming the mismatched fields. Failing to send it is logged and
    /// does not change the outcome.
    ///
    /// # Errors
    /// See [`RiskEvaluator::evaluate`].
    #[instrument(skip_all, fields(account = %account))]
    pub async fn evaluate(&self, account: AccountId, request: &RequestContext) -> Result<Outcome, EngineError> {
        let capture = self.capture.capture(request).await;
        let device_key = match &capture {
            Capture::Complete(signature) => Some(signature.device_key()),
            Capture::Incomplete(_) => None,
        };

        let outcome = match self.evaluator.evaluate(account, &capture).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("context evaluation failed: {err:#}");
                self.audit(account, device_key, request.ip, EventKind::ContextError, EventLevel::Error, &err.to_string())
                    .await;
                return Err(err);
            }
        };

        match (&outcome, &capture) {
            (Outcome::Ok { .. }, _) => {}
            (Outcome::Mismatch { fields, .. }, Capture::Complete(signature)) => {
                if let Err(err) = self.notifier.challenge(account, signature, fields.clone()).await {
                    warn!("verification challenge not sent: {err}");
                }
                let names: Vec<&str> = fields.iter().map(|field| field.as_str()).collect();
                let message = format!("unrecognized context: {}", names.join(", "));
                self.audit(account, device_key, request.ip, EventKind::VerificationRequired, EventLevel::Warn, &message)
                    .await;
            }
            (Outcome::Mismatch { .. }, Capture::Incomplete(_)) => {}
            (Outcome::Suspicious { attempts, .. }, _) => {
                let message = format!("{attempts} unverified attempts");
                self.audit(account, device_key, request.ip, EventKind::TemporarilyBlocked, EventLevel::Warn, &message)
                    .await;
            }
            (Outcome::Blocked { block }, _) => {
                self.audit(account, device_key, request.ip, EventKind::PermanentlyBlocked, EventLevel::Error, &block.reason)
                    .await;
            }
            (Outcome::ContextUnavailable { reason }, _) => {
                error!(%reason, "sign-in context unavailable");
                self.audit(account, device_key, request.ip, EventKind::ContextError, EventLevel::Error, &reason.to_string())
                    .await;
            }
        }

        Ok(outcome)
    }

    /// Complete a verification challenge.
    ///
    /// # Errors
    /// See [`VerificationNotifier::consume`].
    pub async fn consume_verification(
        &self,
        code: &SecretString,
        account_hint: Option<AccountId>,
    ) -> Result<TrustedContext, EngineError> {
        match self.notifier.consume(code, account_hint).await {
            Ok(trusted) => {
                self.audit(
                    trusted.account,
                    Some(trusted.device_key.clone()),
                    Some(trusted.attributes.ip),
                    EventKind::Verified,
                    EventLevel::Info,
                    "context verified",
                )
                .await;
                Ok(trusted)
            }
            Err(err) => {
                if let Some(account) = account_hint {
                    let level = if err.is_validation() {
                        EventLevel::Warn
                    } else {
                        EventLevel::Error
                    };
                    self.audit(account, None, None, EventKind::VerificationRejected, level, &err.to_string())
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn grant(&self, account: AccountId, device_key: Option<DeviceKey>, ip: Option<IpAddr>) -> SignInResult {
        match self.sessions.issue(account).await {
            Ok(grant) => {
                self.audit(account, device_key, ip, EventKind::Granted, EventLevel::Info, "session issued")
                    .await;
                SignInResult::Granted(grant)
            }
            Err(err) => {
                error!(account = %account, "session issuance failed: {err:#}");
                SignInResult::ServiceError
            }
        }
    }

    /// Best effort: a failed audit write never changes a decision.
    async fn audit(
        &self,
        account: AccountId,
        device_key: Option<DeviceKey>,
        ip: Option<IpAddr>,
        kind: EventKind,
        level: EventLevel,
        message: &str,
    ) {
        let event = SignInEvent {
            account,
            device_key,
            ip,
            kind,
            level,
            message: message.to_string(),
            at: Utc::now(),
        };
        let limit = self.evaluator.policy().store_timeout();
        if let Err(err) = within(limit, self.store.record_event(&event)).await {
            warn!(account = %account, kind = kind.as_str(), "failed to record sign-in event: {err}");
        }
    }
}

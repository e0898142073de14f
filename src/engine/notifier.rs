//! Verification notifier: one-time codes that let a user confirm a new context.
//!
//! A device holds at most one live token. Asking again while it is live
//! returns the same token and sends nothing, which throttles outbound mail.
//! The raw code only exists in the delivered message; the store keeps its
//! SHA-256.

use anyhow::{Context, Result, anyhow};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, TimeDelta, Utc};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::BoxFuture;
use super::blocks;
use super::context::{AccountId, ContextAttributes, ContextField, ContextSignature, DeviceKey, TrustedContext};
use super::error::{EngineError, ValidationError};
use super::ledger;
use super::profile;
use crate::store::{ContextStore, KeyScope, ScopeKey, VerificationToken, within};

pub const DEFAULT_TOKEN_TTL_SECONDS: u32 = 86_400;
const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct NotifierConfig {
    verify_base_url: Url,
    token_ttl: TimeDelta,
    delivery_timeout: Duration,
    store_timeout: Duration,
}

impl NotifierConfig {
    /// Defaults: 24h token TTL, 5s delivery bound, 3s store bound.
    #[must_use]
    pub fn new(verify_base_url: Url) -> Self {
        Self {
            verify_base_url,
            token_ttl: TimeDelta::seconds(i64::from(DEFAULT_TOKEN_TTL_SECONDS)),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_token_ttl_seconds(mut self, seconds: u32) -> Self {
        self.token_ttl = TimeDelta::seconds(i64::from(seconds.max(1)));
        self
    }

    #[must_use]
    pub fn with_delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    #[must_use]
    pub fn token_ttl(&self) -> TimeDelta {
        self.token_ttl
    }

    #[must_use]
    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// `{base}/verify-login?code=..&account=..`
    ///
    /// # Errors
    /// Returns an error if the base URL cannot carry a path.
    pub fn verification_link(&self, code: &str, account: AccountId) -> Result<Url> {
        let mut url = self.verify_base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("verification base URL cannot be a base: {}", self.verify_base_url))?
            .pop_if_empty()
            .push("verify-login");
        url.query_pairs_mut()
            .append_pair("code", code)
            .append_pair("account", &account.to_string());
        Ok(url)
    }
}

/// Why the user is asked to verify.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChallengeReason {
    Mismatch(Vec<ContextField>),
    Suspicious { attempts: u32 },
}

impl ChallengeReason {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Mismatch(fields) => {
                let names: Vec<&str> = fields.iter().map(|field| field.as_str()).collect();
                format!("sign-in from an unrecognized context ({})", names.join(", "))
            }
            Self::Suspicious { attempts } => {
                format!("{attempts} sign-in attempts from an unrecognized context; device suspended")
            }
        }
    }
}

/// Message handed to the delivery collaborator.
#[derive(Clone, Debug)]
pub struct VerificationMessage {
    pub account: AccountId,
    pub device_key: DeviceKey,
    pub code: SecretString,
    pub link: SecretString,
    pub expires_at: DateTime<Utc>,
    pub reason: ChallengeReason,
}

/// Outbound channel for verification messages (email in production).
///
/// `scope` is the key scope the token was written in. A delivery that
/// persists the message writes it there, so it is released by the same commit
/// as the token.
pub trait MessageDelivery: Send + Sync {
    fn deliver<'a>(
        &'a self,
        scope: &'a mut dyn KeyScope,
        message: &'a VerificationMessage,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Result of [`VerificationNotifier::issue_or_reuse`].
#[derive(Debug)]
pub enum Issuance {
    Minted {
        token: VerificationToken,
        code: SecretString,
    },
    Reused(VerificationToken),
}

impl Issuance {
    #[must_use]
    pub fn token(&self) -> &VerificationToken {
        match self {
            Self::Minted { token, .. } | Self::Reused(token) => token,
        }
    }

    #[must_use]
    pub fn into_token(self) -> VerificationToken {
        match self {
            Self::Minted { token, .. } | Self::Reused(token) => token,
        }
    }

    #[must_use]
    pub fn is_minted(&self) -> bool {
        matches!(self, Self::Minted { .. })
    }
}

pub struct VerificationNotifier {
    store: Arc<dyn ContextStore>,
    delivery: Arc<dyn MessageDelivery>,
    config: NotifierConfig,
}

impl VerificationNotifier {
    pub fn new(
        store: Arc<dyn ContextStore>,
        delivery: Arc<dyn MessageDelivery>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Return the live token of the scope's key, or mint and store a new one.
    /// Nothing is delivered here; see [`Self::deliver`].
    ///
    /// # Errors
    /// Store failures map to [`EngineError::Persistence`].
    pub async fn issue_or_reuse(
        &self,
        scope: &mut dyn KeyScope,
        pending: &ContextAttributes,
        now: DateTime<Utc>,
    ) -> Result<Issuance, EngineError> {
        if let Some(token) = within(self.config.store_timeout, scope.live_token(now)).await? {
            return Ok(Issuance::Reused(token));
        }

        let code = generate_secret().map_err(|err| EngineError::TransientInfra(format!("{err:#}")))?;
        let key = scope.key().clone();
        let token = VerificationToken {
            id: Uuid::now_v7(),
            account: key.account,
            device_key: key.device_key,
            code_hash: hash_secret(&code),
            issued_at: now,
            expires_at: now + self.config.token_ttl,
            consumed_at: None,
            pending: pending.clone(),
        };
        within(self.config.store_timeout, scope.insert_token(&token)).await?;

        Ok(Issuance::Minted {
            token,
            code: SecretString::from(code),
        })
    }

    /// Send a freshly minted code through `scope`. Reused tokens were delivered when minted.
    ///
    /// # Errors
    /// Delivery failure or timeout is [`EngineError::TransientInfra`].
    pub async fn deliver(
        &self,
        scope: &mut dyn KeyScope,
        issuance: &Issuance,
        reason: ChallengeReason,
    ) -> Result<bool, EngineError> {
        let Issuance::Minted { token, code } = issuance else {
            return Ok(false);
        };

        let link = self
            .config
            .verification_link(code.expose_secret(), token.account)
            .map_err(|err| EngineError::TransientInfra(format!("{err:#}")))?;
        let message = VerificationMessage {
            account: token.account,
            device_key: token.device_key.clone(),
            code: code.clone(),
            link: SecretString::from(String::from(link)),
            expires_at: token.expires_at,
            reason,
        };

        match timeout(self.config.delivery_timeout, self.delivery.deliver(scope, &message)).await {
            Ok(Ok(())) => {
                info!(account = %token.account, device_key = %token.device_key, "verification code delivered");
                Ok(true)
            }
            Ok(Err(err)) => Err(EngineError::TransientInfra(format!(
                "verification delivery failed: {err:#}"
            ))),
            Err(_) => Err(EngineError::TransientInfra(format!(
                "verification delivery timed out after {}ms",
                self.config.delivery_timeout.as_millis()
            ))),
        }
    }

    /// Ask the user to confirm `signature` after a mismatch.
    ///
    /// # Errors
    /// See [`Self::issue_or_reuse`] and [`Self::deliver`]; nothing is stored when delivery fails.
    pub async fn challenge(
        &self,
        account: AccountId,
        signature: &ContextSignature,
        fields: Vec<ContextField>,
    ) -> Result<VerificationToken, EngineError> {
        self.challenge_at(account, signature, fields, Utc::now()).await
    }

    #[instrument(skip_all, fields(account = %account))]
    pub(crate) async fn challenge_at(
        &self,
        account: AccountId,
        signature: &ContextSignature,
        fields: Vec<ContextField>,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, EngineError> {
        let key = ScopeKey::new(account, signature.device_key());
        let mut scope = within(self.config.store_timeout, self.store.lock(&key))
            .await
            .map_err(|err| EngineError::unavailable(&err))?;

        let issuance = self
            .issue_or_reuse(scope.as_mut(), &signature.attributes, now)
            .await?;
        self.deliver(scope.as_mut(), &issuance, ChallengeReason::Mismatch(fields))
            .await?;
        within(self.config.store_timeout, scope.commit()).await?;

        Ok(issuance.into_token())
    }

    /// Complete a challenge.
    ///
    /// On success the context recorded at issuance becomes trusted, the
    /// attempt counter is reset and a temporary block is lifted.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a rejected code; infrastructure errors otherwise.
    pub async fn consume(
        &self,
        code: &SecretString,
        account_hint: Option<AccountId>,
    ) -> Result<TrustedContext, EngineError> {
        self.consume_at(code, account_hint, Utc::now()).await
    }

    #[instrument(skip_all, fields(account_hint = ?account_hint))]
    pub(crate) async fn consume_at(
        &self,
        code: &SecretString,
        account_hint: Option<AccountId>,
        now: DateTime<Utc>,
    ) -> Result<TrustedContext, EngineError> {
        let code = code.expose_secret().trim();
        if code.is_empty() {
            return Err(ValidationError::UnknownCode.into());
        }
        let code_hash = hash_secret(code);
        let store_timeout = self.config.store_timeout;

        let token = within(store_timeout, self.store.token_by_code_hash(&code_hash))
            .await
            .map_err(|err| EngineError::unavailable(&err))?
            .ok_or(ValidationError::UnknownCode)?;

        if account_hint.is_some_and(|hint| hint != token.account) {
            return Err(ValidationError::AccountMismatch.into());
        }
        if token.is_consumed() {
            return Err(ValidationError::AlreadyConsumed.into());
        }
        if token.is_expired(now) {
            return Err(ValidationError::Expired.into());
        }

        let key = ScopeKey::new(token.account, token.device_key.clone());
        let mut scope = within(store_timeout, self.store.lock(&key))
            .await
            .map_err(|err| EngineError::unavailable(&err))?;

        if within(store_timeout, blocks::permanent(scope.as_mut()))
            .await
            .map_err(|err| EngineError::unavailable(&err))?
            .is_some()
        {
            warn!(key = %key, "verification code presented for a permanently blocked device");
            return Err(ValidationError::DeviceBlocked.into());
        }

        // A concurrent consumer may have won between the lookup and the lock.
        let consumed = within(store_timeout, scope.consume_token(token.id, now))
            .await?
            .ok_or(ValidationError::AlreadyConsumed)?;

        let trusted = within(
            store_timeout,
            profile::promote(scope.as_mut(), consumed.account, &consumed.pending, now),
        )
        .await?;
        within(store_timeout, ledger::reset(scope.as_mut())).await?;
        within(store_timeout, blocks::lift_suspension(scope.as_mut())).await?;
        within(store_timeout, scope.commit()).await?;

        info!(account = %trusted.account, device_key = %trusted.device_key, "context verified");
        Ok(trusted)
    }
}

/// 32 random bytes, URL-safe base64 without padding.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random secret")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// SHA-256 of a secret; the only form that reaches storage.
#[must_use]
pub fn hash_secret(secret: &str) -> Vec<u8> {
    Sha256::digest(secret.as_bytes()).to_vec()
}

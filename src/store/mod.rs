//! Durable state behind the risk engine.
//!
//! Every mutation of attempt counters, blocks, tokens and trusted contexts
//! happens through a [`KeyScope`]: a handle that holds an exclusive lock on one
//! `(account, device key)` pair until it is committed or dropped. Dropping a
//! scope without [`KeyScope::commit`] discards its writes. That makes "check
//! the permanent block, then act" and "increment, then escalate" atomic per key
//! across every service instance sharing the store.

pub mod memory;
pub mod postgres;

#[cfg(test)]
pub(crate) mod container;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::BoxFuture;
use crate::engine::context::{AccountId, ContextAttributes, DeviceKey, TrustedContext};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bound a store operation; an elapsed deadline reads as [`StoreError::Unavailable`].
pub async fn within<T, F>(limit: Duration, operation: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "no answer within {}ms",
            limit.as_millis()
        ))),
    }
}

/// The unit of locking: one device of one account.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub account: AccountId,
    pub device_key: DeviceKey,
}

impl ScopeKey {
    #[must_use]
    pub fn new(account: AccountId, device_key: DeviceKey) -> Self {
        Self {
            account,
            device_key,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account, self.device_key)
    }
}

/// Classification recorded with the last counted attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Mismatch,
    Suspicious,
    Blocked,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mismatch => "mismatch",
            Self::Suspicious => "suspicious",
            Self::Blocked => "blocked",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mismatch" => Ok(Self::Mismatch),
            "suspicious" => Ok(Self::Suspicious),
            "blocked" => Ok(Self::Blocked),
            other => Err(StoreError::Read(format!("unknown attempt outcome: {other}"))),
        }
    }
}

/// Consecutive unverified mismatched attempts for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    pub account: AccountId,
    pub device_key: DeviceKey,
    pub attempt_count: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_outcome: AttemptOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub account: AccountId,
    pub device_key: DeviceKey,
    pub blocked_at: DateTime<Utc>,
    pub permanent: bool,
    pub reason: String,
}

/// One-time verification token. Only the SHA-256 of the code is kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationToken {
    pub id: Uuid,
    pub account: AccountId,
    pub device_key: DeviceKey,
    pub code_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    /// Context to trust once the token is consumed.
    pub pending: ContextAttributes,
}

impl VerificationToken {
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_consumed() && !self.is_expired(now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Attempt,
    InvalidCredentials,
    Granted,
    VerificationRequired,
    TemporarilyBlocked,
    PermanentlyBlocked,
    ContextError,
    Verified,
    VerificationRejected,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attempt => "attempt",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Granted => "granted",
            Self::VerificationRequired => "verification_required",
            Self::TemporarilyBlocked => "temporarily_blocked",
            Self::PermanentlyBlocked => "permanently_blocked",
            Self::ContextError => "context_error",
            Self::Verified => "verified",
            Self::VerificationRejected => "verification_rejected",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Audit trail entry for a sign-in attempt or verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignInEvent {
    pub account: AccountId,
    pub device_key: Option<DeviceKey>,
    pub ip: Option<IpAddr>,
    pub kind: EventKind,
    pub level: EventLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Message for the outbox worker, written inside a [`KeyScope`] so it only
/// becomes visible when the scope commits.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxMessage {
    pub account: AccountId,
    pub template: String,
    pub payload: serde_json::Value,
}

/// Exclusive, transactional access to one [`ScopeKey`].
pub trait KeyScope: Send {
    fn key(&self) -> &ScopeKey;

    /// Block entry for the key, permanent or temporary.
    fn block(&mut self) -> BoxFuture<'_, StoreResult<Option<BlockEntry>>>;

    /// Every trusted context of the account, across all device keys.
    fn trusted_contexts(&mut self) -> BoxFuture<'_, StoreResult<Vec<TrustedContext>>>;

    /// Move `last_confirmed_at` of an existing trusted context.
    fn confirm_trusted(&mut self, id: Uuid, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<()>>;

    /// Insert the context, or refresh the existing one for `(account, device_key)`.
    /// Returns the stored row, which keeps its original id and `first_seen_at`.
    fn upsert_trusted<'a>(
        &'a mut self,
        context: &'a TrustedContext,
    ) -> BoxFuture<'a, StoreResult<TrustedContext>>;

    fn attempts(&mut self) -> BoxFuture<'_, StoreResult<Option<AttemptRecord>>>;

    /// Add one to the counter, creating it on first use. Returns the new record.
    fn increment_attempts(&mut self, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<AttemptRecord>>;

    fn set_attempt_outcome(&mut self, outcome: AttemptOutcome) -> BoxFuture<'_, StoreResult<()>>;

    /// Drop the counter. Idempotent.
    fn reset_attempts(&mut self) -> BoxFuture<'_, StoreResult<()>>;

    /// Write a block. A permanent entry is never downgraded to temporary.
    fn put_block<'a>(&'a mut self, entry: &'a BlockEntry) -> BoxFuture<'a, StoreResult<()>>;

    /// Remove a temporary block; permanent entries are left alone.
    fn clear_temporary_block(&mut self) -> BoxFuture<'_, StoreResult<()>>;

    /// The unconsumed, unexpired token for the key, if any.
    fn live_token(&mut self, now: DateTime<Utc>) -> BoxFuture<'_, StoreResult<Option<VerificationToken>>>;

    fn insert_token<'a>(&'a mut self, token: &'a VerificationToken) -> BoxFuture<'a, StoreResult<()>>;

    /// Mark the token consumed if it is still live. `None` when it was not.
    fn consume_token(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<Option<VerificationToken>>>;

    /// Queue an outbound message with the scope's other writes.
    fn enqueue_message<'a>(&'a mut self, message: &'a OutboxMessage) -> BoxFuture<'a, StoreResult<()>>;

    fn commit(self: Box<Self>) -> BoxFuture<'static, StoreResult<()>>;
}

/// Durable store for trust profiles, attempt ledger, block registry and tokens.
pub trait ContextStore: Send + Sync {
    /// Wait for the exclusive lock on `key`.
    fn lock<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Box<dyn KeyScope>>>;

    fn trusted_contexts(&self, account: AccountId) -> BoxFuture<'_, StoreResult<Vec<TrustedContext>>>;

    fn attempt_record<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Option<AttemptRecord>>>;

    fn block_entry<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Option<BlockEntry>>>;

    fn token_by_code_hash<'a>(
        &'a self,
        code_hash: &'a [u8],
    ) -> BoxFuture<'a, StoreResult<Option<VerificationToken>>>;

    /// Whether context-aware sign-in is enabled for the account (default on).
    fn context_auth_enabled(&self, account: AccountId) -> BoxFuture<'_, StoreResult<bool>>;

    fn record_event<'a>(&'a self, event: &'a SignInEvent) -> BoxFuture<'a, StoreResult<()>>;

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>>;
}

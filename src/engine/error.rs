//! Engine error taxonomy.
//!
//! Security decisions are never errors: `Blocked` and friends are
//! [`super::Outcome`] variants. Errors mean "no decision was made" or "a
//! verification code was rejected".

use thiserror::Error;

use crate::store::StoreError;

/// Rejected verification attempt. Never touches the attempt ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("verification code is not recognized")]
    UnknownCode,
    #[error("verification code belongs to another account")]
    AccountMismatch,
    #[error("verification code has expired")]
    Expired,
    #[error("verification code was already used")]
    AlreadyConsumed,
    #[error("device is permanently blocked")]
    DeviceBlocked,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Lookup, delivery or store timeout. Nothing was written.
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),
    /// A store write failed mid-operation; the operation was not applied.
    #[error("persistence failure")]
    Persistence(#[source] StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl EngineError {
    /// Map a failed read or lock, before anything was written.
    pub(crate) fn unavailable(err: &StoreError) -> Self {
        Self::TransientInfra(err.to_string())
    }

    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::Persistence(err)
    }
}

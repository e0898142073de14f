//! Attempt ledger: consecutive unverified mismatches per `(account, device key)`.
//!
//! The counter lives in the store and is only touched through a locked
//! [`KeyScope`], so concurrent attempts for one key serialize on the lock and
//! every increment observes the previous one.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::store::{AttemptOutcome, AttemptRecord, KeyScope, StoreResult};

pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;

/// Escalation thresholds `T` (temporary block) and `T2` (permanent block).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    escalation: u32,
    block: u32,
}

/// What a post-increment count means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Escalation {
    Challenge,
    Suspend,
    Block,
}

impl Thresholds {
    /// # Errors
    /// Returns an error when `escalation` is zero or `block` does not exceed it.
    pub fn new(escalation: u32, block: u32) -> Result<Self> {
        if escalation == 0 {
            bail!("escalation threshold must be at least 1");
        }
        if block <= escalation {
            bail!("block threshold ({block}) must exceed escalation threshold ({escalation})");
        }
        Ok(Self { escalation, block })
    }

    /// `T2` defaults to twice `T`.
    ///
    /// # Errors
    /// Returns an error when `escalation` is zero.
    pub fn with_default_block(escalation: u32) -> Result<Self> {
        Self::new(escalation, escalation.saturating_mul(2))
    }

    #[must_use]
    pub fn escalation(&self) -> u32 {
        self.escalation
    }

    #[must_use]
    pub fn block(&self) -> u32 {
        self.block
    }

    #[must_use]
    pub fn classify(&self, attempt_count: u32) -> Escalation {
        if attempt_count >= self.block {
            Escalation::Block
        } else if attempt_count >= self.escalation {
            Escalation::Suspend
        } else {
            Escalation::Challenge
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            escalation: DEFAULT_ESCALATION_THRESHOLD,
            block: DEFAULT_ESCALATION_THRESHOLD * 2,
        }
    }
}

pub async fn increment(scope: &mut dyn KeyScope, at: DateTime<Utc>) -> StoreResult<AttemptRecord> {
    let record = scope.increment_attempts(at).await?;
    debug!(key = %scope.key(), count = record.attempt_count, "attempt counted");
    Ok(record)
}

pub async fn record_outcome(scope: &mut dyn KeyScope, outcome: AttemptOutcome) -> StoreResult<()> {
    scope.set_attempt_outcome(outcome).await
}

pub async fn reset(scope: &mut dyn KeyScope) -> StoreResult<()> {
    scope.reset_attempts().await
}

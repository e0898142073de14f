//! Risk evaluator: classifies one sign-in attempt.
//!
//! The whole evaluation runs under the store lock for `(account, device key)`.
//! Reads happen first; a failed lock or read yields
//! [`Outcome::ContextUnavailable`] with nothing written. Once the first write
//! has been issued, any store failure is an [`EngineError::Persistence`] and
//! the scope is dropped uncommitted.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::blocks;
use super::context::{AccountId, Capture};
use super::error::EngineError;
use super::ledger::{self, Escalation, Thresholds};
use super::notifier::{ChallengeReason, VerificationNotifier};
use super::outcome::{Outcome, UnavailableReason};
use super::profile;
use crate::store::{AttemptOutcome, ContextStore, ScopeKey, StoreError, within};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug)]
pub struct RiskPolicy {
    thresholds: Thresholds,
    store_timeout: Duration,
}

impl RiskPolicy {
    #[must_use]
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

pub struct RiskEvaluator {
    store: Arc<dyn ContextStore>,
    notifier: Arc<VerificationNotifier>,
    policy: RiskPolicy,
}

impl RiskEvaluator {
    pub fn new(store: Arc<dyn ContextStore>, notifier: Arc<VerificationNotifier>, policy: RiskPolicy) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Classify an attempt by `account` with the captured context.
    ///
    /// # Errors
    /// [`EngineError::Persistence`] when a store write fails and
    /// [`EngineError::TransientInfra`] when a suspension code cannot be delivered.
    pub async fn evaluate(&self, account: AccountId, capture: &Capture) -> Result<Outcome, EngineError> {
        self.evaluate_at(account, capture, Utc::now()).await
    }

    #[instrument(skip_all, fields(account = %account))]
    pub(crate) async fn evaluate_at(
        &self,
        account: AccountId,
        capture: &Capture,
        now: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        let signature = match capture {
            Capture::Complete(signature) => signature,
            Capture::Incomplete(partial) => {
                let missing = partial.missing();
                warn!(?missing, "context capture incomplete");
                return Ok(Outcome::ContextUnavailable {
                    reason: UnavailableReason::CaptureIncomplete { missing },
                });
            }
        };

        let limit = self.policy.store_timeout;
        let key = ScopeKey::new(account, signature.device_key());
        let mut scope = match within(limit, self.store.lock(&key)).await {
            Ok(scope) => scope,
            Err(err) => return Ok(store_unreachable(&key, &err)),
        };

        let existing_block = match within(limit, scope.block()).await {
            Ok(entry) => entry,
            Err(err) => return Ok(store_unreachable(&key, &err)),
        };
        if let Some(block) = existing_block.as_ref().filter(|entry| entry.permanent) {
            info!(device_key = %key.device_key, "permanently blocked device");
            return Ok(Outcome::Blocked {
                block: block.clone(),
            });
        }

        let trusted = match within(limit, scope.trusted_contexts()).await {
            Ok(trusted) => trusted,
            Err(err) => return Ok(store_unreachable(&key, &err)),
        };
        let baseline = profile::closest_match(&trusted, &signature.attributes, &key.device_key);

        if let Some(context) = baseline.context.filter(|_| baseline.mismatched.is_empty()) {
            let context = within(limit, profile::confirm(scope.as_mut(), context, now)).await?;
            within(limit, ledger::reset(scope.as_mut())).await?;
            if existing_block.is_some() {
                within(limit, blocks::lift_suspension(scope.as_mut())).await?;
            }
            within(limit, scope.commit()).await?;
            info!(device_key = %key.device_key, outcome = "ok", "context matched");
            return Ok(Outcome::Ok { context });
        }

        let fields = baseline.mismatched.clone();
        let reference = baseline.context.cloned();
        let record = within(limit, ledger::increment(scope.as_mut(), now)).await?;
        let attempts = record.attempt_count;

        let outcome = match self.policy.thresholds.classify(attempts) {
            Escalation::Challenge => {
                within(limit, ledger::record_outcome(scope.as_mut(), AttemptOutcome::Mismatch)).await?;
                Outcome::Mismatch {
                    fields,
                    reference,
                    attempts,
                }
            }
            Escalation::Suspend => {
                let issuance = self
                    .notifier
                    .issue_or_reuse(scope.as_mut(), &signature.attributes, now)
                    .await?;
                if existing_block.is_none() {
                    within(limit, blocks::suspend(scope.as_mut(), now)).await?;
                }
                within(limit, ledger::record_outcome(scope.as_mut(), AttemptOutcome::Suspicious)).await?;
                // Queued in this scope: a failed send or a failed commit drops token and message together.
                self.notifier
                    .deliver(scope.as_mut(), &issuance, ChallengeReason::Suspicious { attempts })
                    .await?;
                Outcome::Suspicious {
                    token: issuance.into_token(),
                    attempts,
                }
            }
            Escalation::Block => {
                let block = within(limit, blocks::block_permanently(scope.as_mut(), now)).await?;
                within(limit, ledger::record_outcome(scope.as_mut(), AttemptOutcome::Blocked)).await?;
                Outcome::Blocked { block }
            }
        };
        within(limit, scope.commit()).await?;

        info!(
            device_key = %key.device_key,
            outcome = outcome.label(),
            attempts,
            "context mismatch"
        );
        Ok(outcome)
    }
}

fn store_unreachable(key: &ScopeKey, err: &StoreError) -> Outcome {
    warn!(key = %key, "store unreachable during evaluation: {err}");
    Outcome::ContextUnavailable {
        reason: UnavailableReason::StoreUnreachable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{ContextField, PartialContext, TrustedContext};
    use crate::engine::test_support::{Harness, attributes, signature};
    use crate::store::BlockEntry;
    use anyhow::{Result, bail};
    use uuid::Uuid;

    fn complete(attributes: crate::engine::context::ContextAttributes) -> Capture {
        Capture::Complete(signature(attributes))
    }

    fn seed_home(harness: &Harness, account: AccountId) -> Result<TrustedContext> {
        let home = TrustedContext::new(account, attributes("US", "D1", "macOS", "Chrome"), Utc::now());
        harness.store.seed_trusted(home.clone())?;
        Ok(home)
    }

    #[tokio::test]
    async fn exact_match_is_ok_and_leaves_no_attempts() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        let home = seed_home(&harness, account)?;

        let outcome = harness
            .evaluator
            .evaluate(account, &complete(home.attributes.clone()))
            .await?;
        match outcome {
            Outcome::Ok { context } => {
                assert_eq!(context.id, home.id);
                assert!(context.last_confirmed_at >= home.last_confirmed_at);
            }
            other => bail!("expected ok, got {other:?}"),
        }

        let key = ScopeKey::new(account, home.device_key.clone());
        assert_eq!(harness.store.attempt_record(&key).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn scenario_country_change_is_a_mismatch() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        let home = seed_home(&harness, account)?;

        let first = harness
            .evaluator
            .evaluate(account, &complete(attributes("US", "D1", "macOS", "Chrome")))
            .await?;
        assert!(first.is_ok());

        let mut abroad = attributes("FR", "D1", "macOS", "Chrome");
        abroad.city = home.attributes.city.clone();
        let second = harness.evaluator.evaluate(account, &complete(abroad)).await?;
        match second {
            Outcome::Mismatch {
                fields,
                reference,
                attempts,
            } => {
                assert_eq!(fields, vec![ContextField::Country]);
                assert_eq!(reference.map(|r| r.id), Some(home.id));
                assert_eq!(attempts, 1);
            }
            other => bail!("expected mismatch, got {other:?}"),
        }

        let key = ScopeKey::new(account, home.device_key);
        assert_eq!(
            harness.store.attempt_record(&key).await?.map(|r| r.attempt_count),
            Some(1)
        );
        Ok(())
    }

    #[tokio::test]
    async fn escalation_sequence() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        seed_home(&harness, account)?;
        let abroad = complete(attributes("FR", "D1", "macOS", "Chrome"));

        let mut labels = Vec::new();
        let mut tokens = Vec::new();
        for _ in 0..8 {
            let outcome = harness.evaluator.evaluate(account, &abroad).await?;
            if let Outcome::Suspicious { token, .. } = &outcome {
                tokens.push(token.id);
            }
            labels.push(outcome.label());
        }

        assert_eq!(
            labels,
            vec![
                "mismatch",
                "mismatch",
                "suspicious",
                "suspicious",
                "suspicious",
                "blocked",
                "blocked",
                "blocked",
            ]
        );
        assert_eq!(tokens.len(), 3);
        assert!(tokens.iter().all(|id| *id == tokens[0]));
        assert_eq!(harness.delivery.count(), 1);

        // Blocked attempts are not counted further.
        let key = ScopeKey::new(account, attributes("FR", "D1", "macOS", "Chrome").device_key());
        assert_eq!(
            harness.store.attempt_record(&key).await?.map(|r| r.attempt_count),
            Some(6)
        );
        Ok(())
    }

    #[tokio::test]
    async fn permanent_block_dominates_any_signature() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        let home = seed_home(&harness, account)?;
        harness.store.seed_block(BlockEntry {
            account,
            device_key: home.device_key.clone(),
            blocked_at: Utc::now(),
            permanent: true,
            reason: "administrative".to_string(),
        })?;

        let mut elsewhere = attributes("DE", "D1", "macOS", "Chrome");
        elsewhere.ip = "198.51.100.7".parse()?;
        for candidate in [home.attributes.clone(), elsewhere] {
            let outcome = harness.evaluator.evaluate(account, &complete(candidate)).await?;
            assert!(matches!(outcome, Outcome::Blocked { .. }), "got {outcome:?}");
        }

        let key = ScopeKey::new(account, home.device_key);
        assert_eq!(harness.store.attempt_record(&key).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn verification_resets_escalation() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        seed_home(&harness, account)?;
        let abroad = complete(attributes("FR", "D1", "macOS", "Chrome"));

        for _ in 0..3 {
            harness.evaluator.evaluate(account, &abroad).await?;
        }
        let Some(code) = harness.delivery.last_code() else {
            bail!("suspension must deliver a code");
        };
        harness.notifier.consume(&code, Some(account)).await?;

        let outcome = harness.evaluator.evaluate(account, &abroad).await?;
        assert!(outcome.is_ok(), "got {outcome:?}");
        let key = ScopeKey::new(account, attributes("FR", "D1", "macOS", "Chrome").device_key());
        assert_eq!(harness.store.attempt_record(&key).await?, None);
        assert_eq!(harness.store.block_entry(&key).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn first_sign_in_mismatches_every_field() -> Result<()> {
        let harness = Harness::new()?;
        let outcome = harness
            .evaluator
            .evaluate(Uuid::now_v7(), &complete(attributes("US", "D1", "macOS", "Chrome")))
            .await?;
        match outcome {
            Outcome::Mismatch {
                fields, reference, ..
            } => {
                assert_eq!(fields, ContextField::ALL.to_vec());
                assert_eq!(reference, None);
            }
            other => bail!("expected mismatch, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn incomplete_capture_writes_nothing() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        let partial = PartialContext {
            ip: Some("203.0.113.10".parse()?),
            ..PartialContext::default()
        };

        let outcome = harness
            .evaluator
            .evaluate(account, &Capture::Incomplete(partial))
            .await?;
        assert!(matches!(
            outcome,
            Outcome::ContextUnavailable {
                reason: UnavailableReason::CaptureIncomplete { .. }
            }
        ));
        assert!(harness.store.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_store_is_context_unavailable() -> Result<()> {
        let harness = Harness::new()?;
        harness.store.set_unavailable(true);
        let outcome = harness
            .evaluator
            .evaluate(Uuid::now_v7(), &complete(attributes("US", "D1", "macOS", "Chrome")))
            .await?;
        assert!(matches!(
            outcome,
            Outcome::ContextUnavailable {
                reason: UnavailableReason::StoreUnreachable(_)
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn write_failure_is_persistence_error() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        seed_home(&harness, account)?;
        harness.store.fail_writes(true);

        let result = harness
            .evaluator
            .evaluate(account, &complete(attributes("FR", "D1", "macOS", "Chrome")))
            .await;
        assert!(matches!(result, Err(EngineError::Persistence(_))), "got {result:?}");
        Ok(())
    }

    #[tokio::test]
    async fn failed_suspension_delivery_rolls_back() -> Result<()> {
        let harness = Harness::new()?;
        let account = Uuid::now_v7();
        seed_home(&harness, account)?;
        let abroad = complete(attributes("FR", "D1", "macOS", "Chrome"));
        let key = ScopeKey::new(account, attributes("FR", "D1", "macOS", "Chrome").device_key());

        for _ in 0..2 {
            harness.evaluator.evaluate(account, &abroad).await?;
        }
        harness.delivery.set_failing(true);
        let result = harness.evaluator.evaluate(account, &abroad).await;
        assert!(matches!(result, Err(EngineError::TransientInfra(_))));
        assert_eq!(
            harness.store.attempt_record(&key).await?.map(|r| r.attempt_count),
            Some(2)
        );
        assert_eq!(harness.store.block_entry(&key).await?, None);

        harness.delivery.set_failing(false);
        let outcome = harness.evaluator.evaluate(account, &abroad).await?;
        assert!(matches!(outcome, Outcome::Suspicious { attempts: 3, .. }));
        assert_eq!(harness.delivery.count(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts_are_all_counted() -> Result<()> {
        let harness = Harness::with_thresholds(100, 200)?;
        let account = Uuid::now_v7();
        seed_home(&harness, account)?;
        let abroad = complete(attributes("FR", "D1", "macOS", "Chrome"));

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let evaluator = harness.evaluator.clone();
                let capture = abroad.clone();
                tokio::spawn(async move { evaluator.evaluate(account, &capture).await })
            })
            .collect();
        for task in tasks {
            let outcome = task.await??;
            assert!(matches!(outcome, Outcome::Mismatch { .. }));
        }

        let key = ScopeKey::new(account, attributes("FR", "D1", "macOS", "Chrome").device_key());
        assert_eq!(
            harness.store.attempt_record(&key).await?.map(|r| r.attempt_count),
            Some(24)
        );
        Ok(())
    }
}

//! Trust profile: the account's trusted contexts and baseline selection.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::context::{AccountId, ContextAttributes, ContextField, DeviceKey, TrustedContext};
use crate::store::{KeyScope, StoreResult};

/// Comparison baseline for a signature.
#[derive(Debug, PartialEq, Eq)]
pub struct Baseline<'a> {
    /// `None` when the account has no trusted context.
    pub context: Option<&'a TrustedContext>,
    pub mismatched: Vec<ContextField>,
}

impl Baseline<'_> {
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.context.is_some() && self.mismatched.is_empty()
    }
}

/// Pick the trusted context with the fewest differing fields.
///
/// Ties go to the context of the same device, then to the most recently
/// confirmed one. With no trusted contexts every field is mismatched.
#[must_use]
pub fn closest_match<'a>(
    contexts: &'a [TrustedContext],
    attributes: &ContextAttributes,
    device_key: &DeviceKey,
) -> Baseline<'a> {
    let best = contexts
        .iter()
        .map(|context| (context, context.attributes.diff(attributes)))
        .min_by(|(a, a_diff), (b, b_diff)| {
            a_diff
                .len()
                .cmp(&b_diff.len())
                .then_with(|| (&b.device_key == device_key).cmp(&(&a.device_key == device_key)))
                .then_with(|| b.last_confirmed_at.cmp(&a.last_confirmed_at))
        });

    match best {
        Some((context, mismatched)) => Baseline {
            context: Some(context),
            mismatched,
        },
        None => Baseline {
            context: None,
            mismatched: ContextField::ALL.to_vec(),
        },
    }
}

/// Re-confirm an exactly matching context.
pub async fn confirm(
    scope: &mut dyn KeyScope,
    context: &TrustedContext,
    at: DateTime<Utc>,
) -> StoreResult<TrustedContext> {
    scope.confirm_trusted(context.id, at).await?;
    Ok(TrustedContext {
        last_confirmed_at: at,
        ..context.clone()
    })
}

/// Trust `attributes` for the account, creating or refreshing the row for its device key.
pub async fn promote(
    scope: &mut dyn KeyScope,
    account: AccountId,
    attributes: &ContextAttributes,
    at: DateTime<Utc>,
) -> StoreResult<TrustedContext> {
    let candidate = TrustedContext::new(account, attributes.clone(), at);
    let stored = scope.upsert_trusted(&candidate).await?;
    debug!(
        account = %account,
        device_key = %stored.device_key,
        "context promoted to trusted"
    );
    Ok(stored)
}

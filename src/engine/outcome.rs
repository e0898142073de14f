use std::fmt;

use super::context::{ContextField, TrustedContext};
use crate::store::{BlockEntry, VerificationToken};

/// Why no decision could be made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnavailableReason {
    /// One or more lookups failed while capturing the request context.
    CaptureIncomplete { missing: Vec<ContextField> },
    /// The store could not be locked or read in time.
    StoreUnreachable(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaptureIncomplete { missing } => {
                let names: Vec<&str> = missing.iter().map(|field| field.as_str()).collect();
                write!(f, "context capture incomplete: {}", names.join(", "))
            }
            Self::StoreUnreachable(detail) => write!(f, "store unreachable: {detail}"),
        }
    }
}

/// Decision for one sign-in attempt. Callers must handle every variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Exact match with a trusted context, which has been re-confirmed.
    Ok { context: TrustedContext },
    /// Below the escalation threshold. `reference` is `None` when the account
    /// has no trusted context at all.
    Mismatch {
        fields: Vec<ContextField>,
        reference: Option<TrustedContext>,
        attempts: u32,
    },
    /// Device is temporarily blocked until the token is consumed.
    Suspicious {
        token: VerificationToken,
        attempts: u32,
    },
    Blocked { block: BlockEntry },
    ContextUnavailable { reason: UnavailableReason },
}

impl Outcome {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::Mismatch { .. } => "mismatch",
            Self::Suspicious { .. } => "suspicious",
            Self::Blocked { .. } => "blocked",
            Self::ContextUnavailable { .. } => "context_unavailable",
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

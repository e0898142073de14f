//! Context-aware sign-in risk engine.
//!
//! Leaves first: [`context`] and [`capture`] build the request signature,
//! [`profile`], [`ledger`] and [`blocks`] read and mutate per-key state through a
//! locked [`crate::store::KeyScope`], [`notifier`] owns verification tokens,
//! [`evaluator`] makes the decision and [`orchestrator`] maps it to what callers
//! see.

pub mod agent;
pub mod blocks;
pub mod capture;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod geo;
pub mod ledger;
pub mod notifier;
pub mod orchestrator;
pub mod outcome;
pub mod profile;

#[cfg(test)]
pub(crate) mod test_support;

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the collaborator traits so they stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use context::{AccountId, ContextField, ContextSignature, DeviceKey, RequestContext};
pub use error::{EngineError, ValidationError};
pub use evaluator::{RiskEvaluator, RiskPolicy};
pub use outcome::Outcome;

//! # Trustgate (context-aware sign-in risk engine)
//!
//! `trustgate` decides, after credentials have been verified, whether a sign-in
//! attempt gets a session, must be confirmed through an out-of-band
//! verification link, or is rejected. The decision compares the environmental
//! context of the request (network origin, coarse geography, device, operating
//! system, browser) against the contexts the account has already trusted.
//!
//! ## Decision flow
//!
//! 1. [`engine::capture`] builds a [`engine::context::ContextSignature`] from the
//!    request. Lookups are time-bounded; a failed lookup marks the capture as
//!    incomplete instead of filling fields with empty strings.
//! 2. [`engine::evaluator::RiskEvaluator`] classifies the attempt into one of the
//!    [`engine::outcome::Outcome`] variants while holding a per `(account, device key)`
//!    lock in the store.
//! 3. [`engine::orchestrator::SignInOrchestrator`] maps the outcome to the
//!    caller-visible result and issues a session only for `Ok`.
//!
//! ## Escalation
//!
//! Consecutive mismatched attempts for the same device key are counted. Below
//! `T` the caller is challenged, from `T` the device is temporarily blocked
//! until the emailed code is consumed, and at `T2` the device is blocked
//! permanently. Permanent blocks are never cleared by this service.
//!
//! ## State
//!
//! No decision state lives in process memory. Trusted contexts, attempt
//! counters, blocks and verification tokens live in the store
//! ([`store::postgres::PgContextStore`] in production), so any number of
//! instances can serve sign-ins concurrently.

pub mod api;
pub mod cli;
pub mod engine;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

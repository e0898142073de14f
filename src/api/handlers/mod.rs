//! HTTP handlers for sign-in, context evaluation and verification.

pub mod context;
pub mod health;
pub mod signin;
pub mod types;
pub mod utils;

pub use utils::{ClientIpSource, ServiceToken};

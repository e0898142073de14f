use anyhow::Context;
use clap::{Arg, ArgMatches, Command};

use crate::api::config::DEFAULT_FRONTEND_BASE_URL;
use crate::engine::ledger::{DEFAULT_ESCALATION_THRESHOLD, Thresholds};

pub const ARG_ESCALATION_THRESHOLD: &str = "escalation-threshold";
pub const ARG_BLOCK_THRESHOLD: &str = "block-threshold";
pub const ARG_VERIFICATION_TTL_SECONDS: &str = "verification-ttl-seconds";
pub const ARG_DELIVERY_TIMEOUT_MS: &str = "delivery-timeout-ms";
pub const ARG_STORE_TIMEOUT_MS: &str = "store-timeout-ms";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";

#[derive(Debug, Clone)]
pub struct Options {
    pub thresholds: Thresholds,
    pub verification_ttl_seconds: u32,
    pub delivery_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub session_ttl_seconds: u32,
    pub frontend_base_url: String,
}

impl Options {
    /// Parse escalation and verification arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the thresholds are inconsistent (T = 0 or T2 <= T).
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let escalation = matches
            .get_one::<u32>(ARG_ESCALATION_THRESHOLD)
            .copied()
            .unwrap_or(DEFAULT_ESCALATION_THRESHOLD);
        let thresholds = match matches.get_one::<u32>(ARG_BLOCK_THRESHOLD).copied() {
            Some(block) => Thresholds::new(escalation, block),
            None => Thresholds::with_default_block(escalation),
        }
        .with_context(|| {
            format!("invalid --{ARG_ESCALATION_THRESHOLD}/--{ARG_BLOCK_THRESHOLD}")
        })?;

        Ok(Self {
            thresholds,
            verification_ttl_seconds: matches
                .get_one::<u32>(ARG_VERIFICATION_TTL_SECONDS)
                .copied()
                .unwrap_or(86_400),
            delivery_timeout_ms: matches
                .get_one::<u64>(ARG_DELIVERY_TIMEOUT_MS)
                .copied()
                .unwrap_or(5_000),
            store_timeout_ms: matches
                .get_one::<u64>(ARG_STORE_TIMEOUT_MS)
                .copied()
                .unwrap_or(3_000),
            session_ttl_seconds: matches
                .get_one::<u32>(ARG_SESSION_TTL_SECONDS)
                .copied()
                .unwrap_or(43_200),
            frontend_base_url: matches
                .get_one::<String>(ARG_FRONTEND_BASE_URL)
                .cloned()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FRONTEND_BASE_URL.to_string()),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ESCALATION_THRESHOLD)
                .long(ARG_ESCALATION_THRESHOLD)
                .help("Mismatched attempts before a device is temporarily blocked (T)")
                .env("TRUSTGATE_ESCALATION_THRESHOLD")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_BLOCK_THRESHOLD)
                .long(ARG_BLOCK_THRESHOLD)
                .help("Mismatched attempts before a device is permanently blocked (T2, default 2*T)")
                .env("TRUSTGATE_BLOCK_THRESHOLD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_VERIFICATION_TTL_SECONDS)
                .long(ARG_VERIFICATION_TTL_SECONDS)
                .help("Verification link TTL in seconds")
                .env("TRUSTGATE_VERIFICATION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_DELIVERY_TIMEOUT_MS)
                .long(ARG_DELIVERY_TIMEOUT_MS)
                .help("Verification message delivery timeout in milliseconds")
                .env("TRUSTGATE_DELIVERY_TIMEOUT_MS")
                .default_value("5000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_STORE_TIMEOUT_MS)
                .long(ARG_STORE_TIMEOUT_MS)
                .help("Store lock and query timeout in milliseconds")
                .env("TRUSTGATE_STORE_TIMEOUT_MS")
                .default_value("3000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session TTL in seconds")
                .env("TRUSTGATE_SESSION_TTL_SECONDS")
                .default_value("43200")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL used for verification links")
                .env("TRUSTGATE_FRONTEND_BASE_URL")
                .default_value(DEFAULT_FRONTEND_BASE_URL),
        )
}

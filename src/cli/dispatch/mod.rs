//! Maps validated CLI arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_CREDENTIALS_URL, ARG_EVALUATE_TOKEN, capture, outbox, risk};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let credentials_url = matches
        .get_one::<String>(ARG_CREDENTIALS_URL)
        .cloned()
        .filter(|value| !value.trim().is_empty())
        .with_context(|| format!("missing required argument: --{ARG_CREDENTIALS_URL}"))?;
    let evaluate_token = matches
        .get_one::<String>(ARG_EVALUATE_TOKEN)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| SecretString::from(value.to_string()));

    let risk_opts = risk::Options::parse(matches)?;
    let capture_opts = capture::Options::parse(matches)?;
    let outbox_opts = outbox::Options::parse(matches);

    Ok(Action::Server(Args {
        port,
        dsn,
        credentials_url,
        evaluate_token,
        frontend_base_url: risk_opts.frontend_base_url,
        geo_url: capture_opts.geo_url,
        geo_timeout_ms: capture_opts.geo_timeout_ms,
        client_ip_header: capture_opts.client_ip_header,
        thresholds: risk_opts.thresholds,
        verification_ttl_seconds: risk_opts.verification_ttl_seconds,
        delivery_timeout_ms: risk_opts.delivery_timeout_ms,
        store_timeout_ms: risk_opts.store_timeout_ms,
        session_ttl_seconds: risk_opts.session_ttl_seconds,
        email_outbox_poll_seconds: outbox_opts.poll_seconds,
        email_outbox_batch_size: outbox_opts.batch_size,
        email_outbox_max_attempts: outbox_opts.max_attempts,
        email_outbox_backoff_base_seconds: outbox_opts.backoff_base_seconds,
        email_outbox_backoff_max_seconds: outbox_opts.backoff_max_seconds,
    }))
}

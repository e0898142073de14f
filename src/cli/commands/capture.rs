use clap::{Arg, ArgMatches, Command};

use crate::api::config::DEFAULT_GEO_URL;

pub const ARG_GEO_URL: &str = "geo-url";
pub const ARG_GEO_TIMEOUT_MS: &str = "geo-timeout-ms";
pub const ARG_CLIENT_IP_HEADER: &str = "client-ip-header";

#[derive(Debug, Clone)]
pub struct Options {
    pub geo_url: String,
    pub geo_timeout_ms: u64,
    pub client_ip_header: Option<String>,
}

impl Options {
    /// Parse context capture arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the geolocation URL lacks an `{ip}` placeholder.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let geo_url = matches
            .get_one::<String>(ARG_GEO_URL)
            .cloned()
            .unwrap_or_else(|| DEFAULT_GEO_URL.to_string());
        if !geo_url.contains("{ip}") {
            anyhow::bail!("--{ARG_GEO_URL} must contain an {{ip}} placeholder");
        }

        Ok(Self {
            geo_url,
            geo_timeout_ms: matches
                .get_one::<u64>(ARG_GEO_TIMEOUT_MS)
                .copied()
                .unwrap_or(2_000),
            client_ip_header: matches
                .get_one::<String>(ARG_CLIENT_IP_HEADER)
                .cloned()
                .filter(|value| !value.trim().is_empty()),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GEO_URL)
                .long(ARG_GEO_URL)
                .help("Geolocation lookup URL, `{ip}` is replaced by the client address")
                .env("TRUSTGATE_GEO_URL")
                .default_value(DEFAULT_GEO_URL),
        )
        .arg(
            Arg::new(ARG_GEO_TIMEOUT_MS)
                .long(ARG_GEO_TIMEOUT_MS)
                .help("Geolocation lookup timeout in milliseconds")
                .env("TRUSTGATE_GEO_TIMEOUT_MS")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CLIENT_IP_HEADER)
                .long(ARG_CLIENT_IP_HEADER)
                .help("Header set by a trusted proxy that carries the client address")
                .long_help(
                    "Header set by a trusted proxy that carries the client address (e.g. CF-Connecting-IP).\n\nOnly set this when every request passes through that proxy. When unset or unparsable the socket peer is used; X-Forwarded-For and X-Real-IP are never read on their own.",
                )
                .env("TRUSTGATE_CLIENT_IP_HEADER"),
        )
}

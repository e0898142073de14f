//! Service wiring configuration, filled from the CLI.

use anyhow::{Context, Result};
use axum::http::HeaderName;
use secrecy::SecretString;
use std::time::Duration;
use url::Url;

use crate::engine::ledger::Thresholds;
use crate::engine::notifier::DEFAULT_TOKEN_TTL_SECONDS;

use super::sessions::DEFAULT_SESSION_TTL_SECONDS;

pub const DEFAULT_FRONTEND_BASE_URL: &str = "https://trustgate.dev";
pub const DEFAULT_GEO_URL: &str = "http://ip-api.com/json/{ip}";
const DEFAULT_GEO_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CREDENTIALS_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    credentials_url: String,
    evaluate_token: Option<SecretString>,
    frontend_base_url: String,
    geo_url: String,
    geo_timeout: Duration,
    client_ip_header: Option<String>,
    thresholds: Thresholds,
    verification_ttl_seconds: u32,
    delivery_timeout: Duration,
    store_timeout: Duration,
    credentials_timeout: Duration,
    session_ttl_seconds: u32,
}

impl ServiceConfig {
    #[must_use]
    pub fn new(credentials_url: String) -> Self {
        Self {
            credentials_url,
            evaluate_token: None,
            frontend_base_url: DEFAULT_FRONTEND_BASE_URL.to_string(),
            geo_url: DEFAULT_GEO_URL.to_string(),
            geo_timeout: Duration::from_millis(DEFAULT_GEO_TIMEOUT_MS),
            client_ip_header: None,
            thresholds: Thresholds::default(),
            verification_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            credentials_timeout: Duration::from_millis(DEFAULT_CREDENTIALS_TIMEOUT_MS),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_evaluate_token(mut self, token: Option<SecretString>) -> Self {
        self.evaluate_token = token;
        self
    }

    #[must_use]
    pub fn with_frontend_base_url(mut self, url: String) -> Self {
        self.frontend_base_url = url;
        self
    }

    #[must_use]
    pub fn with_geo_url(mut self, url: String) -> Self {
        self.geo_url = url;
        self
    }

    #[must_use]
    pub fn with_geo_timeout_ms(mut self, ms: u64) -> Self {
        self.geo_timeout = Duration::from_millis(ms);
        self
    }

    #[must_use]
    pub fn with_client_ip_header(mut self, header: Option<String>) -> Self {
        self.client_ip_header = header.filter(|value| !value.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[must_use]
    pub fn with_verification_ttl_seconds(mut self, seconds: u32) -> Self {
        self.verification_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_delivery_timeout_ms(mut self, ms: u64) -> Self {
        self.delivery_timeout = Duration::from_millis(ms);
        self
    }

    #[must_use]
    pub fn with_store_timeout_ms(mut self, ms: u64) -> Self {
        self.store_timeout = Duration::from_millis(ms);
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: u32) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    /// # Errors
    /// Returns an error if the URL does not parse.
    pub fn credentials_url(&self) -> Result<Url> {
        Url::parse(&self.credentials_url)
            .with_context(|| format!("Invalid credentials URL: {}", self.credentials_url))
    }

    #[must_use]
    pub fn evaluate_token(&self) -> Option<&SecretString> {
        self.evaluate_token.as_ref()
    }

    /// # Errors
    /// Returns an error if the URL does not parse.
    pub fn frontend_base_url(&self) -> Result<Url> {
        Url::parse(&self.frontend_base_url)
            .with_context(|| format!("Invalid frontend base URL: {}", self.frontend_base_url))
    }

    #[must_use]
    pub fn geo_url(&self) -> &str {
        &self.geo_url
    }

    #[must_use]
    pub fn geo_timeout(&self) -> Duration {
        self.geo_timeout
    }

    /// # Errors
    /// Returns an error if the configured name is not a valid header name.
    pub fn client_ip_header(&self) -> Result<Option<HeaderName>> {
        self.client_ip_header
            .as_deref()
            .map(|name| {
                HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
                    .with_context(|| format!("Invalid client IP header: {name}"))
            })
            .transpose()
    }

    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    #[must_use]
    pub fn verification_ttl_seconds(&self) -> u32 {
        self.verification_ttl_seconds
    }

    #[must_use]
    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    #[must_use]
    pub fn credentials_timeout(&self) -> Duration {
        self.credentials_timeout
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> u32 {
        self.session_ttl_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() -> Result<()> {
        let config = ServiceConfig::new("https://iam.internal".to_string());
        assert_eq!(config.frontend_base_url()?.as_str(), "https://trustgate.dev/");
        assert_eq!(config.geo_url(), DEFAULT_GEO_URL);
        assert_eq!(config.geo_timeout(), Duration::from_secs(2));
        assert_eq!(config.thresholds().escalation(), 3);
        assert_eq!(config.thresholds().block(), 6);
        assert_eq!(config.verification_ttl_seconds(), 86_400);
        assert_eq!(config.session_ttl_seconds(), 43_200);
        assert!(config.client_ip_header()?.is_none());
        assert!(config.evaluate_token().is_none());
        Ok(())
    }

    #[test]
    fn client_ip_header_is_normalized() -> Result<()> {
        let config = ServiceConfig::new("https://iam.internal".to_string())
            .with_client_ip_header(Some(" CF-Connecting-IP ".to_string()));
        assert_eq!(
            config.client_ip_header()?.map(|name| name.to_string()),
            Some("cf-connecting-ip".to_string())
        );

        let config = ServiceConfig::new("https://iam.internal".to_string())
            .with_client_ip_header(Some("bad header".to_string()));
        assert!(config.client_ip_header().is_err());

        let config = ServiceConfig::new("https://iam.internal".to_string())
            .with_client_ip_header(Some("  ".to_string()));
        assert!(config.client_ip_header()?.is_none());
        Ok(())
    }

    #[test]
    fn invalid_urls_are_reported() {
        let config = ServiceConfig::new("not a url".to_string())
            .with_frontend_base_url("also not".to_string());
        assert!(config.credentials_url().is_err());
        assert!(config.frontend_base_url().is_err());
    }
}

use crate::{api, engine::ledger::Thresholds};
use anyhow::Result;
use secrecy::SecretString;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub credentials_url: String,
    pub evaluate_token: Option<SecretString>,
    pub frontend_base_url: String,
    pub geo_url: String,
    pub geo_timeout_ms: u64,
    pub client_ip_header: Option<String>,
    pub thresholds: Thresholds,
    pub verification_ttl_seconds: u32,
    pub delivery_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub session_ttl_seconds: u32,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
    pub email_outbox_backoff_base_seconds: u64,
    pub email_outbox_backoff_max_seconds: u64,
}

impl Args {
    #[must_use]
    pub fn service_config(&self) -> api::ServiceConfig {
        api::ServiceConfig::new(self.credentials_url.clone())
            .with_evaluate_token(self.evaluate_token.clone())
            .with_frontend_base_url(self.frontend_base_url.clone())
            .with_geo_url(self.geo_url.clone())
            .with_geo_timeout_ms(self.geo_timeout_ms)
            .with_client_ip_header(self.client_ip_header.clone())
            .with_thresholds(self.thresholds)
            .with_verification_ttl_seconds(self.verification_ttl_seconds)
            .with_delivery_timeout_ms(self.delivery_timeout_ms)
            .with_store_timeout_ms(self.store_timeout_ms)
            .with_session_ttl_seconds(self.session_ttl_seconds)
    }

    #[must_use]
    pub fn email_config(&self) -> api::email::EmailWorkerConfig {
        api::email::EmailWorkerConfig::new()
            .with_poll_interval_seconds(self.email_outbox_poll_seconds)
            .with_batch_size(self.email_outbox_batch_size)
            .with_max_attempts(self.email_outbox_max_attempts)
            .with_backoff_base_seconds(self.email_outbox_backoff_base_seconds)
            .with_backoff_max_seconds(self.email_outbox_backoff_max_seconds)
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let config = args.service_config();
    let email_config = args.email_config();

    debug!(
        port = args.port,
        credentials_url = %args.credentials_url,
        frontend_base_url = %args.frontend_base_url,
        "starting server"
    );

    api::new(args.port, args.dsn, config, email_config).await
}

//! Client for the credential-verification service.

use anyhow::{Context, Result, anyhow};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::engine::BoxFuture;
use crate::engine::context::AccountId;
use crate::engine::orchestrator::{CredentialVerifier, Credentials};

#[derive(Serialize)]
struct VerifyRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize, Debug)]
struct VerifyResponse {
    account_id: AccountId,
}

/// POSTs `{email, password}` to `{base}/verify`.
///
/// 200 with `{"account_id": ..}` is a match, 401 and 404 are wrong
/// credentials, anything else is an error.
#[derive(Clone, Debug)]
pub struct HttpCredentialVerifier {
    client: Client,
    verify_url: Url,
}

impl HttpCredentialVerifier {
    /// # Errors
    /// Returns an error if the base URL cannot carry a path or the HTTP client cannot be built.
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self> {
        let mut verify_url = base_url.clone();
        verify_url
            .path_segments_mut()
            .map_err(|()| anyhow!("credentials URL cannot be a base: {base_url}"))?
            .pop_if_empty()
            .push("verify");

        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build credentials HTTP client")?;

        Ok(Self { client, verify_url })
    }

    #[must_use]
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    #[instrument(skip_all, fields(url = %self.verify_url))]
    async fn post(&self, credentials: &Credentials) -> Result<Option<AccountId>> {
        let response = self
            .client
            .post(self.verify_url.clone())
            .json(&VerifyRequest {
                email: &credentials.email,
                password: credentials.password.expose_secret(),
            })
            .send()
            .await
            .context("credential service request failed")?;

        match response.status() {
            StatusCode::OK => {
                let body: VerifyResponse = response
                    .json()
                    .await
                    .context("invalid credential service response")?;
                Ok(Some(body.account_id))
            }
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                debug!("credential service rejected the credentials");
                Ok(None)
            }
            status => Err(anyhow!("credential service returned {status}")),
        }
    }
}

impl CredentialVerifier for HttpCredentialVerifier {
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Option<AccountId>>> {
        Box::pin(self.post(credentials))
    }
}

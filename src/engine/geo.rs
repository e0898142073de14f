//! Coarse geolocation (network address to country and city).

use anyhow::{Context, Result, anyhow};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, instrument};

use super::BoxFuture;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub country: String,
    pub city: String,
}

/// Geolocation lookup collaborator.
///
/// `Ok(None)` means the lookup answered but had no record for the address
/// (private ranges, reserved blocks); callers treat that like a failure.
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: IpAddr) -> BoxFuture<'_, Result<Option<Location>>>;
}

/// JSON response of an `ip-api.com` style lookup service.
#[derive(Deserialize, Debug)]
struct GeoResponse {
    status: Option<String>,
    #[serde(rename = "countryCode", alias = "country_code")]
    country_code: Option<String>,
    country: Option<String>,
    city: Option<String>,
}

/// HTTP geolocation client. The URL template must contain `{ip}`.
#[derive(Clone, Debug)]
pub struct HttpGeoLocator {
    client: Client,
    url_template: String,
}

impl HttpGeoLocator {
    /// # Errors
    /// Returns an error if the template lacks `{ip}` or the HTTP client cannot be built.
    pub fn new(url_template: String) -> Result<Self> {
        if !url_template.contains("{ip}") {
            return Err(anyhow!(
                "geolocation URL must contain an {{ip}} placeholder: {url_template}"
            ));
        }

        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build geolocation HTTP client")?;

        Ok(Self {
            client,
            url_template,
        })
    }

    fn url_for(&self, ip: IpAddr) -> String {
        self.url_template.replace("{ip}", &ip.to_string())
    }
}

impl GeoLocator for HttpGeoLocator {
    fn locate(&self, ip: IpAddr) -> BoxFuture<'_, Result<Option<Location>>> {
        Box::pin(self.lookup(ip))
    }
}

impl HttpGeoLocator {
    #[instrument(skip(self))]
    async fn lookup(&self, ip: IpAddr) -> Result<Option<Location>> {
        let response = self
            .client
            .get(self.url_for(ip))
            .send()
            .await
            .context("geolocation request failed")?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            status => return Err(anyhow!("geolocation lookup returned {status}")),
        }

        let body: GeoResponse = response
            .json()
            .await
            .context("invalid geolocation response")?;
        debug!(?body, "geolocation response");

        Ok(location_from(body))
    }
}

fn location_from(body: GeoResponse) -> Option<Location> {
    if body
        .status
        .as_deref()
        .is_some_and(|status| !status.eq_ignore_ascii_case("success"))
    {
        return None;
    }

    let country = body
        .country_code
        .or(body.country)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;
    let city = body
        .city
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    Some(Location { country, city })
}

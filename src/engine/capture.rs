//! Builds a [`Capture`] from raw request metadata.
//!
//! Geolocation is an external lookup bounded by `lookup_timeout`. A timeout, a
//! lookup error or an empty answer leaves the geography fields unset and the
//! capture incomplete. The same applies to an unparseable user agent.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{instrument, warn};

use super::agent::AgentParser;
use super::context::{Capture, PartialContext, RequestContext};
use super::geo::GeoLocator;

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub struct CaptureConfig {
    lookup_timeout: Duration,
}

impl CaptureConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    #[must_use]
    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ContextCapture {
    geo: Arc<dyn GeoLocator>,
    agent: Arc<dyn AgentParser>,
    config: CaptureConfig,
}

impl ContextCapture {
    pub fn new(geo: Arc<dyn GeoLocator>, agent: Arc<dyn AgentParser>, config: CaptureConfig) -> Self {
        Self { geo, agent, config }
    }

    #[instrument(skip_all, fields(ip = ?request.ip))]
    pub async fn capture(&self, request: &RequestContext) -> Capture {
        let mut partial = PartialContext {
            ip: request.ip,
            ..PartialContext::default()
        };

        if let Some(ip) = request.ip {
            match timeout(self.config.lookup_timeout(), self.geo.locate(ip)).await {
                Ok(Ok(Some(location))) => {
                    partial.country = Some(location.country);
                    partial.city = Some(location.city);
                }
                Ok(Ok(None)) => warn!("geolocation has no record for {ip}"),
                Ok(Err(err)) => warn!("geolocation lookup failed: {err:#}"),
                Err(_) => warn!(
                    "geolocation lookup timed out after {:?}",
                    self.config.lookup_timeout()
                ),
            }
        } else {
            warn!("request has no client address");
        }

        match request
            .user_agent
            .as_deref()
            .and_then(|user_agent| self.agent.parse(user_agent))
        {
            Some(details) => {
                partial.device = Some(details.device);
                partial.device_type = Some(details.device_type);
                partial.os = Some(details.os);
                partial.platform = Some(details.platform);
                partial.browser = Some(details.browser);
            }
            None => warn!("user agent missing or unrecognized"),
        }

        match partial.complete(Utc::now()) {
            Ok(signature) => Capture::Complete(signature),
            Err(partial) => Capture::Incomplete(partial),
        }
    }
}

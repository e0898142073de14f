//! Request metadata helpers shared by the handlers.

use axum::http::{
    HeaderMap, HeaderName, StatusCode,
    header::{AUTHORIZATION, USER_AGENT},
};
use secrecy::{ExposeSecret, SecretString};
use std::net::{IpAddr, SocketAddr};

use crate::engine::context::RequestContext;
use crate::engine::notifier::hash_secret;

/// Bearer secret shared with the services allowed to call context evaluation.
///
/// Only the SHA-256 digest is kept. Without a configured secret every call is
/// refused.
#[derive(Clone, Debug, Default)]
pub struct ServiceToken {
    digest: Option<Vec<u8>>,
}

impl ServiceToken {
    #[must_use]
    pub fn new(secret: Option<&SecretString>) -> Self {
        let digest = secret
            .map(|secret| secret.expose_secret().trim())
            .filter(|secret| !secret.is_empty())
            .map(hash_secret);
        Self { digest }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    /// Check the `Authorization: Bearer` header against the configured secret.
    ///
    /// # Errors
    /// `FORBIDDEN` when no secret is configured, `UNAUTHORIZED` when the
    /// header is missing or carries another value.
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let Some(expected) = self.digest.as_deref() else {
            return Err(StatusCode::FORBIDDEN);
        };
        let presented = extract_bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;
        if hash_secret(presented) == expected {
            Ok(())
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() { None } else { Some(token) }
}

/// Where the client address is read from.
///
/// Forwarding headers are client-controlled unless a proxy in front rewrites
/// them, so only the configured header is read; everything else uses the
/// socket peer. A comma-separated value yields its first hop and unparsable
/// values fall back to the peer.
#[derive(Clone, Debug, Default)]
pub struct ClientIpSource {
    header: Option<HeaderName>,
}

impl ClientIpSource {
    #[must_use]
    pub fn new(header: Option<HeaderName>) -> Self {
        Self { header }
    }

    #[must_use]
    pub fn header(&self) -> Option<&HeaderName> {
        self.header.as_ref()
    }

    #[must_use]
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        self.header
            .as_ref()
            .and_then(|name| header_ip(headers, name))
            .or_else(|| peer.map(|addr| addr.ip()))
    }

    /// Build the [`RequestContext`] the capture stage works from.
    #[must_use]
    pub fn request_context(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestContext {
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        RequestContext::new(self.resolve(headers, peer), user_agent)
    }
}

fn header_ip(headers: &HeaderMap, name: &HeaderName) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(parse_ip)
}

/// Accepts `1.2.3.4`, `1.2.3.4:5678`, `::1` and `[::1]:5678`.
fn parse_ip(value: &str) -> Option<IpAddr> {
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

//! Context signatures, trusted contexts and device keys.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use utoipa::ToSchema;
use uuid::Uuid;

pub type AccountId = Uuid;

/// Attributes compared between a sign-in request and a trusted context.
#[derive(ToSchema, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextField {
    Ip,
    Country,
    City,
    Device,
    DeviceType,
    Os,
    Platform,
    Browser,
}

impl ContextField {
    pub const ALL: [Self; 8] = [
        Self::Ip,
        Self::Country,
        Self::City,
        Self::Device,
        Self::DeviceType,
        Self::Os,
        Self::Platform,
        Self::Browser,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Country => "country",
            Self::City => "city",
            Self::Device => "device",
            Self::DeviceType => "deviceType",
            Self::Os => "os",
            Self::Platform => "platform",
            Self::Browser => "browser",
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of a device, derived from device, OS, browser and platform.
///
/// Attempt counters, blocks and verification tokens are scoped to
/// `(account, device key)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    #[must_use]
    pub fn derive(device: &str, os: &str, browser: &str, platform: &str) -> Self {
        let mut hasher = Sha256::new();
        // Unit separators keep ("ab", "c") and ("a", "bc") apart.
        for part in [device, os, browser, platform] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        Self(Base64UrlUnpadded::encode_string(&hasher.finalize()))
    }

    /// Wrap a key previously produced by [`DeviceKey::derive`] and read back from storage.
    #[must_use]
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw request metadata handed to [`crate::engine::capture::ContextCapture`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(ip: Option<IpAddr>, user_agent: Option<String>) -> Self {
        Self { ip, user_agent }
    }
}

/// The comparable attributes of a context. This is the subset that gets persisted.
#[derive(ToSchema, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAttributes {
    #[schema(value_type = String)]
    pub ip: IpAddr,
    pub country: String,
    pub city: String,
    pub device: String,
    pub device_type: String,
    pub os: String,
    pub platform: String,
    pub browser: String,
}

impl ContextAttributes {
    #[must_use]
    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::derive(&self.device, &self.os, &self.browser, &self.platform)
    }

    /// Fields whose values differ between `self` and `other`, in [`ContextField::ALL`] order.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<ContextField> {
        ContextField::ALL
            .into_iter()
            .filter(|field| !self.same(other, *field))
            .collect()
    }

    fn same(&self, other: &Self, field: ContextField) -> bool {
        match field {
            ContextField::Ip => self.ip == other.ip,
            ContextField::Country => self.country.eq_ignore_ascii_case(&other.country),
            ContextField::City => self.city.eq_ignore_ascii_case(&other.city),
            ContextField::Device => self.device == other.device,
            ContextField::DeviceType => self.device_type == other.device_type,
            ContextField::Os => self.os == other.os,
            ContextField::Platform => self.platform == other.platform,
            ContextField::Browser => self.browser == other.browser,
        }
    }
}

/// Snapshot of a sign-in request's environment. Built per request, never stored as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSignature {
    pub attributes: ContextAttributes,
    pub captured_at: DateTime<Utc>,
}

impl ContextSignature {
    #[must_use]
    pub fn device_key(&self) -> DeviceKey {
        self.attributes.device_key()
    }
}

/// Capture with at least one lookup failed; unset fields stay `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartialContext {
    pub ip: Option<IpAddr>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub device: Option<String>,
    pub device_type: Option<String>,
    pub os: Option<String>,
    pub platform: Option<String>,
    pub browser: Option<String>,
}

impl PartialContext {
    #[must_use]
    pub fn missing(&self) -> Vec<ContextField> {
        let present = |field: ContextField| match field {
            ContextField::Ip => self.ip.is_some(),
            ContextField::Country => self.country.is_some(),
            ContextField::City => self.city.is_some(),
            ContextField::Device => self.device.is_some(),
            ContextField::DeviceType => self.device_type.is_some(),
            ContextField::Os => self.os.is_some(),
            ContextField::Platform => self.platform.is_some(),
            ContextField::Browser => self.browser.is_some(),
        };
        ContextField::ALL
            .into_iter()
            .filter(|field| !present(*field))
            .collect()
    }

    /// Promote to a full signature when every field is set.
    ///
    /// # Errors
    /// Returns the partial context unchanged when any field is missing.
    pub fn complete(self, captured_at: DateTime<Utc>) -> Result<ContextSignature, Self> {
        match self {
            Self {
                ip: Some(ip),
                country: Some(country),
                city: Some(city),
                device: Some(device),
                device_type: Some(device_type),
                os: Some(os),
                platform: Some(platform),
                browser: Some(browser),
            } => Ok(ContextSignature {
                attributes: ContextAttributes {
                    ip,
                    country,
                    city,
                    device,
                    device_type,
                    os,
                    platform,
                    browser,
                },
                captured_at,
            }),
            partial => Err(partial),
        }
    }
}

/// Result of context capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capture {
    Complete(ContextSignature),
    Incomplete(PartialContext),
}

/// A context previously confirmed as belonging to an account.
///
/// Unique per `(account, device_key)`; re-confirmation only moves `last_confirmed_at`.
#[derive(ToSchema, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedContext {
    pub id: Uuid,
    #[schema(value_type = uuid::Uuid)]
    pub account: AccountId,
    #[schema(value_type = String)]
    pub device_key: DeviceKey,
    pub attributes: ContextAttributes,
    pub first_seen_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
}

impl TrustedContext {
    #[must_use]
    pub fn new(account: AccountId, attributes: ContextAttributes, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            account,
            device_key: attributes.device_key(),
            attributes,
            first_seen_at: at,
            last_confirmed_at: at,
        }
    }
}

//! Fakes and fixtures shared by engine and API tests.

use anyhow::{Result, anyhow};
use chrono::{Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use super::BoxFuture;
use super::agent::RegexAgentParser;
use super::capture::{CaptureConfig, ContextCapture};
use super::context::{AccountId, ContextAttributes, ContextSignature};
use super::evaluator::{RiskEvaluator, RiskPolicy};
use super::geo::{GeoLocator, Location};
use super::ledger::Thresholds;
use super::notifier::{MessageDelivery, NotifierConfig, VerificationMessage, VerificationNotifier};
use super::orchestrator::{Credentials, CredentialVerifier, SessionGrant, SessionIssuer, SignInOrchestrator};
use crate::store::KeyScope;
use crate::store::memory::MemoryStore;

pub const MAC_CHROME: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub const HOME_IP: [u8; 4] = [203, 0, 113, 10];

/// Attributes for a desktop device; the city follows the country.
pub fn attributes(country: &str, device: &str, os: &str, browser: &str) -> ContextAttributes {
    let city = match country {
        "US" => "Austin",
        "FR" => "Paris",
        "DE" => "Berlin",
        _ => "Springfield",
    };
    ContextAttributes {
        ip: IpAddr::from(HOME_IP),
        country: country.to_string(),
        city: city.to_string(),
        device: device.to_string(),
        device_type: "desktop".to_string(),
        os: os.to_string(),
        platform: format!("{os} desktop"),
        browser: browser.to_string(),
    }
}

pub fn signature(attributes: ContextAttributes) -> ContextSignature {
    ContextSignature {
        attributes,
        captured_at: Utc::now(),
    }
}

enum GeoBehavior {
    Located(Location),
    Slow(Duration),
    Failing,
}

pub struct FakeGeo {
    behavior: GeoBehavior,
}

impl FakeGeo {
    pub fn located(country: &str, city: &str) -> Self {
        Self {
            behavior: GeoBehavior::Located(Location {
                country: country.to_string(),
                city: city.to_string(),
            }),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            behavior: GeoBehavior::Slow(delay),
        }
    }

    pub fn failing() -> Self {
        Self {
            behavior: GeoBehavior::Failing,
        }
    }
}

impl GeoLocator for FakeGeo {
    fn locate(&self, _ip: IpAddr) -> BoxFuture<'_, Result<Option<Location>>> {
        Box::pin(async move {
            match &self.behavior {
                GeoBehavior::Located(location) => Ok(Some(location.clone())),
                GeoBehavior::Slow(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(None)
                }
                GeoBehavior::Failing => Err(anyhow!("lookup service down")),
            }
        })
    }
}

/// Delivery fake that keeps every message, raw code included.
#[derive(Default)]
pub struct RecordingDelivery {
    messages: Mutex<Vec<VerificationMessage>>,
    failing: AtomicBool,
}

impl RecordingDelivery {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.messages.lock().map(|messages| messages.len()).unwrap_or(0)
    }

    pub fn messages(&self) -> Vec<VerificationMessage> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    /// Raw code of the most recent message.
    pub fn last_code(&self) -> Option<SecretString> {
        self.messages().last().map(|message| message.code.clone())
    }
}

impl MessageDelivery for RecordingDelivery {
    fn deliver<'a>(
        &'a self,
        _scope: &'a mut dyn KeyScope,
        message: &'a VerificationMessage,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("smtp relay refused connection"));
            }
            self.messages
                .lock()
                .map_err(|_| anyhow!("delivery log poisoned"))?
                .push(message.clone());
            Ok(())
        })
    }
}

/// Credential fake keyed by email; the password must be "correct horse".
#[derive(Default)]
pub struct FakeCredentials {
    accounts: HashMap<String, AccountId>,
    failing: bool,
}

impl FakeCredentials {
    pub fn with_account(mut self, email: &str, account: AccountId) -> Self {
        self.accounts.insert(email.to_string(), account);
        self
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }
}

pub const PASSWORD: &str = "correct horse";

impl CredentialVerifier for FakeCredentials {
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Option<AccountId>>> {
        Box::pin(async move {
            if self.failing {
                return Err(anyhow!("credential service unreachable"));
            }
            if credentials.password.expose_secret() != PASSWORD {
                return Ok(None);
            }
            Ok(self.accounts.get(&credentials.email).copied())
        })
    }
}

#[derive(Default)]
pub struct CountingSessions {
    issued: AtomicUsize,
}

impl CountingSessions {
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

impl SessionIssuer for CountingSessions {
    fn issue(&self, account: AccountId) -> BoxFuture<'_, Result<SessionGrant>> {
        Box::pin(async move {
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(SessionGrant {
                account,
                token: SecretString::from(format!("session-{n}")),
                expires_at: Utc::now() + ChronoDuration::hours(12),
            })
        })
    }
}

pub fn credentials(email: &str, password: &str) -> Credentials {
    Credentials {
        email: email.to_string(),
        password: SecretString::from(password.to_string()),
    }
}

/// Engine wired to an in-process store and recording delivery, T=3, T2=6.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub delivery: Arc<RecordingDelivery>,
    pub notifier: Arc<VerificationNotifier>,
    pub evaluator: Arc<RiskEvaluator>,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_thresholds(3, 6)
    }

    pub fn with_thresholds(escalation: u32, block: u32) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let delivery = Arc::new(RecordingDelivery::default());
        let notifier = Arc::new(VerificationNotifier::new(
            store.clone(),
            delivery.clone(),
            NotifierConfig::new(Url::parse("https://app.trustgate.test")?),
        ));
        let policy = RiskPolicy::new(Thresholds::new(escalation, block)?);
        let evaluator = Arc::new(RiskEvaluator::new(store.clone(), notifier.clone(), policy));
        Ok(Self {
            store,
            delivery,
            notifier,
            evaluator,
        })
    }

    pub fn orchestrator(
        &self,
        credentials: FakeCredentials,
        sessions: Arc<CountingSessions>,
        geo: FakeGeo,
    ) -> Result<SignInOrchestrator> {
        let capture = ContextCapture::new(
            Arc::new(geo),
            Arc::new(RegexAgentParser::new()?),
            CaptureConfig::new().with_lookup_timeout(Duration::from_millis(200)),
        );
        Ok(SignInOrchestrator::new(
            Arc::new(credentials),
            sessions,
            capture,
            self.evaluator.clone(),
            self.notifier.clone(),
            self.store.clone(),
        ))
    }
}

/// Attributes the regex parser produces for [`MAC_CHROME`], located at `country`/`city`.
pub fn mac_chrome_attributes(country: &str, city: &str) -> ContextAttributes {
    ContextAttributes {
        ip: IpAddr::from(HOME_IP),
        country: country.to_string(),
        city: city.to_string(),
        device: "Mac".to_string(),
        device_type: "desktop".to_string(),
        os: "macOS".to_string(),
        platform: "Apple Mac".to_string(),
        browser: "Chrome".to_string(),
    }
}

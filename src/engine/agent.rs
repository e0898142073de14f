//! User-agent parsing into device, OS, platform and browser identifiers.
//!
//! Versions are deliberately dropped so a browser or OS update does not look
//! like a new device.

use anyhow::{Context, Result};
use regex::Regex;

/// Device attributes extracted from a user-agent string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentDetails {
    pub device: String,
    pub device_type: String,
    pub os: String,
    pub platform: String,
    pub browser: String,
}

/// User-agent parsing capability.
pub trait AgentParser: Send + Sync {
    /// Parse a user agent; `None` when nothing recognizable was found.
    fn parse(&self, user_agent: &str) -> Option<AgentDetails>;
}

struct OsRule {
    pattern: Regex,
    os: &'static str,
    platform: &'static str,
    device: &'static str,
    device_type: &'static str,
}

struct BrowserRule {
    pattern: Regex,
    browser: &'static str,
}

/// Rule-table parser. Rules are evaluated top to bottom; the first hit wins.
pub struct RegexAgentParser {
    bots: Regex,
    mobile_token: Regex,
    os_rules: Vec<OsRule>,
    browser_rules: Vec<BrowserRule>,
}

const OS_RULES: &[(&str, &str, &str, &str, &str)] = &[
    // (pattern, os, platform, device, device_type)
    (r"iPad", "iOS", "Apple iPad", "iPad", "tablet"),
    (r"iPhone", "iOS", "Apple iPhone", "iPhone", "mobile"),
    (r"iPod", "iOS", "Apple iPod", "iPod", "mobile"),
    (r"Android", "Android", "Android", "Android Phone", "mobile"),
    (r"Windows Phone", "Windows Phone", "Microsoft Windows Phone", "Windows Phone", "mobile"),
    (r"Windows NT|Win64|Windows", "Windows", "Microsoft Windows", "Windows PC", "desktop"),
    (r"CrOS", "ChromeOS", "Chrome OS", "Chromebook", "desktop"),
    (r"Macintosh|Mac OS X", "macOS", "Apple Mac", "Mac", "desktop"),
    (r"Linux|X11", "Linux", "Linux", "Linux PC", "desktop"),
];

const BROWSER_RULES: &[(&str, &str)] = &[
    (r"Edg(e|A|iOS)?/", "Edge"),
    (r"OPR/|Opera", "Opera"),
    (r"SamsungBrowser/", "Samsung Internet"),
    (r"Firefox/|FxiOS/", "Firefox"),
    (r"Chrome/|CriOS/|Chromium/", "Chrome"),
    (r"Version/[\d.]+.*Safari/", "Safari"),
    (r"MSIE |Trident/", "Internet Explorer"),
];

impl RegexAgentParser {
    /// Compile the rule table.
    ///
    /// # Errors
    /// Returns an error if a built-in pattern fails to compile.
    pub fn new() -> Result<Self> {
        let os_rules = OS_RULES
            .iter()
            .map(|&(pattern, os, platform, device, device_type)| {
                Ok(OsRule {
                    pattern: Regex::new(pattern)
                        .with_context(|| format!("invalid OS pattern: {pattern}"))?,
                    os,
                    platform,
                    device,
                    device_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let browser_rules = BROWSER_RULES
            .iter()
            .map(|&(pattern, browser)| {
                Ok(BrowserRule {
                    pattern: Regex::new(pattern)
                        .with_context(|| format!("invalid browser pattern: {pattern}"))?,
                    browser,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            bots: Regex::new(r"(?i)bot|crawler|spider|curl/|wget/|python-requests|headless")
                .context("invalid bot pattern")?,
            mobile_token: Regex::new(r"\bMobile\b").context("invalid mobile pattern")?,
            os_rules,
            browser_rules,
        })
    }
}

impl AgentParser for RegexAgentParser {
    fn parse(&self, user_agent: &str) -> Option<AgentDetails> {
        let user_agent = user_agent.trim();
        if user_agent.is_empty() {
            return None;
        }

        let os = self
            .os_rules
            .iter()
            .find(|rule| rule.pattern.is_match(user_agent));
        let browser = self
            .browser_rules
            .iter()
            .find(|rule| rule.pattern.is_match(user_agent))
            .map(|rule| rule.browser);
        let bot = self.bots.is_match(user_agent);

        if os.is_none() && browser.is_none() && !bot {
            return None;
        }

        let (os_name, platform, mut device, mut device_type) = os.map_or(
            ("Other", "Other", "Other", "desktop"),
            |rule| (rule.os, rule.platform, rule.device, rule.device_type),
        );

        // Android tablets omit the "Mobile" token.
        if os_name == "Android" && !self.mobile_token.is_match(user_agent) {
            device = "Android Tablet";
            device_type = "tablet";
        }
        if bot {
            device_type = "bot";
        }

        Some(AgentDetails {
            device: device.to_string(),
            device_type: device_type.to_string(),
            os: os_name.to_string(),
            platform: platform.to_string(),
            browser: browser.unwrap_or("Other").to_string(),
        })
    }
}

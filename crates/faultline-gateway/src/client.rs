//! Client metadata derived from request headers.

use std::fmt;
use std::sync::LazyLock;

use axum::http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    Bot,
}

impl DeviceClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Bot => "bot",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device: DeviceClass,
}

struct UaPatterns {
    edge: Regex,
    opera: Regex,
    firefox: Regex,
    chrome: Regex,
    safari: Regex,
    ie: Regex,
    windows: Regex,
    android: Regex,
    ios: Regex,
    macos: Regex,
}

fn build_patterns() -> Option<UaPatterns> {
    Some(UaPatterns {
        edge: Regex::new(r"Edg(?:e|A|iOS)?/(\d+)").ok()?,
        opera: Regex::new(r"(?:OPR|Opera)/(\d+)").ok()?,
        firefox: Regex::new(r"(?:Firefox|FxiOS)/(\d+)").ok()?,
        chrome: Regex::new(r"(?:Chrome|CriOS)/(\d+)").ok()?,
        safari: Regex::new(r"Version/(\d+)[^ ]* (?:Mobile/\S+ )?Safari/").ok()?,
        ie: Regex::new(r"(?:MSIE |Trident/.*rv:)(\d+)").ok()?,
        windows: Regex::new(r"Windows NT (\d+\.\d+)").ok()?,
        android: Regex::new(r"Android (\d+(?:\.\d+)?)").ok()?,
        ios: Regex::new(r"(?:iPhone|CPU) OS (\d+)").ok()?,
        macos: Regex::new(r"Mac OS X (\d+)[._](\d+)").ok()?,
    })
}

#[allow(clippy::incompatible_msrv)]
static PATTERNS: LazyLock<Option<UaPatterns>> = LazyLock::new(build_patterns);

const BOT_MARKERS: &[&str] = &[
    "bot", "crawler", "spider", "slurp", "curl/", "wget/", "python-requests", "headless",
];

/// Best-effort browser, OS and device class of a user agent.
pub fn parse_user_agent(user_agent: &str) -> UserAgentInfo {
    let lower = user_agent.to_ascii_lowercase();

    UserAgentInfo {
        browser: browser(user_agent),
        os: os(user_agent),
        device: device(&lower),
    }
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

fn browser(ua: &str) -> Option<String> {
    let p = PATTERNS.as_ref()?;

    // Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari.
    let candidates: [(&Regex, &str); 6] = [
        (&p.edge, "Edge"),
        (&p.opera, "Opera"),
        (&p.firefox, "Firefox"),
        (&p.chrome, "Chrome"),
        (&p.safari, "Safari"),
        (&p.ie, "Internet Explorer"),
    ];

    candidates
        .iter()
        .find_map(|(re, name)| capture(re, ua).map(|v| format!("{name} {v}")))
}

fn os(ua: &str) -> Option<String> {
    let p = PATTERNS.as_ref()?;

    if let Some(version) = capture(&p.windows, ua) {
        let name = match version.as_str() {
            "10.0" => "10",
            "6.3" => "8.1",
            "6.2" => "8",
            "6.1" => "7",
            other => other,
        };
        return Some(format!("Windows {name}"));
    }
    if let Some(version) = capture(&p.android, ua) {
        return Some(format!("Android {version}"));
    }
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        return Some(match capture(&p.ios, ua) {
            Some(v) => format!("iOS {v}"),
            None => "iOS".to_owned(),
        });
    }
    if ua.contains("CrOS") {
        return Some("ChromeOS".to_owned());
    }
    if let Some(c) = p.macos.captures(ua) {
        return Some(format!("macOS {}.{}", &c[1], &c[2]));
    }
    if ua.contains("Linux") {
        return Some("Linux".to_owned());
    }
    None
}

fn device(lower: &str) -> DeviceClass {
    if BOT_MARKERS.iter().any(|m| lower.contains(m)) {
        DeviceClass::Bot
    } else if lower.contains("ipad")
        || lower.contains("tablet")
        || (lower.contains("android") && !lower.contains("mobile"))
    {
        DeviceClass::Tablet
    } else if lower.contains("mobi") || lower.contains("iphone") || lower.contains("ipod") {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    }
}

/// Trimmed, non-empty header value.
pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Client address reported by a proxy: the first non-empty
/// `x-forwarded-for` hop, then `x-real-ip`.
pub fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "x-forwarded-for")
        .and_then(|value| {
            value
                .split(',')
                .map(str::trim)
                .find(|hop| !hop.is_empty())
                .map(str::to_owned)
        })
        .or_else(|| header_value(headers, "x-real-ip"))
}

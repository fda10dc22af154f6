use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod canonical;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// Identity of a routable service: `slug@version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceKey {
    pub slug: String,
    pub version: u32,
}

impl ServiceKey {
    pub fn new(slug: &str, version: u32) -> Self {
        Self {
            slug: slug.trim().to_ascii_lowercase(),
            version,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slug, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseServiceKeyError {
    pub input: String,
}

impl fmt::Display for ParseServiceKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid service key `{}` (expected slug@version)", self.input)
    }
}

impl std::error::Error for ParseServiceKeyError {}

impl FromStr for ServiceKey {
    type Err = ParseServiceKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseServiceKeyError {
            input: s.to_string(),
        };

        let (slug, version) = s.trim().split_once('@').ok_or_else(err)?;
        if !is_valid_slug(slug) {
            return Err(err());
        }
        let version = parse_version(version).ok_or_else(err)?;

        Ok(Self {
            slug: slug.to_string(),
            version,
        })
    }
}

impl TryFrom<String> for ServiceKey {
    type Error = ParseServiceKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceKey> for String {
    fn from(value: ServiceKey) -> Self {
        value.to_string()
    }
}

/// Slugs are lowercase ASCII, digits, `-` and `_`, starting with a letter or digit.
pub fn is_valid_slug(slug: &str) -> bool {
    let bytes = slug.as_bytes();
    let Some(first) = bytes.first() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_'))
}

/// Positive integer versions only; `"01"` and `"1"` are the same version.
pub fn parse_version(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u32>().ok().filter(|v| *v > 0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub slug: String,
    pub version: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub outbound_api_prefix: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_true")]
    pub allow_proxy: bool,
    #[serde(default)]
    pub protected_get_prefixes: Vec<String>,
    #[serde(default)]
    pub public_prefixes: Vec<String>,
    #[serde(default)]
    pub overrides: ServiceOverrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceDescriptor {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.slug, self.version)
    }

    /// Disabled services and services that opted out of proxying are not routable.
    pub fn is_routable(&self) -> bool {
        self.enabled && self.allow_proxy
    }

    /// Whether an edge request for `rest` (path below `/api/<slug>.<version>/`) needs a bearer.
    pub fn requires_end_user_auth(&self, method: &str, rest: &str) -> bool {
        let read_only = method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD");
        if read_only {
            return matches_any_prefix(&self.protected_get_prefixes, rest);
        }
        !matches_any_prefix(&self.public_prefixes, rest)
    }

    /// Structural checks that do not need a URL parser; base URL checks live with the decoder.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !is_valid_slug(&self.slug) {
            return Err("slug must be lowercase [a-z0-9_-]");
        }
        if self.version == 0 {
            return Err("version must be a positive integer");
        }
        if self.base_url.trim().is_empty() {
            return Err("baseUrl must be non-empty");
        }
        if !self.outbound_api_prefix.is_empty() && !self.outbound_api_prefix.starts_with('/') {
            return Err("outboundApiPrefix must start with '/'");
        }
        Ok(())
    }
}

fn matches_any_prefix(prefixes: &[String], rest: &str) -> bool {
    let rest = rest.trim_start_matches('/');
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return true;
        }
        rest == prefix
            || rest
                .strip_prefix(prefix)
                .is_some_and(|tail| tail.starts_with('/'))
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(
        default,
        rename = "breakerCfg",
        skip_serializing_if = "Option::is_none"
    )]
    pub breaker: Option<BreakerOverrides>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rtt_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotSource {
    Authority,
    LastKnownGood,
}

/// Immutable routing view. Replaced wholesale, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSnapshot {
    pub version: String,
    pub updated_at: Option<String>,
    pub services: BTreeMap<ServiceKey, ServiceDescriptor>,
    pub source: SnapshotSource,
    pub stale: bool,
    pub fetched_at: String,
}

impl MirrorSnapshot {
    pub fn etag(&self) -> String {
        version_etag(&self.version)
    }

    pub fn resolve(&self, slug: &str, version: u32) -> Option<&ServiceDescriptor> {
        self.services.get(&ServiceKey::new(slug, version))
    }

    /// Highest routable version registered for `slug`.
    pub fn url_for_slug(&self, slug: &str) -> Option<&ServiceDescriptor> {
        let slug = slug.trim().to_ascii_lowercase();
        self.services
            .iter()
            .filter(|(key, descriptor)| key.slug == slug && descriptor.is_routable())
            .map(|(_, descriptor)| descriptor)
            .next_back()
    }

    /// Same routing content, ignoring fetch bookkeeping.
    pub fn same_routes(&self, other: &MirrorSnapshot) -> bool {
        self.version == other.version && self.services == other.services
    }
}

pub fn version_etag(version: &str) -> String {
    format!("\"v:{}\"", version)
}

/// RFC 7807 problem document; `instance` carries the request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
}

impl Problem {
    pub fn new(status: u16, kind: &str, title: &str, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("urn:nvgate:problem:{}", kind),
            title: title.to_string(),
            status,
            detail: detail.into(),
            instance: String::new(),
        }
    }

    pub fn with_instance(mut self, request_id: &str) -> Self {
        self.instance = request_id.to_string();
        self
    }
}

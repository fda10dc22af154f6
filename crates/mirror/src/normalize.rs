use std::collections::BTreeMap;

use nvgate_contracts::canonical;
use nvgate_contracts::{ServiceDescriptor, ServiceKey, parse_version};
use serde_json::{Map, Value};

/// The three discovery payload shapes the authority is known to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryPayload {
    /// `[{"slug": "user", "version": 1, ...}, ...]`
    DescriptorArray(Vec<Value>),
    /// `{"user": {"version": 1, ...}}` or `{"user": [{...}, {...}]}`
    BySlug(Map<String, Value>),
    /// `{"user@1": {...}}`
    Flattened(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDocument {
    pub version: Option<String>,
    pub updated_at: Option<String>,
    pub payload: DiscoveryPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub version: String,
    pub updated_at: Option<String>,
    pub services: BTreeMap<ServiceKey, ServiceDescriptor>,
    pub rejected: Vec<RejectedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    UnsupportedShape(&'static str),
    MixedKeys,
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedShape(what) => write!(f, "unsupported discovery payload: {}", what),
            Self::MixedKeys => write!(
                f,
                "discovery map mixes `slug@version` keys with bare slug keys"
            ),
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Classifies a raw discovery body. Envelope metadata (`version`, `updatedAt`) is optional.
pub fn decode(value: Value) -> Result<DiscoveryDocument, NormalizeError> {
    match value {
        Value::Array(items) => Ok(DiscoveryDocument {
            version: None,
            updated_at: None,
            payload: DiscoveryPayload::DescriptorArray(items),
        }),
        Value::Object(mut obj) => {
            if !obj.contains_key("services") {
                if obj.is_empty() || !obj.values().all(|v| v.is_object() || v.is_array()) {
                    return Err(NormalizeError::UnsupportedShape(
                        "bare discovery map values must be objects or arrays",
                    ));
                }
                return Ok(DiscoveryDocument {
                    version: None,
                    updated_at: None,
                    payload: classify_map(obj)?,
                });
            }

            let version = obj.get("version").and_then(meta_version);
            let updated_at = obj
                .get("updatedAt")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());

            let payload = match obj.remove("services") {
                Some(Value::Array(items)) => DiscoveryPayload::DescriptorArray(items),
                Some(Value::Object(map)) => classify_map(map)?,
                Some(Value::Null) | None => DiscoveryPayload::Flattened(Map::new()),
                Some(_) => {
                    return Err(NormalizeError::UnsupportedShape(
                        "`services` must be an array or an object",
                    ));
                }
            };

            Ok(DiscoveryDocument {
                version,
                updated_at,
                payload,
            })
        }
        _ => Err(NormalizeError::UnsupportedShape(
            "body must be a JSON array or object",
        )),
    }
}

fn meta_version(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn classify_map(map: Map<String, Value>) -> Result<DiscoveryPayload, NormalizeError> {
    let keyed = map.keys().filter(|k| k.contains('@')).count();
    if keyed == map.len() {
        Ok(DiscoveryPayload::Flattened(map))
    } else if keyed == 0 {
        Ok(DiscoveryPayload::BySlug(map))
    } else {
        Err(NormalizeError::MixedKeys)
    }
}

pub fn normalize(document: DiscoveryDocument) -> Normalized {
    let mut acc = Accumulator::default();

    match document.payload {
        DiscoveryPayload::DescriptorArray(items) => normalize_array(items, &mut acc),
        DiscoveryPayload::BySlug(map) => normalize_by_slug(map, &mut acc),
        DiscoveryPayload::Flattened(map) => normalize_flattened(map, &mut acc),
    }

    let version = document
        .version
        .unwrap_or_else(|| content_version(&acc.services));

    Normalized {
        version,
        updated_at: document.updated_at,
        services: acc.services,
        rejected: acc.rejected,
    }
}

/// Decode and normalize in one step.
pub fn normalize_value(value: Value) -> Result<Normalized, NormalizeError> {
    decode(value).map(normalize)
}

#[derive(Default)]
struct Accumulator {
    services: BTreeMap<ServiceKey, ServiceDescriptor>,
    rejected: Vec<RejectedEntry>,
}

impl Accumulator {
    fn admit(&mut self, label: String, result: Result<ServiceDescriptor, String>) {
        match result {
            Ok(descriptor) => {
                let key = descriptor.key();
                if self.services.contains_key(&key) {
                    self.reject(label, format!("duplicate service key {}", key));
                    return;
                }
                self.services.insert(key, descriptor);
            }
            Err(reason) => self.reject(label, reason),
        }
    }

    fn reject(&mut self, key: String, reason: String) {
        self.rejected.push(RejectedEntry { key, reason });
    }
}

fn normalize_array(items: Vec<Value>, acc: &mut Accumulator) {
    for (idx, item) in items.into_iter().enumerate() {
        let label = item
            .get("slug")
            .and_then(|v| v.as_str())
            .map(|slug| slug.to_string())
            .unwrap_or_else(|| format!("[{}]", idx));
        acc.admit(label, descriptor_from_parts(item, None, None));
    }
}

fn normalize_by_slug(map: Map<String, Value>, acc: &mut Accumulator) {
    for (slug, entry) in map {
        match entry {
            Value::Array(items) => {
                for item in items {
                    acc.admit(slug.clone(), descriptor_from_parts(item, Some(&slug), None));
                }
            }
            other => acc.admit(slug.clone(), descriptor_from_parts(other, Some(&slug), None)),
        }
    }
}

fn normalize_flattened(map: Map<String, Value>, acc: &mut Accumulator) {
    for (key, entry) in map {
        acc.admit(key.clone(), descriptor_from_keyed(&key, entry));
    }
}

/// Parses one `"slug@version"` entry; the key must agree with the payload it labels.
pub fn descriptor_from_keyed(key: &str, entry: Value) -> Result<ServiceDescriptor, String> {
    let Some((slug, version)) = key.trim().split_once('@') else {
        return Err(format!("key `{}` is not slug@version", key));
    };
    let Some(version) = parse_version(version) else {
        return Err(format!("key `{}` has a non-positive version", key));
    };
    descriptor_from_parts(entry, Some(slug), Some(version))
}

fn descriptor_from_parts(
    entry: Value,
    slug: Option<&str>,
    version: Option<u32>,
) -> Result<ServiceDescriptor, String> {
    let Value::Object(mut obj) = entry else {
        return Err("descriptor must be a JSON object".to_string());
    };

    let found_slug = obj
        .get("slug")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase());
    let expected_slug = slug.map(|s| s.trim().to_ascii_lowercase());
    let slug = match (found_slug, expected_slug) {
        (Some(found), Some(expected)) if found != expected => {
            return Err(format!(
                "slug `{}` does not match its key `{}`",
                found, expected
            ));
        }
        (Some(s), _) | (None, Some(s)) => s,
        (None, None) => return Err("descriptor is missing slug".to_string()),
    };
    obj.insert("slug".to_string(), Value::String(slug));

    let found_version = match obj.get("version") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(
            n.as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .ok_or_else(|| "version must be a positive integer".to_string())?,
        ),
        Some(Value::String(s)) => Some(
            parse_version(s).ok_or_else(|| "version must be a positive integer".to_string())?,
        ),
        Some(_) => return Err("version must be a positive integer".to_string()),
    };

    let version = match (found_version, version) {
        (Some(found), Some(expected)) if found != expected => {
            return Err(format!(
                "version {} does not match its key version {}",
                found, expected
            ));
        }
        (Some(v), _) | (None, Some(v)) => v,
        (None, None) => return Err("descriptor is missing version".to_string()),
    };
    obj.insert("version".to_string(), Value::from(version));

    let descriptor = serde_json::from_value::<ServiceDescriptor>(Value::Object(obj))
        .map_err(|err| format!("descriptor does not parse: {}", err))?;
    descriptor.validate().map_err(|reason| reason.to_string())?;
    if !is_absolute_http_url(&descriptor.base_url) {
        return Err(format!(
            "baseUrl `{}` is not an absolute http(s) URL",
            descriptor.base_url
        ));
    }

    Ok(descriptor)
}

pub fn is_absolute_http_url(raw: &str) -> bool {
    match url::Url::parse(raw.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}

/// Content-derived version for payloads that carry none.
fn content_version(services: &BTreeMap<ServiceKey, ServiceDescriptor>) -> String {
    let digest = canonical::digest_of(services);
    format!("sha256:{}", &digest[..16])
}

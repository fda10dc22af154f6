use hex::ToHex;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 64 {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Object keys sorted recursively; arrays keep their order.
pub fn canonicalize_json_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(canonicalize_json_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize_json_value(v));
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn canonical_json_bytes(value: &serde_json::Value) -> Vec<u8> {
    let canonical = canonicalize_json_value(value);
    serde_json::to_vec(&canonical).unwrap_or_else(|_| b"null".to_vec())
}

pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(&canonical_json_bytes(value))
}

/// Digest of any serializable value through its canonical JSON form.
pub fn digest_of<T: serde::Serialize>(value: &T) -> String {
    let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    hash_canonical_json(&json)
}

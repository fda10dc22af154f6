use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use nvgate_contracts::canonical;
use nvgate_contracts::{MirrorSnapshot, SnapshotSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalize::{descriptor_from_keyed, is_absolute_http_url};

pub const SHARED_PATH_KEY: &str = "NVGATE_LKG_PATH";

/// `NVGATE_<SERVICE>_LKG_PATH`, with the service name upper-cased and non-alphanumerics mapped to `_`.
pub fn service_path_key(service: &str) -> String {
    let service = service
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("NVGATE_{}_LKG_PATH", service)
}

/// The service-specific key wins; the shared key is only a fallback.
pub fn resolve_path(service: &str, kv: &HashMap<String, String>) -> Option<PathBuf> {
    let non_empty = |key: &str| {
        kv.get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    };
    non_empty(&service_path_key(service)).or_else(|| non_empty(SHARED_PATH_KEY))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LkgSnapshotFile {
    pub saved_at: String,
    pub meta: LkgMeta,
    pub mirror: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LkgMeta {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub service_count: usize,
    #[serde(default)]
    pub digest: String,
}

#[derive(Debug)]
pub enum LkgError {
    Io(std::io::Error),
    Encode(serde_json::Error),
}

impl std::fmt::Display for LkgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "lkg io error: {}", err),
            Self::Encode(err) => write!(f, "lkg encode error: {}", err),
        }
    }
}

impl std::error::Error for LkgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Encode(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for LkgError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for LkgError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}

/// A temp file written and fsynced next to the destination, not yet renamed over it.
#[derive(Debug)]
pub(crate) struct StagedWrite {
    tmp: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LkgStore {
    path: PathBuf,
}

impl LkgStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory, seeds an empty envelope on first touch and sweeps orphaned temp files.
    pub fn ensure_seeded(&self) -> Result<(), LkgError> {
        let parent = self.parent_dir();
        std::fs::create_dir_all(&parent)?;
        self.sweep_temp_files(&parent);

        if !self.path.exists() {
            let empty = LkgSnapshotFile {
                saved_at: now_rfc3339(),
                meta: LkgMeta {
                    version: String::new(),
                    updated_at: None,
                    service_count: 0,
                    digest: canonical::hash_canonical_json(&Value::Object(Default::default())),
                },
                mirror: BTreeMap::new(),
            };
            self.write_file(&empty)?;
        }
        Ok(())
    }

    pub fn save(&self, snapshot: &MirrorSnapshot) -> Result<(), LkgError> {
        let mut mirror = BTreeMap::new();
        for (key, descriptor) in &snapshot.services {
            mirror.insert(key.to_string(), serde_json::to_value(descriptor)?);
        }

        let file = LkgSnapshotFile {
            saved_at: now_rfc3339(),
            meta: LkgMeta {
                version: snapshot.version.clone(),
                updated_at: snapshot.updated_at.clone(),
                service_count: mirror.len(),
                digest: mirror_digest(&mirror),
            },
            mirror,
        };

        std::fs::create_dir_all(self.parent_dir())?;
        self.write_file(&file)
    }

    /// Returns `None` for a missing, empty or corrupt file; never errors.
    pub fn load(&self) -> Option<MirrorSnapshot> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "mirror.lkg_unreadable"
                );
                return None;
            }
        };

        match parse_lkg(&bytes) {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                tracing::warn!(
                    path = %self.path.display(),
                    reason = %reason,
                    "mirror.lkg_corrupt"
                );
                None
            }
        }
    }

    pub fn read_file(&self) -> Option<LkgSnapshotFile> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_file(&self, file: &LkgSnapshotFile) -> Result<(), LkgError> {
        let mut bytes = serde_json::to_vec_pretty(file)?;
        bytes.push(b'\n');
        let staged = self.stage(&bytes)?;
        self.commit(staged)
    }

    pub(crate) fn stage(&self, bytes: &[u8]) -> Result<StagedWrite, LkgError> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "lkg.json".to_string());
        let tmp = self.parent_dir().join(format!(
            ".{}.{}.{}.tmp",
            name,
            std::process::id(),
            ulid::Ulid::new()
        ));

        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        Ok(StagedWrite { tmp })
    }

    pub(crate) fn commit(&self, staged: StagedWrite) -> Result<(), LkgError> {
        std::fs::rename(&staged.tmp, &self.path)?;
        if let Err(err) = sync_directory(&self.parent_dir()) {
            tracing::debug!(error = %err, "mirror.lkg_dir_sync_failed");
        }
        Ok(())
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn sweep_temp_files(&self, dir: &Path) {
        let Some(name) = self.path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return;
        };
        let prefix = format!(".{}.", name);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(&prefix) && file_name.ends_with(".tmp") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

fn parse_lkg(bytes: &[u8]) -> Result<Option<MirrorSnapshot>, String> {
    let file = serde_json::from_slice::<LkgSnapshotFile>(bytes)
        .map_err(|err| format!("not an lkg envelope: {}", err))?;

    if file.mirror.is_empty() {
        return Ok(None);
    }

    if !file.meta.digest.is_empty() && file.meta.digest != mirror_digest(&file.mirror) {
        return Err("mirror digest does not match meta.digest".to_string());
    }

    let mut services = BTreeMap::new();
    for (key, entry) in &file.mirror {
        if entry.get("slug").is_none() || entry.get("version").is_none() {
            return Err(format!("entry `{}` does not carry its own slug and version", key));
        }
        if !entry
            .get("baseUrl")
            .and_then(|v| v.as_str())
            .is_some_and(is_absolute_http_url)
        {
            return Err(format!("entry `{}` has an invalid baseUrl", key));
        }
        let descriptor = descriptor_from_keyed(key, entry.clone())
            .map_err(|reason| format!("entry `{}`: {}", key, reason))?;
        if descriptor.key().to_string() != *key {
            return Err(format!("entry `{}` is keyed as {}", key, descriptor.key()));
        }
        services.insert(descriptor.key(), descriptor);
    }

    let version = if file.meta.version.trim().is_empty() {
        format!("lkg:{}", file.saved_at)
    } else {
        file.meta.version
    };

    Ok(Some(MirrorSnapshot {
        version,
        updated_at: file.meta.updated_at,
        services,
        source: SnapshotSource::LastKnownGood,
        stale: true,
        fetched_at: file.saved_at,
    }))
}

fn mirror_digest(mirror: &BTreeMap<String, Value>) -> String {
    let obj = mirror
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<serde_json::Map<_, _>>();
    canonical::hash_canonical_json(&Value::Object(obj))
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use nvgate_contracts::{MirrorSnapshot, SnapshotSource};
use reqwest::StatusCode;
use reqwest::header::IF_NONE_MATCH;
use tokio::sync::Mutex;

use crate::lkg::{LkgStore, now_rfc3339};
use crate::normalize::normalize_value;

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub authority_url: String,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum MirrorError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(StatusCode),
    InvalidPayload(String),
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorError::Timeout => write!(f, "discovery authority timed out"),
            MirrorError::Http(err) => write!(f, "discovery authority HTTP error: {}", err),
            MirrorError::BadStatus(status) => {
                write!(f, "discovery authority returned status {}", status)
            }
            MirrorError::InvalidPayload(reason) => {
                write!(f, "discovery authority returned an invalid payload: {}", reason)
            }
        }
    }
}

impl std::error::Error for MirrorError {}

impl From<reqwest::Error> for MirrorError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            MirrorError::Timeout
        } else {
            MirrorError::Http(value)
        }
    }
}

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Updated { version: String, services: usize },
    Unchanged,
    Failed(Arc<MirrorError>),
}

impl RefreshOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RefreshOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Updated { .. } => "updated",
            RefreshOutcome::Unchanged => "unchanged",
            RefreshOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStart {
    /// Primed from the authority.
    Fresh,
    /// Authority unavailable; serving the last-known-good snapshot.
    Degraded,
    /// Neither source produced a snapshot.
    Empty,
}

/// Copy-on-write view of the discovery authority, backed by a last-known-good file.
#[derive(Clone)]
pub struct ConfigMirror {
    inner: Arc<Inner>,
}

struct Inner {
    config: MirrorConfig,
    http: reqwest::Client,
    lkg: LkgStore,
    current: RwLock<Option<Arc<MirrorSnapshot>>>,
    refresh_slot: Mutex<Option<RefreshOutcome>>,
    completed: AtomicU64,
}

impl ConfigMirror {
    pub fn new(config: MirrorConfig, lkg: LkgStore) -> Result<Self, MirrorError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(MirrorError::Http)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                lkg,
                current: RwLock::new(None),
                refresh_slot: Mutex::new(None),
                completed: AtomicU64::new(0),
            }),
        })
    }

    pub fn lkg(&self) -> &LkgStore {
        &self.inner.lkg
    }

    /// Current snapshot, or `None` if never primed. No I/O.
    pub fn snapshot(&self) -> Option<Arc<MirrorSnapshot>> {
        match self.inner.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn adopt(&self, snapshot: MirrorSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.inner.current.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }

    /// Concurrent callers share one in-flight fetch and its outcome.
    pub async fn refresh(&self) -> RefreshOutcome {
        let observed = self.inner.completed.load(Ordering::Acquire);
        let mut slot = self.inner.refresh_slot.lock().await;
        if self.inner.completed.load(Ordering::Acquire) != observed
            && let Some(outcome) = slot.as_ref()
        {
            return outcome.clone();
        }

        let outcome = match self.fetch_and_apply().await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    authority = %self.inner.config.authority_url,
                    error = %err,
                    "mirror.refresh_failed"
                );
                RefreshOutcome::Failed(Arc::new(err))
            }
        };

        *slot = Some(outcome.clone());
        self.inner.completed.fetch_add(1, Ordering::Release);
        outcome
    }

    /// One authority attempt, then the last-known-good file if that fails.
    pub async fn cold_start(&self) -> ColdStart {
        let lkg = self.inner.lkg.clone();
        match tokio::task::spawn_blocking(move || lkg.ensure_seeded()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(path = %self.inner.lkg.path().display(), error = %err, "mirror.lkg_seed_failed");
            }
            Err(err) => tracing::warn!(error = %err, "mirror.lkg_seed_failed"),
        }

        if !self.refresh().await.is_failure() {
            return ColdStart::Fresh;
        }

        self.adopt_lkg_if_unprimed().await;
        if self.snapshot().is_some() {
            ColdStart::Degraded
        } else {
            tracing::error!(
                authority = %self.inner.config.authority_url,
                path = %self.inner.lkg.path().display(),
                "mirror.cold_start_empty"
            );
            ColdStart::Empty
        }
    }

    /// Periodic refresh; `observe` sees every outcome.
    pub fn spawn_refresh_loop<F>(&self, every: Duration, observe: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&RefreshOutcome) + Send + Sync + 'static,
    {
        let mirror = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let outcome = mirror.refresh().await;
                if outcome.is_failure() {
                    mirror.adopt_lkg_if_unprimed().await;
                }
                observe(&outcome);
            }
        })
    }

    async fn adopt_lkg_if_unprimed(&self) -> bool {
        if self.snapshot().is_some() {
            return false;
        }

        let lkg = self.inner.lkg.clone();
        let loaded = match tokio::task::spawn_blocking(move || lkg.load()).await {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(error = %err, "mirror.lkg_load_failed");
                None
            }
        };

        let Some(snapshot) = loaded else {
            return false;
        };

        tracing::warn!(
            version = %snapshot.version,
            services = snapshot.services.len(),
            saved_at = %snapshot.fetched_at,
            "mirror.lkg_adopted"
        );
        self.adopt(snapshot);
        true
    }

    async fn fetch_and_apply(&self) -> Result<RefreshOutcome, MirrorError> {
        let current = self.snapshot();
        let url = format!(
            "{}/services",
            self.inner.config.authority_url.trim_end_matches('/')
        );

        let mut request = self.inner.http.get(url);
        if let Some(current) = current.as_ref()
            && current.source == SnapshotSource::Authority
        {
            request = request.header(IF_NONE_MATCH, current.etag());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED && current.is_some() {
            tracing::debug!("mirror.refresh_unchanged");
            return Ok(RefreshOutcome::Unchanged);
        }
        if !status.is_success() {
            return Err(MirrorError::BadStatus(status));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| MirrorError::InvalidPayload(err.to_string()))?;
        let normalized =
            normalize_value(body).map_err(|err| MirrorError::InvalidPayload(err.to_string()))?;

        for rejected in &normalized.rejected {
            tracing::warn!(
                key = %rejected.key,
                reason = %rejected.reason,
                "mirror.entry_rejected"
            );
        }
        if normalized.services.is_empty() && !normalized.rejected.is_empty() {
            return Err(MirrorError::InvalidPayload(format!(
                "all {} discovery entries were rejected",
                normalized.rejected.len()
            )));
        }

        let snapshot = Arc::new(MirrorSnapshot {
            version: normalized.version,
            updated_at: normalized.updated_at,
            services: normalized.services,
            source: SnapshotSource::Authority,
            stale: false,
            fetched_at: now_rfc3339(),
        });

        match self.inner.current.write() {
            Ok(mut guard) => *guard = Some(snapshot.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot.clone()),
        }

        tracing::info!(
            version = %snapshot.version,
            services = snapshot.services.len(),
            "mirror.refreshed"
        );

        let lkg = self.inner.lkg.clone();
        let to_save = snapshot.clone();
        match tokio::task::spawn_blocking(move || lkg.save(&to_save)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(path = %self.inner.lkg.path().display(), error = %err, "mirror.lkg_save_failed");
            }
            Err(err) => tracing::warn!(error = %err, "mirror.lkg_save_failed"),
        }

        Ok(RefreshOutcome::Updated {
            version: snapshot.version.clone(),
            services: snapshot.services.len(),
        })
    }
}

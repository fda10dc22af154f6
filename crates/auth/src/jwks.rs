use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use tokio::sync::{Mutex, RwLock};

use crate::AuthError;

/// Stale keys stay usable this long after a failed refresh before the next attempt.
pub const FAILED_REFRESH_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct JwksConfig {
    pub url: Option<String>,
    pub inline_json: Option<String>,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

/// Cached keyset with TTL-driven rotation and a single collapsed refresh on `kid` miss.
#[derive(Clone)]
pub struct JwksSource {
    config: Arc<JwksConfig>,
    http: reqwest::Client,
    cache: Arc<RwLock<JwksCache>>,
    refresh_gate: Arc<Mutex<()>>,
    generation: Arc<AtomicU64>,
}

#[derive(Debug)]
struct JwksCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
    retry_at: Option<Instant>,
}

impl JwksCache {
    fn jwk_for_kid(&self, kid: &str) -> Option<&Jwk> {
        self.jwks.as_ref()?.find(kid)
    }

    fn usable(&self, ttl: Duration, now: Instant) -> bool {
        let fresh = self
            .fetched_at
            .is_some_and(|t| now.saturating_duration_since(t) <= ttl);
        fresh || self.retry_at.is_some_and(|t| now < t)
    }
}

impl JwksSource {
    pub async fn new(config: JwksConfig) -> Result<Self, AuthError> {
        if config.url.is_none() && config.inline_json.is_none() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "jwks requires a url or inline json".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|_| AuthError {
                code: "ERR_INTERNAL",
                message: "failed to initialize jwks http client".to_string(),
            })?;

        let source = Self {
            config: Arc::new(config),
            http,
            cache: Arc::new(RwLock::new(JwksCache {
                jwks: None,
                fetched_at: None,
                retry_at: None,
            })),
            refresh_gate: Arc::new(Mutex::new(())),
            generation: Arc::new(AtomicU64::new(0)),
        };

        match source.fetch().await {
            Ok(jwks) => source.store(jwks).await,
            Err(err) if err.code == "ERR_INVALID_CONFIG" => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "auth.jwks_initial_fetch_failed");
            }
        }

        Ok(source)
    }

    /// Number of completed refresh attempts, successful or not.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let observed = self.generation();
        {
            let cache = self.cache.read().await;
            if cache.usable(self.config.cache_ttl, Instant::now())
                && let Some(jwk) = cache.jwk_for_kid(kid)
            {
                return to_decoding_key(jwk);
            }
        }

        self.refresh_after(observed).await;

        let cache = self.cache.read().await;
        match cache.jwk_for_kid(kid) {
            Some(jwk) => to_decoding_key(jwk),
            None => Err(AuthError {
                code: "ERR_AUTH_INVALID",
                message: "JWT kid not found in JWKS".to_string(),
            }),
        }
    }

    /// Refreshes unless another caller already completed a refresh after `observed`.
    async fn refresh_after(&self, observed: u64) {
        let _gate = self.refresh_gate.lock().await;
        if self.generation() != observed {
            return;
        }

        match self.fetch().await {
            Ok(jwks) => self.store(jwks).await,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    backoff_ms = FAILED_REFRESH_BACKOFF.as_millis() as u64,
                    "auth.jwks_refresh_failed"
                );
                self.cache.write().await.retry_at = Some(Instant::now() + FAILED_REFRESH_BACKOFF);
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    async fn store(&self, jwks: JwkSet) {
        let mut cache = self.cache.write().await;
        cache.jwks = Some(jwks);
        cache.fetched_at = Some(Instant::now());
        cache.retry_at = None;
    }

    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        if let Some(jwks_json) = self.config.inline_json.as_ref() {
            return serde_json::from_str::<JwkSet>(jwks_json).map_err(|_| AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "inline JWKS is not valid JWKS JSON".to_string(),
            });
        }

        let Some(url) = self.config.url.as_ref() else {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "jwks requires a url or inline json".to_string(),
            });
        };

        self.http
            .get(url)
            .send()
            .await
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "failed to fetch JWKS".to_string(),
            })?
            .error_for_status()
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "JWKS endpoint returned non-success status".to_string(),
            })?
            .json::<JwkSet>()
            .await
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "failed to parse JWKS JSON".to_string(),
            })
    }
}

fn to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, AuthError> {
    DecodingKey::from_jwk(jwk).map_err(|_| AuthError {
        code: "ERR_AUTH_INVALID",
        message: "failed to parse JWK decoding key".to_string(),
    })
}

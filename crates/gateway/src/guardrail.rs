use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode};
use nvgate_auth::{EndUser, OidcAuthenticator, S2sIdentity, S2sVerifier};
use nvgate_contracts::{MirrorSnapshot, Problem, ServiceDescriptor, is_valid_slug, parse_version};
use nvgate_mirror::ConfigMirror;
use tokio::sync::OwnedSemaphorePermit;

use crate::breaker::{Admission, BreakerPermit, BreakerRegistry, segment_for};
use crate::config::{AuthMode, S2sSettings};
use crate::rate_limit::{ConcurrencyGuard, RateLimiter, TimeoutPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ParseTarget,
    RateLimit,
    AssignTimeout,
    Breaker,
    Auth,
    Resolve,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ParseTarget => "parse_target",
            Stage::RateLimit => "rate_limit",
            Stage::AssignTimeout => "assign_timeout",
            Stage::Breaker => "breaker",
            Stage::Auth => "auth",
            Stage::Resolve => "resolve",
        }
    }
}

/// Cheap in-memory checks run before anything that may suspend on I/O.
pub const GUARDRAIL_CHAIN: [Stage; 6] = [
    Stage::ParseTarget,
    Stage::RateLimit,
    Stage::AssignTimeout,
    Stage::Breaker,
    Stage::Auth,
    Stage::Resolve,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    /// Public traffic under `/api/`.
    Edge,
    /// Service-to-service traffic under `/internal/api/`.
    Internal,
}

impl Plane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plane::Edge => "edge",
            Plane::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub slug: String,
    pub version: u32,
    /// Path below `<slug>.<version>/`, without a leading slash.
    pub rest: String,
    pub segment: String,
}

/// Parses `<slug>.<version>[/<rest>]`.
pub fn parse_target(path: &str) -> Option<Target> {
    let path = path.trim_start_matches('/');
    let (head, rest) = match path.split_once('/') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    };

    let (slug, version) = head.rsplit_once('.')?;
    let slug = slug.to_ascii_lowercase();
    if !is_valid_slug(&slug) {
        return None;
    }
    let version = parse_version(version)?;

    Some(Target {
        segment: segment_for(head),
        slug,
        version,
        rest: rest.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    EndUser(EndUser),
    Service(S2sIdentity),
}

impl Caller {
    pub fn scopes(&self) -> &[String] {
        match self {
            Caller::Anonymous => &[],
            Caller::EndUser(user) => &user.scopes,
            Caller::Service(identity) => &identity.scopes,
        }
    }

    pub fn principal(&self) -> &str {
        match self {
            Caller::Anonymous => "anonymous",
            Caller::EndUser(user) => &user.subject,
            Caller::Service(identity) => &identity.subject,
        }
    }
}

pub struct GuardRequest<'a> {
    pub plane: Plane,
    pub request_id: &'a str,
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub client: &'a str,
}

/// Everything the proxy needs once every stage has admitted the request.
#[derive(Debug)]
pub struct Admitted {
    pub target: Target,
    pub timeout: Duration,
    pub breaker: Option<BreakerPermit>,
    pub caller: Caller,
    pub descriptor: ServiceDescriptor,
    pub in_flight: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub stage: Stage,
    pub problem: Problem,
    pub retry_after: Option<Duration>,
    /// Log-only detail; never rendered.
    pub reason: &'static str,
}

impl Rejection {
    fn new(stage: Stage, status: StatusCode, kind: &str, detail: &str, reason: &'static str) -> Self {
        Self {
            stage,
            problem: Problem::new(
                status.as_u16(),
                kind,
                status.canonical_reason().unwrap_or("Error"),
                detail,
            ),
            retry_after: None,
            reason,
        }
    }

    pub fn status(&self) -> u16 {
        self.problem.status
    }
}

#[derive(Default)]
struct Progress {
    target: Option<Target>,
    in_flight: Option<OwnedSemaphorePermit>,
    timeout: Option<Duration>,
    breaker: Option<BreakerPermit>,
    caller: Option<Caller>,
    descriptor: Option<ServiceDescriptor>,
}

/// The ordered admission chain shared by both planes.
#[derive(Clone)]
pub struct Guardrails {
    pub mirror: ConfigMirror,
    pub breakers: BreakerRegistry,
    pub rate_limiter: RateLimiter,
    pub concurrency: ConcurrencyGuard,
    pub timeouts: TimeoutPolicy,
    pub auth_mode: AuthMode,
    pub oidc: Option<OidcAuthenticator>,
    pub s2s: Option<InternalAuth>,
}

#[derive(Clone)]
pub struct InternalAuth {
    pub verifier: S2sVerifier,
    pub settings: Arc<S2sSettings>,
}

impl Guardrails {
    pub async fn evaluate(&self, request: &GuardRequest<'_>) -> Result<Admitted, Rejection> {
        let snapshot = self.mirror.snapshot();
        let mut progress = Progress::default();

        for stage in GUARDRAIL_CHAIN {
            if let Err(rejection) = self
                .run_stage(stage, request, snapshot.as_deref(), &mut progress)
                .await
            {
                tracing::warn!(
                    target: "nvgate::security",
                    request_id = %request.request_id,
                    plane = request.plane.as_str(),
                    stage = rejection.stage.as_str(),
                    status = rejection.status(),
                    reason = rejection.reason,
                    "guardrail.rejected"
                );
                crate::metrics::observe_guardrail_rejection(
                    rejection.stage.as_str(),
                    rejection.status(),
                );
                return Err(rejection);
            }
        }

        let admitted = match progress {
            Progress {
                target: Some(target),
                in_flight: Some(in_flight),
                timeout: Some(timeout),
                breaker,
                caller: Some(caller),
                descriptor: Some(descriptor),
            } => Admitted {
                target,
                timeout,
                breaker,
                caller,
                descriptor,
                in_flight,
            },
            _ => {
                return Err(Rejection::new(
                    Stage::Resolve,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "request could not be admitted",
                    "incomplete_chain",
                ));
            }
        };

        tracing::info!(
            target: "nvgate::security",
            request_id = %request.request_id,
            plane = request.plane.as_str(),
            slug = %admitted.target.slug,
            version = admitted.target.version,
            principal = admitted.caller.principal(),
            probe = admitted.breaker.as_ref().is_some_and(|p| p.is_probe()),
            timeout_ms = admitted.timeout.as_millis() as u64,
            "guardrail.admitted"
        );

        Ok(admitted)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        request: &GuardRequest<'_>,
        snapshot: Option<&MirrorSnapshot>,
        progress: &mut Progress,
    ) -> Result<(), Rejection> {
        if stage == Stage::ParseTarget {
            let target = parse_target(request.path).ok_or_else(|| {
                Rejection::new(
                    stage,
                    StatusCode::BAD_REQUEST,
                    "invalid-target",
                    "path must be <slug>.<version>/<rest>",
                    "malformed_target",
                )
            })?;
            progress.target = Some(target);
            return Ok(());
        }

        let Some(target) = progress.target.as_ref() else {
            return Err(Rejection::new(
                stage,
                StatusCode::BAD_REQUEST,
                "invalid-target",
                "path must be <slug>.<version>/<rest>",
                "missing_target",
            ));
        };
        let peeked = snapshot.and_then(|s| s.resolve(&target.slug, target.version));

        match stage {
            Stage::ParseTarget => Ok(()),
            Stage::RateLimit => {
                if !self.rate_limiter.allow_route(&target.slug, request.client) {
                    let mut rejection = Rejection::new(
                        stage,
                        StatusCode::TOO_MANY_REQUESTS,
                        "rate-limited",
                        "rate limit exceeded",
                        "rate_limited",
                    );
                    rejection.retry_after = Some(self.rate_limiter.window());
                    return Err(rejection);
                }
                let permit = self.concurrency.try_acquire().ok_or_else(|| {
                    Rejection::new(
                        stage,
                        StatusCode::TOO_MANY_REQUESTS,
                        "rate-limited",
                        "gateway is at capacity",
                        "in_flight_saturated",
                    )
                })?;
                progress.in_flight = Some(permit);
                Ok(())
            }
            Stage::AssignTimeout => {
                let descriptor_ms = peeked.and_then(|d| d.overrides.timeout_ms);
                progress.timeout = Some(self.timeouts.budget_for(&target.slug, descriptor_ms));
                Ok(())
            }
            Stage::Breaker => {
                let cfg = self
                    .breakers
                    .defaults()
                    .with_overrides(peeked.and_then(|d| d.overrides.breaker.as_ref()));
                match self.breakers.admit(&target.segment, &cfg) {
                    Admission::Closed(permit) | Admission::Probe(permit) => {
                        progress.breaker = Some(permit);
                        Ok(())
                    }
                    Admission::Untracked => Ok(()),
                    Admission::Rejected { retry_after } => {
                        let mut rejection = Rejection::new(
                            stage,
                            StatusCode::SERVICE_UNAVAILABLE,
                            "circuit-open",
                            "upstream is temporarily unavailable",
                            "breaker_open",
                        );
                        rejection.retry_after = Some(retry_after);
                        Err(rejection)
                    }
                }
            }
            Stage::Auth => {
                let caller = match request.plane {
                    Plane::Edge => self.authenticate_edge(request, target, peeked).await?,
                    Plane::Internal => self.authenticate_internal(request, target).await?,
                };
                progress.caller = Some(caller);
                Ok(())
            }
            Stage::Resolve => {
                let Some(snapshot) = snapshot else {
                    return Err(Rejection::new(
                        stage,
                        StatusCode::SERVICE_UNAVAILABLE,
                        "unavailable",
                        "service directory is not ready",
                        "mirror_unprimed",
                    ));
                };
                let Some(descriptor) = snapshot.resolve(&target.slug, target.version) else {
                    return Err(Rejection::new(
                        stage,
                        StatusCode::NOT_FOUND,
                        "not-found",
                        "no such service",
                        "unknown_service",
                    ));
                };
                if !descriptor.is_routable() {
                    return Err(Rejection::new(
                        stage,
                        StatusCode::SERVICE_UNAVAILABLE,
                        "unavailable",
                        "service is not routable",
                        "service_disabled",
                    ));
                }
                progress.descriptor = Some(descriptor.clone());
                Ok(())
            }
        }
    }

    async fn authenticate_edge(
        &self,
        request: &GuardRequest<'_>,
        target: &Target,
        descriptor: Option<&ServiceDescriptor>,
    ) -> Result<Caller, Rejection> {
        if self.auth_mode == AuthMode::Local {
            return Ok(Caller::Anonymous);
        }

        // Unknown targets require a bearer so probing cannot enumerate routes.
        let required = descriptor
            .map(|d| d.requires_end_user_auth(request.method.as_str(), &target.rest))
            .unwrap_or(true);
        if !required {
            return Ok(Caller::Anonymous);
        }

        let Some(oidc) = self.oidc.as_ref() else {
            return Err(unauthenticated("oidc_unconfigured"));
        };
        oidc.authenticate(request.headers)
            .await
            .map(Caller::EndUser)
            .map_err(|err| unauthenticated(err.code))
    }

    async fn authenticate_internal(
        &self,
        request: &GuardRequest<'_>,
        target: &Target,
    ) -> Result<Caller, Rejection> {
        let Some(internal) = self.s2s.as_ref() else {
            return Err(unauthenticated("s2s_disabled"));
        };
        internal
            .verifier
            .verify(request.headers, internal.settings.callers_for(&target.slug))
            .await
            .map(Caller::Service)
            .map_err(|rejection| {
                if rejection.status() == 403 {
                    Rejection::new(
                        Stage::Auth,
                        StatusCode::FORBIDDEN,
                        "forbidden",
                        "caller is not allowed",
                        rejection.reason,
                    )
                } else {
                    unauthenticated(rejection.reason)
                }
            })
    }
}

fn unauthenticated(reason: &'static str) -> Rejection {
    Rejection::new(
        Stage::Auth,
        StatusCode::UNAUTHORIZED,
        "unauthenticated",
        "authentication required",
        reason,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    use nvgate_contracts::{ServiceKey, SnapshotSource};
    use nvgate_mirror::{LkgStore, MirrorConfig};

    use crate::breaker::{BreakerConfig, CircuitState};

    fn guardrails(route_limit: u32) -> Guardrails {
        let mirror = ConfigMirror::new(
            MirrorConfig {
                authority_url: "http://127.0.0.1:9".to_string(),
                timeout: Duration::from_millis(50),
            },
            LkgStore::new(std::env::temp_dir().join("nvgate-guardrail-unused.json")),
        )
        .expect("mirror");

        Guardrails {
            mirror,
            breakers: BreakerRegistry::new(
                BreakerConfig {
                    failure_threshold: 1,
                    half_open_after: Duration::from_secs(60),
                    min_rtt: None,
                },
                16,
            ),
            rate_limiter: RateLimiter::new(
                Duration::from_secs(60),
                64,
                0,
                HashMap::from([("acts".to_string(), route_limit)]),
            ),
            concurrency: ConcurrencyGuard::new(8),
            timeouts: TimeoutPolicy::new(Duration::from_millis(5000), HashMap::new()),
            auth_mode: AuthMode::Local,
            oidc: None,
            s2s: None,
        }
    }

    fn snapshot(descriptors: Vec<serde_json::Value>) -> MirrorSnapshot {
        let mut services = BTreeMap::new();
        for raw in descriptors {
            let descriptor: ServiceDescriptor = serde_json::from_value(raw).expect("descriptor");
            services.insert(ServiceKey::new(&descriptor.slug, descriptor.version), descriptor);
        }
        MirrorSnapshot {
            version: "1".to_string(),
            updated_at: None,
            services,
            source: SnapshotSource::Authority,
            stale: false,
            fetched_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    async fn run(guard: &Guardrails, plane: Plane, method: Method, path: &str) -> Result<Admitted, Rejection> {
        let headers = HeaderMap::new();
        guard
            .evaluate(&GuardRequest {
                plane,
                request_id: "req-1",
                method: &method,
                path,
                headers: &headers,
                client: "direct",
            })
            .await
    }

    #[test]
    fn chain_order_is_fixed() {
        assert_eq!(
            GUARDRAIL_CHAIN.map(|s| s.as_str()),
            ["parse_target", "rate_limit", "assign_timeout", "breaker", "auth", "resolve"]
        );
    }

    #[test]
    fn parse_target_accepts_slug_version_rest() {
        let target = parse_target("User.2/profile/me").unwrap();
        assert_eq!(target.slug, "user");
        assert_eq!(target.version, 2);
        assert_eq!(target.rest, "profile/me");
        assert_eq!(target.segment, "user");

        assert_eq!(parse_target("acts.1").unwrap().rest, "");
        assert!(parse_target("acts/ping").is_none());
        assert!(parse_target("acts.0/ping").is_none());
        assert!(parse_target("acts.v1/ping").is_none());
        assert!(parse_target(".1/ping").is_none());
    }

    #[tokio::test]
    async fn malformed_target_is_400() {
        let guard = guardrails(10);
        let err = run(&guard, Plane::Edge, Method::GET, "nope/ping").await.unwrap_err();
        assert_eq!(err.stage, Stage::ParseTarget);
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn rate_limited_request_never_reaches_breaker() {
        let guard = guardrails(1);
        let cfg = *guard.breakers.defaults();
        match guard.breakers.admit("acts", &cfg) {
            Admission::Closed(permit) => permit.record_failure(),
            other => panic!("expected closed, got {:?}", other),
        }
        assert_eq!(guard.breakers.state_of("acts"), Some(CircuitState::Open));
        assert!(guard.rate_limiter.allow_route("acts", "direct"));

        let err = run(&guard, Plane::Edge, Method::GET, "acts.1/ping").await.unwrap_err();
        assert_eq!(err.stage, Stage::RateLimit);
        assert_eq!(err.status(), 429);
        assert_eq!(guard.breakers.state_of("acts"), Some(CircuitState::Open));
        assert_eq!(guard.breakers.consecutive_failures("acts"), Some(1));
    }

    #[tokio::test]
    async fn open_breaker_rejects_with_retry_after() {
        let guard = guardrails(0);
        guard.mirror.adopt(snapshot(vec![serde_json::json!({
            "slug": "acts", "version": 1, "baseUrl": "http://acts:4000"
        })]));
        let cfg = *guard.breakers.defaults();
        if let Admission::Closed(permit) = guard.breakers.admit("acts", &cfg) {
            permit.record_status(500);
        }

        let err = run(&guard, Plane::Edge, Method::GET, "acts.1/ping").await.unwrap_err();
        assert_eq!(err.stage, Stage::Breaker);
        assert_eq!(err.status(), 503);
        assert!(err.retry_after.is_some());
    }

    #[tokio::test]
    async fn resolve_distinguishes_missing_and_disabled() {
        let guard = guardrails(0);
        let err = run(&guard, Plane::Edge, Method::GET, "user.1/ping").await.unwrap_err();
        assert_eq!((err.stage, err.status()), (Stage::Resolve, 503));

        guard.mirror.adopt(snapshot(vec![
            serde_json::json!({"slug": "user", "version": 1, "baseUrl": "http://u:4001"}),
            serde_json::json!({"slug": "events", "version": 1, "baseUrl": "http://e:4002", "allowProxy": false}),
        ]));

        let err = run(&guard, Plane::Edge, Method::GET, "user.2/ping").await.unwrap_err();
        assert_eq!((err.stage, err.status()), (Stage::Resolve, 404));

        let err = run(&guard, Plane::Edge, Method::GET, "events.1/ping").await.unwrap_err();
        assert_eq!((err.stage, err.status()), (Stage::Resolve, 503));

        let admitted = run(&guard, Plane::Edge, Method::GET, "user.1/ping").await.unwrap();
        assert_eq!(admitted.descriptor.base_url, "http://u:4001");
        assert_eq!(admitted.caller, Caller::Anonymous);
        assert_eq!(admitted.timeout, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn descriptor_timeout_override_applies() {
        let guard = guardrails(0);
        guard.mirror.adopt(snapshot(vec![serde_json::json!({
            "slug": "user", "version": 1, "baseUrl": "http://u:4001",
            "overrides": {"timeoutMs": 750}
        })]));
        let admitted = run(&guard, Plane::Edge, Method::GET, "user.1/ping").await.unwrap();
        assert_eq!(admitted.timeout, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn internal_plane_without_s2s_fails_closed() {
        let guard = guardrails(0);
        guard.mirror.adopt(snapshot(vec![serde_json::json!({
            "slug": "user", "version": 1, "baseUrl": "http://u:4001"
        })]));
        let err = run(&guard, Plane::Internal, Method::GET, "user.1/ping").await.unwrap_err();
        assert_eq!((err.stage, err.status()), (Stage::Auth, 401));
    }

    #[tokio::test]
    async fn oidc_mode_without_token_is_401_for_protected_routes() {
        let mut guard = guardrails(0);
        guard.auth_mode = AuthMode::Oidc;
        guard.mirror.adopt(snapshot(vec![serde_json::json!({
            "slug": "user", "version": 1, "baseUrl": "http://u:4001",
            "publicPrefixes": ["login"]
        })]));

        let err = run(&guard, Plane::Edge, Method::POST, "user.1/orders").await.unwrap_err();
        assert_eq!((err.stage, err.status()), (Stage::Auth, 401));

        let admitted = run(&guard, Plane::Edge, Method::POST, "user.1/login").await.unwrap();
        assert_eq!(admitted.caller, Caller::Anonymous);

        let admitted = run(&guard, Plane::Edge, Method::GET, "user.1/orders").await.unwrap();
        assert_eq!(admitted.caller, Caller::Anonymous);

        let err = run(&guard, Plane::Edge, Method::GET, "ghost.1/x").await.unwrap_err();
        assert_eq!((err.stage, err.status()), (Stage::Auth, 401));
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use nvgate_auth::{MintRequest, OidcAuthenticator, S2sMinter, S2sVerifier};
use nvgate_contracts::{PROBLEM_CONTENT_TYPE, Problem};
use nvgate_mirror::{ColdStart, ConfigMirror, LkgStore, MirrorConfig};
use serde::Serialize;
use ulid::Ulid;

use crate::audit::{AuditEntry, AuditPhase, AuditSink, AuditTarget};
use crate::breaker::BreakerRegistry;
use crate::config::{AuthMode, GatewayConfig, StartupError};
use crate::guardrail::{Admitted, Caller, GuardRequest, Guardrails, InternalAuth, Plane, Rejection};
use crate::proxy::{Forwarder, OutboundAuth, OutboundRequest, REQUEST_ID_HEADER, rewrite_url};
use crate::rate_limit::{ConcurrencyGuard, RateLimiter, TimeoutPolicy};

const RATE_LIMIT_MAX_KEYS: usize = 16_384;

/// Reserved route-callers slug for the internal facilitator endpoints.
const FACILITATOR_SLUG: &str = "mirror";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    guardrails: Guardrails,
    minter: Option<S2sMinter>,
    audit: AuditSink,
    forwarder: Forwarder,
    published_jwks: Arc<serde_json::Value>,
}

/// Owned collaborators behind one gateway instance.
pub struct GatewayParts {
    pub mirror: ConfigMirror,
    pub breakers: BreakerRegistry,
    pub rate_limiter: RateLimiter,
    pub concurrency: ConcurrencyGuard,
    pub timeouts: TimeoutPolicy,
    pub oidc: Option<OidcAuthenticator>,
    pub s2s: Option<InternalAuth>,
    pub minter: Option<S2sMinter>,
    pub audit: AuditSink,
    pub forwarder: Forwarder,
}

impl GatewayParts {
    pub async fn from_config(config: &GatewayConfig) -> Result<Self, StartupError> {
        let mirror = ConfigMirror::new(
            MirrorConfig {
                authority_url: config.authority_url.clone(),
                timeout: Duration::from_millis(config.authority_timeout_ms),
            },
            LkgStore::new(config.lkg_path.clone()),
        )
        .map_err(|err| StartupError {
            code: "ERR_MIRROR_INIT",
            message: format!("failed to initialize config mirror: {}", err),
        })?;

        let oidc = if config.auth_mode == AuthMode::Oidc {
            let oidc_config = config.oidc.clone().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc auth mode requires oidc config".to_string(),
            })?;

            Some(
                OidcAuthenticator::new(oidc_config)
                    .await
                    .map_err(|err| StartupError {
                        code: err.code,
                        message: err.message,
                    })?,
            )
        } else {
            None
        };

        let (s2s, minter) = match config.s2s.as_ref() {
            None => (None, None),
            Some(settings) => {
                let verifier = S2sVerifier::new(settings.verifier.clone())
                    .await
                    .map_err(|err| StartupError {
                        code: err.code,
                        message: err.message,
                    })?;

                let pem = std::fs::read(&settings.signing_key_path).map_err(|_| StartupError {
                    code: "ERR_CONFIG_FILE_READ",
                    message: format!(
                        "failed to read s2s signing key at {}",
                        settings.signing_key_path.display()
                    ),
                })?;
                let minter = S2sMinter::from_rsa_pem(&settings.signing_kid, &pem).map_err(|err| {
                    StartupError {
                        code: err.code,
                        message: err.message,
                    }
                })?;

                (
                    Some(InternalAuth {
                        verifier,
                        settings: Arc::new(settings.clone()),
                    }),
                    Some(minter),
                )
            }
        };

        let forwarder = Forwarder::new().map_err(|_| StartupError {
            code: "ERR_PROXY_INIT",
            message: "failed to initialize upstream client".to_string(),
        })?;

        Ok(Self {
            mirror,
            breakers: BreakerRegistry::new(config.breaker, config.breaker_max_segments),
            rate_limiter: RateLimiter::new(
                Duration::from_secs(config.rate_limit_window_secs.max(1)),
                RATE_LIMIT_MAX_KEYS,
                config.rate_limit_per_window,
                config.rate_limit_routes.clone(),
            ),
            concurrency: ConcurrencyGuard::new(config.max_in_flight),
            timeouts: TimeoutPolicy::new(
                Duration::from_millis(config.upstream_timeout_ms),
                config.timeout_routes.clone(),
            ),
            oidc,
            s2s,
            minter,
            audit: AuditSink::new(config.audit_queue_capacity),
            forwarder,
        })
    }
}

/// Builds the collaborators, primes the mirror and starts the background tasks.
pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let parts = GatewayParts::from_config(&config).await?;

    match parts.mirror.cold_start().await {
        ColdStart::Fresh => tracing::info!("gateway.cold_start_fresh"),
        ColdStart::Degraded => tracing::warn!("gateway.cold_start_degraded"),
        ColdStart::Empty => tracing::warn!("gateway.cold_start_empty"),
    }
    crate::metrics::set_mirror_stale(parts.mirror.snapshot().is_some_and(|s| s.stale));

    let observed = parts.mirror.clone();
    parts.mirror.spawn_refresh_loop(
        Duration::from_millis(config.mirror_refresh_interval_ms),
        move |outcome| {
            crate::metrics::observe_mirror_refresh(outcome.label());
            crate::metrics::set_mirror_stale(observed.snapshot().is_some_and(|s| s.stale));
        },
    );
    parts.audit.start();

    router_with_parts(config, parts)
}

/// Routes over caller-supplied parts; starts no background tasks.
pub fn router_with_parts(config: GatewayConfig, parts: GatewayParts) -> Result<Router, StartupError> {
    let published_jwks = load_published_jwks(&config)?;
    let internal_enabled = parts.s2s.is_some();

    let state = AppState {
        guardrails: Guardrails {
            mirror: parts.mirror,
            breakers: parts.breakers,
            rate_limiter: parts.rate_limiter,
            concurrency: parts.concurrency,
            timeouts: parts.timeouts,
            auth_mode: config.auth_mode,
            oidc: parts.oidc,
            s2s: parts.s2s,
        },
        config,
        minter: parts.minter,
        audit: parts.audit,
        forwarder: parts.forwarder,
        published_jwks: Arc::new(published_jwks),
    };

    let mut router = Router::new()
        .route("/health", get(healthz))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/api/{*path}", any(edge_proxy));

    if internal_enabled {
        router = router
            .route("/internal/api/{*path}", any(internal_proxy))
            .route("/internal/mirror", get(internal_mirror))
            .route("/internal/services/{slug}/url", get(internal_service_url));
    }

    Ok(router.fallback(not_found).with_state(state))
}

fn load_published_jwks(config: &GatewayConfig) -> Result<serde_json::Value, StartupError> {
    let Some(path) = config.s2s.as_ref().and_then(|s| s.published_jwks_path.as_ref()) else {
        return Ok(serde_json::json!({ "keys": [] }));
    };

    let raw = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read published jwks at {}", path.display()),
    })?;
    let value = serde_json::from_str::<serde_json::Value>(&raw).map_err(|_| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: "published jwks must be valid JSON".to_string(),
    })?;
    if !value.get("keys").is_some_and(|keys| keys.is_array()) {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "published jwks must contain a keys array".to_string(),
        });
    }
    Ok(value)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.guardrails.mirror.snapshot();

    let mut checks = BTreeMap::new();
    checks.insert("mirror_primed", snapshot.is_some());
    checks.insert("mirror_fresh", snapshot.as_ref().is_some_and(|s| !s.stale));

    let ready = snapshot.is_some();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if ready { "ready" } else { "not_ready" },
            checks,
            version: snapshot.map(|s| s.version.clone()),
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.published_jwks.as_ref().clone())
}

async fn not_found(headers: HeaderMap) -> Response {
    let request_id = extract_request_id(&headers);
    let mut response = problem_response(
        Problem::new(
            StatusCode::NOT_FOUND.as_u16(),
            "not-found",
            "Not Found",
            "no route matches the request path",
        )
        .with_instance(&request_id),
        None,
    );
    set_request_id(response.headers_mut(), &request_id);
    response
}

async fn edge_proxy(State(state): State<AppState>, request: Request) -> Response {
    dispatch(state, Plane::Edge, request).await
}

async fn internal_proxy(State(state): State<AppState>, request: Request) -> Response {
    dispatch(state, Plane::Internal, request).await
}

async fn dispatch(state: AppState, plane: Plane, request: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let request_id = extract_request_id(&parts.headers);
    let client = client_key(&parts.headers);

    let prefix = match plane {
        Plane::Edge => "/api/",
        Plane::Internal => "/internal/api/",
    };
    let path = parts.uri.path().strip_prefix(prefix).unwrap_or_default();

    let guard_request = GuardRequest {
        plane,
        request_id: &request_id,
        method: &parts.method,
        path,
        headers: &parts.headers,
        client: &client,
    };

    let mut response = match state.guardrails.evaluate(&guard_request).await {
        Ok(admitted) => {
            forward_admitted(&state, plane, &parts, body, &request_id, admitted, started).await
        }
        Err(rejection) => rejection_response(&rejection, &request_id),
    };

    set_request_id(response.headers_mut(), &request_id);
    crate::metrics::observe_http_request(
        plane.as_str(),
        parts.method.as_str(),
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn forward_admitted(
    state: &AppState,
    plane: Plane,
    parts: &axum::http::request::Parts,
    body: Body,
    request_id: &str,
    admitted: Admitted,
    started: Instant,
) -> Response {
    let Admitted {
        target,
        timeout,
        breaker,
        caller,
        descriptor,
        in_flight: _in_flight,
    } = admitted;

    let audit_target = AuditTarget {
        slug: target.slug.clone(),
        version: target.version,
        route: target.rest.clone(),
        method: parts.method.as_str().to_string(),
    };
    state.audit.record(AuditEntry {
        phase: AuditPhase::Begin,
        service: state.config.service_name.clone(),
        request_id: request_id.to_string(),
        target: audit_target.clone(),
        status: None,
        duration_ms: None,
    });

    let response = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Err(_) => problem_response(
            Problem::new(
                StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                "payload-too-large",
                "Payload Too Large",
                "request body exceeds the configured limit",
            )
            .with_instance(request_id),
            None,
        ),
        Ok(body) => match outbound_auth(state, plane, &caller) {
            Err(problem) => problem_response(problem.with_instance(request_id), None),
            Ok(auth) => {
                let url = rewrite_url(&descriptor, &target.rest, parts.uri.query());
                let result = state
                    .forwarder
                    .forward(OutboundRequest {
                        method: parts.method.clone(),
                        url,
                        headers: &parts.headers,
                        body,
                        request_id,
                        auth,
                        timeout,
                    })
                    .await;

                match result {
                    Ok(upstream) => {
                        if let Some(permit) = breaker {
                            permit.record_status(upstream.status.as_u16());
                        }
                        let mut response = Response::new(Body::from(upstream.body));
                        *response.status_mut() = upstream.status;
                        *response.headers_mut() = upstream.headers;
                        response
                    }
                    Err(err) => {
                        if let Some(permit) = breaker {
                            permit.record_failure();
                        }
                        crate::metrics::observe_upstream_error(err.kind());
                        tracing::warn!(
                            request_id = %request_id,
                            slug = %target.slug,
                            version = target.version,
                            timeout_ms = timeout.as_millis() as u64,
                            error = %err,
                            "proxy.upstream_failed"
                        );
                        let problem = if matches!(err, crate::proxy::UpstreamError::Timeout) {
                            Problem::new(
                                StatusCode::GATEWAY_TIMEOUT.as_u16(),
                                "gateway-timeout",
                                "Gateway Timeout",
                                "upstream did not respond in time",
                            )
                        } else {
                            Problem::new(
                                StatusCode::BAD_GATEWAY.as_u16(),
                                "bad-gateway",
                                "Bad Gateway",
                                "upstream is unreachable",
                            )
                        };
                        problem_response(problem.with_instance(request_id), None)
                    }
                }
            }
        },
    };

    state.audit.record(AuditEntry {
        phase: AuditPhase::End,
        service: state.config.service_name.clone(),
        request_id: request_id.to_string(),
        target: audit_target,
        status: Some(response.status().as_u16()),
        duration_ms: Some(started.elapsed().as_millis() as u64),
    });

    response
}

fn outbound_auth(state: &AppState, plane: Plane, caller: &Caller) -> Result<OutboundAuth, Problem> {
    if plane == Plane::Edge {
        return Ok(OutboundAuth::Passthrough);
    }

    let internal_error = || {
        Problem::new(
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            "internal",
            "Internal Server Error",
            "outbound credentials unavailable",
        )
    };
    let (Some(minter), Some(settings)) = (
        state.minter.as_ref(),
        state.config.s2s.as_ref(),
    ) else {
        return Err(internal_error());
    };

    minter
        .mint(&MintRequest {
            issuer: settings.issuer.clone(),
            audience: settings.outbound_audience.clone(),
            subject: state.config.service_name.clone(),
            scopes: caller.scopes().to_vec(),
            ttl: Duration::from_secs(settings.token_ttl_secs),
        })
        .map(OutboundAuth::S2s)
        .map_err(|err| {
            tracing::error!(code = err.code, "s2s.mint_failed");
            internal_error()
        })
}

async fn internal_mirror(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = extract_request_id(&headers);
    let mut response = match authorize_facilitator(&state, &headers, &request_id).await {
        Err(response) => response,
        Ok(()) => match state.guardrails.mirror.snapshot() {
            None => problem_response(not_ready().with_instance(&request_id), None),
            Some(snapshot) => {
                let mut response = Json(snapshot.as_ref()).into_response();
                if let Ok(etag) = HeaderValue::from_str(&snapshot.etag()) {
                    response.headers_mut().insert(header::ETAG, etag);
                }
                response
            }
        },
    };
    set_request_id(response.headers_mut(), &request_id);
    response
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceUrlResponse {
    slug: String,
    version: u32,
    base_url: String,
}

async fn internal_service_url(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let mut response = match authorize_facilitator(&state, &headers, &request_id).await {
        Err(response) => response,
        Ok(()) => match state.guardrails.mirror.snapshot() {
            None => problem_response(not_ready().with_instance(&request_id), None),
            Some(snapshot) => match snapshot.url_for_slug(&slug) {
                Some(descriptor) => Json(ServiceUrlResponse {
                    slug: descriptor.slug.clone(),
                    version: descriptor.version,
                    base_url: descriptor.base_url.clone(),
                })
                .into_response(),
                None => problem_response(
                    Problem::new(
                        StatusCode::NOT_FOUND.as_u16(),
                        "not-found",
                        "Not Found",
                        "no routable service for slug",
                    )
                    .with_instance(&request_id),
                    None,
                ),
            },
        },
    };
    set_request_id(response.headers_mut(), &request_id);
    response
}

/// Callers listed under the `mirror` slug, or any verified service when none are listed.
async fn authorize_facilitator(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> Result<(), Response> {
    let Some(internal) = state.guardrails.s2s.as_ref() else {
        return Err(problem_response(unauthorized(401).with_instance(request_id), None));
    };

    let listed = internal.settings.callers_for(FACILITATOR_SLUG);
    let any_caller = ["*".to_string()];
    let callers = if listed.is_empty() { &any_caller[..] } else { listed };

    match internal.verifier.verify(headers, callers).await {
        Ok(identity) => {
            tracing::info!(
                target: "nvgate::security",
                request_id = %request_id,
                caller = %identity.subject,
                "facilitator.admitted"
            );
            Ok(())
        }
        Err(rejection) => {
            tracing::warn!(
                target: "nvgate::security",
                request_id = %request_id,
                status = rejection.status(),
                reason = rejection.reason,
                "facilitator.rejected"
            );
            Err(problem_response(
                unauthorized(rejection.status()).with_instance(request_id),
                None,
            ))
        }
    }
}

fn unauthorized(status: u16) -> Problem {
    if status == 403 {
        Problem::new(403, "forbidden", "Forbidden", "caller is not allowed")
    } else {
        Problem::new(401, "unauthenticated", "Unauthorized", "authentication required")
    }
}

fn not_ready() -> Problem {
    Problem::new(
        StatusCode::SERVICE_UNAVAILABLE.as_u16(),
        "unavailable",
        "Service Unavailable",
        "service directory is not ready",
    )
}

fn rejection_response(rejection: &Rejection, request_id: &str) -> Response {
    problem_response(
        rejection.problem.clone().with_instance(request_id),
        rejection.retry_after,
    )
}

fn problem_response(problem: Problem, retry_after: Option<Duration>) -> Response {
    let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match serde_json::to_vec(&problem) {
        Ok(body) => body,
        Err(_) => return status.into_response(),
    };

    let mut response = (status, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
    );
    if let Some(retry_after) = retry_after
        && let Ok(value) = HeaderValue::from_str(&retry_after_secs(retry_after).to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

fn set_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

/// First `X-Forwarded-For` hop, or `direct`.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "direct".to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use nvgate_auth::{JwksConfig, OidcConfig, S2sVerifierConfig};
use nvgate_mirror::lkg;

use crate::breaker::BreakerConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub service_name: String,
    pub authority_url: String,
    pub authority_timeout_ms: u64,
    pub mirror_refresh_interval_ms: u64,
    pub lkg_path: PathBuf,
    pub breaker: BreakerConfig,
    pub breaker_max_segments: usize,
    pub rate_limit_window_secs: u64,
    pub rate_limit_per_window: u32,
    pub rate_limit_routes: HashMap<String, u32>,
    pub max_in_flight: usize,
    pub upstream_timeout_ms: u64,
    pub timeout_routes: HashMap<String, u64>,
    pub max_body_bytes: usize,
    pub audit_queue_capacity: usize,
    pub auth_mode: AuthMode,
    pub oidc: Option<OidcConfig>,
    pub s2s: Option<S2sSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Local,
    Oidc,
}

/// Internal-plane settings; present only when `NVGATE_S2S_ENABLED` is set.
#[derive(Debug, Clone)]
pub struct S2sSettings {
    pub verifier: S2sVerifierConfig,
    pub route_callers: HashMap<String, Vec<String>>,
    pub issuer: String,
    pub outbound_audience: String,
    pub signing_key_path: PathBuf,
    pub signing_kid: String,
    pub token_ttl_secs: u64,
    pub published_jwks_path: Option<PathBuf>,
}

impl S2sSettings {
    /// Callers allowed to reach `slug` on the internal plane. Unlisted slugs admit nobody.
    pub fn callers_for(&self, slug: &str) -> &[String] {
        self.route_callers
            .get(slug)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("NVGATE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("NVGATE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "NVGATE_BIND_ADDR",
        )?;

        let auth_mode = parse_auth_mode(kv.get("NVGATE_AUTH_MODE"))?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("NVGATE_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback() && auth_mode != AuthMode::Oidc {
            if dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()) {
                // Explicit dev-only escape hatch for local containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                    message: "non-local bind requires oidc auth mode; refuse startup".to_string(),
                });
            }
        }

        let service_name = optional_nonempty(kv, "NVGATE_SERVICE_NAME")
            .unwrap_or_else(|| "gateway".to_string());

        let authority_url = require_nonempty(kv, "NVGATE_AUTHORITY_URL")?;
        if !nvgate_mirror::normalize::is_absolute_http_url(&authority_url) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_AUTHORITY_URL must be an absolute http(s) URL".to_string(),
            });
        }
        let authority_timeout_ms = parse_u64(
            kv.get("NVGATE_AUTHORITY_TIMEOUT_MS"),
            1500,
            "NVGATE_AUTHORITY_TIMEOUT_MS",
        )?;
        let mirror_refresh_interval_ms = parse_u64(
            kv.get("NVGATE_MIRROR_REFRESH_INTERVAL_MS"),
            30_000,
            "NVGATE_MIRROR_REFRESH_INTERVAL_MS",
        )?;
        if mirror_refresh_interval_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_MIRROR_REFRESH_INTERVAL_MS must be >= 1".to_string(),
            });
        }

        let lkg_path = lkg::resolve_path(&service_name, kv).ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!(
                "missing required config key {} or {}",
                lkg::service_path_key(&service_name),
                lkg::SHARED_PATH_KEY
            ),
        })?;

        let failure_threshold = parse_u32(
            kv.get("NVGATE_BREAKER_FAILURE_THRESHOLD"),
            5,
            "NVGATE_BREAKER_FAILURE_THRESHOLD",
        )?;
        if failure_threshold == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_BREAKER_FAILURE_THRESHOLD must be >= 1".to_string(),
            });
        }
        let half_open_after_ms = parse_u64(
            kv.get("NVGATE_BREAKER_HALF_OPEN_AFTER_MS"),
            10_000,
            "NVGATE_BREAKER_HALF_OPEN_AFTER_MS",
        )?;
        let min_rtt_ms = match optional_nonempty(kv, "NVGATE_BREAKER_MIN_RTT_MS") {
            None => None,
            Some(v) => Some(v.parse::<u64>().map_err(|_| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_BREAKER_MIN_RTT_MS must be an integer".to_string(),
            })?),
        };
        let breaker_max_segments = parse_usize(
            kv.get("NVGATE_BREAKER_MAX_SEGMENTS"),
            1024,
            "NVGATE_BREAKER_MAX_SEGMENTS",
        )?;

        let rate_limit_window_secs = parse_u64(
            kv.get("NVGATE_RATE_LIMIT_WINDOW_SECS"),
            60,
            "NVGATE_RATE_LIMIT_WINDOW_SECS",
        )?;
        if rate_limit_window_secs == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_RATE_LIMIT_WINDOW_SECS must be >= 1".to_string(),
            });
        }
        let rate_limit_per_window = parse_u32(
            kv.get("NVGATE_RATE_LIMIT_PER_WINDOW"),
            600,
            "NVGATE_RATE_LIMIT_PER_WINDOW",
        )?;
        let rate_limit_routes =
            parse_route_map::<u32>(kv.get("NVGATE_RATE_LIMIT_ROUTES"), "NVGATE_RATE_LIMIT_ROUTES")?;

        let max_in_flight = parse_usize(kv.get("NVGATE_MAX_IN_FLIGHT"), 1024, "NVGATE_MAX_IN_FLIGHT")?;
        if max_in_flight == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_MAX_IN_FLIGHT must be >= 1".to_string(),
            });
        }

        let upstream_timeout_ms = parse_u64(
            kv.get("NVGATE_UPSTREAM_TIMEOUT_MS"),
            5000,
            "NVGATE_UPSTREAM_TIMEOUT_MS",
        )?;
        if upstream_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_UPSTREAM_TIMEOUT_MS must be >= 1".to_string(),
            });
        }
        let timeout_routes =
            parse_route_map::<u64>(kv.get("NVGATE_TIMEOUT_ROUTES"), "NVGATE_TIMEOUT_ROUTES")?;

        let max_body_bytes = parse_usize(
            kv.get("NVGATE_MAX_BODY_BYTES"),
            10 * 1024 * 1024,
            "NVGATE_MAX_BODY_BYTES",
        )?;
        let audit_queue_capacity = parse_usize(
            kv.get("NVGATE_AUDIT_QUEUE_CAPACITY"),
            1024,
            "NVGATE_AUDIT_QUEUE_CAPACITY",
        )?;
        if audit_queue_capacity == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "NVGATE_AUDIT_QUEUE_CAPACITY must be >= 1".to_string(),
            });
        }

        let oidc = if auth_mode == AuthMode::Oidc {
            Some(parse_oidc_config(kv)?)
        } else {
            None
        };

        let s2s = if parse_bool(kv.get("NVGATE_S2S_ENABLED")).unwrap_or(false) {
            Some(parse_s2s_settings(kv, &service_name)?)
        } else {
            None
        };

        Ok(Self {
            bind_addr,
            service_name,
            authority_url,
            authority_timeout_ms,
            mirror_refresh_interval_ms,
            lkg_path,
            breaker: BreakerConfig {
                failure_threshold,
                half_open_after: Duration::from_millis(half_open_after_ms),
                min_rtt: min_rtt_ms.map(Duration::from_millis),
            },
            breaker_max_segments,
            rate_limit_window_secs,
            rate_limit_per_window,
            rate_limit_routes,
            max_in_flight,
            upstream_timeout_ms,
            timeout_routes,
            max_body_bytes,
            audit_queue_capacity,
            auth_mode,
            oidc,
            s2s,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

/// `slug=value,slug=value`; slugs are lower-cased.
fn parse_route_map<T: FromStr>(
    value: Option<&String>,
    key: &'static str,
) -> Result<HashMap<String, T>, StartupError> {
    let mut out = HashMap::new();
    let Some(raw) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(out);
    };

    for entry in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let parsed = entry.split_once('=').and_then(|(slug, v)| {
            let slug = slug.trim().to_ascii_lowercase();
            if !nvgate_contracts::is_valid_slug(&slug) {
                return None;
            }
            v.trim().parse::<T>().ok().map(|v| (slug, v))
        });
        let Some((slug, v)) = parsed else {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!("{} entry `{}` must be slug=value", key, entry),
            });
        };
        out.insert(slug, v);
    }

    Ok(out)
}

/// `slug=callerA|callerB;slug2=*`
fn parse_route_callers(value: Option<&String>) -> Result<HashMap<String, Vec<String>>, StartupError> {
    let mut out = HashMap::new();
    let Some(raw) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(out);
    };

    for entry in raw.split(';').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let Some((slug, callers)) = entry.split_once('=') else {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!("NVGATE_S2S_ROUTE_CALLERS entry `{}` must be slug=a|b", entry),
            });
        };
        let slug = slug.trim().to_ascii_lowercase();
        if !nvgate_contracts::is_valid_slug(&slug) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!("NVGATE_S2S_ROUTE_CALLERS slug `{}` is invalid", slug),
            });
        }

        let mut callers = callers
            .split('|')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        callers.sort();
        callers.dedup();
        out.insert(slug, callers);
    }

    Ok(out)
}

fn parse_auth_mode(value: Option<&String>) -> Result<AuthMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("local");

    match mode {
        "local" => Ok(AuthMode::Local),
        "oidc" => Ok(AuthMode::Oidc),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "NVGATE_AUTH_MODE must be local or oidc".to_string(),
        }),
    }
}

fn parse_oidc_config(kv: &HashMap<String, String>) -> Result<OidcConfig, StartupError> {
    let issuer = require_nonempty(kv, "NVGATE_OIDC_ISSUER")?;

    let jwks_json = optional_nonempty(kv, "NVGATE_OIDC_JWKS_JSON");
    let jwks_url = optional_nonempty(kv, "NVGATE_OIDC_JWKS_URL");

    if jwks_json.is_none() && jwks_url.is_none() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc requires NVGATE_OIDC_JWKS_URL or NVGATE_OIDC_JWKS_JSON".to_string(),
        });
    }

    let audience = optional_nonempty(kv, "NVGATE_OIDC_AUDIENCE");

    let jwks_timeout_ms = parse_u64(
        kv.get("NVGATE_OIDC_JWKS_TIMEOUT_MS"),
        2000,
        "NVGATE_OIDC_JWKS_TIMEOUT_MS",
    )?;
    let jwks_refresh_ttl_secs = parse_u64(
        kv.get("NVGATE_OIDC_JWKS_REFRESH_TTL_SECS"),
        300,
        "NVGATE_OIDC_JWKS_REFRESH_TTL_SECS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("NVGATE_OIDC_CLOCK_SKEW_SECS"),
        60,
        "NVGATE_OIDC_CLOCK_SKEW_SECS",
    )?;

    Ok(OidcConfig {
        issuer,
        audience,
        jwks: JwksConfig {
            url: jwks_url,
            inline_json: jwks_json,
            timeout: Duration::from_millis(jwks_timeout_ms),
            cache_ttl: Duration::from_secs(jwks_refresh_ttl_secs),
        },
        clock_skew: Duration::from_secs(clock_skew_secs),
    })
}

fn parse_s2s_settings(
    kv: &HashMap<String, String>,
    service_name: &str,
) -> Result<S2sSettings, StartupError> {
    let audience = require_nonempty(kv, "NVGATE_S2S_AUDIENCE")?;

    let allowed_issuers = require_nonempty(kv, "NVGATE_S2S_ALLOWED_ISSUERS")?
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    if allowed_issuers.is_empty() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "NVGATE_S2S_ALLOWED_ISSUERS must list at least one issuer".to_string(),
        });
    }

    let jwks_url = optional_nonempty(kv, "NVGATE_S2S_JWKS_URL");
    let jwks_json = optional_nonempty(kv, "NVGATE_S2S_JWKS_JSON");
    if jwks_url.is_none() && jwks_json.is_none() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "s2s requires NVGATE_S2S_JWKS_URL or NVGATE_S2S_JWKS_JSON".to_string(),
        });
    }
    let cache_ttl_secs = parse_u64(
        kv.get("NVGATE_S2S_JWKS_CACHE_TTL_SECS"),
        300,
        "NVGATE_S2S_JWKS_CACHE_TTL_SECS",
    )?;
    let jwks_timeout_ms = parse_u64(
        kv.get("NVGATE_S2S_JWKS_TIMEOUT_MS"),
        2000,
        "NVGATE_S2S_JWKS_TIMEOUT_MS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("NVGATE_S2S_CLOCK_SKEW_SECS"),
        30,
        "NVGATE_S2S_CLOCK_SKEW_SECS",
    )?;

    let route_callers = parse_route_callers(kv.get("NVGATE_S2S_ROUTE_CALLERS"))?;

    let issuer =
        optional_nonempty(kv, "NVGATE_S2S_ISSUER").unwrap_or_else(|| service_name.to_string());
    let outbound_audience =
        optional_nonempty(kv, "NVGATE_S2S_OUTBOUND_AUDIENCE").unwrap_or_else(|| audience.clone());

    let signing_key_path = PathBuf::from(require_nonempty(kv, "NVGATE_S2S_SIGNING_KEY_PATH")?);
    let signing_kid = require_nonempty(kv, "NVGATE_S2S_SIGNING_KID")?;
    let token_ttl_secs = parse_u64(
        kv.get("NVGATE_S2S_TOKEN_TTL_SECS"),
        60,
        "NVGATE_S2S_TOKEN_TTL_SECS",
    )?;
    if token_ttl_secs == 0 {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "NVGATE_S2S_TOKEN_TTL_SECS must be >= 1".to_string(),
        });
    }
    let published_jwks_path =
        optional_nonempty(kv, "NVGATE_S2S_PUBLISHED_JWKS_PATH").map(PathBuf::from);

    Ok(S2sSettings {
        verifier: S2sVerifierConfig {
            audience,
            allowed_issuers,
            clock_skew: Duration::from_secs(clock_skew_secs),
            jwks: JwksConfig {
                url: jwks_url,
                inline_json: jwks_json,
                timeout: Duration::from_millis(jwks_timeout_ms),
                cache_ttl: Duration::from_secs(cache_ttl_secs),
            },
        },
        route_callers,
        issuer,
        outbound_audience,
        signing_key_path,
        signing_kid,
        token_ttl_secs,
        published_jwks_path,
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

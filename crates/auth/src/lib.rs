use http::HeaderMap;
use http::header;
use serde_json::Value;

pub mod jwks;
pub mod oidc;
pub mod s2s;

pub use jwks::{JwksConfig, JwksSource};
pub use oidc::{EndUser, OidcAuthenticator, OidcConfig};
pub use s2s::{
    Audience, MintRequest, RejectionKind, S2sClaims, S2sIdentity, S2sMinter, S2sRejection,
    S2sVerifier, S2sVerifierConfig,
};

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

pub fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_REQUIRED",
            message: "missing Authorization header".to_string(),
        })?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Authorization must be a Bearer token".to_string(),
        })?;

    if token.trim().is_empty() {
        return Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Bearer token is empty".to_string(),
        });
    }

    Ok(token.trim().to_string())
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: format!("required claim `{}` is missing or not a string", claim),
        })
}

fn claim_string_vec(claims: &Value, claim: &str) -> Result<Vec<String>, AuthError> {
    let Some(value) = claims.get(claim) else {
        return Ok(Vec::new());
    };

    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![s.to_string()])
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let Some(s) = item.as_str() else {
                    return Err(AuthError {
                        code: "ERR_AUTH_INVALID",
                        message: format!("claim `{}` must be a string array", claim),
                    });
                };
                let s = s.trim();
                if !s.is_empty() {
                    out.push(s.to_string());
                }
            }
            out.sort();
            out.dedup();
            Ok(out)
        }
        _ => Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: format!("claim `{}` must be a string or a string array", claim),
        }),
    }
}

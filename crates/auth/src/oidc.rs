use std::time::Duration;

use http::HeaderMap;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde_json::Value;

use crate::jwks::{JwksConfig, JwksSource};
use crate::{AuthError, bearer_token, claim_string, claim_string_vec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndUser {
    pub subject: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: Option<String>,
    pub jwks: JwksConfig,
    pub clock_skew: Duration,
}

/// Verifies end-user bearer tokens on the edge plane.
#[derive(Clone)]
pub struct OidcAuthenticator {
    config: OidcConfig,
    jwks: JwksSource,
}

impl OidcAuthenticator {
    pub async fn new(config: OidcConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc issuer must be non-empty".to_string(),
            });
        }

        let jwks = JwksSource::new(config.jwks.clone()).await?;
        Ok(Self { config, jwks })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<EndUser, AuthError> {
        let token = bearer_token(headers)?;

        let header = decode_header(&token).map_err(|_| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "invalid JWT header".to_string(),
        })?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError {
                code: "ERR_AUTH_INVALID",
                message: "unsupported JWT alg (expected RS256)".to_string(),
            });
        }

        let kid = header.kid.ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "JWT header missing kid".to_string(),
        })?;

        let decoding_key = self.jwks.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(std::slice::from_ref(&self.config.issuer));
        match self.config.audience.as_ref() {
            Some(audience) => validation.set_audience(std::slice::from_ref(audience)),
            None => validation.validate_aud = false,
        }
        validation.leeway = self.config.clock_skew.as_secs();

        let decoded =
            decode::<Value>(&token, &decoding_key, &validation).map_err(|_| AuthError {
                code: "ERR_AUTH_INVALID",
                message: "JWT validation failed".to_string(),
            })?;

        let claims = decoded.claims;
        let subject = claim_string(&claims, "sub")?;

        let mut scopes = match claims.get("scope").and_then(|v| v.as_str()) {
            Some(scope) => scope
                .split_whitespace()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };
        scopes.extend(claim_string_vec(&claims, "scopes")?);
        scopes.sort();
        scopes.dedup();

        Ok(EndUser { subject, scopes })
    }
}

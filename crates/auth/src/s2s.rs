use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};

use crate::jwks::{JwksConfig, JwksSource};
use crate::{AuthError, bearer_token};

/// `aud` may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(aud) => aud == audience,
            Audience::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S2sClaims {
    pub iss: String,
    pub aud: Audience,
    pub sub: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: u64,
    pub iat: u64,
}

#[derive(Debug, Clone)]
pub struct MintRequest {
    pub issuer: String,
    pub audience: String,
    pub subject: String,
    pub scopes: Vec<String>,
    pub ttl: Duration,
}

/// Signs short-lived RS256 tokens for outbound service calls.
#[derive(Clone)]
pub struct S2sMinter {
    kid: String,
    key: EncodingKey,
}

impl std::fmt::Debug for S2sMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S2sMinter").field("kid", &self.kid).finish()
    }
}

impl S2sMinter {
    pub fn from_rsa_pem(kid: &str, pem: &[u8]) -> Result<Self, AuthError> {
        if kid.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "s2s signing kid must be non-empty".to_string(),
            });
        }

        let key = EncodingKey::from_rsa_pem(pem).map_err(|_| AuthError {
            code: "ERR_INVALID_CONFIG",
            message: "s2s signing key is not a valid RSA PEM".to_string(),
        })?;

        Ok(Self {
            kid: kid.trim().to_string(),
            key,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn mint(&self, request: &MintRequest) -> Result<String, AuthError> {
        let iat = unix_now();
        let claims = S2sClaims {
            iss: request.issuer.clone(),
            aud: Audience::One(request.audience.clone()),
            sub: request.subject.clone(),
            scopes: request.scopes.clone(),
            exp: iat + request.ttl.as_secs().max(1),
            iat,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());

        encode(&header, &claims, &self.key).map_err(|_| AuthError {
            code: "ERR_INTERNAL",
            message: "failed to sign s2s token".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct S2sVerifierConfig {
    pub audience: String,
    pub allowed_issuers: Vec<String>,
    pub clock_skew: Duration,
    pub jwks: JwksConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S2sIdentity {
    pub issuer: String,
    pub subject: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Token missing, malformed, unsigned by a known key, or expired.
    Unauthenticated,
    /// Cryptographically valid token whose claims are not acceptable here.
    Forbidden,
}

/// Reason is for logs only; callers render a generic problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S2sRejection {
    pub kind: RejectionKind,
    pub reason: &'static str,
}

impl S2sRejection {
    fn unauthenticated(reason: &'static str) -> Self {
        Self {
            kind: RejectionKind::Unauthenticated,
            reason,
        }
    }

    fn forbidden(reason: &'static str) -> Self {
        Self {
            kind: RejectionKind::Forbidden,
            reason,
        }
    }

    pub fn status(&self) -> u16 {
        match self.kind {
            RejectionKind::Unauthenticated => 401,
            RejectionKind::Forbidden => 403,
        }
    }
}

impl std::fmt::Display for S2sRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s2s rejected ({}): {}", self.status(), self.reason)
    }
}

impl std::error::Error for S2sRejection {}

#[derive(Clone)]
pub struct S2sVerifier {
    config: S2sVerifierConfig,
    jwks: JwksSource,
}

impl S2sVerifier {
    pub async fn new(config: S2sVerifierConfig) -> Result<Self, AuthError> {
        if config.audience.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "s2s audience must be non-empty".to_string(),
            });
        }
        if config.allowed_issuers.is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "s2s allowed issuers must be non-empty".to_string(),
            });
        }

        let jwks = JwksSource::new(config.jwks.clone()).await?;
        Ok(Self { config, jwks })
    }

    pub fn jwks(&self) -> &JwksSource {
        &self.jwks
    }

    /// `allowed_callers` is the target route's caller list; `*` admits any subject.
    pub async fn verify(
        &self,
        headers: &HeaderMap,
        allowed_callers: &[String],
    ) -> Result<S2sIdentity, S2sRejection> {
        let token = bearer_token(headers).map_err(|err| {
            if err.code == "ERR_AUTH_REQUIRED" {
                S2sRejection::unauthenticated("missing_token")
            } else {
                S2sRejection::unauthenticated("malformed_token")
            }
        })?;

        let header =
            decode_header(&token).map_err(|_| S2sRejection::unauthenticated("malformed_token"))?;
        if header.alg != Algorithm::RS256 {
            return Err(S2sRejection::unauthenticated("unsupported_alg"));
        }
        let kid = header
            .kid
            .ok_or(S2sRejection::unauthenticated("missing_kid"))?;

        let decoding_key = self
            .jwks
            .decoding_key(&kid)
            .await
            .map_err(|_| S2sRejection::unauthenticated("unknown_kid"))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        validation.leeway = self.config.clock_skew.as_secs();
        validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);

        let claims = decode::<S2sClaims>(&token, &decoding_key, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => S2sRejection::unauthenticated("expired"),
                ErrorKind::InvalidSignature => S2sRejection::unauthenticated("bad_signature"),
                _ => S2sRejection::unauthenticated("malformed_token"),
            })?
            .claims;

        if !claims.aud.contains(&self.config.audience) {
            return Err(S2sRejection::forbidden("audience"));
        }
        if !self.config.allowed_issuers.iter().any(|iss| *iss == claims.iss) {
            return Err(S2sRejection::forbidden("issuer"));
        }
        if !caller_allowed(allowed_callers, &claims.sub) {
            return Err(S2sRejection::forbidden("caller"));
        }

        Ok(S2sIdentity {
            issuer: claims.iss,
            subject: claims.sub,
            scopes: claims.scopes,
        })
    }
}

fn caller_allowed(allowed_callers: &[String], subject: &str) -> bool {
    allowed_callers
        .iter()
        .any(|caller| caller == "*" || caller == subject)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

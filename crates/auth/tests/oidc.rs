use std::time::Duration;

use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use nvgate_auth::{JwksConfig, OidcAuthenticator, OidcConfig};

fn edge_authenticator_config(audience: Option<&str>) -> OidcConfig {
    OidcConfig {
        issuer: "https://issuer.example".to_string(),
        audience: audience.map(|a| a.to_string()),
        jwks: JwksConfig {
            url: None,
            inline_json: Some(include_str!("fixtures/jwks_edge.json").to_string()),
            timeout: Duration::from_millis(2000),
            cache_ttl: Duration::from_secs(300),
        },
        clock_skew: Duration::from_secs(0),
    }
}

fn sign(claims: &serde_json::Value, kid: &str) -> String {
    let private_key_pem = include_bytes!("fixtures/test_rsa_c_private.pem");

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());

    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(private_key_pem).expect("private key must parse"),
    )
    .expect("token encode should succeed")
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token)
            .parse()
            .expect("authorization header must parse"),
    );
    headers
}

#[tokio::test]
async fn authenticate_extracts_end_user_from_valid_rs256_jwt() {
    let token = sign(
        &serde_json::json!({
            "iss": "https://issuer.example",
            "sub": "dev",
            "aud": "nvgate",
            "exp": 2000000000,
            "iat": 1000000000,
            "scope": "orders:read profile",
            "scopes": ["orders:write", "profile"]
        }),
        "s2s-c",
    );

    let auth = OidcAuthenticator::new(edge_authenticator_config(Some("nvgate")))
        .await
        .expect("auth init should succeed");

    let user = auth
        .authenticate(&bearer(&token))
        .await
        .expect("authenticate should succeed");

    assert_eq!(user.subject, "dev");
    assert_eq!(user.scopes, vec!["orders:read", "orders:write", "profile"]);
}

#[tokio::test]
async fn authenticate_rejects_wrong_issuer_and_audience() {
    let auth = OidcAuthenticator::new(edge_authenticator_config(Some("nvgate")))
        .await
        .expect("auth init should succeed");

    let wrong_issuer = sign(
        &serde_json::json!({
            "iss": "https://other.example",
            "sub": "dev",
            "aud": "nvgate",
            "exp": 2000000000,
        }),
        "s2s-c",
    );
    let err = auth.authenticate(&bearer(&wrong_issuer)).await.unwrap_err();
    assert_eq!(err.code, "ERR_AUTH_INVALID");

    let wrong_audience = sign(
        &serde_json::json!({
            "iss": "https://issuer.example",
            "sub": "dev",
            "aud": "someone-else",
            "exp": 2000000000,
        }),
        "s2s-c",
    );
    assert!(auth.authenticate(&bearer(&wrong_audience)).await.is_err());

    let unknown_kid = sign(
        &serde_json::json!({
            "iss": "https://issuer.example",
            "sub": "dev",
            "aud": "nvgate",
            "exp": 2000000000,
        }),
        "nope",
    );
    assert!(auth.authenticate(&bearer(&unknown_kid)).await.is_err());
}

#[tokio::test]
async fn audience_is_optional() {
    let auth = OidcAuthenticator::new(edge_authenticator_config(None))
        .await
        .expect("auth init should succeed");

    let token = sign(
        &serde_json::json!({
            "iss": "https://issuer.example",
            "sub": "dev",
            "exp": 2000000000,
        }),
        "s2s-c",
    );
    let user = auth.authenticate(&bearer(&token)).await.expect("valid");
    assert!(user.scopes.is_empty());
}

#[tokio::test]
async fn invalid_inline_jwks_is_a_config_error() {
    let mut config = edge_authenticator_config(None);
    config.jwks.inline_json = Some("{not json".to_string());
    let err = OidcAuthenticator::new(config)
        .await
        .err()
        .expect("init must fail");
    assert_eq!(err.code, "ERR_INVALID_CONFIG");
}

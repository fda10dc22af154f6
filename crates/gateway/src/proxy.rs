use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use nvgate_contracts::ServiceDescriptor;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
pub enum UpstreamError {
    Timeout,
    Network(reqwest::Error),
}

impl UpstreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Network(_) => "network",
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "upstream timed out"),
            UpstreamError::Network(err) => write!(f, "upstream request failed: {}", err),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Network(value)
        }
    }
}

/// How the outbound hop authenticates.
#[derive(Debug, Clone)]
pub enum OutboundAuth {
    /// Edge hop: the caller's own `Authorization` travels unchanged.
    Passthrough,
    /// Internal hop: inbound credentials are dropped and replaced with a freshly minted token.
    S2s(String),
}

pub struct OutboundRequest<'a> {
    pub method: Method,
    pub url: String,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub request_id: &'a str,
    pub auth: OutboundAuth,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client })
    }

    /// Sends the request and buffers the response; the whole exchange shares one deadline.
    pub async fn forward(
        &self,
        request: OutboundRequest<'_>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut headers = strip_hop_by_hop(request.headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if let OutboundAuth::S2s(token) = &request.auth {
            headers.remove(header::AUTHORIZATION);
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(request.request_id) {
            headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }

        let call = async {
            let response = self
                .client
                .request(request.method, &request.url)
                .headers(headers)
                .body(request.body)
                .send()
                .await?;
            let status = response.status();
            let headers = strip_hop_by_hop(response.headers());
            let body = response.bytes().await?;
            Ok::<_, UpstreamError>(UpstreamResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(request.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout),
        }
    }
}

/// `baseUrl` + `outboundApiPrefix` + `/` + rest (first segment aliased) + query.
pub fn rewrite_url(descriptor: &ServiceDescriptor, rest: &str, query: Option<&str>) -> String {
    let mut url = descriptor.base_url.trim_end_matches('/').to_string();
    url.push_str(descriptor.outbound_api_prefix.trim_end_matches('/'));
    url.push('/');

    let rest = rest.trim_start_matches('/');
    let (first, tail) = match rest.split_once('/') {
        Some((first, tail)) => (first, Some(tail)),
        None => (rest, None),
    };
    let first = descriptor
        .overrides
        .route_aliases
        .get(first)
        .map(|alias| alias.trim_matches('/'))
        .unwrap_or(first);
    url.push_str(first);
    if let Some(tail) = tail {
        url.push('/');
        url.push_str(tail);
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Drops RFC 7230 hop-by-hop headers and any header named in `Connection`.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || named.iter().any(|n| n == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(raw: serde_json::Value) -> ServiceDescriptor {
        serde_json::from_value(raw).expect("descriptor")
    }

    #[test]
    fn rewrite_joins_base_prefix_rest_and_query() {
        let d = descriptor(serde_json::json!({
            "slug": "user", "version": 1, "baseUrl": "http://u:4001/"
        }));
        assert_eq!(rewrite_url(&d, "ping", None), "http://u:4001/ping");
        assert_eq!(rewrite_url(&d, "", None), "http://u:4001/");
        assert_eq!(
            rewrite_url(&d, "a/b", Some("x=1&y=2")),
            "http://u:4001/a/b?x=1&y=2"
        );

        let d = descriptor(serde_json::json!({
            "slug": "user", "version": 1, "baseUrl": "http://u:4001",
            "outboundApiPrefix": "/api/v2",
            "overrides": {"routeAliases": {"me": "profile"}}
        }));
        assert_eq!(rewrite_url(&d, "me/settings", None), "http://u:4001/api/v2/profile/settings");
        assert_eq!(rewrite_url(&d, "mee", Some("")), "http://u:4001/api/v2/mee");
    }

    #[test]
    fn hop_by_hop_and_connection_named_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, X-Trace-Hop"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-trace-hop", HeaderValue::from_static("1"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let out = strip_hop_by_hop(&headers);
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get("x-trace-hop").is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "application/json");
        assert_eq!(out.get_all("x-multi").iter().count(), 2);
    }
}

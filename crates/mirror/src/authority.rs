use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use nvgate_contracts::{ServiceDescriptor, ServiceKey, version_etag};
use tokio::sync::RwLock;

use crate::lkg::now_rfc3339;

/// In-memory discovery registry; the version moves forward on every change.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    version: u64,
    updated_at: Option<String>,
    services: BTreeMap<ServiceKey, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, descriptor: ServiceDescriptor) -> u64 {
        let mut state = self.inner.write().await;
        state.services.insert(descriptor.key(), descriptor);
        state.bump()
    }

    pub async fn remove(&self, key: &ServiceKey) -> Option<u64> {
        let mut state = self.inner.write().await;
        state.services.remove(key)?;
        Some(state.bump())
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }
}

impl RegistryState {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.updated_at = Some(now_rfc3339());
        self.version
    }

    fn document<'a>(
        &self,
        services: impl Iterator<Item = (&'a ServiceKey, &'a ServiceDescriptor)>,
    ) -> serde_json::Value {
        let services = services
            .map(|(key, descriptor)| {
                (
                    key.to_string(),
                    serde_json::to_value(descriptor).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect::<serde_json::Map<_, _>>();

        serde_json::json!({
            "version": self.version.to_string(),
            "updatedAt": self.updated_at,
            "services": services,
        })
    }
}

pub fn router(registry: ServiceRegistry) -> Router {
    Router::new()
        .route("/services", get(list_services))
        .route("/services/{slug}", get(get_service))
        .with_state(registry)
}

async fn list_services(State(registry): State<ServiceRegistry>, headers: HeaderMap) -> Response {
    let state = registry.inner.read().await;
    let etag = version_etag(&state.version.to_string());
    if if_none_match(&headers, &etag) {
        return not_modified(&etag);
    }

    let body = state.document(state.services.iter());
    with_etag(axum::Json(body).into_response(), &etag)
}

async fn get_service(
    State(registry): State<ServiceRegistry>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let slug = slug.trim().to_ascii_lowercase();
    let state = registry.inner.read().await;
    if !state.services.keys().any(|key| key.slug == slug) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let etag = version_etag(&state.version.to_string());
    if if_none_match(&headers, &etag) {
        return not_modified(&etag);
    }

    let body = state.document(state.services.iter().filter(|(key, _)| key.slug == slug));
    with_etag(axum::Json(body).into_response(), &etag)
}

fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim())
        .any(|candidate| candidate == "*" || candidate == etag)
}

fn not_modified(etag: &str) -> Response {
    with_etag(StatusCode::NOT_MODIFIED.into_response(), etag)
}

fn with_etag(mut response: Response, etag: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn version_moves_on_every_change() {
        let registry = ServiceRegistry::new();
        let descriptor: ServiceDescriptor = serde_json::from_value(serde_json::json!({
            "slug": "user",
            "version": 1,
            "baseUrl": "http://u:4001",
        }))
        .unwrap();

        assert_eq!(registry.upsert(descriptor.clone()).await, 1);
        assert_eq!(registry.upsert(descriptor).await, 2);
        assert_eq!(registry.remove(&ServiceKey::new("user", 1)).await, Some(3));
        assert_eq!(registry.remove(&ServiceKey::new("user", 1)).await, None);
        assert_eq!(registry.version().await, 3);
    }

    #[test]
    fn if_none_match_accepts_lists_and_wildcard() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_static("\"v:1\", \"v:2\""),
        );
        assert!(if_none_match(&headers, "\"v:2\""));
        assert!(!if_none_match(&headers, "\"v:3\""));

        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(if_none_match(&headers, "\"v:3\""));
    }
}

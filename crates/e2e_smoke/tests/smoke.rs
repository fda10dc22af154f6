use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use nvgate_auth::{MintRequest, S2sMinter};
use nvgate_contracts::{MirrorSnapshot, ServiceDescriptor, ServiceKey, SnapshotSource};
use nvgate_gateway::config::GatewayConfig;
use nvgate_mirror::LkgStore;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const KEY_B: &[u8] = include_bytes!("../../auth/tests/fixtures/test_rsa_b_private.pem");
const JWKS_CURRENT_NEXT: &str = include_str!("../../auth/tests/fixtures/jwks_current_next.json");

#[derive(Clone, Default)]
struct Backend {
    hits: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

impl Backend {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().expect("paths lock").clone()
    }
}

async fn backend_handler(State(backend): State<Backend>, request: Request) -> Response {
    backend.hits.fetch_add(1, Ordering::SeqCst);
    backend
        .paths
        .lock()
        .expect("paths lock")
        .push(request.uri().path().to_string());

    if backend.fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    axum::Json(serde_json::json!({ "pong": true })).into_response()
}

async fn spawn_backend(fail: bool) -> (Backend, SocketAddr, oneshot::Sender<()>) {
    let backend = Backend::default();
    backend.fail.store(fail, Ordering::SeqCst);
    let app = Router::new()
        .fallback(backend_handler)
        .with_state(backend.clone());
    let (addr, shutdown, _) = spawn_server(app).await;
    (backend, addr, shutdown)
}

async fn spawn_authority(payload: serde_json::Value) -> (SocketAddr, oneshot::Sender<()>) {
    let app = Router::new().route(
        "/services",
        get(move || {
            let payload = payload.clone();
            async move { axum::Json(payload) }
        }),
    );
    let (addr, shutdown, _) = spawn_server(app).await;
    (addr, shutdown)
}

async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr")
}

fn temp_lkg_path() -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let suffix = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
        .join(format!("nvgate_e2e_{}_{}", std::process::id(), suffix))
        .join("lkg.json")
}

fn fixture_path(name: &str) -> String {
    workspace_root()
        .join("crates")
        .join("auth")
        .join("tests")
        .join("fixtures")
        .join(name)
        .display()
        .to_string()
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

async fn start_gateway(
    authority: SocketAddr,
    lkg_path: &Path,
    extra: Vec<(&'static str, String)>,
) -> (String, oneshot::Sender<()>) {
    let mut kv = HashMap::from([
        (
            "NVGATE_AUTHORITY_URL".to_string(),
            format!("http://{}", authority),
        ),
        ("NVGATE_AUTHORITY_TIMEOUT_MS".to_string(), "500".to_string()),
        (
            "NVGATE_MIRROR_REFRESH_INTERVAL_MS".to_string(),
            "60000".to_string(),
        ),
        ("NVGATE_LKG_PATH".to_string(), lkg_path.display().to_string()),
    ]);
    for (key, value) in extra {
        kv.insert(key.to_string(), value);
    }

    let config = GatewayConfig::from_kv(&kv).expect("config should parse");
    let app = nvgate_gateway::http::router(config)
        .await
        .expect("gateway should start");
    let (addr, shutdown, _) = spawn_server(app).await;
    (format!("http://{}", addr), shutdown)
}

fn scenario_payload(base_url: &str) -> serde_json::Value {
    serde_json::json!({
        "version": "3",
        "services": {
            "user@1": { "baseUrl": base_url, "enabled": true }
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authority_snapshot_routes_edge_request_to_backend() {
    let log_buf = init_test_tracing();

    let (backend, backend_addr, _backend_shutdown) = spawn_backend(false).await;
    let (authority, _authority_shutdown) =
        spawn_authority(scenario_payload(&format!("http://{}", backend_addr))).await;
    let lkg_path = temp_lkg_path();
    let (gateway, _gateway_shutdown) = start_gateway(authority, &lkg_path, Vec::new()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/user.1/ping", gateway))
        .header("x-request-id", "req_smoke_01")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.paths(), vec!["/ping"]);

    let ready: serde_json::Value = client
        .get(format!("{}/readyz", gateway))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ready["status"], "ready");
    assert_eq!(ready["version"], "3");
    assert_eq!(ready["checks"]["mirror_fresh"], true);

    let saved = LkgStore::new(lkg_path.clone())
        .read_file()
        .expect("successful refresh should persist the lkg");
    assert_eq!(saved.meta.version, "3");
    assert!(saved.mirror.contains_key("user@1"));

    let logs = wait_for_log(&log_buf, "req_smoke_01", "audit.end").await;
    assert!(logs.contains("audit.begin"), "logs:\n{}", logs);
    assert!(logs.contains("guardrail.admitted"), "logs:\n{}", logs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_start_falls_back_to_last_known_good() {
    let (backend, backend_addr, _backend_shutdown) = spawn_backend(false).await;

    let lkg_path = temp_lkg_path();
    let store = LkgStore::new(lkg_path.clone());
    store.ensure_seeded().expect("seed lkg");
    let descriptor: ServiceDescriptor = serde_json::from_value(serde_json::json!({
        "slug": "user",
        "version": 1,
        "baseUrl": format!("http://{}", backend_addr),
    }))
    .expect("descriptor");
    store
        .save(&MirrorSnapshot {
            version: "2".to_string(),
            updated_at: None,
            services: BTreeMap::from([(ServiceKey::new("user", 1), descriptor)]),
            source: SnapshotSource::Authority,
            stale: false,
            fetched_at: "2026-01-01T00:00:00Z".to_string(),
        })
        .expect("save lkg");

    let (gateway, _gateway_shutdown) =
        start_gateway(unreachable_addr().await, &lkg_path, Vec::new()).await;
    let client = reqwest::Client::new();

    let ready = client
        .get(format!("{}/readyz", gateway))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    let ready: serde_json::Value = ready.json().await.unwrap();
    assert_eq!(ready["checks"]["mirror_fresh"], false);

    let response = client
        .get(format!("{}/api/user.1/ping", gateway))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.hits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consecutive_upstream_failures_open_the_breaker() {
    let log_buf = init_test_tracing();

    let (backend, backend_addr, _backend_shutdown) = spawn_backend(true).await;
    let (authority, _authority_shutdown) = spawn_authority(serde_json::json!({
        "version": "1",
        "services": {
            "acts@1": { "baseUrl": format!("http://{}", backend_addr) }
        }
    }))
    .await;
    let (gateway, _gateway_shutdown) = start_gateway(
        authority,
        &temp_lkg_path(),
        vec![
            ("NVGATE_BREAKER_FAILURE_THRESHOLD", "5".to_string()),
            ("NVGATE_BREAKER_HALF_OPEN_AFTER_MS", "10000".to_string()),
        ],
    )
    .await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/acts.1/perform", gateway);

    for _ in 0..5 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text().await.unwrap(), "boom");
    }

    let response = client
        .get(&url)
        .header("x-request-id", "req_breaker_06")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["instance"], "req_breaker_06");
    assert_eq!(backend.hits(), 5);

    let logs = wait_for_log(&log_buf, "req_breaker_06", "guardrail.rejected").await;
    assert!(logs.contains("breaker.opened"), "logs:\n{}", logs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s2s_call_with_wrong_audience_is_forbidden() {
    let (backend, backend_addr, _backend_shutdown) = spawn_backend(false).await;
    let (authority, _authority_shutdown) =
        spawn_authority(scenario_payload(&format!("http://{}", backend_addr))).await;
    let (gateway, _gateway_shutdown) = start_gateway(
        authority,
        &temp_lkg_path(),
        vec![
            ("NVGATE_S2S_ENABLED", "true".to_string()),
            ("NVGATE_S2S_AUDIENCE", "internal-services".to_string()),
            ("NVGATE_S2S_ALLOWED_ISSUERS", "orders".to_string()),
            ("NVGATE_S2S_JWKS_JSON", JWKS_CURRENT_NEXT.to_string()),
            ("NVGATE_S2S_ROUTE_CALLERS", "user=*".to_string()),
            (
                "NVGATE_S2S_SIGNING_KEY_PATH",
                fixture_path("test_rsa_a_private.pem"),
            ),
            ("NVGATE_S2S_SIGNING_KID", "s2s-a".to_string()),
        ],
    )
    .await;

    let minter = S2sMinter::from_rsa_pem("s2s-b", KEY_B).expect("minter");
    let mint = |audience: &str| {
        minter
            .mint(&MintRequest {
                issuer: "orders".to_string(),
                audience: audience.to_string(),
                subject: "orders".to_string(),
                scopes: Vec::new(),
                ttl: Duration::from_secs(60),
            })
            .expect("mint")
    };
    let client = reqwest::Client::new();
    let url = format!("{}/internal/api/user.1/ping", gateway);

    let forbidden = client
        .get(&url)
        .bearer_auth(mint("wrong-audience"))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    assert_eq!(backend.hits(), 0);

    let allowed = client
        .get(&url)
        .bearer_auth(mint("internal-services"))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(backend.hits(), 1);
}

async fn wait_for_log(log_buf: &Arc<Mutex<Vec<u8>>>, request_id: &str, event: &str) -> String {
    for _ in 0..50 {
        let logs = {
            let buf = log_buf.lock().expect("log lock should be available");
            String::from_utf8_lossy(&buf).to_string()
        };
        if logs
            .lines()
            .any(|line| line.contains(request_id) && line.contains(event))
        {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let buf = log_buf.lock().expect("log lock should be available");
    panic!(
        "missing {} for {}; logs:\n{}",
        event,
        request_id,
        String::from_utf8_lossy(&buf)
    );
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

#[derive(Clone)]
struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}

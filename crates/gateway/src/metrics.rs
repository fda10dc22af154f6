use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static GUARDRAIL_REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static UPSTREAM_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static MIRROR_REFRESH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static MIRROR_STALE: OnceLock<IntGauge> = OnceLock::new();
static AUDIT_DROPPED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "nvgate_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["plane", "method", "status"],
            )
            .expect("create nvgate_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "nvgate_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["plane", "method", "outcome"],
            )
            .expect("create nvgate_gateway_http_request_duration_seconds"),
        )
    })
}

fn guardrail_rejections_total() -> &'static IntCounterVec {
    GUARDRAIL_REJECTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "nvgate_gateway_guardrail_rejections_total",
                    "Requests rejected by a guardrail stage.",
                ),
                &["stage", "status"],
            )
            .expect("create nvgate_gateway_guardrail_rejections_total"),
        )
    })
}

fn upstream_errors_total() -> &'static IntCounterVec {
    UPSTREAM_ERRORS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "nvgate_gateway_upstream_errors_total",
                    "Proxied calls that failed before an upstream response.",
                ),
                &["kind"],
            )
            .expect("create nvgate_gateway_upstream_errors_total"),
        )
    })
}

fn mirror_refresh_total() -> &'static IntCounterVec {
    MIRROR_REFRESH_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "nvgate_gateway_mirror_refresh_total",
                    "Discovery mirror refresh outcomes.",
                ),
                &["outcome"],
            )
            .expect("create nvgate_gateway_mirror_refresh_total"),
        )
    })
}

fn mirror_stale() -> &'static IntGauge {
    MIRROR_STALE.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "nvgate_gateway_mirror_stale",
                "1 while routing from the last-known-good snapshot.",
            )
            .expect("create nvgate_gateway_mirror_stale"),
        )
    })
}

fn audit_dropped_total() -> &'static IntCounter {
    AUDIT_DROPPED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "nvgate_gateway_audit_dropped_total",
                "Audit entries dropped because the queue was full.",
            )
            .expect("create nvgate_gateway_audit_dropped_total"),
        )
    })
}

pub fn observe_http_request(plane: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[plane, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[plane, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_guardrail_rejection(stage: &str, status: u16) {
    let status_str = status.to_string();
    guardrail_rejections_total()
        .with_label_values(&[stage, status_str.as_str()])
        .inc();
}

pub fn observe_upstream_error(kind: &str) {
    upstream_errors_total().with_label_values(&[kind]).inc();
}

pub fn observe_mirror_refresh(outcome: &str) {
    mirror_refresh_total().with_label_values(&[outcome]).inc();
}

pub fn set_mirror_stale(stale: bool) {
    mirror_stale().set(i64::from(stale));
}

pub fn inc_audit_dropped() {
    audit_dropped_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = mirror_stale();
    let _ = audit_dropped_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

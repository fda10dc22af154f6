use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nvgate_contracts::BreakerOverrides;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub half_open_after: Duration,
    /// Accepted for forward compatibility; no latency-based failure policy reads it yet.
    pub min_rtt: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_after: Duration::from_secs(10),
            min_rtt: None,
        }
    }
}

impl BreakerConfig {
    pub fn with_overrides(&self, overrides: Option<&BreakerOverrides>) -> Self {
        let Some(overrides) = overrides else {
            return *self;
        };
        Self {
            failure_threshold: overrides
                .failure_threshold
                .filter(|v| *v > 0)
                .unwrap_or(self.failure_threshold),
            half_open_after: overrides
                .half_open_after_ms
                .map(Duration::from_millis)
                .unwrap_or(self.half_open_after),
            min_rtt: overrides.min_rtt_ms.map(Duration::from_millis).or(self.min_rtt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Default)]
struct SegmentState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open: bool,
    probe_in_flight: bool,
}

impl SegmentState {
    fn circuit(&self) -> CircuitState {
        match (self.opened_at, self.half_open) {
            (None, _) => CircuitState::Closed,
            (Some(_), true) => CircuitState::HalfOpen,
            (Some(_), false) => CircuitState::Open,
        }
    }
}

/// Lowercase first path token with any `.<version>` suffix removed; `default` when empty.
pub fn segment_for(path: &str) -> String {
    let Some(first) = path.split('/').find(|s| !s.is_empty()) else {
        return "default".to_string();
    };
    let first = first.to_ascii_lowercase();
    let base = match first.rsplit_once('.') {
        Some((base, version))
            if !base.is_empty()
                && !version.is_empty()
                && version.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base.to_string()
        }
        _ => first,
    };
    if base.is_empty() {
        "default".to_string()
    } else {
        base
    }
}

#[derive(Debug)]
pub enum Admission {
    Closed(BreakerPermit),
    Probe(BreakerPermit),
    Rejected { retry_after: Duration },
    /// The registry could not evaluate the segment; the request goes through unrecorded.
    Untracked,
}

/// Per-segment failure tracking with lazy half-open probing.
#[derive(Clone)]
pub struct BreakerRegistry {
    segments: Arc<Mutex<HashMap<String, Arc<Mutex<SegmentState>>>>>,
    defaults: BreakerConfig,
    max_segments: usize,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig, max_segments: usize) -> Self {
        Self {
            segments: Arc::new(Mutex::new(HashMap::new())),
            defaults,
            max_segments,
        }
    }

    pub fn defaults(&self) -> &BreakerConfig {
        &self.defaults
    }

    pub fn admit(&self, segment: &str, config: &BreakerConfig) -> Admission {
        self.admit_at(segment, config, Instant::now())
    }

    pub fn admit_at(&self, segment: &str, config: &BreakerConfig, now: Instant) -> Admission {
        let Some(entry) = self.entry(segment) else {
            return Admission::Untracked;
        };

        let mut state = match entry.lock() {
            Ok(state) => state,
            Err(_) => {
                tracing::warn!(
                    target: "nvgate::security",
                    segment,
                    "breaker.state_poisoned"
                );
                return Admission::Untracked;
            }
        };

        let Some(opened_at) = state.opened_at else {
            drop(state);
            return Admission::Closed(BreakerPermit::new(segment, entry, *config, false));
        };

        if state.half_open {
            if state.probe_in_flight {
                return Admission::Rejected {
                    retry_after: config.half_open_after,
                };
            }
            state.probe_in_flight = true;
            drop(state);
            return Admission::Probe(BreakerPermit::new(segment, entry, *config, true));
        }

        let elapsed = now.saturating_duration_since(opened_at);
        if elapsed >= config.half_open_after {
            state.half_open = true;
            state.probe_in_flight = true;
            drop(state);
            tracing::info!(target: "nvgate::security", segment, "breaker.half_open");
            return Admission::Probe(BreakerPermit::new(segment, entry, *config, true));
        }

        Admission::Rejected {
            retry_after: config.half_open_after - elapsed,
        }
    }

    pub fn state_of(&self, segment: &str) -> Option<CircuitState> {
        let segments = self.segments.lock().ok()?;
        let entry = segments.get(segment)?;
        let state = entry.lock().ok()?;
        Some(state.circuit())
    }

    pub fn consecutive_failures(&self, segment: &str) -> Option<u32> {
        let segments = self.segments.lock().ok()?;
        let entry = segments.get(segment)?;
        let state = entry.lock().ok()?;
        Some(state.consecutive_failures)
    }

    fn entry(&self, segment: &str) -> Option<Arc<Mutex<SegmentState>>> {
        let mut segments = match self.segments.lock() {
            Ok(segments) => segments,
            Err(_) => {
                tracing::warn!(target: "nvgate::security", segment, "breaker.registry_poisoned");
                return None;
            }
        };

        if let Some(entry) = segments.get(segment) {
            return Some(entry.clone());
        }

        if segments.len() >= self.max_segments {
            tracing::warn!(
                target: "nvgate::security",
                segment,
                max_segments = self.max_segments,
                "breaker.segment_overflow"
            );
            return None;
        }

        let entry = Arc::new(Mutex::new(SegmentState::default()));
        segments.insert(segment.to_string(), entry.clone());
        Some(entry)
    }
}

/// Outcome slot for one admitted request. Dropping an unsettled probe frees the probe slot.
#[derive(Debug)]
pub struct BreakerPermit {
    segment: String,
    state: Arc<Mutex<SegmentState>>,
    config: BreakerConfig,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    fn new(
        segment: &str,
        state: Arc<Mutex<SegmentState>>,
        config: BreakerConfig,
        probe: bool,
    ) -> Self {
        Self {
            segment: segment.to_string(),
            state,
            config,
            probe,
            settled: false,
        }
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// 5xx counts as a failure; everything else is a success.
    pub fn record_status(self, status: u16) {
        self.record_status_at(status, Instant::now());
    }

    pub fn record_status_at(self, status: u16, now: Instant) {
        if status >= 500 {
            self.record_failure_at(now);
        } else {
            self.record_success();
        }
    }

    pub fn record_failure(self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_success(mut self) {
        self.settled = true;
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if self.probe {
            *state = SegmentState::default();
            drop(state);
            tracing::info!(target: "nvgate::security", segment = %self.segment, "breaker.closed");
            return;
        }

        if state.opened_at.is_none() {
            state.consecutive_failures = 0;
        }
    }

    pub fn record_failure_at(mut self, now: Instant) {
        self.settled = true;
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if self.probe {
            state.opened_at = Some(now);
            state.half_open = false;
            state.probe_in_flight = false;
            drop(state);
            tracing::warn!(target: "nvgate::security", segment = %self.segment, "breaker.reopened");
            return;
        }

        if state.opened_at.is_some() {
            return;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.config.failure_threshold {
            state.opened_at = Some(now);
            state.half_open = false;
            let failures = state.consecutive_failures;
            drop(state);
            tracing::warn!(
                target: "nvgate::security",
                segment = %self.segment,
                consecutive_failures = failures,
                threshold = self.config.failure_threshold,
                "breaker.opened"
            );
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.probe || self.settled {
            return;
        }
        if let Ok(mut state) = self.state.lock()
            && state.half_open
        {
            state.probe_in_flight = false;
        }
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Sliding-window limiter keyed by `<slug>:<client>`.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Windows>>,
    window: Duration,
    max_keys: usize,
    default_limit: u32,
    route_limits: Arc<HashMap<String, u32>>,
}

struct Windows {
    events: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl RateLimiter {
    pub fn new(
        window: Duration,
        max_keys: usize,
        default_limit: u32,
        route_limits: HashMap<String, u32>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Windows {
                events: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            window,
            max_keys,
            default_limit,
            route_limits: Arc::new(route_limits),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit_for(&self, slug: &str) -> u32 {
        self.route_limits
            .get(slug)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn allow_route(&self, slug: &str, client: &str) -> bool {
        let key = format!("{}:{}", slug, client);
        self.allow(&key, self.limit_for(slug))
    }

    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let queue = inner.events.entry(key.to_string()).or_default();
        prune_queue(queue, now, self.window);
        if queue.len() >= limit as usize {
            return false;
        }
        queue.push_back(now);

        // Idle keys are only reclaimed by a full sweep, at most once per window.
        if now.duration_since(inner.last_sweep) >= self.window
            || inner.events.len() > self.max_keys
        {
            inner.sweep(key, now, self.window, self.max_keys);
        }

        true
    }

    /// Keys currently holding events; idle keys linger until the next sweep.
    pub fn tracked_keys(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.events.len(),
            Err(poisoned) => poisoned.into_inner().events.len(),
        }
    }
}

impl Windows {
    fn sweep(&mut self, current: &str, now: Instant, window: Duration, max_keys: usize) {
        self.events.retain(|_, events| {
            prune_queue(events, now, window);
            !events.is_empty()
        });
        self.last_sweep = now;

        if self.events.len() > max_keys {
            let overflow = self.events.len() - max_keys;
            let evicted = self
                .events
                .keys()
                .filter(|k| k.as_str() != current)
                .take(overflow)
                .cloned()
                .collect::<Vec<_>>();
            for key in evicted {
                self.events.remove(&key);
            }
        }
    }
}

fn prune_queue(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

/// Global bound on requests in flight through the proxy.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Never waits; `None` means saturated.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }
}

/// Outbound budget: route override, then descriptor override, then the default.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    default: Duration,
    route_overrides: HashMap<String, Duration>,
}

impl TimeoutPolicy {
    pub fn new(default: Duration, route_overrides: HashMap<String, u64>) -> Self {
        Self {
            default,
            route_overrides: route_overrides
                .into_iter()
                .map(|(slug, ms)| (slug, Duration::from_millis(ms)))
                .collect(),
        }
    }

    pub fn budget_for(&self, slug: &str, descriptor_timeout_ms: Option<u64>) -> Duration {
        if let Some(budget) = self.route_overrides.get(slug) {
            return *budget;
        }
        descriptor_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default)
    }
}

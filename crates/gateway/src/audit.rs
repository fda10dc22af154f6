use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditPhase {
    Begin,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTarget {
    pub slug: String,
    pub version: u32,
    pub route: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub phase: AuditPhase,
    pub service: String,
    pub request_id: String,
    pub target: AuditTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Bounded, non-blocking audit queue drained by a background task.
///
/// `record` never waits; when the queue is full the oldest entry is evicted.
#[derive(Clone)]
pub struct AuditSink {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl AuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let evicted = {
            let mut queue = match self.inner.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            let evicted = if queue.len() >= self.inner.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(entry);
            evicted
        };

        if let Some(evicted) = evicted {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            crate::metrics::inc_audit_dropped();
            tracing::debug!(
                request_id = %evicted.request_id,
                "audit.entry_dropped"
            );
        }

        self.inner.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        match self.inner.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Spawns the drain task; it runs until the runtime shuts down.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            loop {
                let batch = sink.take_all();
                if batch.is_empty() {
                    sink.inner.notify.notified().await;
                    continue;
                }
                for entry in batch {
                    emit(&entry);
                }
            }
        })
    }

    fn take_all(&self) -> Vec<AuditEntry> {
        let mut queue = match self.inner.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }
}

fn emit(entry: &AuditEntry) {
    let payload = match serde_json::to_string(entry) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "audit.encode_failed");
            return;
        }
    };

    match entry.phase {
        AuditPhase::Begin => tracing::info!(
            target: "nvgate::audit",
            request_id = %entry.request_id,
            entry = %payload,
            "audit.begin"
        ),
        AuditPhase::End => tracing::info!(
            target: "nvgate::audit",
            request_id = %entry.request_id,
            status = entry.status.unwrap_or_default(),
            entry = %payload,
            "audit.end"
        ),
    }
}

//! Per-event counters and the trace index

use crate::context::SignalContext;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
struct EventCounters {
    emit_count: AtomicU64,
    handler_count: AtomicI64,
    processing_time_ms: AtomicU64,
    error_count: AtomicU64,
    processed_count: AtomicU64,
    /// Unix millis, 0 when never emitted
    last_emit_ms: AtomicI64,
    last_process_ms: AtomicI64,
}

/// Point-in-time metrics of one event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub emit_count: u64,
    /// Live handlers (adds minus removes)
    pub handler_count: i64,
    pub total_processing_time_ms: u64,
    pub error_count: u64,
    pub processed_count: u64,
    pub last_emit_time: Option<DateTime<Utc>>,
    pub last_process_time: Option<DateTime<Utc>>,
}

/// Metrics registry shared by every component of an engine
pub struct SignalMetrics {
    counters: DashMap<String, EventCounters>,
    processed_total: AtomicU64,
    traces: DashMap<String, Arc<SignalContext>>,
    trace_order: Mutex<VecDeque<String>>,
    trace_capacity: usize,
}

impl SignalMetrics {
    pub fn new(trace_capacity: usize) -> Self {
        Self {
            counters: DashMap::new(),
            processed_total: AtomicU64::new(0),
            traces: DashMap::new(),
            trace_order: Mutex::new(VecDeque::with_capacity(trace_capacity)),
            trace_capacity,
        }
    }

    pub fn record_emit(&self, event: &str) {
        self.with_counters(event, |c| {
            c.emit_count.fetch_add(1, Ordering::Relaxed);
            c.last_emit_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        });
    }

    pub fn record_handler_added(&self, event: &str) {
        self.with_counters(event, |c| {
            c.handler_count.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_handler_removed(&self, event: &str) {
        self.with_counters(event, |c| {
            c.handler_count.fetch_sub(1, Ordering::Relaxed);
        });
    }

    pub fn record_processing_time(&self, event: &str, millis: u64) {
        self.with_counters(event, |c| {
            c.processing_time_ms.fetch_add(millis, Ordering::Relaxed);
        });
    }

    pub fn record_error(&self, event: &str) {
        self.with_counters(event, |c| {
            c.error_count.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Count one handler invocation that completed successfully
    pub fn record_processed(&self, event: &str) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        self.with_counters(event, |c| {
            c.processed_count.fetch_add(1, Ordering::Relaxed);
            c.last_process_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        });
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    /// Snapshot for one event; zeroed when the event was never seen
    pub fn get(&self, event: &str) -> MetricsSnapshot {
        self.counters
            .get(event)
            .map(|c| snapshot(c.value()))
            .unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, MetricsSnapshot> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), snapshot(entry.value())))
            .collect()
    }

    /// Index a traced emission context by its trace id
    pub fn record_trace(&self, context: &Arc<SignalContext>) {
        let Some(trace_id) = context.trace_id() else {
            return;
        };
        if self.trace_capacity == 0 {
            return;
        }

        let mut order = self.trace_order.lock();
        if self.traces.insert(trace_id.clone(), context.clone()).is_none() {
            order.push_back(trace_id);
        }
        while order.len() > self.trace_capacity {
            if let Some(oldest) = order.pop_front() {
                self.traces.remove(&oldest);
            }
        }
    }

    pub fn trace(&self, trace_id: &str) -> Option<Arc<SignalContext>> {
        self.traces.get(trace_id).map(|t| t.value().clone())
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    /// Drop all counters of an event
    pub fn clear_event(&self, event: &str) {
        self.counters.remove(event);
    }

    /// Drop every counter and trace
    pub fn clear_all(&self) {
        self.counters.clear();
        self.traces.clear();
        self.trace_order.lock().clear();
        self.processed_total.store(0, Ordering::Relaxed);
    }

    /// Log a summary line per event
    pub fn flush(&self) {
        for (event, m) in self.all() {
            info!(
                event = %event,
                emits = m.emit_count,
                handlers = m.handler_count,
                errors = m.error_count,
                processed = m.processed_count,
                processing_ms = m.total_processing_time_ms,
                "Signal metrics"
            );
        }
    }

    fn with_counters<F>(&self, event: &str, f: F)
    where
        F: FnOnce(&EventCounters),
    {
        if let Some(counters) = self.counters.get(event) {
            f(counters.value());
            return;
        }
        f(self.counters.entry(event.to_string()).or_default().value());
    }
}

impl Default for SignalMetrics {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn snapshot(c: &EventCounters) -> MetricsSnapshot {
    MetricsSnapshot {
        emit_count: c.emit_count.load(Ordering::Relaxed),
        handler_count: c.handler_count.load(Ordering::Relaxed),
        total_processing_time_ms: c.processing_time_ms.load(Ordering::Relaxed),
        error_count: c.error_count.load(Ordering::Relaxed),
        processed_count: c.processed_count.load(Ordering::Relaxed),
        last_emit_time: millis_to_time(c.last_emit_ms.load(Ordering::Relaxed)),
        last_process_time: millis_to_time(c.last_process_ms.load(Ordering::Relaxed)),
    }
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

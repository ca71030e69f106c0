//! Per-emission context: business attributes, framework scratch values and
//! the span tree recorded while the emission travels through the engine.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use uuid::Uuid;

/// One timed step of an emission (pipeline stage or handler invocation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Span {
    fn new(operation: impl Into<String>, parent_span_id: Option<String>) -> Self {
        Self {
            span_id: Uuid::new_v4().to_string(),
            parent_span_id,
            operation: operation.into(),
            start_time: Utc::now(),
            end_time: None,
            metadata: HashMap::new(),
        }
    }

    /// Elapsed milliseconds, once the span has ended
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| (end - self.start_time).num_milliseconds())
    }
}

#[derive(Debug, Default, Clone)]
struct TraceIds {
    trace_id: Option<String>,
    event_id: Option<String>,
    parent_span_id: Option<String>,
}

/// Mutable state carried by exactly one emission.
///
/// Shared as `Arc<SignalContext>` between the pipeline, the processor and
/// handlers; all mutation goes through interior locks.
#[derive(Debug, Default)]
pub struct SignalContext {
    attributes: RwLock<HashMap<String, Value>>,
    intermediate_values: RwLock<HashMap<String, Value>>,
    spans: Mutex<Vec<Span>>,
    ids: RwLock<TraceIds>,
}

impl SignalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context pre-seeded with business attributes
    pub fn with_attributes(attributes: HashMap<String, Value>) -> Self {
        Self {
            attributes: RwLock::new(attributes),
            ..Self::default()
        }
    }

    // ------------------------------------------------------------------
    // Attributes (caller visible)
    // ------------------------------------------------------------------

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.write().insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }

    pub fn attributes(&self) -> HashMap<String, Value> {
        self.attributes.read().clone()
    }

    /// Replace every attribute with `attributes`
    pub fn set_attributes(&self, attributes: HashMap<String, Value>) {
        *self.attributes.write() = attributes;
    }

    // ------------------------------------------------------------------
    // Intermediate values (framework scratch space)
    // ------------------------------------------------------------------

    pub fn set_intermediate_value(&self, key: impl Into<String>, value: Value) {
        self.intermediate_values.write().insert(key.into(), value);
    }

    pub fn intermediate_value(&self, key: &str) -> Option<Value> {
        self.intermediate_values.read().get(key).cloned()
    }

    pub fn intermediate_values(&self) -> HashMap<String, Value> {
        self.intermediate_values.read().clone()
    }

    // ------------------------------------------------------------------
    // Tracing
    // ------------------------------------------------------------------

    /// Assign a fresh trace id and an event id of the form `{event}_{id}`
    /// Start a new trace; a parent span left by an earlier trace is dropped
    pub fn init_trace(&self, event: &str, id: u64) {
        let mut ids = self.ids.write();
        ids.trace_id = Some(Uuid::new_v4().to_string());
        ids.event_id = Some(format!("{event}_{id}"));
        ids.parent_span_id = None;
    }

    pub fn trace_id(&self) -> Option<String> {
        self.ids.read().trace_id.clone()
    }

    pub fn event_id(&self) -> Option<String> {
        self.ids.read().event_id.clone()
    }

    pub fn parent_span_id(&self) -> Option<String> {
        self.ids.read().parent_span_id.clone()
    }

    /// Parent for the next span recorded on this context
    pub fn set_parent_span_id(&self, parent: impl Into<String>) {
        self.ids.write().parent_span_id = Some(parent.into());
    }

    /// Parent for the first span recorded by the engine
    pub fn root_parent(&self) -> Option<String> {
        let ids = self.ids.read();
        ids.parent_span_id.clone().or_else(|| ids.event_id.clone())
    }

    /// Open a span and return its id
    pub fn start_span(&self, operation: impl Into<String>, parent_span_id: Option<String>) -> String {
        let span = Span::new(operation, parent_span_id);
        let id = span.span_id.clone();
        self.spans.lock().push(span);
        id
    }

    /// Close a span; unknown ids are ignored
    pub fn end_span(&self, span_id: &str) {
        if let Some(span) = self.spans.lock().iter_mut().rev().find(|s| s.span_id == span_id) {
            span.end_time = Some(Utc::now());
        }
    }

    pub fn add_span_metadata(&self, span_id: &str, key: impl Into<String>, value: Value) {
        if let Some(span) = self.spans.lock().iter_mut().rev().find(|s| s.span_id == span_id) {
            span.metadata.insert(key.into(), value);
        }
    }

    /// Spans in the order they were opened
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    /// Render the span tree, one span per line, children indented under parents
    pub fn render_trace_tree(&self) -> String {
        let spans = self.spans();
        let ids = self.ids.read().clone();
        let mut out = String::new();

        let _ = writeln!(
            out,
            "trace {} (event {})",
            ids.trace_id.as_deref().unwrap_or("-"),
            ids.event_id.as_deref().unwrap_or("-")
        );

        let is_root = |span: &Span| match &span.parent_span_id {
            None => true,
            Some(parent) => !spans.iter().any(|s| &s.span_id == parent),
        };

        for root in spans.iter().filter(|s| is_root(s)) {
            render_span(&spans, root, 1, &mut out);
        }
        out
    }

    /// Serializable copy for dead-letter and persistence records
    pub fn snapshot(&self) -> ContextSnapshot {
        let ids = self.ids.read().clone();
        ContextSnapshot {
            trace_id: ids.trace_id,
            event_id: ids.event_id,
            attributes: self.attributes(),
            intermediate_values: self.intermediate_values(),
            spans: self.spans(),
        }
    }

    /// Fresh context carrying the business attributes of `snapshot`.
    ///
    /// Used when an emission is replayed: a replay is a new emission, so no
    /// spans or trace ids are carried over.
    pub fn from_snapshot(snapshot: &ContextSnapshot) -> Self {
        Self::with_attributes(snapshot.attributes.clone())
    }
}

fn render_span(spans: &[Span], span: &Span, depth: usize, out: &mut String) {
    let duration = span
        .duration_ms()
        .map(|ms| format!("{ms}ms"))
        .unwrap_or_else(|| "open".to_string());
    let _ = writeln!(out, "{}{} [{}]", "  ".repeat(depth), span.operation, duration);

    for child in spans
        .iter()
        .filter(|s| s.parent_span_id.as_deref() == Some(span.span_id.as_str()))
    {
        render_span(spans, child, depth + 1, out);
    }
}

/// Point-in-time copy of a [`SignalContext`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub trace_id: Option<String>,
    pub event_id: Option<String>,
    pub attributes: HashMap<String, Value>,
    pub intermediate_values: HashMap<String, Value>,
    pub spans: Vec<Span>,
}

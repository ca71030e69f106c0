//! Emission pipeline: interceptors, then filters, then transformers.
//! Every stage invocation is recorded as a span on the emission context.

use crate::context::SignalContext;
use crate::error::ProcessingError;
use crate::handler::{Params, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Sees every emission of an event before filters run, and every handler
/// outcome after it completes
pub trait SignalInterceptor: Send + Sync {
    /// Returning false vetoes the emission
    fn before_handle(&self, _event: &str, _sender: &Sender, _params: &Params) -> bool {
        true
    }

    fn after_handle(&self, _event: &str, _sender: &Sender, _params: &Params, _error: Option<&ProcessingError>) {}

    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

pub trait SignalFilter: Send + Sync {
    /// Returning false halts the emission
    fn filter(&self, event: &str, sender: &Sender, params: &Params) -> bool;

    /// Lower runs first
    fn priority(&self) -> i32 {
        0
    }

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

pub trait SignalTransformer: Send + Sync {
    fn transform(&self, event: &str, sender: &Sender, params: Params) -> Params;

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

struct FnFilter<F> {
    name: String,
    priority: i32,
    f: F,
}

impl<F> SignalFilter for FnFilter<F>
where
    F: Fn(&str, &Sender, &Params) -> bool + Send + Sync,
{
    fn filter(&self, event: &str, sender: &Sender, params: &Params) -> bool {
        (self.f)(event, sender, params)
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Named filter from a closure
pub fn filter_fn<F>(name: impl Into<String>, priority: i32, f: F) -> Arc<dyn SignalFilter>
where
    F: Fn(&str, &Sender, &Params) -> bool + Send + Sync + 'static,
{
    Arc::new(FnFilter {
        name: name.into(),
        priority,
        f,
    })
}

struct FnTransformer<F> {
    name: String,
    f: F,
}

impl<F> SignalTransformer for FnTransformer<F>
where
    F: Fn(&str, &Sender, Params) -> Params + Send + Sync,
{
    fn transform(&self, event: &str, sender: &Sender, params: Params) -> Params {
        (self.f)(event, sender, params)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Named transformer from a closure
pub fn transformer_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn SignalTransformer>
where
    F: Fn(&str, &Sender, Params) -> Params + Send + Sync + 'static,
{
    Arc::new(FnTransformer { name: name.into(), f })
}

/// Per-event stage lists
#[derive(Default)]
pub struct SignalPipeline {
    interceptors: DashMap<String, Vec<Arc<dyn SignalInterceptor>>>,
    filters: DashMap<String, Vec<Arc<dyn SignalFilter>>>,
    transformers: DashMap<String, Vec<Arc<dyn SignalTransformer>>>,
}

impl SignalPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the emission through every stage.
    ///
    /// Returns the (possibly transformed) params, or `None` when an
    /// interceptor or filter blocked the emission.
    pub fn process(&self, event: &str, sender: &Sender, context: &SignalContext, params: Params) -> Option<Params> {
        let mut parent = context.root_parent();

        for interceptor in self.interceptors(event) {
            let name = interceptor.name();
            let allowed = stage_span(context, &mut parent, format!("Interceptor: {name}"), || {
                interceptor.before_handle(event, sender, &params)
            });
            if !allowed {
                debug!(event = %event, interceptor = %name, "Signal blocked by interceptor");
                return None;
            }
        }

        for filter in self.filters(event) {
            let name = filter.name();
            let pass = stage_span(context, &mut parent, format!("Filter: {name}"), || {
                filter.filter(event, sender, &params)
            });
            if !pass {
                debug!(event = %event, filter = %name, "Signal filtered out");
                return None;
            }
        }

        let mut params = params;
        for transformer in self.transformers(event) {
            let name = transformer.name();
            params = stage_span(context, &mut parent, format!("Transformer: {name}"), || {
                transformer.transform(event, sender, params)
            });
        }

        Some(params)
    }

    pub fn add_interceptor(&self, event: &str, interceptor: Arc<dyn SignalInterceptor>) {
        info!(event = %event, interceptor = %interceptor.name(), "Interceptor added");
        self.interceptors.entry(event.to_string()).or_default().push(interceptor);
    }

    pub fn add_filter(&self, event: &str, filter: Arc<dyn SignalFilter>) {
        self.filters.entry(event.to_string()).or_default().push(filter);
    }

    pub fn add_transformer(&self, event: &str, transformer: Arc<dyn SignalTransformer>) {
        self.transformers.entry(event.to_string()).or_default().push(transformer);
    }

    /// Interceptors in registration order
    pub fn interceptors(&self, event: &str) -> Vec<Arc<dyn SignalInterceptor>> {
        self.interceptors
            .get(event)
            .map(|list| list.value().clone())
            .unwrap_or_default()
    }

    /// Filters sorted by ascending priority; ties keep registration order
    pub fn filters(&self, event: &str) -> Vec<Arc<dyn SignalFilter>> {
        let mut filters = self
            .filters
            .get(event)
            .map(|list| list.value().clone())
            .unwrap_or_default();
        filters.sort_by_key(|f| f.priority());
        filters
    }

    pub fn transformers(&self, event: &str) -> Vec<Arc<dyn SignalTransformer>> {
        self.transformers
            .get(event)
            .map(|list| list.value().clone())
            .unwrap_or_default()
    }

    /// Drop every stage registered for the event
    pub fn clear(&self, event: &str) {
        self.interceptors.remove(event);
        self.filters.remove(event);
        self.transformers.remove(event);
    }

    pub fn clear_all(&self) {
        self.interceptors.clear();
        self.filters.clear();
        self.transformers.clear();
    }
}

/// Run one stage inside a span chained to the previous one
fn stage_span<T>(context: &SignalContext, parent: &mut Option<String>, operation: String, stage: impl FnOnce() -> T) -> T {
    let span_id = context.start_span(operation, parent.take());
    context.set_parent_span_id(span_id.clone());
    let out = stage();
    context.end_span(&span_id);
    *parent = Some(span_id);
    out
}

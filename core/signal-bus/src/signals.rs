//! Engine facade: wires registry, pipeline, protection, metrics and the
//! escalation paths into one cloneable handle
//!
//! ```no_run
//! use signal_bus::{handler_fn, Signals};
//! use serde_json::json;
//!
//! # async fn run() -> signal_bus::Result<()> {
//! let signals = Signals::builder().build()?;
//! signals
//!     .connect("order.created", handler_fn(|emission| async move {
//!         println!("order {:?}", emission.param(0));
//!         Ok(())
//!     }))
//!     .await;
//!
//! signals.emit("order.created", "checkout", vec![json!("A")]).await?;
//! signals.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{EngineConfig, SignalConfig};
use crate::context::SignalContext;
use crate::dead_letter::{DeadLetterQueue, RetryReport};
use crate::emitter::{Dispatch, DispatchPool, ErrorHandler, SignalCallback, SignalEmitter};
use crate::error::{BlockReason, ProcessingError, Result, SignalError};
use crate::handler::{Emission, HandlerId, Params, Sender, SignalHandler};
use crate::id_gen::IdGenerator;
use crate::metrics::SignalMetrics;
use crate::persistence::PersistenceSink;
use crate::pipeline::{SignalFilter, SignalInterceptor, SignalPipeline, SignalTransformer};
use crate::processor::SignalProcessor;
use crate::protection::{Admission, CircuitBreaker, RateLimiter, SignalProtectionManager};
use crate::recovery::{EventRecoveryManager, Replayer};
use crate::registry::SignalRegistry;
use crate::transaction::{EventTransactionManager, TransactionBoundary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Per-emission hooks
#[derive(Clone, Default)]
pub struct EmitOptions {
    pub error_handler: Option<ErrorHandler>,
    pub callback: Option<Arc<dyn SignalCallback>>,
    /// Context to trace the emission into; synthesized when absent
    pub context: Option<Arc<SignalContext>>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignalError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(f));
        self
    }

    pub fn callback(mut self, callback: Arc<dyn SignalCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn context(mut self, context: Arc<SignalContext>) -> Self {
        self.context = Some(context);
        self
    }
}

/// What happened to an emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Handed to this many handlers
    Dispatched { handlers: usize },
    Blocked(BlockReason),
    NoHandlers,
}

pub struct SignalsBuilder {
    config: EngineConfig,
    persistence: Option<Arc<dyn PersistenceSink>>,
    transactions: Option<Arc<dyn TransactionBoundary>>,
}

impl SignalsBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sink receiving events whose config is `persistent`
    pub fn persistence(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = Some(sink);
        self
    }

    pub fn transaction_boundary(mut self, boundary: Arc<dyn TransactionBoundary>) -> Self {
        self.transactions = Some(boundary);
        self
    }

    pub fn build(self) -> Result<Signals> {
        let config = self.config;
        let id_gen = Arc::new(IdGenerator::new(config.datacenter_id, config.machine_id)?);
        let metrics = Arc::new(SignalMetrics::new(config.metrics.trace_capacity));
        let registry = Arc::new(SignalRegistry::new(metrics.clone(), id_gen.clone()));
        let pipeline = Arc::new(SignalPipeline::new());
        let protection = Arc::new(SignalProtectionManager::new());
        let dead_letters = Arc::new(DeadLetterQueue::new(&config.dead_letter, registry.clone())?);
        let recovery = Arc::new(EventRecoveryManager::new());

        let emitter = SignalEmitter {
            processor: SignalProcessor::new(),
            metrics: metrics.clone(),
            protection: protection.clone(),
            pipeline: pipeline.clone(),
            dead_letters: dead_letters.clone(),
            recovery: recovery.clone(),
            recovery_enabled: config.recovery.enabled,
            persistence: self.persistence,
            pool: Arc::new(DispatchPool::new(config.pool.max_concurrency)),
        };
        let transactions = self
            .transactions
            .map(|boundary| EventTransactionManager::new(boundary, dead_letters.clone()));

        info!(
            max_concurrency = config.pool.max_concurrency,
            protection = config.protection.enabled,
            dead_letter_capacity = config.dead_letter.capacity,
            "Signal engine started"
        );

        Ok(Signals {
            inner: Arc::new(Inner {
                config,
                id_gen,
                registry,
                pipeline,
                protection,
                metrics,
                dead_letters,
                recovery,
                transactions,
                emitter,
                maintenance: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

struct Inner {
    config: EngineConfig,
    id_gen: Arc<IdGenerator>,
    registry: Arc<SignalRegistry>,
    pipeline: Arc<SignalPipeline>,
    protection: Arc<SignalProtectionManager>,
    metrics: Arc<SignalMetrics>,
    dead_letters: Arc<DeadLetterQueue>,
    recovery: Arc<EventRecoveryManager>,
    transactions: Option<EventTransactionManager>,
    emitter: SignalEmitter,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

#[async_trait]
impl Replayer for Inner {
    async fn replay(
        &self,
        event: &str,
        context: Arc<SignalContext>,
        params: Params,
    ) -> std::result::Result<(), ProcessingError> {
        context.init_trace(event, self.id_gen.next_id());
        let dispatch = Dispatch {
            event: event.to_string(),
            sender: Sender::system(),
            params,
            context,
            config: self.registry.get_config(event),
            handlers: self.registry.get_handlers(event),
            error_handler: None,
            callback: None,
        };
        self.emitter.replay(dispatch).await
    }
}

/// Handle to one dispatch engine; clones share the engine
#[derive(Clone)]
pub struct Signals {
    inner: Arc<Inner>,
}

impl Signals {
    pub fn builder() -> SignalsBuilder {
        SignalsBuilder {
            config: EngineConfig::default(),
            persistence: None,
            transactions: None,
        }
    }

    /// Engine with the given settings and no external collaborators
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register with the default config
    pub async fn connect(&self, event: &str, handler: Arc<dyn SignalHandler>) -> HandlerId {
        self.connect_with(event, handler, SignalConfig::default()).await
    }

    /// Register; `config` becomes the event's config if it has none yet.
    ///
    /// A registration beyond `max_handlers` is dropped with a warning.
    pub async fn connect_with(&self, event: &str, handler: Arc<dyn SignalHandler>, config: SignalConfig) -> HandlerId {
        self.prepare_event(event);
        self.inner.registry.register_handler(event, handler, config).await
    }

    pub async fn connect_named(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
        name: impl Into<String>,
    ) -> HandlerId {
        self.prepare_event(event);
        self.inner.registry.register_named(event, handler, config, name).await
    }

    /// Register with a context whose attributes every emission inherits
    pub async fn connect_with_context(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
        context: Arc<SignalContext>,
    ) -> HandlerId {
        self.prepare_event(event);
        self.inner
            .registry
            .register_with_context(event, handler, config, context)
            .await
    }

    /// Like [`connect_with`](Self::connect_with) but reports a capacity drop
    pub async fn try_connect(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
    ) -> Result<HandlerId> {
        self.prepare_event(event);
        self.inner.registry.try_register_handler(event, handler, config).await
    }

    /// Remove a handler; unknown ids are ignored
    pub async fn disconnect(&self, event: &str, id: HandlerId) {
        self.inner.registry.unregister_handler(event, id).await;
    }

    fn prepare_event(&self, event: &str) {
        self.inner
            .protection
            .auto_configure(event, &self.inner.config.protection);
    }

    /// Replace the dispatch policy of an event
    pub fn set_config(&self, event: &str, config: SignalConfig) {
        self.inner.registry.set_config(event, config);
    }

    pub fn config(&self, event: &str) -> SignalConfig {
        self.inner.registry.get_config(event)
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    pub async fn emit(&self, event: &str, sender: impl Into<Sender>, params: Params) -> Result<EmitOutcome> {
        self.emit_with(event, sender, params, EmitOptions::default()).await
    }

    /// Emit an event.
    ///
    /// Handler failures never surface here; they reach the options' error
    /// handler and callback and are dead-lettered. Sync events return once
    /// every handler finished, async events once every handler is spawned.
    pub async fn emit_with(
        &self,
        event: &str,
        sender: impl Into<Sender>,
        params: Params,
        options: EmitOptions,
    ) -> Result<EmitOutcome> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(SignalError::ShutDown);
        }
        let sender = sender.into();

        if let Admission::Blocked(reason) = inner.protection.try_acquire(event) {
            debug!(event = %event, reason = %reason, "Signal blocked by protection");
            reject(&options, event, &sender, &params, reason);
            return Ok(EmitOutcome::Blocked(reason));
        }

        let context = options.context.clone().unwrap_or_default();
        context.init_trace(event, inner.id_gen.next_id());

        let Some(params) = inner.pipeline.process(event, &sender, &context, params.clone()) else {
            debug!(event = %event, "Signal blocked by pipeline");
            reject(&options, event, &sender, &params, BlockReason::Pipeline);
            return Ok(EmitOutcome::Blocked(BlockReason::Pipeline));
        };

        inner.registry.ensure_config(event, &SignalConfig::default());
        let config = inner.registry.get_config(event);
        if config.record_metrics() {
            inner.metrics.record_emit(event);
        }
        inner.metrics.record_trace(&context);

        let handlers = inner.registry.get_handlers(event);
        if handlers.is_empty() {
            debug!(event = %event, "No handlers for signal");
            if let Some(callback) = &options.callback {
                callback.on_error(event, &sender, &SignalError::NoHandlers(event.to_string()), &params);
                callback.on_complete(event, &sender, &params);
            }
            return Ok(EmitOutcome::NoHandlers);
        }

        let count = handlers.len();
        inner
            .emitter
            .dispatch(Dispatch {
                event: event.to_string(),
                sender,
                params,
                context,
                config,
                handlers,
                error_handler: options.error_handler,
                callback: options.callback,
            })
            .await?;

        Ok(EmitOutcome::Dispatched { handlers: count })
    }

    /// Run one registered handler inside a transaction of the installed
    /// boundary, retrying in fresh transactions
    pub async fn emit_in_transaction(
        &self,
        event: &str,
        handler_id: HandlerId,
        sender: impl Into<Sender>,
        params: Params,
    ) -> Result<()> {
        let inner = &self.inner;
        let transactions = inner
            .transactions
            .as_ref()
            .ok_or_else(|| SignalError::NotFound("transaction boundary".to_string()))?;
        let handler = inner
            .registry
            .find_handler(event, handler_id)
            .ok_or_else(|| SignalError::NotFound(format!("handler {handler_id} on `{event}`")))?;

        let context = Arc::new(SignalContext::new());
        context.init_trace(event, inner.id_gen.next_id());
        let emission = Emission {
            event: event.to_string(),
            sender: sender.into(),
            params,
            context,
            handler_id,
            handler_name: handler.handler_name.clone(),
        };
        transactions
            .execute_in_transaction(&handler, emission, &inner.registry.get_config(event))
            .await
    }

    // ------------------------------------------------------------------
    // Pipeline and protection
    // ------------------------------------------------------------------

    pub fn add_interceptor(&self, event: &str, interceptor: Arc<dyn SignalInterceptor>) {
        self.inner.pipeline.add_interceptor(event, interceptor);
    }

    pub fn add_filter(&self, event: &str, filter: Arc<dyn SignalFilter>) {
        self.inner.pipeline.add_filter(event, filter);
    }

    pub fn add_transformer(&self, event: &str, transformer: Arc<dyn SignalTransformer>) {
        self.inner.pipeline.add_transformer(event, transformer);
    }

    pub fn configure_protection(&self, event: &str, breaker: CircuitBreaker, limiter: RateLimiter) {
        self.inner.protection.register_circuit_breaker(event, breaker);
        self.inner.protection.register_rate_limiter(event, limiter);
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn registry(&self) -> &SignalRegistry {
        &self.inner.registry
    }

    pub fn pipeline(&self) -> &SignalPipeline {
        &self.inner.pipeline
    }

    pub fn protection(&self) -> &SignalProtectionManager {
        &self.inner.protection
    }

    pub fn metrics(&self) -> &SignalMetrics {
        &self.inner.metrics
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.inner.dead_letters
    }

    pub fn recovery(&self) -> &EventRecoveryManager {
        &self.inner.recovery
    }

    /// `None` unless a transaction boundary was installed
    pub fn transactions(&self) -> Option<&EventTransactionManager> {
        self.inner.transactions.as_ref()
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.inner.registry.registered_events()
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Re-invoke the handler of one dead letter
    pub async fn retry_dead_letter(&self, id: &str) -> bool {
        self.inner.dead_letters.retry(id).await
    }

    pub async fn retry_dead_letters<F>(&self, filter: F) -> RetryReport
    where
        F: Fn(&crate::dead_letter::DeadLetterRecord) -> bool,
    {
        self.inner.dead_letters.batch_retry(filter).await
    }

    pub async fn replay_event(&self, event_id: &str) {
        self.inner.recovery.replay_event(event_id, self.inner.as_ref()).await;
    }

    pub async fn replay_failed(&self) -> usize {
        self.inner.recovery.replay_all_failed(self.inner.as_ref()).await
    }

    pub async fn replay_in_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        self.inner
            .recovery
            .replay_in_time_range(start, end, self.inner.as_ref())
            .await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Forget handlers, config, stages, protection and metrics of the events
    pub fn clear(&self, events: &[&str]) {
        let inner = &self.inner;
        inner.registry.clear(events);
        for event in events {
            inner.pipeline.clear(event);
            inner.protection.remove_protection(event);
            inner.metrics.clear_event(event);
        }
    }

    /// Forget every event, including metrics and recovery records.
    ///
    /// Dead letters are kept until processed or expired.
    pub fn clear_all(&self) {
        let inner = &self.inner;
        inner.registry.clear_all();
        inner.pipeline.clear_all();
        inner.protection.clear_all();
        inner.metrics.clear_all();
        inner.recovery.clear();
    }

    /// Start the periodic metrics flush, dead-letter cleanup and recovery sweep
    pub fn spawn_maintenance(&self) {
        let inner = &self.inner;
        let mut tasks = inner.maintenance.lock();
        if !tasks.is_empty() {
            return;
        }

        let metrics = inner.metrics.clone();
        let flush_every = every_secs(inner.config.metrics.flush_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.flush();
            }
        }));

        if inner.config.dead_letter.auto_cleanup {
            tasks.push(
                inner
                    .dead_letters
                    .spawn_cleanup(every_secs(inner.config.dead_letter.cleanup_interval_secs)),
            );
        }
        if inner.config.recovery.enabled {
            tasks.push(inner.recovery.spawn_retry_sweep(
                Arc::downgrade(inner),
                every_secs(inner.config.recovery.retry_interval_secs),
            ));
        }
        info!(tasks = tasks.len(), "Maintenance tasks started");
    }

    /// Stop maintenance, then wait for in-flight async handlers up to the
    /// configured shutdown timeout. Returns false if that wait timed out.
    pub async fn shutdown(&self) -> bool {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return true;
        }

        let tasks: Vec<_> = inner.maintenance.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let drained = inner.emitter.pool.shutdown(inner.config.shutdown_timeout()).await;
        inner.metrics.flush();
        info!(drained, "Signal engine shut down");
        drained
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

fn every_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// Report an emission dropped before dispatch
fn reject(options: &EmitOptions, event: &str, sender: &Sender, params: &Params, reason: BlockReason) {
    if let Some(callback) = &options.callback {
        let err = SignalError::Blocked {
            event: event.to_string(),
            reason,
        };
        callback.on_error(event, sender, &err, params);
        callback.on_complete(event, sender, params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtectionConfig, SignalPriority};
    use crate::dead_letter::DeadLetterStatus;
    use crate::error::HandlerError;
    use crate::handler::handler_fn;
    use crate::persistence::testing::MemorySink;
    use crate::pipeline::{filter_fn, transformer_fn};
    use crate::recovery::RecoveryStatus;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn signals() -> Signals {
        init_tracing();
        Signals::new(EngineConfig::default()).unwrap()
    }

    fn config() -> SignalConfig {
        SignalConfig::builder()
            .max_retries(0)
            .retry_delay_ms(1)
            .build()
            .unwrap()
    }

    /// Handler recording its first parameter
    fn recording(seen: Arc<Mutex<Vec<Value>>>) -> Arc<dyn SignalHandler> {
        handler_fn(move |emission| {
            let seen = seen.clone();
            async move {
                seen.lock().push(emission.param(0).cloned().unwrap_or(Value::Null));
                Ok(())
            }
        })
    }

    fn counting(calls: Arc<AtomicU32>) -> Arc<dyn SignalHandler> {
        handler_fn(move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn failing(calls: Arc<AtomicU32>) -> Arc<dyn SignalHandler> {
        handler_fn(move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::failed("always fails"))
            }
        })
    }

    #[derive(Default)]
    struct Outcomes {
        success: AtomicU32,
        error: AtomicU32,
        complete: AtomicU32,
    }

    impl SignalCallback for Outcomes {
        fn on_success(&self, _event: &str, _sender: &Sender, _params: &Params) {
            self.success.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _event: &str, _sender: &Sender, _error: &SignalError, _params: &Params) {
            self.error.fetch_add(1, Ordering::SeqCst);
        }

        fn on_complete(&self, _event: &str, _sender: &Sender, _params: &Params) {
            self.complete.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ========================================================================
    // End-to-end scenarios
    // ========================================================================

    #[tokio::test]
    async fn test_single_handler_receives_params() {
        let signals = signals();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let high = SignalConfig::builder()
            .priority(SignalPriority::High)
            .max_retries(0)
            .build()
            .unwrap();
        signals
            .connect_with("order.created", recording(seen.clone()), high)
            .await;

        let outcome = signals
            .emit("order.created", "checkout", vec![json!("A")])
            .await
            .unwrap();

        assert_eq!(outcome, EmitOutcome::Dispatched { handlers: 1 });
        assert_eq!(*seen.lock(), vec![json!("A")]);
    }

    #[tokio::test]
    async fn test_flaky_handler_retried_then_succeeds() {
        let signals = signals();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::failed("not yet"))
                } else {
                    Ok(())
                }
            }
        });
        let retrying = SignalConfig::builder()
            .max_retries(2)
            .retry_delay_ms(1)
            .build()
            .unwrap();
        signals.connect_with("payment", flaky, retrying).await;

        let outcomes = Arc::new(Outcomes::default());
        signals
            .emit_with("payment", "test", vec![], EmitOptions::new().callback(outcomes.clone()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcomes.success.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.error.load(Ordering::SeqCst), 0);
        assert_eq!(outcomes.complete.load(Ordering::SeqCst), 1);
        assert!(signals.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_keeps_first_handler() {
        let signals = signals();
        let single = SignalConfig::builder().max_handlers(1).build().unwrap();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let h1 = signals
            .connect_with("inventory", counting(first.clone()), single.clone())
            .await;
        signals
            .connect_with("inventory", counting(second.clone()), single.clone())
            .await;
        let refused = signals
            .try_connect("inventory", counting(second.clone()), single)
            .await;

        assert!(matches!(refused, Err(SignalError::CapacityExceeded { max: 1, .. })));
        let live = signals.registry().get_handlers("inventory");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, h1);

        signals.emit("inventory", "test", vec![]).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_emission_is_blocked() {
        let signals = signals();
        let calls = Arc::new(AtomicU32::new(0));
        signals.connect_with("login", counting(calls.clone()), config()).await;
        signals
            .protection()
            .register_rate_limiter("login", RateLimiter::new(2));

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(signals.emit("login", "test", vec![]).await.unwrap());
        }

        assert_eq!(outcomes[0], EmitOutcome::Dispatched { handlers: 1 });
        assert_eq!(outcomes[1], EmitOutcome::Dispatched { handlers: 1 });
        assert_eq!(outcomes[2], EmitOutcome::Blocked(BlockReason::RateLimited));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(signals.metrics().get("login").emit_count, 2);
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_next_emission() {
        let signals = signals();
        let calls = Arc::new(AtomicU32::new(0));
        signals.connect_with("charge", failing(calls.clone()), config()).await;
        signals.configure_protection(
            "charge",
            CircuitBreaker::new(1, Duration::from_secs(60), 1),
            RateLimiter::new(100),
        );

        let first = signals.emit("charge", "test", vec![]).await.unwrap();
        let outcomes = Arc::new(Outcomes::default());
        let second = signals
            .emit_with("charge", "test", vec![], EmitOptions::new().callback(outcomes.clone()))
            .await
            .unwrap();

        assert_eq!(first, EmitOutcome::Dispatched { handlers: 1 });
        assert_eq!(second, EmitOutcome::Blocked(BlockReason::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.error.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.complete.load(Ordering::SeqCst), 1);
        assert!(signals.protection().is_blocked("charge"));
    }

    // ========================================================================
    // Properties
    // ========================================================================

    #[tokio::test]
    async fn test_interceptor_veto_skips_everything_downstream() {
        struct Veto;

        impl SignalInterceptor for Veto {
            fn before_handle(&self, _event: &str, _sender: &Sender, _params: &Params) -> bool {
                false
            }
        }

        let signals = signals();
        let stages = Arc::new(AtomicU32::new(0));
        let calls = Arc::new(AtomicU32::new(0));
        signals.connect_with("audit", counting(calls.clone()), config()).await;
        signals.add_interceptor("audit", Arc::new(Veto));

        let filter_hits = stages.clone();
        signals.add_filter(
            "audit",
            filter_fn("count", 0, move |_, _, _| {
                filter_hits.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );
        let transform_hits = stages.clone();
        signals.add_transformer(
            "audit",
            transformer_fn("count", move |_, _, params| {
                transform_hits.fetch_add(1, Ordering::SeqCst);
                params
            }),
        );

        let outcome = signals.emit("audit", "test", vec![]).await.unwrap();

        assert_eq!(outcome, EmitOutcome::Blocked(BlockReason::Pipeline));
        assert_eq!(stages.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transformed_params_reach_handler_and_spans_chain() {
        let signals = signals();
        let seen = Arc::new(Mutex::new(Vec::new()));
        signals.connect_with("greet", recording(seen.clone()), config()).await;
        signals.add_filter("greet", filter_fn("non-empty", 1, |_, _, params| !params.is_empty()));
        signals.add_transformer(
            "greet",
            transformer_fn("upper", |_, _, params| {
                params
                    .into_iter()
                    .map(|p| json!(p.as_str().unwrap_or_default().to_uppercase()))
                    .collect()
            }),
        );

        let context = Arc::new(SignalContext::new());
        signals
            .emit_with("greet", "test", vec![json!("hi")], EmitOptions::new().context(context.clone()))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![json!("HI")]);
        let spans = context.spans();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].operation, "Filter: non-empty");
        assert_eq!(spans[1].operation, "Transformer: upper");
        assert_eq!(spans[0].parent_span_id, context.event_id());
        assert_eq!(spans[1].parent_span_id.as_deref(), Some(spans[0].span_id.as_str()));
        assert_eq!(spans[2].parent_span_id.as_deref(), Some(spans[1].span_id.as_str()));
        assert!(spans[2].operation.starts_with("Handler: handler-"));
        assert!(signals.metrics().trace(&context.trace_id().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_sync_emit_waits_for_retries() {
        let signals = signals();
        let calls = Arc::new(AtomicU32::new(0));
        let retrying = SignalConfig::builder()
            .max_retries(2)
            .retry_delay_ms(20)
            .build()
            .unwrap();
        signals.connect_with("sync", failing(calls.clone()), retrying).await;

        let started = std::time::Instant::now();
        signals.emit("sync", "test", vec![]).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_async_emit_returns_before_handlers_finish() {
        let signals = signals();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let slow = handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let async_config = SignalConfig::builder().async_dispatch(true).build().unwrap();
        signals.connect_with("async", slow, async_config).await;

        signals.emit("async", "test", vec![]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(signals.shutdown().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            signals.emit("async", "test", vec![]).await,
            Err(SignalError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_terminal_failure_dead_letters_once_and_replays_once() {
        let signals = signals();
        let calls = Arc::new(AtomicU32::new(0));
        let retrying = SignalConfig::builder()
            .max_retries(2)
            .retry_delay_ms(1)
            .build()
            .unwrap();
        signals
            .connect_named("refund", failing(calls.clone()), retrying, "refunder")
            .await;

        let errors = Arc::new(AtomicU32::new(0));
        let seen = errors.clone();
        signals
            .emit_with(
                "refund",
                "test",
                vec![json!(7)],
                EmitOptions::new().on_error(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let records = signals.dead_letters().by_event("refund");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].retry_count_at_failure, 2);
        assert_eq!(records[0].handler_name, "refunder");

        assert!(!signals.retry_dead_letter(&records[0].id).await);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            signals.dead_letters().get(&records[0].id).unwrap().status,
            DeadLetterStatus::RetryFailed
        );
    }

    #[tokio::test]
    async fn test_failed_event_replayed_through_recovery() {
        let signals = signals();
        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let (flag, counter) = (healthy.clone(), calls.clone());
        let handler = handler_fn(move |_| {
            let (flag, counter) = (flag.clone(), counter.clone());
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(HandlerError::failed("downstream unavailable"))
                }
            }
        });
        let replayable = SignalConfig::builder()
            .max_retries(1)
            .retry_delay_ms(0)
            .build()
            .unwrap();
        signals.connect_with("ship", handler, replayable).await;

        let context = Arc::new(SignalContext::new());
        signals
            .emit_with("ship", "test", vec![], EmitOptions::new().context(context.clone()))
            .await
            .unwrap();
        let event_id = context.event_id().unwrap();
        assert_eq!(signals.recovery().get(&event_id).unwrap().status, RecoveryStatus::Failed);

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(signals.replay_failed().await, 1);
        assert_eq!(signals.recovery().get(&event_id).unwrap().status, RecoveryStatus::Success);

        signals.replay_event(&event_id).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(signals.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_noop() {
        let signals = signals();
        let id = signals.connect("logout", counting(Arc::default())).await;

        signals.disconnect("logout", id).await;
        signals.disconnect("logout", id).await;

        assert!(!signals.registry().has_handlers("logout"));
        assert_eq!(signals.metrics().get("logout").handler_count, 0);
        assert_eq!(
            signals.emit("logout", "test", vec![]).await.unwrap(),
            EmitOutcome::NoHandlers
        );
    }

    #[tokio::test]
    async fn test_protection_auto_configured_when_enabled() {
        init_tracing();
        let config = EngineConfig {
            protection: ProtectionConfig {
                enabled: true,
                max_requests_per_second: 1,
                ..ProtectionConfig::default()
            },
            ..EngineConfig::default()
        };
        let signals = Signals::new(config).unwrap();
        signals.connect("quote", counting(Arc::default())).await;

        assert!(signals.protection().circuit_breaker("quote").is_some());
        assert_eq!(
            signals.emit("quote", "test", vec![]).await.unwrap(),
            EmitOutcome::Dispatched { handlers: 1 }
        );
        assert_eq!(
            signals.emit("quote", "test", vec![]).await.unwrap(),
            EmitOutcome::Blocked(BlockReason::RateLimited)
        );
    }

    #[tokio::test]
    async fn test_persistent_event_saved_through_sink() {
        init_tracing();
        let sink = Arc::new(MemorySink::default());
        let signals = Signals::builder().persistence(sink.clone()).build().unwrap();
        let persistent = SignalConfig::builder().persistent(true).build().unwrap();
        signals
            .connect_with("invoice", counting(Arc::default()), persistent)
            .await;
        signals.connect_with("transient", counting(Arc::default()), config()).await;

        signals.emit("invoice", "billing", vec![json!(1)]).await.unwrap();
        signals.emit("transient", "billing", vec![]).await.unwrap();

        let saved = sink.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].event_name, "invoice");
        assert_eq!(saved[0].sender, "billing");
    }

    #[tokio::test]
    async fn test_emit_in_transaction_commits_through_boundary() {
        use crate::transaction::Transaction;

        struct Counting(Arc<AtomicU32>);

        #[async_trait]
        impl Transaction for Counting {
            async fn commit(self: Box<Self>) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        struct Boundary(Arc<AtomicU32>);

        #[async_trait]
        impl TransactionBoundary for Boundary {
            async fn begin(&self, _event: &str, _timeout: Option<Duration>) -> anyhow::Result<Box<dyn Transaction>> {
                Ok(Box::new(Counting(self.0.clone())))
            }
        }

        init_tracing();
        let commits = Arc::new(AtomicU32::new(0));
        let signals = Signals::builder()
            .transaction_boundary(Arc::new(Boundary(commits.clone())))
            .build()
            .unwrap();
        let id = signals.connect("settle", counting(Arc::default())).await;

        signals
            .emit_in_transaction("settle", id, "batch", vec![])
            .await
            .unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert!(signals.transactions().unwrap().active_transactions().is_empty());

        let missing = signals
            .emit_in_transaction("settle", HandlerId(0), "batch", vec![])
            .await;
        assert!(matches!(missing, Err(SignalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_forgets_event_state() {
        let signals = signals();
        signals.connect("temp", counting(Arc::default())).await;
        signals.add_filter("temp", filter_fn("all", 0, |_, _, _| true));
        signals.emit("temp", "test", vec![]).await.unwrap();

        signals.clear(&["temp"]);

        assert!(signals.registered_events().is_empty());
        assert!(signals.pipeline().filters("temp").is_empty());
        assert_eq!(signals.metrics().get("temp").emit_count, 0);
    }

    #[tokio::test]
    async fn test_maintenance_tasks_stop_on_shutdown() {
        let signals = signals();
        signals.spawn_maintenance();
        signals.spawn_maintenance();
        assert_eq!(signals.inner.maintenance.lock().len(), 3);

        signals.shutdown().await;
        assert!(signals.inner.maintenance.lock().is_empty());
        assert!(signals.is_shut_down());
    }

    #[tokio::test]
    async fn test_failure_with_huge_retry_delay_still_returns() {
        let signals = signals();
        let calls = Arc::new(AtomicU32::new(0));
        let patient = SignalConfig::builder()
            .max_retries(0)
            .retry_delay_ms(u64::MAX)
            .build()
            .unwrap();
        signals.connect_with("evt", failing(calls.clone()), patient).await;

        let context = Arc::new(SignalContext::new());
        let outcome = signals
            .emit_with("evt", "test", vec![json!(1)], EmitOptions::new().context(context.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, EmitOutcome::Dispatched { handlers: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signals.dead_letters().len(), 1);
        let event_id = context.event_id().unwrap();
        assert_eq!(signals.recovery().get(&event_id).unwrap().status, RecoveryStatus::Failed);
    }

    #[test]
    fn test_out_of_range_retention_is_config_error() {
        let mut config = EngineConfig::default();
        config.dead_letter.retention_days = i64::MAX;

        assert!(matches!(Signals::new(config), Err(SignalError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_clear_all_resets_metrics_and_recovery() {
        let signals = signals();
        signals.connect_with("boom", failing(Arc::default()), config()).await;
        signals.emit("boom", "test", vec![]).await.unwrap();
        assert_eq!(signals.recovery().len(), 1);

        signals.clear_all();

        assert!(signals.registered_events().is_empty());
        assert!(signals.metrics().all().is_empty());
        assert!(signals.recovery().is_empty());
        assert_eq!(signals.dead_letters().len(), 1);
    }
}

//! Dispatch of one admitted emission to its handlers
//!
//! Sync dispatch awaits every handler (retries included) in registration
//! order. Async dispatch spawns one task per handler on the bounded
//! [`DispatchPool`] and returns immediately.

use crate::config::SignalConfig;
use crate::context::SignalContext;
use crate::dead_letter::{DeadLetterQueue, DeadLetterRecord};
use crate::error::{HandlerError, ProcessingError, Result, SignalError};
use crate::handler::{Emission, Params, Sender, SigHandler};
use crate::metrics::SignalMetrics;
use crate::persistence::{PersistedEvent, PersistenceSink, PersistenceStatus};
use crate::pipeline::SignalPipeline;
use crate::processor::SignalProcessor;
use crate::protection::SignalProtectionManager;
use crate::recovery::{EventRecoveryManager, RecoveryStatus};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Observer of per-handler outcomes of an emission
pub trait SignalCallback: Send + Sync {
    fn on_success(&self, _event: &str, _sender: &Sender, _params: &Params) {}

    fn on_error(&self, _event: &str, _sender: &Sender, _error: &SignalError, _params: &Params) {}

    /// Called after every success or error
    fn on_complete(&self, _event: &str, _sender: &Sender, _params: &Params) {}
}

/// Invoked with every terminal handler failure of an emission
pub type ErrorHandler = Arc<dyn Fn(&SignalError) + Send + Sync>;

// ============================================================================
// Dispatch pool
// ============================================================================

/// Bounded pool for async handler tasks
pub struct DispatchPool {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl DispatchPool {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    /// Run `task` once a slot is free.
    ///
    /// A task still waiting for a slot when the pool shuts down is dropped.
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let ready = match permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::Closed) => return Err(SignalError::ShutDown),
            Err(TryAcquireError::NoPermits) => None,
        };

        Ok(tokio::spawn(async move {
            let permit = match ready {
                Some(permit) => permit,
                None => match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Dispatch pool closed before task started");
                        return;
                    }
                },
            };
            task.await;
            drop(permit);
        }))
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Tasks currently holding a slot
    pub fn in_flight(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.max_concurrency - self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Wait up to `timeout` for in-flight tasks, then refuse new ones.
    ///
    /// Returns false when the wait timed out.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        let drained = match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                true
            }
            Ok(Err(_)) => true,
            Err(_) => false,
        };
        self.permits.close();

        if drained {
            info!("Dispatch pool drained");
        } else {
            warn!(timeout_ms = timeout.as_millis() as u64, "Dispatch pool shutdown timed out");
        }
        drained
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// One admitted emission, ready to be handed to handlers
pub struct Dispatch {
    pub event: String,
    pub sender: Sender,
    pub params: Params,
    pub context: Arc<SignalContext>,
    pub config: SignalConfig,
    pub handlers: Arc<[SigHandler]>,
    pub error_handler: Option<ErrorHandler>,
    pub callback: Option<Arc<dyn SignalCallback>>,
}

impl Dispatch {
    fn emission(&self, handler: &SigHandler) -> Emission {
        Emission {
            event: self.event.clone(),
            sender: self.sender.clone(),
            params: self.params.clone(),
            context: self.context.clone(),
            handler_id: handler.id,
            handler_name: handler.handler_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SignalEmitter {
    pub(crate) processor: SignalProcessor,
    pub(crate) metrics: Arc<SignalMetrics>,
    pub(crate) protection: Arc<SignalProtectionManager>,
    pub(crate) pipeline: Arc<SignalPipeline>,
    pub(crate) dead_letters: Arc<DeadLetterQueue>,
    pub(crate) recovery: Arc<EventRecoveryManager>,
    pub(crate) recovery_enabled: bool,
    pub(crate) persistence: Option<Arc<dyn PersistenceSink>>,
    pub(crate) pool: Arc<DispatchPool>,
}

impl SignalEmitter {
    /// Dispatch according to the config's sync/async mode
    pub async fn dispatch(&self, dispatch: Dispatch) -> Result<()> {
        if dispatch.config.is_async() && self.pool.is_closed() {
            return Err(SignalError::ShutDown);
        }
        self.persist(&dispatch).await;
        if dispatch.config.is_async() {
            self.emit_async(dispatch)
        } else {
            self.emit_sync(dispatch).await;
            Ok(())
        }
    }

    /// Run every handler in registration order, awaiting each one
    pub async fn emit_sync(&self, dispatch: Dispatch) {
        for handler in dispatch.handlers.iter() {
            self.run_handler(&dispatch, handler).await;
        }
    }

    /// Spawn one pool task per handler.
    ///
    /// Fails without dispatching anything when the pool is already closed.
    /// A handler refused because the pool closed mid-loop is reported through
    /// the error handler and callback instead.
    pub fn emit_async(&self, dispatch: Dispatch) -> Result<()> {
        if self.pool.is_closed() {
            return Err(SignalError::ShutDown);
        }

        let dispatch = Arc::new(dispatch);
        for handler in dispatch.handlers.iter() {
            let emitter = self.clone();
            let task = dispatch.clone();
            let owned = handler.clone();
            let spawned = self.pool.spawn(async move {
                emitter.run_handler(&task, &owned).await;
            });
            if let Err(err) = spawned {
                self.refuse(&dispatch, handler, &err);
            }
        }
        Ok(())
    }

    fn refuse(&self, dispatch: &Dispatch, handler: &SigHandler, err: &SignalError) {
        let event = dispatch.event.as_str();
        warn!(event = %event, handler = %handler.display_name(), error = %err, "Handler not dispatched");
        if let Some(error_handler) = &dispatch.error_handler {
            error_handler(err);
        }
        if let Some(callback) = &dispatch.callback {
            callback.on_error(event, &dispatch.sender, err, &dispatch.params);
            callback.on_complete(event, &dispatch.sender, &dispatch.params);
        }
    }

    async fn run_handler(&self, dispatch: &Dispatch, handler: &SigHandler) {
        let event = dispatch.event.as_str();
        if let Some(registered) = &handler.context {
            merge_attributes(&dispatch.context, registered);
        }

        let emission = dispatch.emission(handler);
        let started = Instant::now();
        let result = self
            .processor
            .execute_with_tracing(handler, emission.clone(), &dispatch.config)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if dispatch.config.record_metrics() {
            self.metrics.record_processing_time(event, elapsed_ms);
        }
        for interceptor in self.pipeline.interceptors(event) {
            interceptor.after_handle(event, &dispatch.sender, &dispatch.params, result.as_ref().err());
        }

        match result {
            Ok(()) => {
                self.protection.record_success(event);
                if dispatch.config.record_metrics() {
                    self.metrics.record_processed(event);
                }
                debug!(event = %event, handler = %handler.display_name(), elapsed_ms, "Handler completed");
                if let Some(callback) = &dispatch.callback {
                    callback.on_success(event, &dispatch.sender, &dispatch.params);
                }
                self.update_persisted(dispatch, PersistenceStatus::Processed).await;
            }
            Err(err) => {
                self.escalate(dispatch, handler, &emission, err);
                self.update_persisted(dispatch, PersistenceStatus::Failed).await;
            }
        }

        if let Some(callback) = &dispatch.callback {
            callback.on_complete(event, &dispatch.sender, &dispatch.params);
        }
    }

    /// Terminal failure: metrics, protection, callbacks, dead letter, recovery
    fn escalate(&self, dispatch: &Dispatch, handler: &SigHandler, emission: &Emission, err: ProcessingError) {
        let event = dispatch.event.as_str();
        if dispatch.config.record_metrics() {
            self.metrics.record_error(event);
        }
        self.protection.record_failure(event);

        error!(
            event = %event,
            handler = %handler.display_name(),
            code = err.code.as_u16(),
            attempts = err.attempts,
            error = %err.message,
            "Handler failed"
        );

        self.dead_letters
            .add(DeadLetterRecord::new(handler, emission, &dispatch.config, &err));

        if self.recovery_enabled {
            if let Some(event_id) = dispatch.context.event_id() {
                self.recovery.record_processing(
                    &event_id,
                    event,
                    &dispatch.context,
                    &dispatch.params,
                    &dispatch.config,
                    RecoveryStatus::Failed,
                );
            }
        }

        let err = SignalError::Processing(err);
        if let Some(error_handler) = &dispatch.error_handler {
            error_handler(&err);
        }
        if let Some(callback) = &dispatch.callback {
            callback.on_error(event, &dispatch.sender, &err, &dispatch.params);
        }
    }

    /// Re-run the handlers of a recovered event synchronously.
    ///
    /// Failures are reported to the caller only; nothing is dead-lettered.
    pub async fn replay(&self, dispatch: Dispatch) -> std::result::Result<(), ProcessingError> {
        if dispatch.handlers.is_empty() {
            let reason = HandlerError::failed(format!("no handlers registered for `{}`", dispatch.event));
            return Err(ProcessingError::from_handler(&reason));
        }

        let mut failure = None;
        for handler in dispatch.handlers.iter() {
            let emission = dispatch.emission(handler);
            let started = Instant::now();
            let result = self
                .processor
                .execute_with_tracing(handler, emission, &dispatch.config)
                .await;

            if dispatch.config.record_metrics() {
                self.metrics
                    .record_processing_time(&dispatch.event, started.elapsed().as_millis() as u64);
            }
            match result {
                Ok(()) => self.protection.record_success(&dispatch.event),
                Err(err) => {
                    self.protection.record_failure(&dispatch.event);
                    warn!(event = %dispatch.event, handler = %handler.display_name(), error = %err, "Replay handler failed");
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        failure.map_or(Ok(()), Err)
    }

    async fn persist(&self, dispatch: &Dispatch) {
        let Some(sink) = self.sink_for(dispatch) else {
            return;
        };
        let Some(event_id) = dispatch.context.event_id() else {
            return;
        };

        let record = PersistedEvent {
            event_id,
            event_name: dispatch.event.clone(),
            sender: dispatch.sender.to_string(),
            handlers: dispatch.handlers.iter().map(SigHandler::descriptor).collect(),
            config: dispatch.config.clone(),
            context: dispatch.context.snapshot(),
            params: dispatch.params.clone(),
            status: PersistenceStatus::Pending,
            created_at: Utc::now(),
        };
        if let Err(e) = sink.save(&record).await {
            warn!(event = %dispatch.event, error = %e, "Failed to persist event");
        }
    }

    async fn update_persisted(&self, dispatch: &Dispatch, status: PersistenceStatus) {
        let Some(sink) = self.sink_for(dispatch) else {
            return;
        };
        let Some(event_id) = dispatch.context.event_id() else {
            return;
        };
        if let Err(e) = sink.update_status(&event_id, status).await {
            warn!(event = %dispatch.event, event_id = %event_id, error = %e, "Failed to update persisted status");
        }
    }

    fn sink_for(&self, dispatch: &Dispatch) -> Option<&Arc<dyn PersistenceSink>> {
        self.persistence
            .as_ref()
            .filter(|_| dispatch.config.is_persistent())
    }
}

/// Copy attributes of a handler's registered context without overriding the caller's
fn merge_attributes(target: &SignalContext, registered: &SignalContext) {
    for (key, value) in registered.attributes() {
        if target.attribute(&key).is_none() {
            target.set_attribute(key, value);
        }
    }
}

//! Single-handler execution with retry and per-attempt timeout

use crate::config::SignalConfig;
use crate::error::{ErrorCode, ProcessingError};
use crate::handler::{Emission, SigHandler, SignalHandler};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs one handler for one emission.
///
/// Every attempt runs on its own tokio task so a panicking handler is
/// reported as a failure instead of unwinding into the emitter. Timeouts
/// abort the task, which only takes effect at the handler's next `.await`;
/// a handler blocking its thread keeps running until it yields.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProcessor;

impl SignalProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Invoke the handler up to `max_retries + 1` times, sleeping
    /// `retry_delay` between attempts
    pub async fn execute_with_retry(
        &self,
        handler: &SigHandler,
        emission: Emission,
        config: &SignalConfig,
    ) -> Result<(), ProcessingError> {
        let attempts = config.max_retries() + 1;
        let mut attempt = 1;

        loop {
            let result = run_attempt(
                handler.handler.clone(),
                emission.clone(),
                config.timeout(),
                config.timeout_ms(),
            )
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.code == ErrorCode::Interrupted || attempt >= attempts => {
                    return Err(err.with_attempts(attempt));
                }
                Err(err) => {
                    debug!(
                        event = %emission.event,
                        handler = %handler.display_name(),
                        attempt,
                        attempts,
                        error = %err.message,
                        "Handler attempt failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay()).await;
                    attempt += 1;
                }
            }
        }
    }

    /// [`execute_with_retry`](Self::execute_with_retry) recorded as a
    /// `Handler: <name>` span on the emission context
    pub async fn execute_with_tracing(
        &self,
        handler: &SigHandler,
        emission: Emission,
        config: &SignalConfig,
    ) -> Result<(), ProcessingError> {
        let context = emission.context.clone();
        let span_id = context.start_span(format!("Handler: {}", handler.display_name()), context.root_parent());
        context.add_span_metadata(&span_id, "handler_id", json!(handler.id.0));

        let result = self.execute_with_retry(handler, emission, config).await;

        if let Err(err) = &result {
            context.add_span_metadata(&span_id, "error", json!(err.message));
            context.add_span_metadata(&span_id, "attempts", json!(err.attempts));
        }
        context.end_span(&span_id);
        result
    }
}

async fn run_attempt(
    handler: Arc<dyn SignalHandler>,
    emission: Emission,
    timeout: Option<Duration>,
    timeout_ms: u64,
) -> Result<(), ProcessingError> {
    let event = emission.event.clone();
    let mut task = tokio::spawn(async move { handler.handle(emission).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                warn!(event = %event, timeout_ms, "Handler timed out");
                return Err(ProcessingError::timeout(timeout_ms));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ProcessingError::from_handler(&err)),
        Err(join) if join.is_cancelled() => Err(ProcessingError::interrupted()),
        Err(_) => {
            warn!(event = %event, "Handler panicked");
            Err(ProcessingError::panicked())
        }
    }
}

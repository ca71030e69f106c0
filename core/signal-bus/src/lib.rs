//! # Signal Bus
//!
//! In-process signal dispatch engine: handlers register against named
//! events, emitters fire events with a list of JSON values.
//!
//! ## Features
//!
//! - **Pipelines**: Interceptors, priority-ordered filters and transformers per event
//! - **Resilience**: Per-attempt timeouts, retries, circuit breakers and rate limiters
//! - **Sync or async**: Awaited in-order dispatch or a bounded task pool, per event
//! - **Tracing**: One span per pipeline stage and handler, linked into a trace tree
//! - **Escalation**: Dead letters, recovery replay and transactional execution
//! - **Serialized registration**: Handler lists mutated by one reconciliation thread
//!
//! ## Example
//!
//! ```rust
//! use signal_bus::{handler_fn, EmitOutcome, SignalConfig, Signals};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> signal_bus::Result<()> {
//!     let signals = Signals::builder().build()?;
//!
//!     let config = SignalConfig::builder().max_retries(0).build()?;
//!     signals
//!         .connect_with("order.created", handler_fn(|emission| async move {
//!             println!("order {:?} from {}", emission.param(0), emission.sender);
//!             Ok(())
//!         }), config)
//!         .await;
//!
//!     let outcome = signals.emit("order.created", "checkout", vec![json!("A")]).await?;
//!     assert_eq!(outcome, EmitOutcome::Dispatched { handlers: 1 });
//!
//!     signals.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod id_gen;

// Dispatch path
pub mod emitter;
pub mod pipeline;
pub mod processor;
pub mod protection;
pub mod registry;
pub mod signals;

// Observability and escalation
pub mod dead_letter;
pub mod metrics;
pub mod persistence;
pub mod recovery;
pub mod transaction;

// Re-exports
pub use config::{EngineConfig, SignalConfig, SignalConfigBuilder, SignalPriority};
pub use context::{ContextSnapshot, SignalContext, Span};
pub use error::{BlockReason, ErrorCode, HandlerError, ProcessingError, Result, SignalError};
pub use handler::{handler_fn, Emission, EventType, HandlerId, Params, Sender, SigHandler, SignalHandler};
pub use id_gen::IdGenerator;

pub use emitter::{DispatchPool, ErrorHandler, SignalCallback, SignalEmitter};
pub use pipeline::{filter_fn, transformer_fn, SignalFilter, SignalInterceptor, SignalPipeline, SignalTransformer};
pub use processor::SignalProcessor;
pub use protection::{Admission, CircuitBreaker, CircuitState, RateLimiter, SignalProtectionManager};
pub use registry::SignalRegistry;
pub use signals::{EmitOptions, EmitOutcome, Signals, SignalsBuilder};

pub use dead_letter::{DeadLetterQueue, DeadLetterRecord, DeadLetterStats, DeadLetterStatus, RetryReport};
pub use metrics::{MetricsSnapshot, SignalMetrics};
pub use persistence::{PersistedEvent, PersistenceSink, PersistenceStatus};
pub use recovery::{EventRecoveryManager, RecoveryInfo, RecoveryStats, RecoveryStatus, Replayer};
pub use transaction::{EventTransactionManager, Transaction, TransactionBoundary, TransactionInfo, TransactionStatus};

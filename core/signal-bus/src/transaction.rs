//! Handler execution inside externally managed transactions

use crate::config::SignalConfig;
use crate::dead_letter::{DeadLetterQueue, DeadLetterRecord};
use crate::error::{HandlerError, ProcessingError, Result, SignalError};
use crate::handler::{Emission, SigHandler};
use crate::processor::SignalProcessor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// One open transaction of the host's transaction system
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// Opens a new, independent transaction per handler attempt
#[async_trait]
pub trait TransactionBoundary: Send + Sync {
    async fn begin(&self, event: &str, timeout: Option<Duration>) -> anyhow::Result<Box<dyn Transaction>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Running,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub event_name: String,
    pub event_id: Option<String>,
    pub attempt: u32,
    pub status: TransactionStatus,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
}

impl TransactionInfo {
    pub fn duration_ms(&self) -> i64 {
        (Utc::now() - self.start_time).num_milliseconds()
    }
}

pub struct EventTransactionManager {
    boundary: Arc<dyn TransactionBoundary>,
    processor: SignalProcessor,
    dead_letters: Arc<DeadLetterQueue>,
    active: DashMap<String, TransactionInfo>,
    counter: AtomicU64,
}

impl EventTransactionManager {
    pub fn new(boundary: Arc<dyn TransactionBoundary>, dead_letters: Arc<DeadLetterQueue>) -> Self {
        Self {
            boundary,
            processor: SignalProcessor::new(),
            dead_letters,
            active: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Run the handler once per transaction, committing on success.
    ///
    /// A failed attempt is rolled back and retried in a fresh transaction up
    /// to `max_retries` times. Exhaustion dead-letters the emission.
    pub async fn execute_in_transaction(
        &self,
        handler: &SigHandler,
        emission: Emission,
        config: &SignalConfig,
    ) -> Result<()> {
        let attempts = config.max_retries() + 1;
        let mut attempt = 1;

        loop {
            let err = match self.attempt(handler, emission.clone(), config, attempt).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if attempt >= attempts {
                let err = err.with_attempts(attempt);
                error!(
                    event = %emission.event,
                    handler = %handler.display_name(),
                    attempts = attempt,
                    error = %err.message,
                    "Transactional handler failed, dead-lettering"
                );
                self.dead_letters
                    .add(DeadLetterRecord::new(handler, &emission, config, &err));
                return Err(SignalError::Processing(err));
            }

            warn!(event = %emission.event, attempt, attempts, error = %err.message, "Transaction attempt failed, retrying");
            tokio::time::sleep(config.retry_delay()).await;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        handler: &SigHandler,
        emission: Emission,
        config: &SignalConfig,
        attempt: u32,
    ) -> std::result::Result<(), ProcessingError> {
        let event = emission.event.clone();
        let transaction_id = self.next_transaction_id(&event);
        self.active.insert(
            transaction_id.clone(),
            TransactionInfo {
                transaction_id: transaction_id.clone(),
                event_name: event.clone(),
                event_id: emission.context.event_id(),
                attempt,
                status: TransactionStatus::Running,
                error: None,
                start_time: Utc::now(),
            },
        );

        let result = self.run(handler, emission, config, &transaction_id).await;
        if let Some((_, info)) = self.active.remove(&transaction_id) {
            info!(
                event = %event,
                transaction_id = %transaction_id,
                status = ?info.status,
                duration_ms = info.duration_ms(),
                "Transaction finished"
            );
        }
        result
    }

    async fn run(
        &self,
        handler: &SigHandler,
        emission: Emission,
        config: &SignalConfig,
        transaction_id: &str,
    ) -> std::result::Result<(), ProcessingError> {
        let transaction = self
            .boundary
            .begin(&emission.event, config.timeout())
            .await
            .map_err(|e| self.fail(transaction_id, ProcessingError::from_handler(&HandlerError::Other(e))))?;

        match self
            .processor
            .execute_with_retry(handler, emission, &config.single_attempt())
            .await
        {
            Ok(()) => {
                transaction
                    .commit()
                    .await
                    .map_err(|e| self.fail(transaction_id, ProcessingError::from_handler(&HandlerError::Other(e))))?;
                self.set_status(transaction_id, TransactionStatus::Committed, None);
                Ok(())
            }
            Err(err) => {
                if let Err(e) = transaction.rollback().await {
                    warn!(transaction_id = %transaction_id, error = %e, "Rollback failed");
                }
                Err(self.fail(transaction_id, err))
            }
        }
    }

    fn fail(&self, transaction_id: &str, err: ProcessingError) -> ProcessingError {
        self.set_status(transaction_id, TransactionStatus::RolledBack, Some(err.message.clone()));
        err
    }

    fn set_status(&self, transaction_id: &str, status: TransactionStatus, error: Option<String>) {
        if let Some(mut info) = self.active.get_mut(transaction_id) {
            info.status = status;
            info.error = error;
        }
    }

    fn next_transaction_id(&self, event: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{event}_{}_{n}", Utc::now().timestamp_millis())
    }

    pub fn transaction_info(&self, transaction_id: &str) -> Option<TransactionInfo> {
        self.active.get(transaction_id).map(|info| info.value().clone())
    }

    /// Transactions currently open
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.active.iter().map(|info| info.value().clone()).collect()
    }
}

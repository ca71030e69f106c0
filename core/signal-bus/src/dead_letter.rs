//! Dead-letter records for handler invocations that exhausted their retries

use crate::config::{DeadLetterConfig, SignalConfig};
use crate::context::{ContextSnapshot, SignalContext};
use crate::error::{ErrorCode, ProcessingError, Result, SignalError};
use crate::handler::{Emission, HandlerId, Params, SigHandler, Sender};
use crate::processor::SignalProcessor;
use crate::registry::SignalRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reason recorded when the original handler is gone at replay time
pub const HANDLER_NOT_FOUND: &str = "handler not found";

/// Resolves the handler a dead letter was recorded against
pub trait HandlerLookup: Send + Sync {
    fn find_handler(&self, event: &str, id: HandlerId) -> Option<SigHandler>;
}

impl HandlerLookup for SignalRegistry {
    fn find_handler(&self, event: &str, id: HandlerId) -> Option<SigHandler> {
        SignalRegistry::find_handler(self, event, id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    RetrySuccess,
    RetryFailed,
    Processed,
}

/// One terminal handler failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub event_name: String,
    pub handler_id: HandlerId,
    pub handler_name: String,
    pub sender: String,
    pub context: ContextSnapshot,
    pub params: Params,
    pub config: SignalConfig,
    pub error: ProcessingErrorInfo,
    pub failure_reason: String,
    pub retry_count_at_failure: u32,
    pub status: DeadLetterStatus,
    pub create_time: DateTime<Utc>,
    pub last_retry_time: Option<DateTime<Utc>>,
}

/// Serializable copy of the failure that produced a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingErrorInfo {
    pub code: u16,
    pub message: String,
    pub attempts: u32,
}

impl From<&ProcessingError> for ProcessingErrorInfo {
    fn from(err: &ProcessingError) -> Self {
        Self {
            code: err.code.as_u16(),
            message: err.message.clone(),
            attempts: err.attempts,
        }
    }
}

impl DeadLetterRecord {
    /// Package a terminal failure of `handler` for `emission`
    pub fn new(handler: &SigHandler, emission: &Emission, config: &SignalConfig, err: &ProcessingError) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_name: emission.event.clone(),
            handler_id: handler.id,
            handler_name: handler.display_name(),
            sender: emission.sender.to_string(),
            context: emission.context.snapshot(),
            params: emission.params.clone(),
            config: config.clone(),
            error: err.into(),
            failure_reason: failure_reason(err),
            retry_count_at_failure: config.max_retries(),
            status: DeadLetterStatus::Pending,
            create_time: Utc::now(),
            last_retry_time: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, DeadLetterStatus::Pending | DeadLetterStatus::RetryFailed)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} [{}] handler={} status={:?} reason={}",
            self.id, self.event_name, self.handler_name, self.status, self.failure_reason
        )
    }
}

fn failure_reason(err: &ProcessingError) -> String {
    if err.timed_out {
        return "timeout".to_string();
    }
    match err.code {
        ErrorCode::BusinessFailure => "business failure".to_string(),
        ErrorCode::Interrupted => "interrupted".to_string(),
        ErrorCode::HandlerFailed => err.message.clone(),
    }
}

/// Result of a batch replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub pending: usize,
    pub retrying: usize,
    pub retry_success: usize,
    pub retry_failed: usize,
    pub processed: usize,
}

/// Bounded store of dead-letter records, oldest evicted first
pub struct DeadLetterQueue {
    records: Mutex<VecDeque<DeadLetterRecord>>,
    capacity: usize,
    retention: ChronoDuration,
    lookup: Arc<dyn HandlerLookup>,
    processor: SignalProcessor,
}

impl DeadLetterQueue {
    /// Fails when `retention_days` is negative or beyond the representable range
    pub fn new(config: &DeadLetterConfig, lookup: Arc<dyn HandlerLookup>) -> Result<Self> {
        let retention = Some(config.retention_days)
            .filter(|days| *days >= 0)
            .and_then(ChronoDuration::try_days)
            .ok_or_else(|| {
                SignalError::InvalidConfig(format!(
                    "dead_letter.retention_days out of range: {}",
                    config.retention_days
                ))
            })?;

        Ok(Self {
            records: Mutex::new(VecDeque::new()),
            capacity: config.capacity.max(1),
            retention,
            lookup,
            processor: SignalProcessor::new(),
        })
    }

    pub fn add(&self, record: DeadLetterRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            if let Some(oldest) = records.pop_front() {
                warn!(evicted = %oldest.summary(), "Dead-letter queue full, evicting oldest record");
            }
        }
        info!(record = %record.summary(), "Dead letter recorded");
        records.push_back(record);
    }

    /// Replay one record through its original handler, exactly once.
    ///
    /// Returns true when the handler succeeded.
    pub async fn retry(&self, id: &str) -> bool {
        let Some(record) = self.begin_retry(id) else {
            return false;
        };

        let Some(handler) = self.lookup.find_handler(&record.event_name, record.handler_id) else {
            error!(id = %id, event = %record.event_name, handler = %record.handler_name, "Dead-letter handler no longer registered");
            self.finish_retry(id, |r| {
                r.status = DeadLetterStatus::RetryFailed;
                r.failure_reason = HANDLER_NOT_FOUND.to_string();
            });
            return false;
        };

        let emission = Emission {
            event: record.event_name.clone(),
            sender: Sender::new(&record.sender),
            params: record.params.clone(),
            context: Arc::new(SignalContext::from_snapshot(&record.context)),
            handler_id: handler.id,
            handler_name: handler.handler_name.clone(),
        };

        match self
            .processor
            .execute_with_retry(&handler, emission, &record.config.single_attempt())
            .await
        {
            Ok(()) => {
                info!(id = %id, event = %record.event_name, "Dead-letter replay succeeded");
                self.finish_retry(id, |r| r.status = DeadLetterStatus::RetrySuccess);
                true
            }
            Err(err) => {
                error!(id = %id, event = %record.event_name, error = %err, "Dead-letter replay failed");
                self.finish_retry(id, |r| {
                    r.status = DeadLetterStatus::RetryFailed;
                    r.error = (&err).into();
                    r.failure_reason = failure_reason(&err);
                });
                false
            }
        }
    }

    /// Replay every retryable record matching `filter`
    pub async fn batch_retry<F>(&self, filter: F) -> RetryReport
    where
        F: Fn(&DeadLetterRecord) -> bool,
    {
        let ids: Vec<String> = self
            .query(|r| r.can_retry() && filter(r))
            .into_iter()
            .map(|r| r.id)
            .collect();

        let mut report = RetryReport {
            total: ids.len(),
            ..Default::default()
        };
        for id in &ids {
            if self.retry(id).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(total = report.total, succeeded = report.succeeded, failed = report.failed, "Batch dead-letter replay complete");
        report
    }

    pub fn query<F>(&self, filter: F) -> Vec<DeadLetterRecord>
    where
        F: Fn(&DeadLetterRecord) -> bool,
    {
        self.records.lock().iter().filter(|r| filter(r)).cloned().collect()
    }

    pub fn by_event(&self, event: &str) -> Vec<DeadLetterRecord> {
        self.query(|r| r.event_name == event)
    }

    pub fn by_status(&self, status: DeadLetterStatus) -> Vec<DeadLetterRecord> {
        self.query(|r| r.status == status)
    }

    /// Records whose failure reason contains `reason`
    pub fn by_failure_reason(&self, reason: &str) -> Vec<DeadLetterRecord> {
        self.query(|r| r.failure_reason.contains(reason))
    }

    pub fn get(&self, id: &str) -> Option<DeadLetterRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }

    /// Close a record by hand; returns false for unknown ids
    pub fn mark_processed(&self, id: &str) -> bool {
        self.finish_retry(id, |r| r.status = DeadLetterStatus::Processed)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn stats(&self) -> DeadLetterStats {
        let records = self.records.lock();
        let mut stats = DeadLetterStats {
            total: records.len(),
            ..Default::default()
        };
        for record in records.iter() {
            match record.status {
                DeadLetterStatus::Pending => stats.pending += 1,
                DeadLetterStatus::Retrying => stats.retrying += 1,
                DeadLetterStatus::RetrySuccess => stats.retry_success += 1,
                DeadLetterStatus::RetryFailed => stats.retry_failed += 1,
                DeadLetterStatus::Processed => stats.processed += 1,
            }
        }
        stats
    }

    /// Drop records older than the retention window
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = Utc::now()
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.create_time >= cutoff);
        let removed = before - records.len();

        if removed > 0 {
            info!(removed, "Expired dead letters purged");
        }
        removed
    }

    /// Periodic retention sweep; the first sweep runs after one interval
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                queue.cleanup_expired();
            }
        })
    }

    fn begin_retry(&self, id: &str) -> Option<DeadLetterRecord> {
        let mut records = self.records.lock();
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            warn!(id = %id, "Dead letter not found");
            return None;
        };
        if !record.can_retry() {
            warn!(id = %id, status = ?record.status, "Dead letter not retryable");
            return None;
        }

        record.status = DeadLetterStatus::Retrying;
        record.last_retry_time = Some(Utc::now());
        Some(record.clone())
    }

    fn finish_retry<F>(&self, id: &str, update: F) -> bool
    where
        F: FnOnce(&mut DeadLetterRecord),
    {
        match self.records.lock().iter_mut().find(|r| r.id == id) {
            Some(record) => {
                update(record);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalPriority;
    use crate::error::HandlerError;
    use crate::handler::{handler_fn, EventType};
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Handlers(DashMap<(String, HandlerId), SigHandler>);

    impl HandlerLookup for Handlers {
        fn find_handler(&self, event: &str, id: HandlerId) -> Option<SigHandler> {
            self.0.get(&(event.to_string(), id)).map(|h| h.value().clone())
        }
    }

    fn registration(id: u64, calls: Arc<AtomicU32>, fail: bool) -> SigHandler {
        SigHandler {
            id: HandlerId(id),
            event_type: EventType::Add,
            signal_name: "pay".to_string(),
            handler: handler_fn(move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(HandlerError::failed("still broken"))
                    } else {
                        Ok(())
                    }
                }
            }),
            priority: SignalPriority::Medium,
            context: None,
            handler_name: Some("charger".to_string()),
        }
    }

    fn record(handler: &SigHandler) -> DeadLetterRecord {
        let emission = Emission {
            event: "pay".to_string(),
            sender: Sender::from("checkout"),
            params: vec![json!(100)],
            context: Arc::new(SignalContext::new()),
            handler_id: handler.id,
            handler_name: handler.handler_name.clone(),
        };
        let config = SignalConfig::builder().max_retries(2).build().unwrap();
        let err = ProcessingError::from_handler(&HandlerError::failed("boom")).with_attempts(3);
        DeadLetterRecord::new(handler, &emission, &config, &err)
    }

    fn queue(capacity: usize, lookup: Arc<Handlers>) -> DeadLetterQueue {
        let config = DeadLetterConfig {
            capacity,
            ..Default::default()
        };
        DeadLetterQueue::new(&config, lookup).unwrap()
    }

    #[test]
    fn test_record_fields() {
        let handler = registration(1, Arc::default(), false);
        let record = record(&handler);
        assert_eq!(record.retry_count_at_failure, 2);
        assert_eq!(record.status, DeadLetterStatus::Pending);
        assert_eq!(record.error.code, 1001);
        assert_eq!(record.handler_name, "charger");
        assert!(record.can_retry());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let queue = queue(2, Arc::default());
        let handler = registration(1, Arc::default(), false);
        let records: Vec<_> = (0..3).map(|_| record(&handler)).collect();
        for r in &records {
            queue.add(r.clone());
        }

        assert_eq!(queue.len(), 2);
        assert!(queue.get(&records[0].id).is_none());
        assert!(queue.get(&records[2].id).is_some());
    }

    #[tokio::test]
    async fn test_retry_invokes_handler_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = registration(1, calls.clone(), false);
        let lookup = Arc::new(Handlers::default());
        lookup.0.insert(("pay".to_string(), handler.id), handler.clone());

        let queue = queue(10, lookup);
        let record = record(&handler);
        let id = record.id.clone();
        queue.add(record);

        assert!(queue.retry(&id).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get(&id).unwrap().status, DeadLetterStatus::RetrySuccess);

        // Succeeded records are no longer retryable
        assert!(!queue.retry(&id).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_failure_stays_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = registration(1, calls.clone(), true);
        let lookup = Arc::new(Handlers::default());
        lookup.0.insert(("pay".to_string(), handler.id), handler.clone());

        let queue = queue(10, lookup);
        let record = record(&handler);
        let id = record.id.clone();
        queue.add(record);

        assert!(!queue.retry(&id).await);
        assert!(!queue.retry(&id).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let record = queue.get(&id).unwrap();
        assert_eq!(record.status, DeadLetterStatus::RetryFailed);
        assert!(record.last_retry_time.is_some());
    }

    #[tokio::test]
    async fn test_missing_handler_fails_with_reason() {
        let handler = registration(1, Arc::default(), false);
        let queue = queue(10, Arc::default());
        let record = record(&handler);
        let id = record.id.clone();
        queue.add(record);

        assert!(!queue.retry(&id).await);
        let record = queue.get(&id).unwrap();
        assert_eq!(record.status, DeadLetterStatus::RetryFailed);
        assert_eq!(record.failure_reason, HANDLER_NOT_FOUND);
        assert_eq!(queue.by_failure_reason("not found").len(), 1);
    }

    #[tokio::test]
    async fn test_batch_retry_and_stats() {
        let calls = Arc::new(AtomicU32::new(0));
        let good = registration(1, calls.clone(), false);
        let lookup = Arc::new(Handlers::default());
        lookup.0.insert(("pay".to_string(), good.id), good.clone());

        let queue = queue(10, lookup);
        queue.add(record(&good));
        queue.add(record(&good));
        let orphan = record(&registration(2, Arc::default(), false));
        queue.add(orphan);
        let done = record(&good);
        let done_id = done.id.clone();
        queue.add(done);
        assert!(queue.mark_processed(&done_id));

        let report = queue.batch_retry(|r| r.event_name == "pay").await;
        assert_eq!(report, RetryReport { total: 3, succeeded: 2, failed: 1 });

        let stats = queue.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.retry_success, 2);
        assert_eq!(stats.retry_failed, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(queue.by_status(DeadLetterStatus::Processed).len(), 1);
        assert_eq!(queue.by_event("pay").len(), 4);
    }

    #[test]
    fn test_cleanup_expired() {
        let config = DeadLetterConfig {
            retention_days: 1,
            ..Default::default()
        };
        let queue = DeadLetterQueue::new(&config, Arc::new(Handlers::default())).unwrap();
        let handler = registration(1, Arc::default(), false);

        let mut stale = record(&handler);
        stale.create_time = Utc::now() - ChronoDuration::days(2);
        queue.add(stale);
        queue.add(record(&handler));

        assert_eq!(queue.cleanup_expired(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retention_out_of_range_rejected() {
        for retention_days in [-1, i64::MAX] {
            let config = DeadLetterConfig {
                retention_days,
                ..Default::default()
            };
            let result = DeadLetterQueue::new(&config, Arc::new(Handlers::default()));
            assert!(matches!(result, Err(SignalError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_long_retention_keeps_everything() {
        let config = DeadLetterConfig {
            retention_days: i64::MAX / (24 * 60 * 60 * 1000),
            ..Default::default()
        };
        let queue = DeadLetterQueue::new(&config, Arc::new(Handlers::default())).unwrap();
        let handler = registration(1, Arc::default(), false);
        queue.add(record(&handler));

        assert_eq!(queue.cleanup_expired(), 0);
        assert_eq!(queue.len(), 1);
    }
}

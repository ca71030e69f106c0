//! Recovery bookkeeping for failed emissions and their replay

use crate::config::SignalConfig;
use crate::context::{ContextSnapshot, SignalContext};
use crate::error::ProcessingError;
use crate::handler::Params;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Re-dispatches an event to its current handlers.
///
/// Implemented by the engine. A replay runs synchronously and never feeds
/// back into the dead-letter or recovery paths.
#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay(&self, event: &str, context: Arc<SignalContext>, params: Params) -> Result<(), ProcessingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Retrying,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub event_id: String,
    pub event_name: String,
    pub context: ContextSnapshot,
    pub params: Params,
    pub config: SignalConfig,
    pub status: RecoveryStatus,
    pub processing_time: DateTime<Utc>,
    pub retry_count: u32,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub retrying: usize,
    pub dead_letter: usize,
}

impl RecoveryStats {
    /// Percentage of tracked events that ended in success
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64 * 100.0
        }
    }
}

/// Tracks emissions by event id so failed ones can be replayed
#[derive(Default)]
pub struct EventRecoveryManager {
    records: DashMap<String, RecoveryInfo>,
}

impl EventRecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) the processing state of an emission
    pub fn record_processing(
        &self,
        event_id: &str,
        event: &str,
        context: &SignalContext,
        params: &Params,
        config: &SignalConfig,
        status: RecoveryStatus,
    ) {
        let now = Utc::now();
        let next_retry_time = (status == RecoveryStatus::Failed).then(|| next_retry_at(now, config));

        self.records.insert(
            event_id.to_string(),
            RecoveryInfo {
                event_id: event_id.to_string(),
                event_name: event.to_string(),
                context: context.snapshot(),
                params: params.clone(),
                config: config.clone(),
                status,
                processing_time: now,
                retry_count: 0,
                last_retry_time: None,
                next_retry_time,
            },
        );
        debug!(event_id = %event_id, event = %event, status = ?status, "Recovery state recorded");
    }

    pub fn get(&self, event_id: &str) -> Option<RecoveryInfo> {
        self.records.get(event_id).map(|r| r.value().clone())
    }

    /// Replay one event unless it already succeeded
    pub async fn replay_event(&self, event_id: &str, replayer: &dyn Replayer) {
        match self.get(event_id) {
            None => warn!(event_id = %event_id, "No recovery record"),
            Some(info) if info.status == RecoveryStatus::Success => {
                info!(event_id = %event_id, "Event already succeeded, not replaying");
            }
            Some(_) => self.replay_internal(event_id, replayer).await,
        }
    }

    /// Replay every failed event whose next retry time has come
    pub async fn replay_all_failed(&self, replayer: &dyn Replayer) -> usize {
        let now = Utc::now();
        let due = self.select(|r| {
            r.status == RecoveryStatus::Failed && r.next_retry_time.map_or(true, |at| now >= at)
        });
        for event_id in &due {
            self.replay_internal(event_id, replayer).await;
        }
        due.len()
    }

    /// Replay every non-successful event processed within `[start, end]`
    pub async fn replay_in_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>, replayer: &dyn Replayer) -> usize {
        let selected = self.select(|r| {
            r.processing_time >= start && r.processing_time <= end && r.status != RecoveryStatus::Success
        });
        for event_id in &selected {
            self.replay_internal(event_id, replayer).await;
        }
        selected.len()
    }

    async fn replay_internal(&self, event_id: &str, replayer: &dyn Replayer) {
        let Some(info) = self.claim(event_id) else {
            return;
        };

        let context = Arc::new(SignalContext::from_snapshot(&info.context));
        let result = replayer.replay(&info.event_name, context, info.params.clone()).await;

        if let Some(mut record) = self.records.get_mut(event_id) {
            match &result {
                Ok(()) => {
                    record.status = RecoveryStatus::Success;
                    record.next_retry_time = None;
                    info!(event_id = %event_id, attempt = record.retry_count, "Replay succeeded");
                }
                Err(err) => {
                    record.status = RecoveryStatus::Failed;
                    warn!(event_id = %event_id, attempt = record.retry_count, error = %err, "Replay failed");
                }
            }
        }
    }

    /// Move a record into RETRYING, or into DEAD_LETTER when its budget is spent
    fn claim(&self, event_id: &str) -> Option<RecoveryInfo> {
        let mut record = self.records.get_mut(event_id)?;
        if record.retry_count >= record.config.max_retries() {
            warn!(event_id = %event_id, retries = record.retry_count, "Replay budget exhausted, moved to dead letter");
            record.status = RecoveryStatus::DeadLetter;
            return None;
        }

        let now = Utc::now();
        record.retry_count += 1;
        record.last_retry_time = Some(now);
        record.next_retry_time = Some(next_retry_at(now, &record.config));
        record.status = RecoveryStatus::Retrying;
        Some(record.value().clone())
    }

    fn select<F>(&self, filter: F) -> Vec<String>
    where
        F: Fn(&RecoveryInfo) -> bool,
    {
        self.records
            .iter()
            .filter(|r| filter(r.value()))
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn stats(&self) -> RecoveryStats {
        let mut stats = RecoveryStats {
            total: self.records.len(),
            ..Default::default()
        };
        for record in self.records.iter() {
            match record.status {
                RecoveryStatus::Success => stats.success += 1,
                RecoveryStatus::Failed => stats.failed += 1,
                RecoveryStatus::Retrying => stats.retrying += 1,
                RecoveryStatus::DeadLetter => stats.dead_letter += 1,
                RecoveryStatus::Pending | RecoveryStatus::Processing => {}
            }
        }
        stats
    }

    /// Forget records that ended in success
    pub fn cleanup_successful(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.status != RecoveryStatus::Success);
        before - self.records.len()
    }

    /// Forget every record regardless of status
    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Periodically replay due failures until the replayer is dropped
    pub fn spawn_retry_sweep<R>(self: &Arc<Self>, replayer: Weak<R>, every: Duration) -> JoinHandle<()>
    where
        R: Replayer + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(replayer) = replayer.upgrade() else {
                    debug!("Replayer dropped, stopping recovery sweep");
                    return;
                };
                let replayed = manager.replay_all_failed(replayer.as_ref()).await;
                if replayed > 0 {
                    info!(replayed, "Recovery sweep complete");
                }
            }
        })
    }
}

/// `now` plus the retry delay, saturating at the latest representable time
fn next_retry_at(now: DateTime<Utc>, config: &SignalConfig) -> DateTime<Utc> {
    i64::try_from(config.retry_delay().as_millis())
        .ok()
        .and_then(ChronoDuration::try_milliseconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct ScriptedReplayer {
        /// Outcomes handed out in order; success once exhausted
        outcomes: Mutex<Vec<bool>>,
        replays: Mutex<Vec<(String, Params)>>,
    }

    #[async_trait]
    impl Replayer for ScriptedReplayer {
        async fn replay(&self, event: &str, _context: Arc<SignalContext>, params: Params) -> Result<(), ProcessingError> {
            self.replays.lock().push((event.to_string(), params));
            let ok = {
                let mut outcomes = self.outcomes.lock();
                if outcomes.is_empty() { true } else { outcomes.remove(0) }
            };
            if ok {
                Ok(())
            } else {
                Err(ProcessingError::from_handler(&HandlerError::failed("replay failed")))
            }
        }
    }

    fn config(max_retries: u32) -> SignalConfig {
        SignalConfig::builder()
            .max_retries(max_retries)
            .retry_delay_ms(0)
            .build()
            .unwrap()
    }

    fn record(manager: &EventRecoveryManager, id: &str, status: RecoveryStatus, max_retries: u32) {
        manager.record_processing(id, "order", &SignalContext::new(), &vec![json!(id)], &config(max_retries), status);
    }

    #[tokio::test]
    async fn test_replay_event_skips_success() {
        let manager = EventRecoveryManager::new();
        let replayer = ScriptedReplayer::default();
        record(&manager, "ok", RecoveryStatus::Success, 3);
        record(&manager, "bad", RecoveryStatus::Failed, 3);

        manager.replay_event("ok", &replayer).await;
        manager.replay_event("missing", &replayer).await;
        manager.replay_event("bad", &replayer).await;

        let replays = replayer.replays.lock();
        assert_eq!(replays.len(), 1);
        assert_eq!(replays[0].1, vec![json!("bad")]);
        assert_eq!(manager.get("bad").unwrap().status, RecoveryStatus::Success);
    }

    #[tokio::test]
    async fn test_replay_budget_moves_to_dead_letter() {
        let manager = EventRecoveryManager::new();
        let replayer = ScriptedReplayer {
            outcomes: Mutex::new(vec![false, false, false]),
            ..Default::default()
        };
        record(&manager, "e1", RecoveryStatus::Failed, 2);

        assert_eq!(manager.replay_all_failed(&replayer).await, 1);
        assert_eq!(manager.replay_all_failed(&replayer).await, 1);
        let info = manager.get("e1").unwrap();
        assert_eq!(info.retry_count, 2);
        assert_eq!(info.status, RecoveryStatus::Failed);

        manager.replay_all_failed(&replayer).await;
        assert_eq!(manager.get("e1").unwrap().status, RecoveryStatus::DeadLetter);
        assert_eq!(replayer.replays.lock().len(), 2);
        assert_eq!(manager.stats().dead_letter, 1);
    }

    #[tokio::test]
    async fn test_replay_all_failed_respects_next_retry_time() {
        let manager = EventRecoveryManager::new();
        let replayer = ScriptedReplayer::default();
        let slow = SignalConfig::builder().retry_delay_ms(60_000).build().unwrap();
        manager.record_processing("later", "order", &SignalContext::new(), &vec![], &slow, RecoveryStatus::Failed);

        assert_eq!(manager.replay_all_failed(&replayer).await, 0);
        assert!(replayer.replays.lock().is_empty());
    }

    #[tokio::test]
    async fn test_huge_retry_delay_saturates() {
        let manager = EventRecoveryManager::new();
        let replayer = ScriptedReplayer::default();
        let forever = SignalConfig::builder().retry_delay_ms(u64::MAX).build().unwrap();
        manager.record_processing("far", "order", &SignalContext::new(), &vec![], &forever, RecoveryStatus::Failed);

        assert_eq!(manager.get("far").unwrap().next_retry_time, Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(manager.replay_all_failed(&replayer).await, 0);

        manager.replay_event("far", &replayer).await;
        assert_eq!(replayer.replays.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_time_range_replay_is_idempotent_for_success() {
        let manager = EventRecoveryManager::new();
        let replayer = ScriptedReplayer::default();
        let start = Utc::now() - ChronoDuration::seconds(1);
        record(&manager, "a", RecoveryStatus::Failed, 3);
        record(&manager, "b", RecoveryStatus::Success, 3);
        record(&manager, "c", RecoveryStatus::Pending, 3);
        let end = Utc::now() + ChronoDuration::seconds(1);

        assert_eq!(manager.replay_in_time_range(start, end, &replayer).await, 2);
        assert_eq!(manager.replay_in_time_range(start, end, &replayer).await, 0);
        assert_eq!(replayer.replays.lock().len(), 2);
    }

    #[test]
    fn test_stats_and_cleanup() {
        let manager = EventRecoveryManager::new();
        record(&manager, "a", RecoveryStatus::Success, 3);
        record(&manager, "b", RecoveryStatus::Success, 3);
        record(&manager, "c", RecoveryStatus::Failed, 3);
        record(&manager, "d", RecoveryStatus::Retrying, 3);

        let stats = manager.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.success, 2);
        assert!((stats.success_rate() - 50.0).abs() < f64::EPSILON);

        assert_eq!(manager.cleanup_successful(), 2);
        assert_eq!(manager.len(), 2);
    }
}

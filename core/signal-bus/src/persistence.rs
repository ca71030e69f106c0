//! Boundary to external persistence backends.
//!
//! The engine never stores events itself. When an event's config is
//! `persistent` and a sink is installed, the emitter hands the sink a
//! self-contained description of the emission before dispatch and reports
//! each handler's outcome afterwards. Sink errors are logged and swallowed.

use crate::config::SignalConfig;
use crate::context::ContextSnapshot;
use crate::handler::{HandlerDescriptor, Params};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceStatus {
    Pending,
    Processed,
    Failed,
}

/// Everything needed to reconstruct a replay of one emission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub event_id: String,
    pub event_name: String,
    pub sender: String,
    pub handlers: Vec<HandlerDescriptor>,
    pub config: SignalConfig,
    pub context: ContextSnapshot,
    pub params: Params,
    pub status: PersistenceStatus,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save(&self, event: &PersistedEvent) -> anyhow::Result<()>;

    async fn update_status(&self, event_id: &str, status: PersistenceStatus) -> anyhow::Result<()>;
}

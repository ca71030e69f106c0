//! Handler registrations and the emission envelope handed to handlers

use crate::config::SignalPriority;
use crate::context::SignalContext;
use crate::error::HandlerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Positional emission payload
pub type Params = Vec<Value>;

/// Identity of a handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the emitting party
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sender(Arc<str>);

impl Sender {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Sender used by replays and internally generated emissions
    pub fn system() -> Self {
        Self::new("system")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Sender {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Sender {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a handler receives for one invocation
#[derive(Debug, Clone)]
pub struct Emission {
    pub event: String,
    pub sender: Sender,
    pub params: Params,
    /// Emission context; never part of `params`
    pub context: Arc<SignalContext>,
    pub handler_id: HandlerId,
    pub handler_name: Option<String>,
}

impl Emission {
    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.get(index)
    }
}

/// Callable registered against an event
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, emission: Emission) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> SignalHandler for FnHandler<F>
where
    F: Fn(Emission) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, emission: Emission) -> Result<(), HandlerError> {
        (self.0)(emission).await
    }
}

/// Wrap an async closure as a [`SignalHandler`]
///
/// ```
/// use signal_bus::handler::handler_fn;
///
/// let handler = handler_fn(|emission| async move {
///     println!("{} from {}", emission.event, emission.sender);
///     Ok(())
/// });
/// # drop(handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn SignalHandler>
where
    F: Fn(Emission) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Kind of registry command a handler registration travels with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Add,
    Remove,
    Pause,
    Resume,
    Broadcast,
    RefreshConfig,
}

impl EventType {
    pub fn value(self) -> u8 {
        match self {
            Self::Add => 0,
            Self::Remove => 1,
            Self::Pause => 2,
            Self::Resume => 3,
            Self::Broadcast => 4,
            Self::RefreshConfig => 5,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Add),
            1 => Some(Self::Remove),
            2 => Some(Self::Pause),
            3 => Some(Self::Resume),
            4 => Some(Self::Broadcast),
            5 => Some(Self::RefreshConfig),
            _ => None,
        }
    }
}

/// A live (or pending) handler registration.
///
/// Two registrations are equal iff their ids match.
#[derive(Clone)]
pub struct SigHandler {
    pub id: HandlerId,
    pub event_type: EventType,
    pub signal_name: String,
    pub handler: Arc<dyn SignalHandler>,
    pub priority: SignalPriority,
    pub context: Option<Arc<SignalContext>>,
    pub handler_name: Option<String>,
}

impl SigHandler {
    /// Name used in spans, logs and dead-letter records
    pub fn display_name(&self) -> String {
        self.handler_name
            .clone()
            .unwrap_or_else(|| format!("handler-{}", self.id))
    }

    /// Serializable description of the registration
    pub fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            id: self.id,
            signal_name: self.signal_name.clone(),
            handler_name: self.handler_name.clone(),
            priority: self.priority,
        }
    }
}

impl PartialEq for SigHandler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SigHandler {}

impl fmt::Debug for SigHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigHandler")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("signal_name", &self.signal_name)
            .field("priority", &self.priority)
            .field("handler_name", &self.handler_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub id: HandlerId,
    pub signal_name: String,
    pub handler_name: Option<String>,
    pub priority: SignalPriority,
}

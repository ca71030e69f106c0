//! Handler registry
//!
//! Registrations never touch the handler lists directly. `connect` and
//! `disconnect` enqueue a [`Command`] into one of three priority queues and a
//! single reconciliation thread applies them, HIGH before MEDIUM before LOW.
//! Callers await a per-command acknowledgement, so a returned id is live.

use crate::config::{SignalConfig, SignalPriority};
use crate::context::SignalContext;
use crate::error::{Result, SignalError};
use crate::handler::{EventType, HandlerId, SigHandler, SignalHandler};
use crate::id_gen::IdGenerator;
use crate::metrics::SignalMetrics;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of applying one registry command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    /// Capacity reached, unsupported command type, or registry cleared
    Dropped,
}

/// One queued mutation of a handler list
#[derive(Debug)]
pub struct Command {
    pub event_type: EventType,
    pub signal_name: String,
    pub handler_id: HandlerId,
    /// Present for `Add`
    pub registration: Option<SigHandler>,
    ack: Option<flume::Sender<CommandOutcome>>,
}

impl Command {
    pub fn add(registration: SigHandler) -> Self {
        Self {
            event_type: EventType::Add,
            signal_name: registration.signal_name.clone(),
            handler_id: registration.id,
            registration: Some(registration),
            ack: None,
        }
    }

    pub fn remove(event: impl Into<String>, handler_id: HandlerId) -> Self {
        Self {
            event_type: EventType::Remove,
            signal_name: event.into(),
            handler_id,
            registration: None,
            ack: None,
        }
    }

    fn with_ack(mut self, ack: flume::Sender<CommandOutcome>) -> Self {
        self.ack = Some(ack);
        self
    }

    fn complete(self, outcome: CommandOutcome) {
        if let Some(ack) = self.ack {
            // Caller may have gone away; nothing to report to
            let _ = ack.send(outcome);
        }
    }
}

/// The three lock-free command queues, indexed by [`SignalPriority`]
#[derive(Default)]
pub struct CommandQueues {
    queues: [SegQueue<Command>; 3],
}

impl CommandQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, priority: SignalPriority, command: Command) {
        self.queues[priority.index()].push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(SegQueue::is_empty)
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(SegQueue::len).sum()
    }

    /// Drain HIGH, then MEDIUM, then LOW, repeating until all are empty.
    /// Returns the number of commands handed to `apply`.
    pub fn drain<F>(&self, mut apply: F) -> usize
    where
        F: FnMut(Command),
    {
        let mut drained = 0;
        loop {
            let before = drained;
            for priority in SignalPriority::ALL {
                while let Some(command) = self.queues[priority.index()].pop() {
                    apply(command);
                    drained += 1;
                }
            }
            if drained == before {
                return drained;
            }
        }
    }
}

struct RegistryState {
    handlers: DashMap<String, Arc<[SigHandler]>>,
    configs: DashMap<String, SignalConfig>,
    queues: CommandQueues,
    draining: AtomicBool,
    metrics: Arc<SignalMetrics>,
}

impl RegistryState {
    fn process_events(&self) -> usize {
        let mut applied = 0;
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return applied;
            }
            applied += self.queues.drain(|command| self.apply(command));
            self.draining.store(false, Ordering::Release);

            // Commands pushed after the last pop but before the flag was released
            if self.queues.is_empty() {
                return applied;
            }
        }
    }

    fn apply(&self, mut command: Command) {
        let outcome = match command.event_type {
            EventType::Add => match command.registration.take() {
                Some(registration) => self.add(registration),
                None => CommandOutcome::Dropped,
            },
            EventType::Remove => {
                self.remove(&command.signal_name, command.handler_id);
                CommandOutcome::Applied
            }
            other => {
                warn!(event = %command.signal_name, event_type = ?other, "Unsupported registry command, skipped");
                CommandOutcome::Dropped
            }
        };
        command.complete(outcome);
    }

    fn add(&self, registration: SigHandler) -> CommandOutcome {
        let event = registration.signal_name.clone();
        let max = self.config(&event).max_handlers();

        {
            let mut list = self.handlers.entry(event.clone()).or_insert_with(empty_list);
            if list.len() >= max {
                warn!(event = %event, handler_id = %registration.id, max, "Handler limit reached, registration dropped");
                return CommandOutcome::Dropped;
            }
            let mut next = list.to_vec();
            next.push(registration);
            *list = Arc::from(next);
        }

        self.metrics.record_handler_added(&event);
        debug!(event = %event, "Handler registered");
        CommandOutcome::Applied
    }

    fn remove(&self, event: &str, id: HandlerId) {
        let removed = match self.handlers.get_mut(event) {
            Some(mut list) if list.iter().any(|h| h.id == id) => {
                let next: Vec<_> = list.iter().filter(|h| h.id != id).cloned().collect();
                *list = Arc::from(next);
                true
            }
            _ => false,
        };

        if removed {
            self.metrics.record_handler_removed(event);
            debug!(event = %event, handler_id = %id, "Handler unregistered");
        }
    }

    fn config(&self, event: &str) -> SignalConfig {
        self.configs
            .get(event)
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }
}

fn empty_list() -> Arc<[SigHandler]> {
    Arc::from(Vec::new())
}

/// Owns every handler list and per-event config
pub struct SignalRegistry {
    state: Arc<RegistryState>,
    id_gen: Arc<IdGenerator>,
    /// Wakes the reconciliation thread; `None` when it could not be started
    doorbell: Option<flume::Sender<()>>,
}

impl SignalRegistry {
    pub fn new(metrics: Arc<SignalMetrics>, id_gen: Arc<IdGenerator>) -> Self {
        let state = Arc::new(RegistryState {
            handlers: DashMap::new(),
            configs: DashMap::new(),
            queues: CommandQueues::new(),
            draining: AtomicBool::new(false),
            metrics,
        });

        let (doorbell, rings) = flume::unbounded::<()>();
        let actor_state = state.clone();
        let spawned = std::thread::Builder::new()
            .name("signal-registry".to_string())
            .spawn(move || {
                // Exits once the registry (and its doorbell) is dropped
                while rings.recv().is_ok() {
                    while rings.try_recv().is_ok() {}
                    actor_state.process_events();
                }
            });

        let doorbell = match spawned {
            Ok(_) => Some(doorbell),
            Err(e) => {
                error!(error = %e, "Failed to start registry thread, reconciling inline");
                None
            }
        };

        Self {
            state,
            id_gen,
            doorbell,
        }
    }

    /// Register a handler; resolves once the registration is live (or dropped)
    pub async fn register_handler(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
    ) -> HandlerId {
        self.register(event, handler, config, None, None).await.0
    }

    /// Register a handler with a name used in spans and dead-letter records
    pub async fn register_named(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
        name: impl Into<String>,
    ) -> HandlerId {
        self.register(event, handler, config, Some(name.into()), None).await.0
    }

    pub async fn register_with_context(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
        context: Arc<SignalContext>,
    ) -> HandlerId {
        self.register(event, handler, config, None, Some(context)).await.0
    }

    /// Like [`register_handler`](Self::register_handler) but reports a
    /// capacity drop as an error
    pub async fn try_register_handler(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
    ) -> Result<HandlerId> {
        match self.register(event, handler, config, None, None).await {
            (id, CommandOutcome::Applied) => Ok(id),
            (_, CommandOutcome::Dropped) => Err(SignalError::CapacityExceeded {
                event: event.to_string(),
                max: self.get_config(event).max_handlers(),
            }),
        }
    }

    async fn register(
        &self,
        event: &str,
        handler: Arc<dyn SignalHandler>,
        config: SignalConfig,
        handler_name: Option<String>,
        context: Option<Arc<SignalContext>>,
    ) -> (HandlerId, CommandOutcome) {
        let priority = config.priority();
        self.state
            .configs
            .entry(event.to_string())
            .or_insert(config);

        let id = HandlerId(self.id_gen.next_id());
        let registration = SigHandler {
            id,
            event_type: EventType::Add,
            signal_name: event.to_string(),
            handler,
            priority,
            context,
            handler_name,
        };

        let outcome = self.submit(priority, Command::add(registration)).await;
        (id, outcome)
    }

    /// Remove a handler; removing an unknown id is a no-op
    pub async fn unregister_handler(&self, event: &str, id: HandlerId) {
        let priority = self.get_config(event).priority();
        self.submit(priority, Command::remove(event, id)).await;
    }

    async fn submit(&self, priority: SignalPriority, command: Command) -> CommandOutcome {
        let (ack, outcome) = flume::bounded(1);
        self.state.queues.push(priority, command.with_ack(ack));
        self.ring();

        match outcome.recv_async().await {
            Ok(outcome) => outcome,
            // Ack sender dropped without an answer: the queues were cleared
            Err(_) => CommandOutcome::Dropped,
        }
    }

    fn ring(&self) {
        let rung = self
            .doorbell
            .as_ref()
            .is_some_and(|doorbell| doorbell.send(()).is_ok());
        if !rung {
            self.state.process_events();
        }
    }

    /// Drain pending commands on the calling thread.
    ///
    /// A no-op while another drain is in progress; returns the number of
    /// commands applied by this call.
    pub fn process_events(&self) -> usize {
        self.state.process_events()
    }

    /// Snapshot of the live handlers, in registration order
    pub fn get_handlers(&self, event: &str) -> Arc<[SigHandler]> {
        self.state
            .handlers
            .get(event)
            .map(|list| list.value().clone())
            .unwrap_or_else(empty_list)
    }

    pub fn find_handler(&self, event: &str, id: HandlerId) -> Option<SigHandler> {
        self.state
            .handlers
            .get(event)
            .and_then(|list| list.iter().find(|h| h.id == id).cloned())
    }

    pub fn has_handlers(&self, event: &str) -> bool {
        self.state
            .handlers
            .get(event)
            .is_some_and(|list| !list.is_empty())
    }

    /// Config associated with the event, or the default one
    pub fn get_config(&self, event: &str) -> SignalConfig {
        self.state.config(event)
    }

    /// Associate a config with the event if it has none yet
    pub fn ensure_config(&self, event: &str, config: &SignalConfig) {
        if !self.state.configs.contains_key(event) {
            self.state
                .configs
                .entry(event.to_string())
                .or_insert_with(|| config.clone());
        }
    }

    /// Replace the config associated with the event
    pub fn set_config(&self, event: &str, config: SignalConfig) {
        self.state.configs.insert(event.to_string(), config);
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.state
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn pending_commands(&self) -> usize {
        self.state.queues.len()
    }

    /// Forget handlers and configs of the given events
    pub fn clear(&self, events: &[&str]) {
        for event in events {
            self.state.handlers.remove(*event);
            self.state.configs.remove(*event);
            debug!(event = %event, "Event cleared");
        }
    }

    /// Forget everything, including commands not yet applied
    pub fn clear_all(&self) {
        let handlers = self.state.handlers.len();
        let configs = self.state.configs.len();

        self.state.handlers.clear();
        self.state.configs.clear();
        let discarded = self.state.queues.drain(|command| command.complete(CommandOutcome::Dropped));

        info!(handlers, configs, discarded, "Registry cleared");
    }
}

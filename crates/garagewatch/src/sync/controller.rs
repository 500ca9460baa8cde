use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::Interval;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::message::Completion;
use super::message::Intent;
use crate::config::OperatingMode;
use crate::entity::Entity;
use crate::entity::EntityState;
use crate::error::Result;
use crate::error::SyncError;
use crate::relay::status_flag;
use crate::relay::FullState;
use crate::relay::PushMessage;
use crate::relay::Query;
use crate::relay::RelayChannel;
use crate::relay::RelayRequest;
use crate::remote::RemoteStateClient;
use crate::store::CommandStatus;
use crate::store::EntityStateStore;
use crate::store::Snapshot;

const RELAY_PEER: &str = "companion device";

/// Timing and behaviour knobs for the controller.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// How long an error stays visible.
    pub error_display: Duration,
    /// Maximum wait for each relay reply.
    pub relay_timeout: Duration,
    /// Delay before retrying a full state request that found the relay
    /// unreachable at activation.
    pub relay_retry_delay: Duration,
    /// Check `appStatus` and `webSocketStatus` before each relayed command.
    pub preflight: bool,
    /// Periodic re-fetch of idle entities, direct mode only.
    pub poll_interval: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            error_display: Duration::from_secs(5),
            relay_timeout: Duration::from_secs(10),
            relay_retry_delay: Duration::from_secs(2),
            preflight: true,
            poll_interval: None,
        }
    }
}

/// Where requests go. Fixed for the lifetime of a controller.
#[derive(Clone)]
pub enum Transport {
    Direct(Arc<dyn RemoteStateClient>),
    Relayed(Arc<dyn RelayChannel>),
}

impl Transport {
    pub fn mode(&self) -> OperatingMode {
        match self {
            Transport::Direct(_) => OperatingMode::Direct,
            Transport::Relayed(_) => OperatingMode::Relayed,
        }
    }
}

/// Outstanding request for an entity. Absent from the map means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// A toggle that arrives mid-fetch is held here and dispatched once
    /// the fetch resolves.
    Fetching { toggle_held: bool },
    AwaitingReply,
}

#[derive(Debug, thiserror::Error)]
#[error("sync controller has shut down")]
pub struct ControllerClosed;

/// Presentation-side handle to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    intents: mpsc::UnboundedSender<Intent>,
    state: watch::Receiver<Snapshot>,
    mode: OperatingMode,
}

impl ControllerHandle {
    pub fn toggle(&self, entity: Entity) -> std::result::Result<(), ControllerClosed> {
        self.send(Intent::Toggle(entity))
    }

    pub fn refresh(&self) -> std::result::Result<(), ControllerClosed> {
        self.send(Intent::Refresh)
    }

    /// Receiver notified after every state change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.clone()
    }

    /// Most recently published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    /// Snapshot taken by the controller after all intents sent so far on
    /// this handle have been handled.
    pub async fn current(&self) -> std::result::Result<Snapshot, ControllerClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Intent::Current(tx))?;
        rx.await.map_err(|_| ControllerClosed)
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    fn send(&self, intent: Intent) -> std::result::Result<(), ControllerClosed> {
        self.intents.send(intent).map_err(|_| ControllerClosed)
    }
}

enum Inbound {
    Message(Value),
    Lagged(u64),
}

/// Keeps the local store consistent with the remote source of truth.
///
/// All state lives on the task running [`SyncController::run`]. Transport
/// calls run on spawned tasks and report back through the completion
/// channel, so the store has exactly one writer and needs no locking.
pub struct SyncController {
    transport: Transport,
    settings: SyncSettings,
    store: EntityStateStore,
    slots: HashMap<Entity, Slot>,
    full_state_in_flight: bool,
    /// Another full state request is owed once the in-flight one resolves.
    full_state_wanted: bool,
    /// Bumped on every full state request; stale retries compare against it.
    full_state_generation: u64,
    intent_rx: mpsc::UnboundedReceiver<Intent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
}

impl SyncController {
    pub fn new(transport: Transport, settings: SyncSettings) -> (Self, ControllerHandle) {
        let store = EntityStateStore::new(settings.error_display);
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let handle = ControllerHandle {
            intents: intent_tx,
            state: store.subscribe(),
            mode: transport.mode(),
        };

        let controller = Self {
            transport,
            settings,
            store,
            slots: HashMap::new(),
            full_state_in_flight: false,
            full_state_wanted: false,
            full_state_generation: 0,
            intent_rx,
            completion_tx,
            completion_rx,
        };
        (controller, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every [`ControllerHandle`] has been dropped.
    pub async fn run(mut self) {
        info!("Sync controller starting in {} mode", self.transport.mode());

        let (mut reachability, mut inbound) = match &self.transport {
            Transport::Relayed(relay) => (Some(relay.reachability()), Some(relay.inbound())),
            Transport::Direct(_) => (None, None),
        };
        if let Some(rx) = reachability.as_mut() {
            let reachable = *rx.borrow_and_update();
            self.store.set_relay_reachable(reachable);
        }
        let mut poll = self
            .settings
            .poll_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        self.reconcile_on_activation();

        loop {
            let error_deadline = self.store.error_deadline();
            tokio::select! {
                intent = self.intent_rx.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => break,
                },
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                reachable = next_reachability(&mut reachability) => {
                    self.handle_reachability(reachable)
                }
                inbound = next_inbound(&mut inbound) => self.handle_inbound(inbound),
                () = sleep_until(error_deadline) => self.store.expire_error(),
                () = next_poll(&mut poll) => self.poll(),
            }
        }

        info!("Sync controller shutting down");
    }

    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Toggle(entity) => self.dispatch_command(entity),
            Intent::Refresh => self.refresh(),
            Intent::Current(reply) => {
                let _ = reply.send(self.store.snapshot().clone());
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched { requested, result } => {
                let slot = self.slots.remove(&requested);
                match result {
                    Ok(state) => {
                        debug!("Fetched state for {}: {}", state.id, state.closed_or_off);
                        self.apply_reply_state(&state);
                    }
                    Err(e) => {
                        warn!("Error fetching state for {}: {}", requested.sensor_id(), e);
                        if e.is_surfaced() {
                            self.store.record_error(
                                Some(requested),
                                format!(
                                    "Failed to fetch state for {}: {}",
                                    requested.sensor_id(),
                                    e
                                ),
                            );
                        }
                    }
                }
                if slot == Some(Slot::Fetching { toggle_held: true }) {
                    self.dispatch_command(requested);
                }
            }
            Completion::FullState { result } => {
                self.full_state_in_flight = false;
                match result {
                    Ok(full) => {
                        info!("Processing initial state response");
                        self.apply_full_state(full);
                    }
                    Err(e) => {
                        warn!("Error requesting initial state: {}", e);
                        if e.is_surfaced() {
                            let message = format!("Failed to fetch initial state: {}", e);
                            self.store.record_error(None, message);
                        }
                    }
                }
                if std::mem::take(&mut self.full_state_wanted) {
                    if let Transport::Relayed(relay) = self.transport.clone() {
                        if relay.is_reachable() {
                            info!("Sending deferred initial state request");
                            self.request_full_state(&relay);
                        }
                    }
                }
            }
            Completion::Command { entity, result } => {
                self.slots.remove(&entity);
                match result {
                    Ok(state) => {
                        info!("Command for {} succeeded", entity.command_id());
                        if let Some(state) = state {
                            self.apply_reply_state(&state);
                        }
                        self.store
                            .apply_command_outcome(entity, CommandStatus::Success, None);
                    }
                    Err(e) => {
                        warn!("Error sending command to {}: {}", entity.command_id(), e);
                        let message = e.is_surfaced().then(|| {
                            format!("Failed to send command to {}: {}", entity.command_id(), e)
                        });
                        self.store
                            .apply_command_outcome(entity, CommandStatus::Failure, message);
                    }
                }
            }
            Completion::RetryFullState { generation } => {
                if generation != self.full_state_generation || self.full_state_in_flight {
                    debug!("Skipping stale initial state retry");
                    return;
                }
                if let Transport::Relayed(relay) = self.transport.clone() {
                    if relay.is_reachable() {
                        self.request_full_state(&relay);
                    } else {
                        info!("Relay still unreachable, waiting for reachability change");
                    }
                }
            }
        }
    }

    /// Reachability receivers only wake on a change, so `true` here follows
    /// an outage even when a quick flap was merged into one notification.
    fn handle_reachability(&mut self, reachable: bool) {
        self.store.set_relay_reachable(reachable);
        info!("Relay reachability changed. Is now reachable: {}", reachable);

        // The peer may have missed pushes while we could not hear it
        if reachable {
            if let Transport::Relayed(relay) = self.transport.clone() {
                self.request_full_state(&relay);
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(value) => match PushMessage::parse(&value) {
                Ok(PushMessage::Snapshot(full)) => {
                    info!("Processing pushed snapshot");
                    self.apply_full_state(full);
                }
                Ok(PushMessage::Delta {
                    entity_id,
                    closed_or_off,
                }) => match Entity::from_id(&entity_id) {
                    Some(entity) => self.store.apply_entity_update(entity, closed_or_off),
                    None => warn!("Unknown entity ID in push: {}", entity_id),
                },
                Err(e) => warn!("Discarding relay push: {}", e),
            },
            Inbound::Lagged(missed) => {
                warn!("Missed {} relay pushes, requesting full state", missed);
                if let Transport::Relayed(relay) = self.transport.clone() {
                    self.request_full_state(&relay);
                }
            }
        }
    }

    fn reconcile_on_activation(&mut self) {
        match self.transport.clone() {
            Transport::Direct(remote) => {
                info!("Fetching initial state");
                for entity in Entity::ALL {
                    self.fetch(&remote, entity);
                }
            }
            Transport::Relayed(relay) => {
                if relay.is_reachable() {
                    self.request_full_state(&relay);
                } else {
                    self.schedule_full_state_retry();
                }
            }
        }
    }

    fn refresh(&mut self) {
        match self.transport.clone() {
            Transport::Direct(remote) => {
                for entity in Entity::ALL {
                    self.fetch(&remote, entity);
                }
            }
            Transport::Relayed(relay) => {
                if relay.is_reachable() {
                    self.request_full_state(&relay);
                } else {
                    let e = SyncError::TransportUnreachable(RELAY_PEER.to_string());
                    self.store
                        .record_error(None, format!("Failed to refresh: {}", e));
                }
            }
        }
    }

    fn poll(&mut self) {
        if let Transport::Direct(remote) = self.transport.clone() {
            debug!("Polling entity state");
            for entity in Entity::ALL {
                self.fetch(&remote, entity);
            }
        }
    }

    fn fetch(&mut self, remote: &Arc<dyn RemoteStateClient>, entity: Entity) {
        if let Some(slot) = self.slots.get(&entity) {
            debug!("Skipping fetch for {}: {:?} in flight", entity, slot);
            return;
        }
        self.slots.insert(entity, Slot::Fetching { toggle_held: false });

        let remote = remote.clone();
        self.spawn_request(async move {
            let result = remote.fetch_state(entity.sensor_id()).await;
            Completion::Fetched {
                requested: entity,
                result,
            }
        });
    }

    fn request_full_state(&mut self, relay: &Arc<dyn RelayChannel>) {
        if self.full_state_in_flight {
            // The in-flight reply may predate whatever prompted this call
            debug!("Initial state request already in flight, deferring another");
            self.full_state_wanted = true;
            return;
        }
        self.full_state_in_flight = true;
        self.full_state_generation += 1;
        info!("Requesting initial state from companion");

        let relay = relay.clone();
        let timeout = self.settings.relay_timeout;
        self.spawn_request(async move {
            let result = relay
                .request(RelayRequest::query(Query::InitialState), timeout)
                .await
                .and_then(|reply| FullState::from_value(&reply));
            Completion::FullState { result }
        });
    }

    fn schedule_full_state_retry(&mut self) {
        let generation = self.full_state_generation;
        let delay = self.settings.relay_retry_delay;
        info!("Relay not reachable, retrying initial state in {:?}", delay);
        self.spawn_request(async move {
            tokio::time::sleep(delay).await;
            Completion::RetryFullState { generation }
        });
    }

    fn dispatch_command(&mut self, entity: Entity) {
        match self.slots.get_mut(&entity) {
            Some(Slot::Fetching { toggle_held }) => {
                debug!("Holding intent for {} until its fetch resolves", entity);
                *toggle_held = true;
                return;
            }
            Some(Slot::AwaitingReply) => {
                debug!("Dropping intent for {}: command in flight", entity);
                return;
            }
            None => {}
        }
        let desired = !self.store.closed_or_off(entity);

        match self.transport.clone() {
            Transport::Direct(remote) => {
                info!(
                    "Sending command to {} (closed_or_off: {})",
                    entity.command_id(),
                    desired
                );
                self.begin_command(entity);
                self.spawn_request(async move {
                    let result = remote
                        .invoke_command(entity.command_id(), desired)
                        .await
                        .map(Some);
                    Completion::Command { entity, result }
                });
            }
            Transport::Relayed(relay) => {
                if !relay.is_reachable() {
                    warn!("Relay is not reachable. Command for {} not sent.", entity);
                    let e = SyncError::TransportUnreachable(RELAY_PEER.to_string());
                    let message =
                        format!("Failed to send command to {}: {}", entity.command_id(), e);
                    self.store
                        .apply_command_outcome(entity, CommandStatus::Failure, Some(message));
                    return;
                }
                info!(
                    "Relaying command to {} (closed_or_off: {})",
                    entity.command_id(),
                    desired
                );
                self.begin_command(entity);
                let timeout = self.settings.relay_timeout;
                let preflight = self.settings.preflight;
                self.spawn_request(async move {
                    let result = relay_command(relay, entity, desired, timeout, preflight).await;
                    Completion::Command { entity, result }
                });
            }
        }
    }

    fn begin_command(&mut self, entity: Entity) {
        self.slots.insert(entity, Slot::AwaitingReply);
        self.store
            .apply_command_outcome(entity, CommandStatus::Pending, None);
    }

    /// Apply a reply, correlated by the id it carries rather than by which
    /// request produced it.
    fn apply_reply_state(&mut self, state: &EntityState) {
        match Entity::from_id(&state.id) {
            Some(entity) => self.store.apply_entity_update(entity, state.closed_or_off),
            None => warn!("Ignoring reply for unknown entity {}", state.id),
        }
    }

    /// Overwrites all three entities, including any with a command in flight.
    fn apply_full_state(&mut self, full: FullState) {
        for entity in Entity::ALL {
            self.store.apply_entity_update(entity, full.get(entity));
        }
    }

    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let completion = request.await;
            // Dropped receiver means the controller has stopped
            let _ = tx.send(completion);
        });
    }
}

/// Optional preflight checks, then the command itself.
///
/// A preflight `false` is terminal for this command; nothing is retried.
async fn relay_command(
    relay: Arc<dyn RelayChannel>,
    entity: Entity,
    closed_or_off: bool,
    timeout: Duration,
    preflight: bool,
) -> Result<Option<EntityState>> {
    if preflight {
        let checks = [
            (Query::AppStatus, "companion app is not running"),
            (
                Query::WebSocketStatus,
                "companion is not connected to the remote service",
            ),
        ];
        for (query, failure) in checks {
            let reply = relay.request(RelayRequest::query(query), timeout).await?;
            if !status_flag(&reply, query)? {
                return Err(SyncError::RemoteRejected(failure.to_string()));
            }
        }
    }

    let ack = relay
        .request(RelayRequest::command(entity, closed_or_off), timeout)
        .await?;
    debug!("Received reply from companion: {}", ack);

    // An ack may echo the new state; otherwise the push that follows carries it
    match PushMessage::parse(&ack) {
        Ok(PushMessage::Delta {
            entity_id,
            closed_or_off,
        }) if Entity::from_id(&entity_id) == Some(entity) => Ok(Some(EntityState {
            id: entity_id,
            closed_or_off,
        })),
        _ => Ok(None),
    }
}

async fn next_reachability(rx: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    if receiver.changed().await.is_err() {
        *rx = None;
        return std::future::pending().await;
    }
    let reachable = *receiver.borrow_and_update();
    reachable
}

async fn next_inbound(rx: &mut Option<broadcast::Receiver<Value>>) -> Inbound {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(value) => Inbound::Message(value),
        Err(broadcast::error::RecvError::Lagged(missed)) => Inbound::Lagged(missed),
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            std::future::pending().await
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_poll(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

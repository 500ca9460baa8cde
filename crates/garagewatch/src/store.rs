//! Local mirror of the three entities plus last command outcome and error.
//!
//! The store is owned by the controller loop, which is the only writer.
//! Every mutation publishes a fresh [`Snapshot`] on a watch channel, so the
//! presentation side is pushed new values instead of polling.

use std::collections::BTreeSet;
use std::time::Duration;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use crate::entity::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Success,
    Failure,
}

/// Outcome of the most recently dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastCommand {
    pub entity: Entity,
    pub status: CommandStatus,
}

/// Transient error shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Entity the error is about, if any.
    pub entity: Option<Entity>,
    pub occurred_at: SystemTime,
}

/// Immutable view published to the presentation side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub left_door_closed: bool,
    pub right_door_closed: bool,
    pub alarm_off: bool,
    pub last_command: Option<LastCommand>,
    /// Entities with a command in flight. Controls for these should be
    /// disabled until the reply arrives.
    pub awaiting_reply: BTreeSet<Entity>,
    pub error: Option<ErrorRecord>,
    /// `None` when operating in direct mode.
    pub relay_reachable: Option<bool>,
}

impl Snapshot {
    pub fn closed_or_off(&self, entity: Entity) -> bool {
        match entity {
            Entity::LeftDoor => self.left_door_closed,
            Entity::RightDoor => self.right_door_closed,
            Entity::Alarm => self.alarm_off,
        }
    }

    fn set(&mut self, entity: Entity, closed_or_off: bool) {
        match entity {
            Entity::LeftDoor => self.left_door_closed = closed_or_off,
            Entity::RightDoor => self.right_door_closed = closed_or_off,
            Entity::Alarm => self.alarm_off = closed_or_off,
        }
    }
}

impl Default for Snapshot {
    /// Everything starts closed/off until the first successful fetch.
    fn default() -> Self {
        Self {
            left_door_closed: true,
            right_door_closed: true,
            alarm_off: true,
            last_command: None,
            awaiting_reply: BTreeSet::new(),
            error: None,
            relay_reachable: None,
        }
    }
}

pub struct EntityStateStore {
    current: Snapshot,
    publisher: watch::Sender<Snapshot>,
    error_display: Duration,
    error_deadline: Option<Instant>,
}

impl EntityStateStore {
    pub fn new(error_display: Duration) -> Self {
        let (publisher, _) = watch::channel(Snapshot::default());
        Self {
            current: Snapshot::default(),
            publisher,
            error_display,
            error_deadline: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.current
    }

    pub fn closed_or_off(&self, entity: Entity) -> bool {
        self.current.closed_or_off(entity)
    }

    pub fn apply_entity_update(&mut self, entity: Entity, closed_or_off: bool) {
        let previous = self.current.closed_or_off(entity);
        debug!(
            "Updating {} (current: {}, new: {})",
            entity, previous, closed_or_off
        );
        self.current.set(entity, closed_or_off);
        if self
            .current
            .error
            .as_ref()
            .is_some_and(|e| e.entity == Some(entity))
        {
            self.clear_error();
        }
        self.publish();
    }

    pub fn apply_command_outcome(
        &mut self,
        entity: Entity,
        status: CommandStatus,
        error: Option<String>,
    ) {
        self.current.last_command = Some(LastCommand { entity, status });
        match status {
            CommandStatus::Pending => {
                self.current.awaiting_reply.insert(entity);
            }
            CommandStatus::Success => {
                self.current.awaiting_reply.remove(&entity);
                self.clear_error();
            }
            CommandStatus::Failure => {
                self.current.awaiting_reply.remove(&entity);
            }
        }
        match error {
            Some(message) => self.record_error(Some(entity), message),
            None => self.publish(),
        }
    }

    /// Record an error that is not tied to a command outcome.
    pub fn record_error(&mut self, entity: Option<Entity>, message: String) {
        info!("Displaying error: {}", message);
        self.current.error = Some(ErrorRecord {
            message,
            entity,
            occurred_at: SystemTime::now(),
        });
        self.error_deadline = Some(Instant::now() + self.error_display);
        self.publish();
    }

    pub fn set_relay_reachable(&mut self, reachable: bool) {
        self.current.relay_reachable = Some(reachable);
        self.publish();
    }

    /// When the current error should disappear.
    pub fn error_deadline(&self) -> Option<Instant> {
        self.error_deadline
    }

    /// Clear the error if its display window has elapsed.
    pub fn expire_error(&mut self) {
        match self.error_deadline {
            Some(deadline) if Instant::now() >= deadline => {
                debug!("Error display window elapsed");
                self.clear_error();
                self.publish();
            }
            _ => {}
        }
    }

    fn clear_error(&mut self) {
        self.current.error = None;
        self.error_deadline = None;
    }

    fn publish(&self) {
        self.publisher.send_replace(self.current.clone());
    }
}

//! Companion-device relay: the path used in relayed mode.
//!
//! The relay peer answers requests and also pushes state unprompted, either
//! as a full snapshot of all three entities or as a single-entity delta.

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "transport_mqtt")]
mod mqtt;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::watch;

use crate::entity::parse_state;
use crate::entity::state_string;
use crate::entity::Entity;
use crate::error::Result;
use crate::error::SyncError;

#[cfg(feature = "transport_mqtt")]
pub use mqtt::MqttClient;
#[cfg(feature = "transport_mqtt")]
pub use mqtt::MqttMessage;
#[cfg(feature = "transport_mqtt")]
pub use mqtt::MqttRelay;
#[cfg(feature = "transport_mqtt")]
pub use mqtt::RumqttcClient;

/// Message transport to the paired companion device.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Reachability of the peer. The receiver is only notified when the
    /// value actually changes.
    fn reachability(&self) -> watch::Receiver<bool>;

    fn is_reachable(&self) -> bool {
        *self.reachability().borrow()
    }

    /// Messages the peer sends unprompted.
    fn inbound(&self) -> broadcast::Receiver<Value>;

    /// Send a request and wait for its reply.
    ///
    /// Fails instead of hanging when the peer does not answer within
    /// `timeout` or becomes unreachable while the request is in flight.
    async fn request(&self, payload: RelayRequest, timeout: Duration) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Query {
    InitialState,
    /// Is the companion app running?
    AppStatus,
    /// Is the companion connected to the remote service?
    WebSocketStatus,
}

impl Query {
    /// Key holding the boolean answer in a status reply.
    pub fn reply_key(self) -> &'static str {
        match self {
            Query::InitialState => "initialState",
            Query::AppStatus => "appStatus",
            Query::WebSocketStatus => "webSocketStatus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RelayRequest {
    Query {
        request: Query,
    },
    Command {
        #[serde(rename = "entityId")]
        entity_id: String,
        #[serde(rename = "newState")]
        new_state: String,
    },
}

impl RelayRequest {
    pub fn query(query: Query) -> Self {
        RelayRequest::Query { request: query }
    }

    pub fn command(entity: Entity, closed_or_off: bool) -> Self {
        RelayRequest::Command {
            entity_id: entity.command_id().to_string(),
            new_state: state_string(closed_or_off).to_string(),
        }
    }
}

/// All three entities at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullState {
    pub left_door_closed: bool,
    pub right_door_closed: bool,
    pub alarm_off: bool,
}

impl FullState {
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(FullState::deserialize(value)?)
    }

    pub fn get(&self, entity: Entity) -> bool {
        match entity {
            Entity::LeftDoor => self.left_door_closed,
            Entity::RightDoor => self.right_door_closed,
            Entity::Alarm => self.alarm_off,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    Snapshot(FullState),
    Delta {
        entity_id: String,
        closed_or_off: bool,
    },
}

const SNAPSHOT_KEYS: [&str; 3] = ["leftDoorClosed", "rightDoorClosed", "alarmOff"];

impl PushMessage {
    pub fn parse(value: &Value) -> Result<Self> {
        let entity_id = value.get("entityId").and_then(Value::as_str);
        let new_state = value.get("newState").and_then(Value::as_str);
        if let (Some(entity_id), Some(new_state)) = (entity_id, new_state) {
            return Ok(PushMessage::Delta {
                entity_id: entity_id.to_string(),
                closed_or_off: parse_state(entity_id, new_state)?,
            });
        }

        if SNAPSHOT_KEYS.iter().any(|k| value.get(k).is_some()) {
            return FullState::from_value(value).map(PushMessage::Snapshot);
        }

        Err(SyncError::MalformedReply(format!(
            "unrecognized relay message: {}",
            value
        )))
    }
}

/// Resolves once `reachability` reads `false`.
#[cfg(any(test, feature = "transport_mqtt"))]
pub(crate) async fn wait_unreachable(reachability: &mut watch::Receiver<bool>) {
    // A closed channel also counts as unreachable
    let _ = reachability.wait_for(|reachable| !*reachable).await;
}

/// Read the boolean answer to a status query.
pub fn status_flag(reply: &Value, query: Query) -> Result<bool> {
    reply
        .get(query.reply_key())
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            SyncError::MalformedReply(format!("missing '{}' in reply", query.reply_key()))
        })
}

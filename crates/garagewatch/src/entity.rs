//! The three entities mirrored by the watch and the boundary between raw
//! remote state strings and the `closed_or_off` boolean.

use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumString;

use crate::error::SyncError;

/// One of the three monitored and controlled things.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    LeftDoor,
    RightDoor,
    Alarm,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::LeftDoor, Entity::RightDoor, Entity::Alarm];

    /// Sensor used on the read path.
    pub fn sensor_id(self) -> &'static str {
        match self {
            Entity::LeftDoor => "binary_sensor.left_door_sensor",
            Entity::RightDoor => "binary_sensor.right_door_sensor",
            Entity::Alarm => "binary_sensor.alarm_sensor",
        }
    }

    /// Switch used on the command path.
    pub fn command_id(self) -> &'static str {
        match self {
            Entity::LeftDoor => "switch.left_garage_door",
            Entity::RightDoor => "switch.right_garage_door",
            Entity::Alarm => "switch.alarm",
        }
    }

    /// Resolve either a sensor or a command id.
    pub fn from_id(id: &str) -> Option<Entity> {
        Entity::ALL
            .into_iter()
            .find(|e| e.sensor_id() == id || e.command_id() == id)
    }

    pub fn label(self) -> &'static str {
        match self {
            Entity::LeftDoor => "Left Door",
            Entity::RightDoor => "Right Door",
            Entity::Alarm => "Alarm",
        }
    }
}

/// State of a single entity as reported by a transport.
///
/// `closed_or_off` is `true` when a door is closed or the alarm is off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    pub id: String,
    pub closed_or_off: bool,
}

impl EntityState {
    /// Build from a raw `"on"`/`"off"` state string.
    pub fn from_raw(id: impl Into<String>, raw: &str) -> Result<Self, SyncError> {
        let id = id.into();
        let closed_or_off = parse_state(&id, raw)?;
        Ok(Self { id, closed_or_off })
    }
}

/// `"off"` means closed (doors) or off (alarm), uniformly for every entity.
pub fn parse_state(entity_id: &str, raw: &str) -> Result<bool, SyncError> {
    match raw {
        "off" => Ok(true),
        "on" => Ok(false),
        other => Err(SyncError::MalformedReply(format!(
            "unexpected state '{}' for {}",
            other, entity_id
        ))),
    }
}

pub fn state_string(closed_or_off: bool) -> &'static str {
    if closed_or_off {
        "off"
    } else {
        "on"
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_from_id_accepts_sensor_and_command_ids() {
        assert_eq!(
            Entity::from_id("binary_sensor.left_door_sensor"),
            Some(Entity::LeftDoor)
        );
        assert_eq!(
            Entity::from_id("switch.right_garage_door"),
            Some(Entity::RightDoor)
        );
        assert_eq!(Entity::from_id("switch.alarm"), Some(Entity::Alarm));
        assert_eq!(Entity::from_id("script.toggle_left_door"), None);
    }

    #[test]
    fn test_off_means_closed_for_every_entity() {
        for entity in Entity::ALL {
            assert!(parse_state(entity.sensor_id(), "off").unwrap());
            assert!(!parse_state(entity.sensor_id(), "on").unwrap());
        }
    }

    #[test]
    fn test_unknown_state_is_malformed() {
        let err = EntityState::from_raw("binary_sensor.alarm_sensor", "unavailable").unwrap_err();
        assert!(matches!(err, SyncError::MalformedReply(_)));
    }

    #[test]
    fn test_path_names() {
        assert_eq!(Entity::LeftDoor.to_string(), "left_door");
        assert_eq!(Entity::from_str("alarm").unwrap(), Entity::Alarm);
        assert!(Entity::from_str("garage").is_err());
    }

    #[test]
    fn test_state_string_inverts_parse() {
        assert_eq!(state_string(true), "off");
        assert_eq!(state_string(false), "on");
    }
}

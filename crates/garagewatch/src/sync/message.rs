//! Messages flowing into the controller loop.
//!
//! Split by origin so the loop can tell user intents apart from transport
//! replies, which are produced on background tasks and marshaled back here.

use tokio::sync::oneshot;

use crate::entity::Entity;
use crate::entity::EntityState;
use crate::error::Result;
use crate::relay::FullState;
use crate::store::Snapshot;

/// Messages FROM handles TO the controller
#[derive(Debug)]
pub(super) enum Intent {
    /// Flip an entity to the opposite of its mirrored value
    Toggle(Entity),

    /// Re-run full-state reconciliation
    Refresh,

    /// Answer with the store's snapshot once every earlier intent is handled
    Current(oneshot::Sender<Snapshot>),
}

/// Replies FROM transport tasks TO the controller
#[derive(Debug)]
pub(super) enum Completion {
    /// Direct-mode fetch of a single entity
    Fetched {
        requested: Entity,
        result: Result<EntityState>,
    },

    /// Relayed-mode full state request
    FullState { result: Result<FullState> },

    /// Command outcome. `Ok(None)` is an acknowledgement without state.
    Command {
        entity: Entity,
        result: Result<Option<EntityState>>,
    },

    /// Delayed retry of a full state request that found the relay unreachable
    RetryFullState { generation: u64 },
}

//! Direct-mode access to the remote service.

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "transport_rest")]
mod rest;

use async_trait::async_trait;

use crate::entity::EntityState;
use crate::error::Result;

#[cfg(feature = "transport_rest")]
pub use rest::HassRestClient;

/// Fetches and changes entity state on the remote service.
///
/// Calls are single-shot with no retry. Replies carry the entity id they
/// describe, and callers must correlate on that id rather than call order.
#[async_trait]
pub trait RemoteStateClient: Send + Sync {
    async fn fetch_state(&self, entity_id: &str) -> Result<EntityState>;

    /// Drive `entity_id` to the given value and report the resulting state.
    async fn invoke_command(&self, entity_id: &str, closed_or_off: bool) -> Result<EntityState>;
}

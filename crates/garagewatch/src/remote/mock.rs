//! Scriptable RemoteStateClient for tests.
//!
//! Every call is forwarded to the test as a [`RemoteCall`], which decides
//! when and how to answer it. This lets tests resolve overlapping requests
//! in any order.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use super::RemoteStateClient;
use crate::entity::EntityState;
use crate::error::Result;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Fetch,
    Command { closed_or_off: bool },
}

#[derive(Debug)]
pub(crate) struct RemoteCall {
    pub entity_id: String,
    pub kind: CallKind,
    reply: oneshot::Sender<Result<EntityState>>,
}

impl RemoteCall {
    pub fn reply(self, result: Result<EntityState>) {
        let _ = self.reply.send(result);
    }

    /// Answer with a raw `"on"`/`"off"` state for the given id.
    pub fn reply_raw(self, id: &str, raw: &str) {
        let state = EntityState::from_raw(id, raw);
        self.reply(state);
    }
}

pub(crate) struct MockRemote {
    calls: mpsc::UnboundedSender<RemoteCall>,
}

impl MockRemote {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }

    async fn call(&self, entity_id: &str, kind: CallKind) -> Result<EntityState> {
        let (reply, rx) = oneshot::channel();
        let call = RemoteCall {
            entity_id: entity_id.to_string(),
            kind,
            reply,
        };
        self.calls
            .send(call)
            .map_err(|_| SyncError::TransportUnreachable("mock remote".into()))?;
        rx.await
            .map_err(|_| SyncError::TransportUnreachable("mock remote".into()))?
    }
}

#[async_trait]
impl RemoteStateClient for MockRemote {
    async fn fetch_state(&self, entity_id: &str) -> Result<EntityState> {
        self.call(entity_id, CallKind::Fetch).await
    }

    async fn invoke_command(&self, entity_id: &str, closed_or_off: bool) -> Result<EntityState> {
        self.call(entity_id, CallKind::Command { closed_or_off })
            .await
    }
}

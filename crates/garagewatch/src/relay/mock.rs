//! Scriptable RelayChannel for tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use super::wait_unreachable;
use super::RelayChannel;
use super::RelayRequest;
use crate::error::Result;
use crate::error::SyncError;

#[derive(Debug)]
pub(crate) struct RelayCall {
    pub payload: RelayRequest,
    reply: oneshot::Sender<Result<Value>>,
}

impl RelayCall {
    pub fn reply(self, result: Result<Value>) {
        let _ = self.reply.send(result);
    }

    pub fn reply_ok(self, value: Value) {
        self.reply(Ok(value));
    }
}

pub(crate) struct MockRelay {
    reachable: watch::Sender<bool>,
    inbound: broadcast::Sender<Value>,
    calls: mpsc::UnboundedSender<RelayCall>,
}

/// Test side of a [`MockRelay`].
pub(crate) struct RelayPeer {
    pub reachable: watch::Sender<bool>,
    pub inbound: broadcast::Sender<Value>,
    pub calls: mpsc::UnboundedReceiver<RelayCall>,
}

impl RelayPeer {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_if_modified(|current| {
            let changed = *current != reachable;
            *current = reachable;
            changed
        });
    }

    pub fn push(&self, value: Value) {
        let _ = self.inbound.send(value);
    }
}

impl MockRelay {
    pub fn new(reachable: bool) -> (Self, RelayPeer) {
        let (reachable_tx, _) = watch::channel(reachable);
        let (inbound, _) = broadcast::channel(16);
        let (calls, calls_rx) = mpsc::unbounded_channel();
        let relay = Self {
            reachable: reachable_tx.clone(),
            inbound: inbound.clone(),
            calls,
        };
        let peer = RelayPeer {
            reachable: reachable_tx,
            inbound,
            calls: calls_rx,
        };
        (relay, peer)
    }
}

#[async_trait]
impl RelayChannel for MockRelay {
    fn reachability(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }

    fn inbound(&self) -> broadcast::Receiver<Value> {
        self.inbound.subscribe()
    }

    async fn request(&self, payload: RelayRequest, timeout: Duration) -> Result<Value> {
        let mut reachability = self.reachable.subscribe();
        if !*reachability.borrow_and_update() {
            return Err(SyncError::TransportUnreachable("mock relay".into()));
        }
        let (reply, rx) = oneshot::channel();
        self.calls
            .send(RelayCall { payload, reply })
            .map_err(|_| SyncError::TransportUnreachable("mock relay".into()))?;
        tokio::select! {
            reply = rx => {
                reply.unwrap_or_else(|_| Err(SyncError::TransportUnreachable("mock relay".into())))
            }
            () = wait_unreachable(&mut reachability) => {
                Err(SyncError::TransportUnreachable("mock relay".into()))
            }
            () = tokio::time::sleep(timeout) => Err(SyncError::RequestTimeout(timeout)),
        }
    }
}

//! RelayChannel over an MQTT broker shared with the companion device.
//!
//! Topics, relative to the configured prefix:
//! - `status`: retained `online`/`offline` published by the companion
//! - `push`: unprompted snapshots and deltas
//! - `request`: `{"id", "replyTo", "payload"}` published by us
//! - `reply/<client_id>`: `{"id", "payload"}` or `{"id", "error"}` from the companion

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::wait_unreachable;
use super::RelayChannel;
use super::RelayRequest;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::error::SyncError;

/// How long the pump holds the client lock per poll, so publishers get a turn.
const POLL_SLICE: Duration = Duration::from_millis(100);

const INBOUND_CAPACITY: usize = 64;

const PEER: &str = "companion device";

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    #[allow(dead_code)]
    pub retain: bool,
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the MQTT broker
    async fn connect(&mut self) -> std::result::Result<(), Box<dyn Error + Send>>;

    /// Subscribe to an MQTT topic
    async fn subscribe(&mut self, topic: &str) -> std::result::Result<(), Box<dyn Error + Send>>;

    /// Publish a message to an MQTT topic
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> std::result::Result<(), Box<dyn Error + Send>>;

    /// Wait for the next message from subscribed topics
    ///
    /// Returns None once the client has stopped for good
    async fn poll_message(&mut self) -> Option<MqttMessage>;
}

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Message receiver (created in connect())
    message_rx: Option<mpsc::UnboundedReceiver<MqttMessage>>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    pub fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Ok(Self {
            mqtt_options,
            client: None,
            message_rx: None,
            event_loop_task: None,
        })
    }

    fn connected(&self) -> std::result::Result<&AsyncClient, Box<dyn Error + Send>> {
        self.client.as_ref().ok_or_else(|| -> Box<dyn Error + Send> {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "MQTT client not connected. Call connect() first.",
            ))
        })
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> std::result::Result<(), Box<dyn Error + Send>> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT event loop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.message_rx = Some(message_rx);
        self.event_loop_task = Some(task);

        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> std::result::Result<(), Box<dyn Error + Send>> {
        self.connected()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send>)
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> std::result::Result<(), Box<dyn Error + Send>> {
        self.connected()?
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send>)
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        match &mut self.message_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone)]
struct Topics {
    status: String,
    push: String,
    request: String,
    reply: String,
}

impl Topics {
    fn new(config: &RelayConfig) -> Self {
        let prefix = config.topic_prefix.trim_end_matches('/');
        Self {
            status: format!("{}/status", prefix),
            push: format!("{}/push", prefix),
            request: format!("{}/request", prefix),
            reply: format!("{}/reply/{}", prefix, config.client_id),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestEnvelope<'a> {
    id: u64,
    reply_to: &'a str,
    payload: &'a RelayRequest,
}

#[derive(Deserialize)]
struct ReplyEnvelope {
    id: u64,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

type Waiter = oneshot::Sender<Result<Value>>;
type PendingMap = Arc<std::sync::Mutex<HashMap<u64, Waiter>>>;

pub struct MqttRelay<C: MqttClient> {
    client: Arc<Mutex<C>>,
    topics: Topics,
    reachable: watch::Sender<bool>,
    inbound: broadcast::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicU64,
    pump_task: JoinHandle<()>,
}

impl<C: MqttClient + 'static> MqttRelay<C> {
    /// Connect, subscribe to the companion's topics and start routing
    /// incoming messages.
    pub async fn start(mut client: C, config: &RelayConfig) -> anyhow::Result<Self> {
        let topics = Topics::new(config);

        info!(
            "Connecting to MQTT broker at {}:{}",
            config.broker, config.port
        );
        client
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Failed to connect to MQTT broker")?;
        for topic in [&topics.status, &topics.push, &topics.reply] {
            client
                .subscribe(topic)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("Failed to subscribe to {}", topic))?;
        }
        info!("Subscribed to relay topics under {}", config.topic_prefix);

        let client = Arc::new(Mutex::new(client));
        let (reachable, _) = watch::channel(false);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let pending: PendingMap = Arc::default();

        let pump_task = tokio::spawn(Self::pump(
            client.clone(),
            topics.clone(),
            reachable.clone(),
            inbound.clone(),
            pending.clone(),
        ));

        Ok(Self {
            client,
            topics,
            reachable,
            inbound,
            pending,
            next_id: AtomicU64::new(1),
            pump_task,
        })
    }

    async fn pump(
        client: Arc<Mutex<C>>,
        topics: Topics,
        reachable: watch::Sender<bool>,
        inbound: broadcast::Sender<Value>,
        pending: PendingMap,
    ) {
        loop {
            let polled = {
                let mut guard = client.lock().await;
                tokio::time::timeout(POLL_SLICE, guard.poll_message()).await
            };

            let msg = match polled {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("MQTT message stream closed, relay is no longer reachable");
                    reachable.send_if_modified(|current| std::mem::replace(current, false));
                    break;
                }
                Err(_) => continue,
            };

            if msg.topic == topics.status {
                Self::handle_status(&msg, &reachable);
            } else if msg.topic == topics.push {
                match serde_json::from_slice::<Value>(&msg.payload) {
                    Ok(value) => {
                        debug!("Relay push: {}", value);
                        // No receivers is fine: nobody is listening yet
                        let _ = inbound.send(value);
                    }
                    Err(e) => warn!("Discarding undecodable relay push: {}", e),
                }
            } else if msg.topic == topics.reply {
                Self::handle_reply(&msg, &pending);
            } else {
                debug!("Ignoring message on {}", msg.topic);
            }
        }
    }

    fn handle_status(msg: &MqttMessage, reachable: &watch::Sender<bool>) {
        let now_reachable = match msg.payload.as_slice() {
            b"online" => true,
            b"offline" => false,
            other => {
                warn!(
                    "Unexpected relay status payload: {}",
                    String::from_utf8_lossy(other)
                );
                return;
            }
        };
        let changed = reachable.send_if_modified(|current| {
            let changed = *current != now_reachable;
            *current = now_reachable;
            changed
        });
        if changed {
            info!("Relay reachability changed. Is now reachable: {}", now_reachable);
        }
    }

    fn handle_reply(msg: &MqttMessage, pending: &PendingMap) {
        let envelope: ReplyEnvelope = match serde_json::from_slice(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Discarding undecodable relay reply: {}", e);
                return;
            }
        };

        let waiter = lock_pending(pending).remove(&envelope.id);
        let Some(waiter) = waiter else {
            debug!("Reply {} has no waiting request (late or duplicate)", envelope.id);
            return;
        };

        let result = match (envelope.error, envelope.payload) {
            (Some(error), _) => Err(SyncError::RemoteRejected(error)),
            (None, Some(payload)) => Ok(payload),
            (None, None) => Err(SyncError::MalformedReply(format!(
                "reply {} has neither payload nor error",
                envelope.id
            ))),
        };
        let _ = waiter.send(result);
    }

    fn forget(&self, id: u64) {
        lock_pending(&self.pending).remove(&id);
    }
}

impl<C: MqttClient> Drop for MqttRelay<C> {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

/// A panicked holder leaves the map consistent, so poisoning is ignored.
fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, Waiter>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl<C: MqttClient + 'static> RelayChannel for MqttRelay<C> {
    fn reachability(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }

    fn inbound(&self) -> broadcast::Receiver<Value> {
        self.inbound.subscribe()
    }

    async fn request(&self, payload: RelayRequest, timeout: Duration) -> Result<Value> {
        let mut reachability = self.reachable.subscribe();
        if !*reachability.borrow_and_update() {
            return Err(SyncError::TransportUnreachable(PEER.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&RequestEnvelope {
            id,
            reply_to: &self.topics.reply,
            payload: &payload,
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, reply_tx);

        debug!("Relay request {}: {:?}", id, payload);
        let published = {
            let mut client = self.client.lock().await;
            client.publish(&self.topics.request, &body, false).await
        };
        if let Err(e) = published {
            warn!("Failed to publish relay request {}: {}", id, e);
            self.forget(id);
            return Err(SyncError::TransportUnreachable(PEER.to_string()));
        }

        let outcome = tokio::select! {
            reply = reply_rx => {
                reply.unwrap_or_else(|_| Err(SyncError::TransportUnreachable(PEER.to_string())))
            }
            () = wait_unreachable(&mut reachability) => {
                Err(SyncError::TransportUnreachable(PEER.to_string()))
            }
            () = tokio::time::sleep(timeout) => Err(SyncError::RequestTimeout(timeout)),
        };

        self.forget(id);
        outcome
    }
}

/**
 * BUS CONNECTION - One MQTT session per feature context
 *
 * ROLE:
 * Opens the session to the fleet broker (raw TCP on the leader, or WebSocket
 * when a remote endpoint is configured), waits for the CONNACK within a bounded
 * handshake window, then pumps inbound PUBLISH packets into the owning
 * context's channel.
 *
 * RULES:
 * - No pooling: every context opens its own session with its own identity.
 * - No implicit queueing: publish/subscribe outside `Connected` fail at once.
 * - No automatic retry: a dropped session stays `Disconnected` until the owner
 *   calls `reconnect`, which replays the recorded subscriptions.
 */

use crate::config::SyncConfig;
use crate::error::{PublishError, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REQUEST_CAPACITY: usize = 10;
const DEFAULT_WS_PORT: u16 = 80;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEndpoint {
    Tcp { host: String, port: u16 },
    WebSocket { url: String },
}

impl BusEndpoint {
    /// `{leader}:9001` over TCP, or `ws://{remote}/` when a remote is configured.
    pub fn from_config(cfg: &SyncConfig) -> Self {
        match &cfg.remote {
            Some(remote) => BusEndpoint::WebSocket {
                url: format!("ws://{}/", remote.ws_url.trim_end_matches('/')),
            },
            None => BusEndpoint::Tcp {
                host: cfg.leader_address.clone(),
                port: cfg.mqtt_port,
            },
        }
    }

    fn mqtt_options(&self, identity: &Identity, keep_alive: Duration) -> MqttOptions {
        let mut opts = match self {
            BusEndpoint::Tcp { host, port } => MqttOptions::new(identity.as_str(), host, *port),
            BusEndpoint::WebSocket { url } => {
                let mut opts = MqttOptions::new(identity.as_str(), url, ws_port(url));
                opts.set_transport(Transport::Ws);
                opts
            }
        };
        opts.set_keep_alive(keep_alive);
        opts.set_clean_session(true);
        opts
    }
}

impl fmt::Display for BusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEndpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            BusEndpoint::WebSocket { url } => f.write_str(url),
        }
    }
}

fn ws_port(url: &str) -> u16 {
    let authority = url
        .trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap_or_default();
    authority
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(DEFAULT_WS_PORT)
}

/// Client id: a per-context base plus a random suffix. Collisions are unlikely,
/// not impossible; there is no registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    base: String,
    value: String,
}

impl Identity {
    pub fn for_context(base: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            base: base.to_string(),
            value: format!("{base}_{}", &suffix[..8]),
        }
    }

    /// Same base, fresh suffix.
    pub fn regenerate(&self) -> Self {
        Self::for_context(&self.base)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    /// First handshake in progress. `BusConnection` never reports it: `connect`
    /// resolves only after the CONNACK and `reconnect` reports `Reconnecting`.
    /// Other `BusPublisher` implementations may.
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub keep_alive: Duration,
    pub handshake_timeout: Duration,
}

impl BusOptions {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            keep_alive: cfg.keep_alive(),
            handshake_timeout: cfg.handshake_timeout(),
        }
    }
}

impl Default for BusOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publishing seam used by the dispatcher, so it can run against a stub bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;

    fn state(&self) -> ConnectionState;
}

#[derive(Debug, Clone, Copy)]
struct Session {
    state: ConnectionState,
    generation: u64,
    rejected_subscriptions: usize,
}

pub struct BusConnection {
    identity: Mutex<Identity>,
    endpoint: Mutex<BusEndpoint>,
    options: BusOptions,
    client: Mutex<AsyncClient>,
    session: Arc<Mutex<Session>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    inbound: mpsc::Sender<InboundMessage>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BusConnection {
    /// Opens one session and waits for the broker's CONNACK. Inbound publishes
    /// are forwarded to `inbound` in bus order.
    pub async fn connect(
        endpoint: BusEndpoint,
        identity: Identity,
        options: BusOptions,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self, TransportError> {
        info!(%endpoint, %identity, "connecting to bus");
        let (client, eventloop) = handshake(&endpoint, &identity, &options).await?;
        let session = Arc::new(Mutex::new(Session {
            state: ConnectionState::Connected,
            generation: 0,
            rejected_subscriptions: 0,
        }));
        let pump = spawn_pump(eventloop, session.clone(), 0, inbound.clone());
        info!(%endpoint, %identity, "bus connected");

        Ok(Self {
            identity: Mutex::new(identity),
            endpoint: Mutex::new(endpoint),
            options,
            client: Mutex::new(client),
            session,
            subscriptions: Mutex::new(Vec::new()),
            inbound,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity.lock().clone()
    }

    pub fn endpoint(&self) -> BusEndpoint {
        self.endpoint.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.lock().state
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }

    /// Filters the broker refused in a SUBACK. `subscribe` returns as soon as
    /// the request is queued, so a refusal only shows up here and in the log.
    pub fn rejected_subscriptions(&self) -> usize {
        self.session.lock().rejected_subscriptions
    }

    fn ensure_connected(&self) -> Result<(), PublishError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(PublishError::NotConnected { state }),
        }
    }

    pub async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), PublishError> {
        self.ensure_connected()?;
        let client = self.client.lock().clone();
        client.subscribe(pattern, qos).await?;
        {
            let mut subs = self.subscriptions.lock();
            subs.retain(|(p, _)| p != pattern);
            subs.push((pattern.to_string(), qos));
        }
        debug!(pattern, ?qos, "subscribed");
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        self.ensure_connected()?;
        let client = self.client.lock().clone();
        client.publish(topic, qos, false, payload).await?;
        debug!(topic, ?qos, "published");
        Ok(())
    }

    /// Replaces the session with a fresh one against `endpoint`, then replays
    /// every recorded subscription. Only ever called by the owner.
    pub async fn reconnect(&self, endpoint: BusEndpoint) -> Result<(), TransportError> {
        let generation = {
            let mut session = self.session.lock();
            session.state = ConnectionState::Reconnecting;
            session.generation += 1;
            session.generation
        };
        self.stop_pump();
        let old_client = self.client.lock().clone();
        if let Err(e) = old_client.try_disconnect() {
            debug!(error = %e, "previous session already closed");
        }

        let identity = self.identity.lock().regenerate();
        info!(%endpoint, %identity, "reconnecting to bus");
        let (client, eventloop) = match handshake(&endpoint, &identity, &self.options).await {
            Ok(pair) => pair,
            Err(e) => {
                self.mark(generation, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self.client.lock() = client.clone();
        *self.identity.lock() = identity;
        *self.endpoint.lock() = endpoint.clone();
        self.mark(generation, ConnectionState::Connected);
        *self.pump.lock() = Some(spawn_pump(
            eventloop,
            self.session.clone(),
            generation,
            self.inbound.clone(),
        ));

        for (pattern, qos) in self.subscriptions() {
            client
                .subscribe(pattern.as_str(), qos)
                .await
                .map_err(|_| TransportError::Closed {
                    endpoint: endpoint.to_string(),
                })?;
        }
        info!(%endpoint, "bus reconnected");
        Ok(())
    }

    pub async fn disconnect(&self) {
        let client = self.client.lock().clone();
        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "disconnect on closed session");
        }
        // The pump stops on its own once DISCONNECT has gone out.
        let pump = self.pump.lock().take();
        if let Some(mut pump) = pump {
            if timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                debug!("pump still running after disconnect, aborting");
                pump.abort();
            }
        }
        self.session.lock().state = ConnectionState::Disconnected;
        info!(identity = %self.identity.lock(), "bus disconnected");
    }

    fn mark(&self, generation: u64, state: ConnectionState) {
        let mut session = self.session.lock();
        if session.generation == generation {
            session.state = state;
        }
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        self.stop_pump();
        let _ = self.client.lock().try_disconnect();
    }
}

#[async_trait]
impl BusPublisher for BusConnection {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        BusConnection::publish(self, topic, payload, qos).await
    }

    fn state(&self) -> ConnectionState {
        BusConnection::state(self)
    }
}

async fn handshake(
    endpoint: &BusEndpoint,
    identity: &Identity,
    options: &BusOptions,
) -> Result<(AsyncClient, EventLoop), TransportError> {
    let (client, mut eventloop) =
        AsyncClient::new(endpoint.mqtt_options(identity, options.keep_alive), REQUEST_CAPACITY);

    let wait_for_ack = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(TransportError::Refused {
                            endpoint: endpoint.to_string(),
                            identity: identity.to_string(),
                            code: ack.code,
                        })
                    };
                }
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(TransportError::Refused {
                        endpoint: endpoint.to_string(),
                        identity: identity.to_string(),
                        code,
                    });
                }
                Err(source) => {
                    return Err(TransportError::Unreachable {
                        endpoint: endpoint.to_string(),
                        source,
                    });
                }
            }
        }
    };

    let outcome = timeout(options.handshake_timeout, wait_for_ack).await;
    match outcome {
        Ok(Ok(())) => Ok((client, eventloop)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransportError::HandshakeTimeout {
            endpoint: endpoint.to_string(),
            timeout: options.handshake_timeout,
        }),
    }
}

fn spawn_pump(
    mut eventloop: EventLoop,
    session: Arc<Mutex<Session>>,
    generation: u64,
    inbound: mpsc::Sender<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let msg = InboundMessage {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    };
                    if inbound.send(msg).await.is_err() {
                        debug!("inbound receiver dropped, stopping pump");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let refused = ack
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count();
                    if refused > 0 {
                        warn!(pkid = ack.pkid, refused, "broker refused subscription");
                        session.lock().rejected_subscriptions += refused;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "bus session lost");
                    break;
                }
            }
        }
        let mut s = session.lock();
        if s.generation == generation {
            s.state = ConnectionState::Disconnected;
        }
    })
}

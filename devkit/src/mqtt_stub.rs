/*!
Mock bus session for tests without a broker.

Records every publish and lets tests push inbound messages into the context's
stream as if the broker had delivered them.
*/

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use pioreactor_sync::bus::{BusPublisher, ConnectionState, InboundMessage};
use pioreactor_sync::error::PublishError;
use rumqttc::QoS;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

pub struct MockBus {
    published: Mutex<Vec<MockMessage>>,
    state: Mutex<ConnectionState>,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MockBus {
    /// A connected session and the inbound stream to hand to the context.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let bus = Arc::new(Self {
            published: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Connected),
            inbound: Mutex::new(Some(tx)),
        });
        (bus, rx)
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Ends the inbound stream, as a dropped session would.
    pub fn close_inbound(&self) {
        self.inbound.lock().take();
    }

    pub async fn simulate_incoming(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let sender = self
            .inbound
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("inbound stream closed"))?;
        sender
            .send(InboundMessage {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .await
            .map_err(|e| anyhow::anyhow!("send error: {e}"))?;
        debug!(topic, "[mock] simulated incoming");
        Ok(())
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn last_json_message<T: DeserializeOwned>(&self, topic: &str) -> Result<Option<T>> {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BusPublisher for MockBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let state = *self.state.lock();
        if state != ConnectionState::Connected {
            return Err(PublishError::NotConnected { state });
        }
        debug!(topic, bytes = payload.len(), "[mock] published");
        self.published.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

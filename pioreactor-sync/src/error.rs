//! Error taxonomy shared by the bus, the REST collaborators and the decoders.

use crate::bus::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Connect / handshake failures. Never retried by the connection manager.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker at {endpoint} unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: rumqttc::ConnectionError,
    },

    #[error("broker at {endpoint} refused identity {identity}: {code:?}")]
    Refused {
        endpoint: String,
        identity: String,
        code: rumqttc::ConnectReturnCode,
    },

    #[error("handshake with {endpoint} timed out after {timeout:?}")]
    HandshakeTimeout { endpoint: String, timeout: Duration },

    #[error("session to {endpoint} closed during handshake")]
    Closed { endpoint: String },
}

/// Publish or subscribe requests against a session.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bus session is {state:?}, not connected")]
    NotConnected { state: ConnectionState },

    #[error("broker client rejected request: {0}")]
    Rejected(#[from] rumqttc::ClientError),

    #[error("command body could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Topic(#[from] TopicError),
}

/// REST collaborator failures (non-2xx or network).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{path} returned status {status}")]
    Status { path: String, status: u16 },

    #[error("unexpected response body from {path}: {reason}")]
    Body { path: String, reason: String },

    #[error("export failed: {0}")]
    Export(String),

    #[error("cannot build request url from {base}: {reason}")]
    Url { base: String, reason: String },
}

/// Inbound payload did not have the expected shape. The message is discarded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not UTF-8")]
    NotUtf8,

    #[error("payload {0:?} is not a decimal number")]
    NotNumeric(String),

    #[error("payload {0:?} is not a finite number")]
    NotFinite(String),

    #[error("unknown telemetry metric {0:?}")]
    UnknownMetric(String),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opening a context: connect, then subscribe.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("subscription failed: {0}")]
    Subscribe(#[from] PublishError),

    #[error("invalid experiment name: {0}")]
    Experiment(#[from] TopicError),
}

/// Topic segment that would break the slash-joined schema.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic segment at position {position} is empty")]
    EmptySegment { position: usize },

    #[error("topic segment {segment:?} contains a reserved character")]
    ReservedCharacter { segment: String },
}

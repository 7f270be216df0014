//! Broker transport adapters
//!
//! This module defines the adapter contract every broker protocol must
//! implement. The dispatcher and the connection pool only ever see these
//! traits; MQTT and STOMP are interchangeable behind them.

pub mod mqtt;
pub mod stomp;

use std::fmt;

use async_trait::async_trait;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by a transport adapter
#[derive(Debug)]
pub enum TransportError {
    /// Connecting to the broker failed
    ConnectFailed(String),

    /// Socket-level I/O error (broken pipe, reset, ...)
    Io(std::io::Error),

    /// The broker did not answer within the attempt deadline
    Timeout(String),

    /// The broker answered with something the protocol does not allow here
    Protocol(String),

    /// The broker explicitly refused the operation
    Rejected(String),
}

impl TransportError {
    /// Transient errors are worth retrying on a fresh connection;
    /// everything else is fatal for the envelope.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::ConnectFailed(_) => true,
            TransportError::Io(_) => true,
            TransportError::Timeout(_) => true,
            TransportError::Protocol(_) => false,
            TransportError::Rejected(_) => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectFailed(msg) => {
                write!(f, "failed to connect to broker: {}", msg)
            }
            TransportError::Io(err) => write!(f, "transport I/O error: {}", err),
            TransportError::Timeout(msg) => write!(f, "broker did not respond: {}", msg),
            TransportError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            TransportError::Rejected(msg) => write!(f, "broker rejected operation: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err)
    }
}

/// A live broker connection.
///
/// Connections are owned by the pool and borrowed by at most one publish
/// attempt at a time, so the methods take `&mut self`.
#[async_trait]
pub trait Connection: Send {
    /// Publish one payload to a destination and wait for the broker ack.
    async fn publish(&mut self, destination: &str, payload: &[u8]) -> TransportResult<()>;

    /// Close the connection politely. Dropping without close is allowed
    /// (the broker sees a socket close) but close is preferred.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Factory for broker connections, one instance per configured transport.
///
/// Implementations must be `Send + Sync`; the pool shares them across
/// borrow calls and dials lazily.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Configured name of this transport, the routing key for publishes.
    fn name(&self) -> &str;

    /// Dial the broker and perform the protocol handshake.
    async fn connect(&self) -> TransportResult<Box<dyn Connection>>;
}

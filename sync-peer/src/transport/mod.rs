//! Transport abstraction for vitalsync.
//!
//! This module provides a pluggable, connection-oriented byte pipe between
//! two peers (TCP on the local network, in-process channels, mock for
//! testing).
//!
//! # Design
//!
//! - [`Transport`] is one live connection: `send()` and `recv()` move whole
//!   envelope frames
//! - [`Connector`] dials a peer by address and hands back a connected transport
//! - [`Acceptor`] yields connections other peers dialed to us
//!
//! The engine only ever speaks [`Envelope`]s over a transport; use
//! [`send_message`] and [`recv_message`] rather than raw bytes.
//!
//! # Example
//!
//! ```ignore
//! let transport = connector.open("192.168.1.20:47210").await?;
//! send_message(transport.as_ref(), local, Some(peer), &message).await?;
//! let (sender, reply) = recv_message(transport.as_ref()).await?;
//! ```

mod memory;
mod mock;
mod tcp;

pub use memory::{MemoryListener, MemoryNetwork, MemoryTransport};
pub use mock::MockTransport;
pub use tcp::{TcpAcceptor, TcpConnector, TcpTransport};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use vitalsync_types::{DeviceId, Envelope, ErrorClass, Message, SyncError};

/// Largest frame accepted from the network (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame larger than [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,

    /// Frame did not decode as an envelope.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),
}

impl TransportError {
    /// Codec failures are protocol bugs; everything else is the network.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Codec(e) => e.class(),
            TransportError::FrameTooLarge(_) => ErrorClass::Protocol,
            _ => ErrorClass::Network,
        }
    }
}

/// Transport trait for sending and receiving sync protocol frames.
///
/// Implementations handle the underlying connection mechanism
/// (TCP, in-memory channels, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the peer at the given address.
    ///
    /// Transports created already connected treat this as a no-op.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one frame.
    ///
    /// The bytes are a serialized envelope.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame.
    ///
    /// Blocks until data is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens outbound connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `address` and return a connected transport.
    async fn open(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Accepts inbound connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next peer to connect.
    async fn accept(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Seal `message` in an envelope and send it.
pub async fn send_message(
    transport: &dyn Transport,
    sender: DeviceId,
    recipient: Option<DeviceId>,
    message: &Message,
) -> Result<(), TransportError> {
    let bytes = Envelope::seal(sender, recipient, message)?.to_bytes()?;
    transport.send(&bytes).await
}

/// Receive one envelope and open it.
///
/// Returns the claimed sender and the message.
pub async fn recv_message(transport: &dyn Transport) -> Result<(DeviceId, Message), TransportError> {
    let bytes = transport.recv().await?;
    let envelope = Envelope::from_bytes(&bytes)?;
    let message = envelope.open()?;
    Ok((envelope.sender_id, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitalsync_types::Bye;

    #[tokio::test]
    async fn message_helpers_roundtrip() {
        let (a, b) = MemoryTransport::pair();
        let sender = DeviceId::random();
        let message = Message::Bye(Bye {
            reason: Some("done".into()),
        });

        send_message(&a, sender, None, &message).await.unwrap();
        let (from, received) = recv_message(&b).await.unwrap();
        assert_eq!(from, sender);
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn garbage_frame_is_codec_error() {
        let (a, b) = MemoryTransport::pair();
        a.send(&[0xC1, 0x00]).await.unwrap();

        let err = recv_message(&b).await.unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn network_errors_are_retryable() {
        assert!(TransportError::ConnectionClosed.class().is_retryable());
        assert!(TransportError::Timeout.class().is_retryable());
        assert_eq!(
            TransportError::FrameTooLarge(1).class(),
            ErrorClass::Protocol
        );
    }
}

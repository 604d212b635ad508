//! Mock transport for testing.
//!
//! Captures sent frames and replays queued ones. A responder hook lets a
//! test play the remote peer, answering each sent frame as it arrives.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vitalsync_types::{DeviceId, Envelope, Message};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Mock transport for testing.
///
/// Starts connected, since connections come from a connector.
#[derive(Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    closed: bool,
    connected_address: Option<String>,
    sent_messages: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame to be returned by the next `recv()` call.
    pub fn queue_response(&self, data: Vec<u8>) {
        self.lock().receive_queue.push_back(data);
    }

    /// Queue a protocol message from `sender`.
    pub fn queue_message(&self, sender: DeviceId, message: &Message) {
        let bytes = Envelope::seal(sender, None, message)
            .and_then(|e| e.to_bytes())
            .unwrap_or_default();
        self.queue_response(bytes);
    }

    /// Answer every sent frame with whatever `responder` returns.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Get all frames that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.lock().sent_messages.clone()
    }

    /// Sent frames decoded as protocol messages. Undecodable frames are skipped.
    pub fn sent_protocol_messages(&self) -> Vec<Message> {
        self.sent_messages()
            .iter()
            .filter_map(|bytes| Envelope::from_bytes(bytes).ok())
            .filter_map(|envelope| envelope.open().ok())
            .collect()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.lock().sent_messages.last().cloned()
    }

    /// Get the address passed to `connect()`.
    pub fn connected_address(&self) -> Option<String> {
        self.lock().connected_address.clone()
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.lock().fail_next_recv = Some(error.to_string());
    }

    /// Clear all state (frames, queue, responder, connection).
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MockTransport")
            .field("closed", &inner.closed)
            .field("sent", &inner.sent_messages.len())
            .field("queued", &inner.receive_queue.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.closed = false;
        inner.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(data.to_vec());
        if let Some(responder) = inner.responder.as_mut() {
            let replies = responder(data);
            inner.receive_queue.extend(replies);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_recv.take() {
            return Err(TransportError::ReceiveFailed(error));
        }

        inner
            .receive_queue
            .pop_front()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        !self.lock().closed
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().closed = true;
        Ok(())
    }
}

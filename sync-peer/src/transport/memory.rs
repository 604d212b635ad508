//! In-process transport.
//!
//! Two [`MemoryTransport`]s made by [`MemoryTransport::pair`] behave like
//! the two ends of a socket. [`MemoryNetwork`] lets engines in one process
//! dial each other by address.

use super::{Acceptor, Connector, Transport, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// One end of an in-process connection.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    connected: AtomicBool,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed,
            connected: AtomicBool::new(true),
        }
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _address: &str) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.lock().await;
        let tx = tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(data.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::NotConnected);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame.ok_or(TransportError::ConnectionClosed),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        self.tx.lock().await.take();
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Address book of in-process listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<MemoryTransport>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections at `address`, replacing any previous listener.
    pub fn listen(&self, address: impl Into<String>) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(address.into(), tx);
        MemoryListener {
            incoming: Mutex::new(rx),
        }
    }

    /// Stop accepting connections at `address`.
    pub fn unlisten(&self, address: &str) {
        self.listeners.remove(address);
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn open(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let listener = self
            .listeners
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener at {}", address)))?;

        let (local, remote) = MemoryTransport::pair();
        listener
            .send(remote)
            .map_err(|_| TransportError::ConnectionFailed(format!("listener at {} gone", address)))?;
        Ok(Arc::new(local))
    }
}

/// Inbound side of a [`MemoryNetwork`] address.
pub struct MemoryListener {
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryTransport>>,
}

impl std::fmt::Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener").finish_non_exhaustive()
    }
}

#[async_trait]
impl Acceptor for MemoryListener {
    async fn accept(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)?;
        Ok(Arc::new(transport))
    }
}

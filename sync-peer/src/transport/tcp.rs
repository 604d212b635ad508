//! TCP transport for the local network.
//!
//! Frames are a 4-byte big-endian length followed by the envelope bytes.

use super::{Acceptor, Connector, Transport, TransportError, MAX_FRAME_SIZE};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

/// A framed TCP connection.
#[derive(Default)]
pub struct TcpTransport {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
}

impl TcpTransport {
    /// Create an unconnected transport; call `connect()` before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self {
            reader: Mutex::new(Some(read)),
            writer: Mutex::new(Some(write)),
            connected: AtomicBool::new(true),
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        *self.reader.lock().await = Some(read);
        *self.writer.lock().await = Some(write);
        self.connected.store(true, Ordering::Release);
        debug!(address, "tcp connected");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(data.len()));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let result = async {
            writer.write_u32(data.len() as u32).await?;
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.connected.store(false, Ordering::Release);
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.connected.store(false, Ordering::Release);
                return Err(TransportError::ConnectionClosed);
            }
            Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
        };
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await.map_err(|e| {
            self.connected.store(false, Ordering::Release);
            TransportError::ReceiveFailed(e.to_string())
        })?;
        Ok(frame)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}

/// Dials peers over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = TcpTransport::new();
        transport.connect(address).await?;
        Ok(Arc::new(transport))
    }
}

/// Accepts peers over TCP.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to `address`, e.g. `0.0.0.0:47210`.
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { listener })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!(%remote, "tcp accepted");
        Ok(Arc::new(TcpTransport::from_stream(stream)))
    }
}

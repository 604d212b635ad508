//! In-process discovery.
//!
//! Every [`LoopbackChannel`] attached to the same [`LoopbackBus`] hears
//! every other one. Used for peers sharing a process and as the test
//! harness; addresses are whatever the channel was created with, so they
//! line up with a [`MemoryNetwork`](crate::transport::MemoryNetwork).

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};
use vitalsync_types::{Announce, DeviceId};

use super::{
    encode_announce, open_announce, ChannelKind, DiscoveryChannel, DiscoveryError, Sighting,
};

const BUS_CAPACITY: usize = 256;

/// Shared medium for loopback channels.
#[derive(Debug, Clone)]
pub struct LoopbackBus {
    tx: broadcast::Sender<(String, Vec<u8>)>,
}

impl LoopbackBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel on a [`LoopbackBus`].
#[derive(Debug)]
pub struct LoopbackChannel {
    bus: LoopbackBus,
    address: String,
    rx: Mutex<broadcast::Receiver<(String, Vec<u8>)>>,
    stop: Notify,
}

impl LoopbackChannel {
    /// Attach to `bus`, advertising `address` as where we accept connections.
    ///
    /// Announcements sent after this call are buffered until `listen()`.
    pub fn new(bus: LoopbackBus, address: impl Into<String>) -> Self {
        let rx = bus.tx.subscribe();
        Self {
            bus,
            address: address.into(),
            rx: Mutex::new(rx),
            stop: Notify::new(),
        }
    }

    /// Address this channel advertises.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl DiscoveryChannel for LoopbackChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Loopback
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn announce(&self, sender: DeviceId, announce: &Announce) -> Result<(), DiscoveryError> {
        let bytes = encode_announce(sender, announce)?;
        // Nobody listening is not a failure
        let _ = self.bus.tx.send((self.address.clone(), bytes));
        Ok(())
    }

    async fn listen(&self) -> Result<Sighting, DiscoveryError> {
        let mut rx = self.rx.lock().await;
        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                _ = self.stop.notified() => return Err(DiscoveryError::Stopped),
            };
            match received {
                Ok((address, bytes)) => {
                    let (sender, announce) = open_announce(&bytes)?;
                    return Ok(Sighting {
                        sender,
                        announce,
                        address,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(DiscoveryError::Stopped),
            }
        }
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.stop.notify_waiters();
        Ok(())
    }
}

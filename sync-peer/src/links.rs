//! Authenticated links to trusted peers.
//!
//! A link is a transport on which a handshake completed. Outbound links
//! are dialed on demand through the [`AddressBook`] and kept open for
//! later operations; use of one link is exclusive so chunk acks of two
//! transfers never interleave. Inbound connections are registered so a
//! revocation notice can reach a peer that only ever dialed us.

use async_trait::async_trait;
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use vitalsync_core::RevocationReason;
use vitalsync_types::{Bye, DeviceId, Message, RevocationNotice};

use crate::discovery::Discovery;
use crate::error::PeerError;
use crate::handshake::HandshakeCoordinator;
use crate::services::{Direction, KeyId, KeyStore};
use crate::transport::{send_message, Connector, Transport};
use crate::trust::{RevocationNotifier, TrustManager};

/// Where peers can be reached.
pub trait AddressBook: Send + Sync {
    /// Dialable address of `peer`, if known.
    fn address_of(&self, peer: &DeviceId) -> Option<String>;
}

impl AddressBook for Discovery {
    fn address_of(&self, peer: &DeviceId) -> Option<String> {
        self.peer(peer).map(|p| p.address)
    }
}

/// One authenticated outbound connection.
pub struct Link {
    peer: DeviceId,
    transport: Arc<dyn Transport>,
    io: Mutex<()>,
}

impl Link {
    /// Peer at the other end.
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// Whether the transport is still up.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Take exclusive use of the link.
    pub async fn lock(&self) -> LinkGuard<'_> {
        LinkGuard {
            _io: self.io.lock().await,
            transport: self.transport.as_ref(),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Exclusive access to a [`Link`]'s transport.
pub struct LinkGuard<'a> {
    _io: MutexGuard<'a, ()>,
    transport: &'a (dyn Transport + 'static),
}

impl Deref for LinkGuard<'_> {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.transport
    }
}

type Slot = Arc<Mutex<Option<Arc<Link>>>>;

/// Owner of every live link.
pub struct PeerLinks {
    local: DeviceId,
    connector: Arc<dyn Connector>,
    addresses: Arc<dyn AddressBook>,
    handshake: Arc<HandshakeCoordinator>,
    trust: Arc<TrustManager>,
    keys: Arc<dyn KeyStore>,
    outbound: DashMap<DeviceId, Slot>,
    inbound: DashMap<DeviceId, Arc<dyn Transport>>,
}

impl PeerLinks {
    /// Create an empty link table.
    pub fn new(
        local: DeviceId,
        connector: Arc<dyn Connector>,
        addresses: Arc<dyn AddressBook>,
        handshake: Arc<HandshakeCoordinator>,
        trust: Arc<TrustManager>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        Self {
            local,
            connector,
            addresses,
            handshake,
            trust,
            keys,
            outbound: DashMap::new(),
            inbound: DashMap::new(),
        }
    }

    /// Return the live link to `peer`, dialing and handshaking if needed.
    ///
    /// Concurrent callers for the same peer share one dial.
    pub async fn connect(&self, peer: DeviceId) -> Result<Arc<Link>, PeerError> {
        let slot = self.outbound.entry(peer).or_default().clone();
        let mut slot = slot.lock().await;
        if let Some(link) = slot.as_ref() {
            if link.is_connected() {
                return Ok(link.clone());
            }
            debug!(peer = ?peer, "Link went down, redialing");
        }

        let link = Arc::new(self.establish(peer).await?);
        *slot = Some(link.clone());
        Ok(link)
    }

    async fn establish(&self, peer: DeviceId) -> Result<Link, PeerError> {
        let address = self
            .addresses
            .address_of(&peer)
            .ok_or(PeerError::UnknownPeer(peer))?;
        let transport = self.connector.open(&address).await?;

        let key = match self.handshake.initiate(peer, transport.as_ref()).await {
            Ok(key) => key,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        self.keys
            .put(
                KeyId::session(&peer, Direction::Outbound),
                key.as_bytes().to_vec(),
            )
            .await?;
        self.trust.install_session_secret(&peer, &key).await?;

        info!(peer = ?peer, %address, "Link established");
        Ok(Link {
            peer,
            transport,
            io: Mutex::new(()),
        })
    }

    /// Close the outbound link to `peer`, saying goodbye first.
    ///
    /// Returns false when there was no link.
    pub async fn disconnect(&self, peer: &DeviceId, reason: Option<&str>) -> bool {
        let Some((_, slot)) = self.outbound.remove(peer) else {
            return false;
        };
        let Some(link) = slot.lock().await.take() else {
            return false;
        };
        let guard = link.lock().await;
        let bye = Message::Bye(Bye {
            reason: reason.map(str::to_string),
        });
        if let Err(e) = send_message(&*guard, self.local, Some(*peer), &bye).await {
            debug!(peer = ?peer, "Could not say goodbye: {}", e);
        }
        let _ = guard.close().await;
        debug!(peer = ?peer, "Link closed");
        true
    }

    /// Drop a broken link without a goodbye.
    pub async fn invalidate(&self, peer: &DeviceId) {
        if let Some((_, slot)) = self.outbound.remove(peer) {
            if let Some(link) = slot.lock().await.take() {
                let _ = link.transport.close().await;
            }
        }
    }

    /// Record an authenticated inbound connection.
    pub fn register_inbound(&self, peer: DeviceId, transport: Arc<dyn Transport>) {
        self.inbound.insert(peer, transport);
    }

    /// Forget an inbound connection once its handler ends.
    pub fn unregister_inbound(&self, peer: &DeviceId) {
        self.inbound.remove(peer);
    }

    /// Whether an outbound link to `peer` is up.
    pub async fn is_connected(&self, peer: &DeviceId) -> bool {
        let Some(slot) = self.outbound.get(peer).map(|s| s.value().clone()) else {
            return false;
        };
        let slot = slot.lock().await;
        slot.as_ref().is_some_and(|link| link.is_connected())
    }

    /// Peers with a live outbound link.
    pub fn connected_peers(&self) -> Vec<DeviceId> {
        self.outbound.iter().map(|entry| *entry.key()).collect()
    }

    /// Close every link.
    pub async fn close_all(&self) {
        let peers: Vec<DeviceId> = self.connected_peers();
        for peer in peers {
            self.disconnect(&peer, Some("shutting down")).await;
        }
        let inbound: Vec<Arc<dyn Transport>> =
            self.inbound.iter().map(|e| e.value().clone()).collect();
        self.inbound.clear();
        for transport in inbound {
            let _ = transport.close().await;
        }
    }
}

impl std::fmt::Debug for PeerLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLinks")
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .finish()
    }
}

#[async_trait]
impl RevocationNotifier for PeerLinks {
    async fn notify_revoked(
        &self,
        peer: DeviceId,
        reason: RevocationReason,
    ) -> Result<(), PeerError> {
        let notice = Message::RevocationNotice(RevocationNotice {
            reason: reason.to_string(),
        });

        let outbound = self
            .outbound
            .get(&peer)
            .map(|slot| slot.value().clone());
        if let Some(slot) = outbound {
            let link = slot.lock().await.clone();
            if let Some(link) = link {
                let guard = link.lock().await;
                send_message(&*guard, self.local, Some(peer), &notice).await?;
                drop(guard);
                self.invalidate(&peer).await;
                return Ok(());
            }
        }

        if let Some((_, transport)) = self.inbound.remove(&peer) {
            send_message(transport.as_ref(), self.local, Some(peer), &notice).await?;
            let _ = transport.close().await;
            return Ok(());
        }

        // Without a link the peer learns at its next handshake attempt
        debug!(peer = ?peer, "No link to deliver revocation notice");
        Ok(())
    }
}

//! UDP discovery channels: subnet broadcast, a multicast service group and
//! unicast signaling to configured peers.
//!
//! Broadcast and multicast share the discovery port, so their sockets are
//! bound with address reuse.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, warn};
use vitalsync_types::{Announce, DeviceId};

use super::{
    decode_announce, encode_announce, ChannelKind, DiscoveryChannel, DiscoveryError, Sighting,
    MAX_DATAGRAM_SIZE,
};

/// Bind `port` on every interface, allowing other discovery sockets on it.
fn bind_shared(port: u16) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&address.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn receive(socket: &UdpSocket, stop: &Notify) -> Result<Sighting, DiscoveryError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    tokio::select! {
        received = socket.recv_from(&mut buf) => {
            let (len, source) = received?;
            decode_announce(&buf[..len], source)
        }
        _ = stop.notified() => Err(DiscoveryError::Stopped),
    }
}

/// Announces to `255.255.255.255` on the discovery port.
#[derive(Debug)]
pub struct UdpBroadcastChannel {
    socket: UdpSocket,
    port: u16,
    stop: Notify,
}

impl UdpBroadcastChannel {
    /// Bind the discovery port on every interface.
    pub async fn bind(port: u16) -> Result<Self, DiscoveryError> {
        let socket = bind_shared(port)?;
        socket.set_broadcast(true)?;
        let port = socket.local_addr()?.port();
        debug!(port, "Broadcast discovery bound");
        Ok(Self {
            socket,
            port,
            stop: Notify::new(),
        })
    }

    /// Port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl DiscoveryChannel for UdpBroadcastChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Broadcast
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn announce(&self, sender: DeviceId, announce: &Announce) -> Result<(), DiscoveryError> {
        let bytes = encode_announce(sender, announce)?;
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port);
        self.socket.send_to(&bytes, target).await?;
        Ok(())
    }

    async fn listen(&self) -> Result<Sighting, DiscoveryError> {
        receive(&self.socket, &self.stop).await
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.stop.notify_waiters();
        Ok(())
    }
}

/// Announces to a multicast group, e.g. `239.255.42.99`.
#[derive(Debug)]
pub struct MulticastChannel {
    socket: UdpSocket,
    group: SocketAddr,
    stop: Notify,
}

impl MulticastChannel {
    /// Bind the discovery port and join `group`.
    pub async fn join(group: Ipv4Addr, port: u16) -> Result<Self, DiscoveryError> {
        let socket = bind_shared(port)?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        let port = socket.local_addr()?.port();
        debug!(%group, port, "Multicast discovery joined");
        Ok(Self {
            socket,
            group: SocketAddr::V4(SocketAddrV4::new(group, port)),
            stop: Notify::new(),
        })
    }

    /// Group address announcements go to.
    pub fn group(&self) -> SocketAddr {
        self.group
    }
}

#[async_trait]
impl DiscoveryChannel for MulticastChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Multicast
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn announce(&self, sender: DeviceId, announce: &Announce) -> Result<(), DiscoveryError> {
        let bytes = encode_announce(sender, announce)?;
        self.socket.send_to(&bytes, self.group).await?;
        Ok(())
    }

    async fn listen(&self) -> Result<Sighting, DiscoveryError> {
        receive(&self.socket, &self.stop).await
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.stop.notify_waiters();
        Ok(())
    }
}

/// Announces directly to a fixed list of peers.
///
/// Fallback for networks that drop broadcast and multicast traffic. Peers
/// that list us hear our announcements; we listen on our own signaling
/// port for theirs.
#[derive(Debug)]
pub struct UnicastChannel {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    stop: Notify,
}

impl UnicastChannel {
    /// Bind the signaling port and remember where to announce.
    pub async fn bind(port: u16, peers: Vec<SocketAddr>) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        debug!(port = socket.local_addr()?.port(), peers = peers.len(), "Unicast signaling bound");
        Ok(Self {
            socket,
            peers,
            stop: Notify::new(),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DiscoveryChannel for UnicastChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Unicast
    }

    fn is_available(&self) -> bool {
        true
    }

    /// Succeeds when at least one peer was reached, or there are none.
    async fn announce(&self, sender: DeviceId, announce: &Announce) -> Result<(), DiscoveryError> {
        let bytes = encode_announce(sender, announce)?;
        let mut last_error = None;
        let mut delivered = 0;
        for peer in &self.peers {
            match self.socket.send_to(&bytes, peer).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(%peer, "Signaling peer unreachable: {}", e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn listen(&self) -> Result<Sighting, DiscoveryError> {
        receive(&self.socket, &self.stop).await
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.stop.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vitalsync_types::{PeerIdentity, Platform, PublicKey};

    #[tokio::test]
    async fn stop_wakes_a_pending_listen() {
        let channel = Arc::new(UdpBroadcastChannel::bind(0).await.unwrap());
        assert_ne!(channel.port(), 0);

        let listener = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.listen().await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        channel.stop().await.unwrap();
        assert!(matches!(
            listener.await.unwrap(),
            Err(DiscoveryError::Stopped)
        ));
    }

    fn phone_announce() -> Announce {
        Announce {
            identity: PeerIdentity::new(
                DeviceId::random(),
                "Phone",
                Platform::Android,
                Some(PublicKey::from_bytes([3u8; 32])),
            ),
            sync_port: Some(47210),
        }
    }

    #[tokio::test]
    async fn discovery_sockets_share_the_port() {
        let first = UdpBroadcastChannel::bind(0).await.unwrap();
        let second = UdpBroadcastChannel::bind(first.port()).await.unwrap();
        assert_eq!(second.port(), first.port());
    }

    #[tokio::test]
    async fn unicast_signaling_reaches_a_listed_peer() {
        let tablet = UnicastChannel::bind(0, Vec::new()).await.unwrap();
        let tablet_port = tablet.local_addr().unwrap().port();
        let phone = UnicastChannel::bind(
            0,
            vec![SocketAddr::from((Ipv4Addr::LOCALHOST, tablet_port))],
        )
        .await
        .unwrap();
        assert_eq!(phone.kind(), ChannelKind::Unicast);

        let announce = phone_announce();
        phone
            .announce(announce.identity.device_id, &announce)
            .await
            .unwrap();

        let sighting = tablet.listen().await.unwrap();
        assert_eq!(sighting.sender, announce.identity.device_id);
        assert_eq!(sighting.announce, announce);
        assert_eq!(sighting.address, "127.0.0.1:47210");
    }

    #[tokio::test]
    async fn unicast_without_peers_announces_nowhere() {
        let channel = UnicastChannel::bind(0, Vec::new()).await.unwrap();
        let announce = phone_announce();
        channel
            .announce(announce.identity.device_id, &announce)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn datagram_from_a_peer_becomes_a_sighting() {
        let channel = UdpBroadcastChannel::bind(0).await.unwrap();
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, channel.port());

        let identity = PeerIdentity::new(
            DeviceId::random(),
            "Phone",
            Platform::Android,
            Some(PublicKey::from_bytes([3u8; 32])),
        );
        let announce = Announce {
            identity: identity.clone(),
            sync_port: Some(47210),
        };
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = encode_announce(identity.device_id, &announce).unwrap();
        sender.send_to(&bytes, target).await.unwrap();

        let sighting = channel.listen().await.unwrap();
        assert_eq!(sighting.announce, announce);
        assert_eq!(sighting.address, "127.0.0.1:47210");
    }
}

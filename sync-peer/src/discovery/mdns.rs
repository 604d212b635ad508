//! DNS-SD service registration.
//!
//! Each device registers a `_vitalsync._udp.local.` service whose TXT
//! record carries its identity, and browses for everyone else's. The
//! service port is the sync port; addresses come from the resolved record.

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vitalsync_types::{Announce, DeviceId, PeerIdentity, Platform, PublicKey};

use super::{ChannelKind, DiscoveryChannel, DiscoveryError, Sighting};

/// Service type registered and browsed.
pub const SERVICE_TYPE: &str = "_vitalsync._udp.local.";

const SIGHTING_BUFFER: usize = 64;

const TXT_ID: &str = "id";
const TXT_NAME: &str = "name";
const TXT_PLATFORM: &str = "platform";
const TXT_PROTOCOL: &str = "proto";
const TXT_KEY: &str = "key";

/// Registers this device as a DNS-SD service and browses for peers.
pub struct ServiceRegistrationChannel {
    daemon: ServiceDaemon,
    sightings: Mutex<mpsc::Receiver<Sighting>>,
    registered: Mutex<Option<Registration>>,
    forwarder: JoinHandle<()>,
    stop: Notify,
}

#[derive(PartialEq)]
struct Registration {
    fullname: String,
    port: u16,
    properties: HashMap<String, String>,
}

impl ServiceRegistrationChannel {
    /// Start the responder and begin browsing.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        let events = daemon.browse(SERVICE_TYPE)?;
        let (tx, rx) = mpsc::channel(SIGHTING_BUFFER);

        let forwarder = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let ServiceEvent::ServiceResolved(info) = event else {
                    continue;
                };
                match sighting_from_service(&info) {
                    Some(sighting) => {
                        if tx.send(sighting).await.is_err() {
                            break;
                        }
                    }
                    None => debug!(service = info.get_fullname(), "Ignoring incomplete service record"),
                }
            }
        });

        debug!(service = SERVICE_TYPE, "Service registration browsing");
        Ok(Self {
            daemon,
            sightings: Mutex::new(rx),
            registered: Mutex::new(None),
            forwarder,
            stop: Notify::new(),
        })
    }

    async fn unregister(&self) -> Result<(), DiscoveryError> {
        if let Some(previous) = self.registered.lock().await.take() {
            self.daemon.unregister(&previous.fullname)?;
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryChannel for ServiceRegistrationChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::ServiceRegistration
    }

    fn is_available(&self) -> bool {
        true
    }

    /// Register, or re-register when the announced identity changed.
    async fn announce(&self, sender: DeviceId, announce: &Announce) -> Result<(), DiscoveryError> {
        let info = service_from_announce(sender, announce)?;
        let registration = Registration {
            fullname: info.get_fullname().to_string(),
            port: info.get_port(),
            properties: txt_properties(sender, announce),
        };

        let mut registered = self.registered.lock().await;
        if registered.as_ref() == Some(&registration) {
            return Ok(());
        }
        self.daemon.register(info)?;
        debug!(service = %registration.fullname, "Service registered");
        *registered = Some(registration);
        Ok(())
    }

    async fn listen(&self) -> Result<Sighting, DiscoveryError> {
        let mut sightings = self.sightings.lock().await;
        tokio::select! {
            sighting = sightings.recv() => sighting.ok_or(DiscoveryError::Stopped),
            _ = self.stop.notified() => Err(DiscoveryError::Stopped),
        }
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.stop.notify_waiters();
        self.unregister().await
    }
}

impl Drop for ServiceRegistrationChannel {
    fn drop(&mut self) {
        self.forwarder.abort();
        if let Err(e) = self.daemon.shutdown() {
            warn!("Service registration shutdown failed: {}", e);
        }
    }
}

fn instance_name(sender: DeviceId) -> String {
    format!("vitalsync-{}", hex::encode(&sender.as_bytes()[..8]))
}

fn platform_tag(platform: Platform) -> &'static str {
    match platform {
        Platform::Ios => "ios",
        Platform::Android => "android",
        Platform::Web => "web",
        Platform::Desktop => "desktop",
        Platform::Unknown => "unknown",
    }
}

fn parse_platform(tag: &str) -> Platform {
    match tag {
        "ios" => Platform::Ios,
        "android" => Platform::Android,
        "web" => Platform::Web,
        "desktop" => Platform::Desktop,
        _ => Platform::Unknown,
    }
}

fn txt_properties(sender: DeviceId, announce: &Announce) -> HashMap<String, String> {
    let identity = &announce.identity;
    let mut properties = HashMap::from([
        (TXT_ID.to_string(), sender.to_string()),
        (TXT_NAME.to_string(), identity.display_name.clone()),
        (TXT_PLATFORM.to_string(), platform_tag(identity.platform).to_string()),
        (TXT_PROTOCOL.to_string(), identity.protocol_version.to_string()),
    ]);
    if let Some(key) = &identity.public_key {
        properties.insert(TXT_KEY.to_string(), hex::encode(key.as_bytes()));
    }
    properties
}

/// Service record for `announce`. Addresses are filled in by the responder.
pub(crate) fn service_from_announce(
    sender: DeviceId,
    announce: &Announce,
) -> Result<ServiceInfo, DiscoveryError> {
    let instance = instance_name(sender);
    let host = format!("{}.local.", instance);
    let info = ServiceInfo::new(
        SERVICE_TYPE,
        &instance,
        &host,
        "",
        announce.sync_port.unwrap_or(0),
        txt_properties(sender, announce),
    )?;
    Ok(info.enable_addr_auto())
}

/// Sighting for a resolved record, or `None` when a required field is
/// missing or malformed.
pub(crate) fn sighting_from_service(info: &ServiceInfo) -> Option<Sighting> {
    let sender = DeviceId::parse(info.get_property_val_str(TXT_ID)?)?;
    let display_name = info.get_property_val_str(TXT_NAME)?;
    let platform = parse_platform(info.get_property_val_str(TXT_PLATFORM).unwrap_or_default());
    let public_key = match info.get_property_val_str(TXT_KEY) {
        Some(encoded) => {
            let bytes: [u8; 32] = hex::decode(encoded).ok()?.try_into().ok()?;
            Some(PublicKey::from_bytes(bytes))
        }
        None => None,
    };

    let mut identity = PeerIdentity::new(sender, display_name, platform, public_key);
    if let Some(version) = info
        .get_property_val_str(TXT_PROTOCOL)
        .and_then(|v| v.parse().ok())
    {
        identity.protocol_version = version;
    }

    let addresses = info.get_addresses();
    let ip: IpAddr = addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()?;
    let port = info.get_port();

    Some(Sighting {
        sender,
        announce: Announce {
            identity,
            sync_port: (port != 0).then_some(port),
        },
        address: SocketAddr::new(ip, port).to_string(),
    })
}

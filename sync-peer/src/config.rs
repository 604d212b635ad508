//! Configuration loading for vitalsync-peer.
//!
//! Configuration is loaded from a TOML file. Every section and field has a
//! default, so a partial file (or none at all) is valid.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vitalsync_core::{BackoffPolicy, LinkPolicy, TrustPolicy};
use vitalsync_types::Platform;

/// Root configuration for a sync peer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerConfig {
    /// This device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Local network discovery.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Handshake deadlines.
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Trust policy and sweep.
    #[serde(default)]
    pub trust: TrustConfig,
    /// Chunked transfer.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Queue, retry and breaker tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Status monitor.
    #[serde(default)]
    pub status: StatusConfig,
}

/// This device's identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Name shown to other devices (default: "vitalsync device").
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Platform tag to announce (default: desktop).
    #[serde(default = "default_platform")]
    pub platform: Platform,
    /// Port the sync listener is reachable on, announced to peers (default: 47210).
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Re-announce interval in seconds (default: 5).
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    /// Forget peers not heard from for this long (default: 60).
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_secs: u64,
    /// UDP port for broadcast and multicast announcements (default: 47211).
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Multicast group for announcements (default: 239.255.42.99).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    /// Enable the local broadcast channel (default: true).
    #[serde(default = "default_true")]
    pub enable_broadcast: bool,
    /// Enable the multicast channel (default: true).
    #[serde(default = "default_true")]
    pub enable_multicast: bool,
    /// Register and browse a DNS-SD service (default: true).
    #[serde(default = "default_true")]
    pub enable_service_registration: bool,
    /// UDP port for unicast signaling (default: 47212).
    #[serde(default = "default_signaling_port")]
    pub signaling_port: u16,
    /// Peers to announce to directly, as `host:port` (default: none).
    ///
    /// Unicast signaling is only started when this list is non-empty.
    #[serde(default)]
    pub signaling_peers: Vec<String>,
}

impl DiscoveryConfig {
    /// Parsed `signaling_peers`.
    pub fn signaling_addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.signaling_peers
            .iter()
            .map(|peer| {
                peer.parse().map_err(|_| ConfigError::Invalid {
                    field: "discovery.signaling_peers",
                    reason: format!("not a socket address: {}", peer),
                })
            })
            .collect()
    }
}

/// Handshake configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeConfig {
    /// Deadline for a whole handshake in seconds (default: 30).
    #[serde(default = "default_handshake_timeout")]
    pub timeout_secs: u64,
}

/// Trust manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustConfig {
    /// Maximum simultaneously trusted devices (default: 10).
    #[serde(default = "default_max_trusted_devices")]
    pub max_trusted_devices: usize,
    /// Allow trusting devices on other platforms (default: true).
    #[serde(default = "default_true")]
    pub allow_cross_platform: bool,
    /// Every request waits for the user (default: true).
    #[serde(default = "default_true")]
    pub require_manual_approval: bool,
    /// Minimum security score for auto-approval (default: 80).
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: u8,
    /// Pending request lifetime in seconds (default: 300).
    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: u64,
    /// Background sweep interval in seconds (default: 3600).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Trust grant lifetime in seconds (default: 90 days).
    #[serde(default = "default_max_trust_age")]
    pub max_trust_age_secs: u64,
}

/// Transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes (default: 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Retransmissions allowed per chunk after an integrity nack (default: 3).
    #[serde(default = "default_max_chunk_retransmits")]
    pub max_chunk_retransmits: u32,
    /// How long to wait for a chunk ack in seconds (default: 10).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    /// Largest inbound payload in bytes (default: 64 MiB).
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
}

impl TransferConfig {
    /// Most chunks an inbound transfer may announce.
    pub fn max_chunks(&self) -> u32 {
        let chunks = self.max_payload_bytes.div_ceil(self.chunk_size.max(1));
        u32::try_from(chunks).unwrap_or(u32::MAX).max(1)
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum operations pending or in progress (default: 10000).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Retry limit for operations that do not set one (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// High-priority operations dispatched on reconnect (default: 3).
    #[serde(default = "default_priority_burst_size")]
    pub priority_burst_size: usize,
    /// Minimum reliability for the reconnect burst (default: 0.8).
    #[serde(default = "default_burst_reliability_threshold")]
    pub burst_reliability_threshold: f32,
    /// Batch size on a perfect link (default: 10).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Consecutive failures that open a breaker (default: 5).
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    /// Breaker cooldown in seconds (default: 30).
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
    /// Retries one device may consume per window (default: 20).
    #[serde(default = "default_retry_budget_per_device")]
    pub retry_budget_per_device: u32,
    /// Retry budget window in seconds (default: 60).
    #[serde(default = "default_retry_budget_window")]
    pub retry_budget_window_secs: u64,
    /// Dispatch tick in milliseconds (default: 500).
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,
    /// Backoff base delay in milliseconds (default: 1000).
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 60000).
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Random jitter added to each backoff, in milliseconds (default: 250).
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,
}

/// Status monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Success notifications hide after this many seconds (default: 5).
    #[serde(default = "default_success_autohide")]
    pub success_autohide_secs: u64,
    /// Derived view refresh interval in milliseconds (default: 1000).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    /// Maximum notifications kept (default: 50).
    #[serde(default = "default_max_notifications")]
    pub max_notifications: usize,
    /// In-progress operations older than this are reported as stalled (default: 300).
    #[serde(default = "default_stall_after")]
    pub stall_after_secs: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_device_name() -> String {
    "vitalsync device".to_string()
}

fn default_platform() -> Platform {
    Platform::Desktop
}

fn default_sync_port() -> u16 {
    47210
}

fn default_announce_interval() -> u64 {
    5
}

fn default_peer_ttl() -> u64 {
    60
}

fn default_discovery_port() -> u16 {
    47211
}

fn default_signaling_port() -> u16 {
    47212
}

fn default_multicast_group() -> String {
    "239.255.42.99".to_string()
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_trusted_devices() -> usize {
    10
}

fn default_auto_approve_threshold() -> u8 {
    80
}

fn default_request_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    3600 // 1 hour
}

fn default_max_trust_age() -> u64 {
    90 * 24 * 60 * 60 // 90 days
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_chunk_retransmits() -> u32 {
    3
}

fn default_max_payload() -> usize {
    64 * 1024 * 1024
}

fn default_ack_timeout() -> u64 {
    10
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    vitalsync_core::DEFAULT_MAX_RETRIES
}

fn default_priority_burst_size() -> usize {
    3
}

fn default_burst_reliability_threshold() -> f32 {
    0.8
}

fn default_max_batch_size() -> usize {
    10
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_retry_budget_per_device() -> u32 {
    20
}

fn default_retry_budget_window() -> u64 {
    60
}

fn default_batch_interval() -> u64 {
    500
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    60_000
}

fn default_retry_jitter() -> u64 {
    250
}

fn default_success_autohide() -> u64 {
    5
}

fn default_refresh_interval() -> u64 {
    1000
}

fn default_max_notifications() -> usize {
    50
}

fn default_stall_after() -> u64 {
    300
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            platform: default_platform(),
            sync_port: default_sync_port(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval_secs: default_announce_interval(),
            peer_ttl_secs: default_peer_ttl(),
            port: default_discovery_port(),
            multicast_group: default_multicast_group(),
            enable_broadcast: true,
            enable_multicast: true,
            enable_service_registration: true,
            signaling_port: default_signaling_port(),
            signaling_peers: Vec::new(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            max_trusted_devices: default_max_trusted_devices(),
            allow_cross_platform: true,
            require_manual_approval: true,
            auto_approve_threshold: default_auto_approve_threshold(),
            request_ttl_secs: default_request_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            max_trust_age_secs: default_max_trust_age(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_chunk_retransmits: default_max_chunk_retransmits(),
            ack_timeout_secs: default_ack_timeout(),
            max_payload_bytes: default_max_payload(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            priority_burst_size: default_priority_burst_size(),
            burst_reliability_threshold: default_burst_reliability_threshold(),
            max_batch_size: default_max_batch_size(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            retry_budget_per_device: default_retry_budget_per_device(),
            retry_budget_window_secs: default_retry_budget_window(),
            batch_interval_ms: default_batch_interval(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter_ms: default_retry_jitter(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            success_autohide_secs: default_success_autohide(),
            refresh_interval_ms: default_refresh_interval(),
            max_notifications: default_max_notifications(),
            stall_after_secs: default_stall_after(),
        }
    }
}

impl PeerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// value fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 12] = [
            ("discovery.announce_interval_secs", self.discovery.announce_interval_secs > 0),
            ("discovery.peer_ttl_secs", self.discovery.peer_ttl_secs > 0),
            ("handshake.timeout_secs", self.handshake.timeout_secs > 0),
            ("trust.max_trusted_devices", self.trust.max_trusted_devices > 0),
            ("trust.sweep_interval_secs", self.trust.sweep_interval_secs > 0),
            ("transfer.chunk_size", self.transfer.chunk_size > 0),
            ("transfer.ack_timeout_secs", self.transfer.ack_timeout_secs > 0),
            ("sync.max_queue_size", self.sync.max_queue_size > 0),
            ("sync.max_batch_size", self.sync.max_batch_size > 0),
            ("sync.breaker_failure_threshold", self.sync.breaker_failure_threshold > 0),
            ("sync.batch_interval_ms", self.sync.batch_interval_ms > 0),
            ("status.refresh_interval_ms", self.status.refresh_interval_ms > 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, ok)| !ok) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.sync.burst_reliability_threshold) {
            return Err(ConfigError::Invalid {
                field: "sync.burst_reliability_threshold",
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.transfer.max_payload_bytes < self.transfer.chunk_size {
            return Err(ConfigError::Invalid {
                field: "transfer.max_payload_bytes",
                reason: "must be at least transfer.chunk_size".to_string(),
            });
        }
        self.discovery.signaling_addresses()?;
        if self.trust.auto_approve_threshold > 100 {
            return Err(ConfigError::Invalid {
                field: "trust.auto_approve_threshold",
                reason: "must be at most 100".to_string(),
            });
        }
        if self.device.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "device.name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl TrustConfig {
    /// Policy for the trust registry.
    pub fn policy(&self) -> TrustPolicy {
        TrustPolicy {
            max_trusted_devices: self.max_trusted_devices,
            allow_cross_platform: self.allow_cross_platform,
            require_manual_approval: self.require_manual_approval,
            auto_approve_threshold: self.auto_approve_threshold,
            request_ttl_secs: self.request_ttl_secs,
            max_trust_age_secs: self.max_trust_age_secs,
        }
    }
}

impl SyncConfig {
    /// Backoff policy for retries.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_delay_ms),
            max: Duration::from_millis(self.retry_max_delay_ms),
            jitter: Duration::from_millis(self.retry_jitter_ms),
        }
    }

    /// Policy for the link state machine.
    pub fn link_policy(&self) -> LinkPolicy {
        LinkPolicy {
            burst_size: self.priority_burst_size,
            burst_threshold: self.burst_reliability_threshold,
            max_batch: self.max_batch_size,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

//! Network quality and adaptive batch sizing.

use serde::{Deserialize, Serialize};

/// Link type reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Wi-Fi or wired LAN.
    Broadband,
    /// Mobile data.
    Cellular,
    /// Anything else.
    Unknown,
}

/// Snapshot of current network conditions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkQuality {
    /// Link type.
    pub kind: ConnectionKind,
    /// Observed reliability, 0.0..=1.0.
    pub reliability: f32,
    /// Whether traffic is billed.
    pub metered: bool,
}

impl NetworkQuality {
    /// Unmetered broadband with the given reliability.
    pub fn broadband(reliability: f32) -> Self {
        Self {
            kind: ConnectionKind::Broadband,
            reliability: reliability.clamp(0.0, 1.0),
            metered: false,
        }
    }

    /// Metered cellular with the given reliability.
    pub fn cellular(reliability: f32) -> Self {
        Self {
            kind: ConnectionKind::Cellular,
            reliability: reliability.clamp(0.0, 1.0),
            metered: true,
        }
    }

    /// How many operations to dispatch per batch.
    ///
    /// Broadband at >= 0.9 reliability gets the full batch, >= 0.6 gets
    /// half, metered or flaky links get one at a time.
    pub fn batch_size(&self, max_batch: usize) -> usize {
        let max_batch = max_batch.max(1);
        if self.metered || self.reliability < 0.6 {
            1
        } else if self.kind == ConnectionKind::Broadband && self.reliability >= 0.9 {
            max_batch
        } else {
            (max_batch / 2).max(1)
        }
    }

    /// Whether a reconnect should fire the high-priority burst.
    pub fn allows_burst(&self, threshold: f32) -> bool {
        self.reliability >= threshold
    }
}

impl Default for NetworkQuality {
    fn default() -> Self {
        Self::broadband(1.0)
    }
}

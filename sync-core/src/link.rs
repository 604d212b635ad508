//! Connectivity state machine for vitalsync.
//!
//! A pure, side-effect-free state machine for the device's network link.
//! It takes events as input and produces a new state plus a list of
//! actions for the orchestrator to execute: requeue in-flight work when
//! the link drops, fire a high-priority burst when it comes back, resize
//! batches when quality changes.

use crate::network::NetworkQuality;

/// Settings the state machine needs to choose actions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkPolicy {
    /// High-priority operations dispatched on reconnect.
    pub burst_size: usize,
    /// Minimum reliability for the burst.
    pub burst_threshold: f32,
    /// Batch size on a perfect link.
    pub max_batch: usize,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            burst_size: 3,
            burst_threshold: 0.8,
            max_batch: 10,
        }
    }
}

/// Link state - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkState {
    /// No usable network.
    Offline,
    /// Network available.
    Online {
        /// Latest measured quality.
        quality: NetworkQuality,
    },
}

impl LinkState {
    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: LinkEvent, policy: &LinkPolicy) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            (Self::Online { .. }, LinkEvent::ConnectivityLost { reason }) => (
                Self::Offline,
                vec![
                    LinkAction::PauseDispatch,
                    LinkAction::RequeueInProgress,
                    LinkAction::Notify(LinkNotice::WentOffline { reason }),
                ],
            ),

            (Self::Offline, LinkEvent::ConnectivityRestored { quality }) => {
                let mut actions = vec![LinkAction::Notify(LinkNotice::CameOnline { quality })];
                if quality.allows_burst(policy.burst_threshold) && policy.burst_size > 0 {
                    actions.push(LinkAction::PriorityBurst {
                        max: policy.burst_size,
                    });
                }
                actions.push(LinkAction::ResumeDispatch {
                    batch_size: quality.batch_size(policy.max_batch),
                });
                (Self::Online { quality }, actions)
            }

            (
                Self::Online { .. },
                LinkEvent::ConnectivityRestored { quality } | LinkEvent::QualityChanged { quality },
            ) => (
                Self::Online { quality },
                vec![LinkAction::ResumeDispatch {
                    batch_size: quality.batch_size(policy.max_batch),
                }],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the link is usable.
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online { .. })
    }

    /// Current quality, if online.
    pub fn quality(&self) -> Option<NetworkQuality> {
        match self {
            Self::Online { quality } => Some(*quality),
            Self::Offline => None,
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Online {
            quality: NetworkQuality::default(),
        }
    }
}

/// Events that can occur on the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Network went away.
    ConnectivityLost {
        /// Why.
        reason: String,
    },
    /// Network came back.
    ConnectivityRestored {
        /// Measured quality.
        quality: NetworkQuality,
    },
    /// Quality changed while online.
    QualityChanged {
        /// New quality.
        quality: NetworkQuality,
    },
}

/// Actions to be executed by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    /// Stop dispatching batches.
    PauseDispatch,
    /// Return in-flight operations to the front of the queue.
    RequeueInProgress,
    /// Dispatch up to `max` high-priority operations now.
    PriorityBurst {
        /// Burst size.
        max: usize,
    },
    /// Dispatch batches of this size.
    ResumeDispatch {
        /// Batch size.
        batch_size: usize,
    },
    /// Tell the application.
    Notify(LinkNotice),
}

/// Link notices for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotice {
    /// Link dropped.
    WentOffline {
        /// Why.
        reason: String,
    },
    /// Link restored.
    CameOnline {
        /// Measured quality.
        quality: NetworkQuality,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LinkPolicy {
        LinkPolicy::default()
    }

    #[test]
    fn starts_online() {
        assert!(LinkState::default().is_online());
    }

    #[test]
    fn losing_connectivity_requeues_and_pauses() {
        let (state, actions) = LinkState::default().on_event(
            LinkEvent::ConnectivityLost {
                reason: "wifi off".into(),
            },
            &policy(),
        );

        assert_eq!(state, LinkState::Offline);
        assert!(actions.contains(&LinkAction::RequeueInProgress));
        assert!(actions.contains(&LinkAction::PauseDispatch));
        assert!(actions
            .iter()
            .any(|a| matches!(a, LinkAction::Notify(LinkNotice::WentOffline { .. }))));
    }

    #[test]
    fn reliable_reconnect_fires_burst_before_resuming() {
        let (state, actions) = LinkState::Offline.on_event(
            LinkEvent::ConnectivityRestored {
                quality: NetworkQuality::broadband(0.95),
            },
            &policy(),
        );

        assert!(state.is_online());
        let burst = actions
            .iter()
            .position(|a| *a == LinkAction::PriorityBurst { max: 3 })
            .unwrap();
        let resume = actions
            .iter()
            .position(|a| *a == LinkAction::ResumeDispatch { batch_size: 10 })
            .unwrap();
        assert!(burst < resume);
    }

    #[test]
    fn unreliable_reconnect_skips_burst() {
        let (_, actions) = LinkState::Offline.on_event(
            LinkEvent::ConnectivityRestored {
                quality: NetworkQuality::broadband(0.5),
            },
            &policy(),
        );

        assert!(!actions
            .iter()
            .any(|a| matches!(a, LinkAction::PriorityBurst { .. })));
        assert!(actions.contains(&LinkAction::ResumeDispatch { batch_size: 1 }));
    }

    #[test]
    fn quality_change_resizes_batches() {
        let (state, actions) = LinkState::default().on_event(
            LinkEvent::QualityChanged {
                quality: NetworkQuality::broadband(0.7),
            },
            &policy(),
        );

        assert_eq!(state.quality().unwrap().reliability, 0.7);
        assert_eq!(actions, vec![LinkAction::ResumeDispatch { batch_size: 5 }]);
    }

    #[test]
    fn events_while_offline_are_ignored_except_restore() {
        let (state, actions) = LinkState::Offline.on_event(
            LinkEvent::QualityChanged {
                quality: NetworkQuality::broadband(1.0),
            },
            &policy(),
        );
        assert_eq!(state, LinkState::Offline);
        assert!(actions.is_empty());

        let (state, actions) = LinkState::Offline.on_event(
            LinkEvent::ConnectivityLost {
                reason: "again".into(),
            },
            &policy(),
        );
        assert_eq!(state, LinkState::Offline);
        assert!(actions.is_empty());
    }
}

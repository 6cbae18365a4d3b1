//! Business-level connection states and the transitions between them
//!
//! Raw link callbacks carry a `(status, phase)` pair. The session engine
//! folds those into [`ConnectionState`] values, arms a watchdog for every
//! state that waits on the peer, and refuses any transition the graph below
//! does not allow:
//!
//! ```text
//! Created -> Connecting -> Connected -> ServiceDiscoveryStarted
//!     -> ServicesDiscovered -> Ready
//!     -> ServicesDiscoveryError
//! any live state -> Disconnecting | Disconnected | ConnectionStateError | UnknownState
//! Connecting / Connected -> ConnectionStageTimeout
//! ServiceDiscoveryStarted -> ServicesDiscoveryTimeout
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ble::gatt::GattStatus;
use crate::ble::transport::phase;
use crate::config::GattConfig;

/// Link stage a connection watchdog was guarding when it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStage {
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    ServiceDiscoveryStarted,
    ServicesDiscovered,
    ServicesDiscoveryError { status: GattStatus },
    Ready,
    Disconnecting,
    Disconnected,
    ConnectionStageTimeout { stage: ConnectionStage },
    ServicesDiscoveryTimeout,
    ConnectionStateError { phase: i32, status: GattStatus },
    UnknownState(i32),
}

/// Phases guarded by the single session watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogPhase {
    Connecting,
    Connected,
    ServiceDiscovery,
}

impl WatchdogPhase {
    /// How long the phase may last before the watchdog fires.
    pub fn limit(self, config: &GattConfig) -> Duration {
        match self {
            WatchdogPhase::Connecting => config.connecting_timeout(),
            WatchdogPhase::Connected => config.connected_timeout(),
            WatchdogPhase::ServiceDiscovery => config.service_discovery_timeout(),
        }
    }

    /// The state the watchdog is guarding.
    pub fn guarded_state(self) -> ConnectionState {
        match self {
            WatchdogPhase::Connecting => ConnectionState::Connecting,
            WatchdogPhase::Connected => ConnectionState::Connected,
            WatchdogPhase::ServiceDiscovery => ConnectionState::ServiceDiscoveryStarted,
        }
    }

    /// The terminal state entered when the watchdog fires.
    pub fn timeout_state(self) -> ConnectionState {
        match self {
            WatchdogPhase::Connecting => ConnectionState::ConnectionStageTimeout {
                stage: ConnectionStage::Connecting,
            },
            WatchdogPhase::Connected => ConnectionState::ConnectionStageTimeout {
                stage: ConnectionStage::Connected,
            },
            WatchdogPhase::ServiceDiscovery => ConnectionState::ServicesDiscoveryTimeout,
        }
    }
}

/// Happy-path phases that may be entered at most once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OneShotPhase {
    Connecting,
    Connected,
    DiscoveryStarted,
    DiscoveryFinished,
    Ready,
}

impl OneShotPhase {
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// What the engine must do to the link after a connection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    None,
    DiscoverServices,
    Close,
}

/// Outcome of folding one raw connection callback into the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub action: LinkAction,
}

impl ConnectionState {
    /// States after which the session can never make progress again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::ConnectionStageTimeout { .. }
                | ConnectionState::ServicesDiscoveryTimeout
                | ConnectionState::ConnectionStateError { .. }
                | ConnectionState::UnknownState(_)
        )
    }

    /// The watchdog that must be armed while in this state, if any.
    pub fn watchdog(&self) -> Option<WatchdogPhase> {
        match self {
            ConnectionState::Connecting => Some(WatchdogPhase::Connecting),
            ConnectionState::Connected => Some(WatchdogPhase::Connected),
            ConnectionState::ServiceDiscoveryStarted => Some(WatchdogPhase::ServiceDiscovery),
            _ => None,
        }
    }

    pub fn one_shot_phase(&self) -> Option<OneShotPhase> {
        match self {
            ConnectionState::Connecting => Some(OneShotPhase::Connecting),
            ConnectionState::Connected => Some(OneShotPhase::Connected),
            ConnectionState::ServiceDiscoveryStarted => Some(OneShotPhase::DiscoveryStarted),
            ConnectionState::ServicesDiscovered | ConnectionState::ServicesDiscoveryError { .. } => {
                Some(OneShotPhase::DiscoveryFinished)
            }
            ConnectionState::Ready => Some(OneShotPhase::Ready),
            _ => None,
        }
    }

    /// Whether the graph allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Created => false,
            Connecting => *self == Created,
            Connected => *self == Connecting,
            ServiceDiscoveryStarted => *self == Connected,
            ServicesDiscovered | ServicesDiscoveryError { .. } => {
                *self == ServiceDiscoveryStarted
            }
            Ready => *self == ServicesDiscovered,
            Disconnecting => *self != Disconnecting,
            ConnectionStageTimeout {
                stage: ConnectionStage::Connecting,
            } => *self == Connecting,
            ConnectionStageTimeout {
                stage: ConnectionStage::Connected,
            } => *self == Connected,
            ServicesDiscoveryTimeout => *self == ServiceDiscoveryStarted,
            Disconnected | ConnectionStateError { .. } | UnknownState(_) => true,
        }
    }

    /// Fold a raw `(phase, status)` connection callback into the next state.
    ///
    /// Returns `None` when the callback does not move the session, e.g. a
    /// duplicate `CONNECTED` or a callback arriving after a terminal state.
    pub fn on_connection_change(&self, raw_phase: i32, status: GattStatus) -> Option<Transition> {
        let transition = if !status.is_success() {
            Transition {
                next: ConnectionState::ConnectionStateError {
                    phase: raw_phase,
                    status,
                },
                action: LinkAction::Close,
            }
        } else {
            match raw_phase {
                phase::CONNECTING => Transition {
                    next: ConnectionState::Connecting,
                    action: LinkAction::None,
                },
                phase::CONNECTED => Transition {
                    next: ConnectionState::Connected,
                    action: LinkAction::DiscoverServices,
                },
                phase::DISCONNECTING => Transition {
                    next: ConnectionState::Disconnecting,
                    action: LinkAction::None,
                },
                phase::DISCONNECTED => Transition {
                    next: ConnectionState::Disconnected,
                    action: LinkAction::Close,
                },
                other => Transition {
                    next: ConnectionState::UnknownState(other),
                    action: LinkAction::Close,
                },
            }
        };
        self.can_transition_to(&transition.next)
            .then_some(transition)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Created => write!(f, "Created"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::ServiceDiscoveryStarted => write!(f, "ServiceDiscoveryStarted"),
            ConnectionState::ServicesDiscovered => write!(f, "ServicesDiscovered"),
            ConnectionState::ServicesDiscoveryError { status } => {
                write!(f, "ServicesDiscoveryError({})", status)
            }
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::ConnectionStageTimeout { stage } => {
                write!(f, "ConnectionStageTimeout({:?})", stage)
            }
            ConnectionState::ServicesDiscoveryTimeout => write!(f, "ServicesDiscoveryTimeout"),
            ConnectionState::ConnectionStateError { phase, status } => {
                write!(f, "ConnectionStateError(phase {}, {})", phase, status)
            }
            ConnectionState::UnknownState(phase) => write!(f, "UnknownState({})", phase),
        }
    }
}

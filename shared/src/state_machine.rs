//! Connection Lifecycle State Machine
//!
//! The manager's visible state is derived from which roles are alive. Role
//! starts and stops are fed in as events; the machine answers with the
//! resulting state so the caller knows whether to notify.

use std::fmt;

/// The single current state of a connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No role is running
    Idle,
    /// A listener is waiting for an inbound peer
    Listening,
    /// An outbound attempt is in flight
    Connecting,
    /// A session is live
    Connected,
    /// The manager has been torn down
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Role lifecycle events that can change the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A listener was spawned
    ListenerStarted,
    /// The listener ended (accepted, failed or was cancelled)
    ListenerStopped,
    /// An initiator was spawned
    OutboundStarted,
    /// The initiator ended (connected, failed or was cancelled)
    OutboundStopped,
    /// A session worker was installed
    SessionStarted,
    /// The session worker ended
    SessionEnded,
    /// The manager is being torn down
    Shutdown,
}

/// Result of feeding an event to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The visible state changed
    Changed { from: ConnectionState, to: ConnectionState },
    /// Role bookkeeping changed but the visible state did not
    Unchanged(ConnectionState),
    /// The machine is closed and ignores further events
    Rejected { event: LifecycleEvent },
}

/// Tracks live roles and derives the visible connection state
#[derive(Debug, Default)]
pub struct LifecycleStateMachine {
    listener: bool,
    initiator: bool,
    session: bool,
    closed: bool,
}

impl LifecycleStateMachine {
    /// Create a machine with no live roles
    pub fn new() -> Self {
        Self::default()
    }

    /// Current visible state
    ///
    /// An in-flight outbound attempt dominates a live session, which in turn
    /// dominates a waiting listener.
    pub fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else if self.initiator {
            ConnectionState::Connecting
        } else if self.session {
            ConnectionState::Connected
        } else if self.listener {
            ConnectionState::Listening
        } else {
            ConnectionState::Idle
        }
    }

    /// Apply an event and report the transition
    pub fn process_event(&mut self, event: LifecycleEvent) -> TransitionResult {
        if self.closed {
            return TransitionResult::Rejected { event };
        }

        let from = self.state();
        match event {
            LifecycleEvent::ListenerStarted => self.listener = true,
            LifecycleEvent::ListenerStopped => self.listener = false,
            LifecycleEvent::OutboundStarted => self.initiator = true,
            LifecycleEvent::OutboundStopped => self.initiator = false,
            LifecycleEvent::SessionStarted => self.session = true,
            LifecycleEvent::SessionEnded => self.session = false,
            LifecycleEvent::Shutdown => {
                self.listener = false;
                self.initiator = false;
                self.session = false;
                self.closed = true;
            }
        }

        let to = self.state();
        if from == to {
            TransitionResult::Unchanged(to)
        } else {
            debug_assert!(is_valid_transition(from, to), "{from} -> {to}");
            TransitionResult::Changed { from, to }
        }
    }
}

/// Check if a visible state change is one the lifecycle allows
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (a, b) if a == b => true,

        // Teardown is reachable from anywhere, and never left
        (_, Closed) => true,
        (Closed, _) => false,

        (Idle, Listening) => true,
        (Idle | Listening | Connected, Connecting) => true,
        (Listening, Connected) => true,
        (Connecting, Connected) => true,

        // Failed or cancelled attempt falls back to whatever is still alive
        (Connecting, Idle | Listening) => true,

        // Session or listener ended
        (Connected, Idle | Listening) => true,
        (Listening, Idle) => true,

        _ => false,
    }
}

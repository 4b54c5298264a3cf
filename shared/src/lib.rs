//! bt-chat Shared Protocol Types
//!
//! This crate provides the transport-independent types shared by every part
//! of a bt-chat peer: peer identities, the service identifier both sides
//! rendezvous on, connection states, notification events and errors.

pub mod error;
pub mod state_machine;

pub use error::{ConnectionError, ErrorKind};
pub use state_machine::{ConnectionState, LifecycleEvent, LifecycleStateMachine, TransitionResult};

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Protocol parameters shared by both peers
pub mod protocol {
    /// Service record UUID used for both listening and connecting
    pub const SERVICE_UUID: &str = "8ce255c0-200a-11e0-ac64-0800200c9a66";

    /// Service record name advertised by the listener
    pub const SERVICE_NAME: &str = "bt-chat";

    /// Size of the session read buffer in bytes
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Outbound connect attempts are abandoned after this long
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Writes queued per session before callers wait on the transport
    pub const WRITE_QUEUE_DEPTH: usize = 32;

    /// How long the adapter stays discoverable when asked to
    pub const DISCOVERABLE_TIMEOUT_SECS: u32 = 300;

    /// Default length of a discovery scan
    pub const SCAN_DURATION_SECS: u64 = 12;
}

/// Identity of a remote peer, as chosen by discovery or the user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Transport-specific address (a Bluetooth MAC, a socket address, ...)
    pub address: String,
    /// Human-readable name, when the peer advertises one
    pub name: Option<String>,
}

impl Endpoint {
    /// Create an endpoint without a display name
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    /// Create an endpoint with a display name
    pub fn named(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Namespace value identifying the chat protocol's service record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The well-known service every bt-chat peer listens on
    pub fn chat() -> Self {
        Self(Uuid::from_u128(0x8ce255c0_200a_11e0_ac64_0800200c9a66))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::chat()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How a session came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Accepted by the listener
    Inbound,
    /// Opened by the initiator
    Outbound,
}

impl fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOrigin::Inbound => write!(f, "inbound"),
            SessionOrigin::Outbound => write!(f, "outbound"),
        }
    }
}

/// Notifications delivered to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The manager's connection state changed
    StateChanged(ConnectionState),
    /// A new session is live with `peer`
    SessionEstablished { peer: Endpoint, origin: SessionOrigin },
    /// Bytes arrived from the peer, decoded as text
    IncomingMessage { text: String, bytes_read: usize },
    /// A role or session reported a failure
    SessionError { kind: ErrorKind, reason: String },
}

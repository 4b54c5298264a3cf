//! bt-chat: a single point-to-point chat connection over Bluetooth RFCOMM
//!
//! The [`ConnectionManager`] listens for one inbound peer, opens outbound
//! connections on request, and relays raw bytes over whichever session is
//! current. Transports are pluggable: RFCOMM through BlueZ, TCP for
//! development, and an in-memory hub for tests.

pub mod connection;
pub mod discovery;
pub mod transport;

pub use bt_chat_shared::{
    protocol, ChatEvent, ConnectionError, ConnectionState, Endpoint, ErrorKind, ServiceId,
    SessionOrigin,
};
pub use connection::{ConnectionManager, EventReceiver, ManagerConfig, PendingTarget};
pub use discovery::{DiscoveryControl, NoDiscovery};

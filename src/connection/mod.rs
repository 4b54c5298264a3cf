//! Connection lifecycle for a single chat peer
//!
//! This module handles:
//! - Listening for one inbound peer on the chat service record
//! - Outbound connect attempts, at most one in flight
//! - Handing established sockets to a full-duplex session worker
//! - Lifecycle notifications for the presentation layer

mod initiator;
mod listener;
mod manager;
mod role;
mod session;

pub use initiator::PendingTarget;
pub use manager::{ConnectionManager, EventReceiver, ManagerConfig};

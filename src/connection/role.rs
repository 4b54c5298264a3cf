//! Plumbing shared by the listener, initiator and session roles

use crate::transport::BoxedStream;
use bt_chat_shared::{ChatEvent, ConnectionError, Endpoint, ErrorKind};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifies one spawned role instance; never reused within a manager
pub(crate) type RoleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoleKind {
    Listener,
    Initiator,
    Session,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleKind::Listener => write!(f, "listener"),
            RoleKind::Initiator => write!(f, "initiator"),
            RoleKind::Session => write!(f, "session"),
        }
    }
}

/// Outcomes a role reports back to the manager's supervisor
pub(crate) enum RoleReport {
    /// The listener accepted a peer; `last` means the listener has ended
    Accepted {
        id: RoleId,
        stream: BoxedStream,
        peer: Endpoint,
        last: bool,
    },
    /// The listener ended without a connection
    ListenerEnded { id: RoleId, error: ConnectionError },
    /// The initiator's connect attempt succeeded
    Connected {
        id: RoleId,
        stream: BoxedStream,
        peer: Endpoint,
    },
    /// The initiator's connect attempt failed or timed out
    ConnectFailed {
        id: RoleId,
        peer: Endpoint,
        reason: String,
    },
    /// The session's read loop ended
    SessionEnded { id: RoleId, reason: String },
}

pub(crate) type ReportSender = mpsc::UnboundedSender<RoleReport>;

/// Delivers notifications to the presentation layer
///
/// A receiver that has gone away is not an error for the lifecycle.
#[derive(Clone)]
pub(crate) struct EventSink(mpsc::UnboundedSender<ChatEvent>);

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ChatEvent>) -> Self {
        Self(tx)
    }

    pub(crate) fn emit(&self, event: ChatEvent) {
        let _ = self.0.send(event);
    }

    pub(crate) fn error(&self, kind: ErrorKind, reason: impl Into<String>) {
        self.emit(ChatEvent::SessionError {
            kind,
            reason: reason.into(),
        });
    }

    /// Publish a lifecycle failure under its notification kind
    pub(crate) fn failure(&self, error: &ConnectionError) {
        match error.kind() {
            Some(kind) => self.error(kind, error.to_string()),
            None => debug!("[ROLE] Not reporting {}", error),
        }
    }
}

/// Handle to a running role task
///
/// Cancelling (or dropping) the handle aborts the task. Every socket the task
/// owns is dropped with it, which is what unblocks a pending accept, connect
/// or read on the transport.
pub(crate) struct RoleHandle {
    id: RoleId,
    kind: RoleKind,
    task: JoinHandle<()>,
}

impl RoleHandle {
    pub(crate) fn spawn<F>(id: RoleId, kind: RoleKind, role: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            id,
            kind,
            task: tokio::spawn(role),
        }
    }

    pub(crate) fn id(&self) -> RoleId {
        self.id
    }

    pub(crate) fn cancel(self) {
        debug!("[ROLE] Cancelling {} #{}", self.kind, self.id);
        drop(self);
    }
}

impl Drop for RoleHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

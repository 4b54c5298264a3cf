//! Error taxonomy for the connection lifecycle

use std::fmt;
use thiserror::Error;

/// Coarse classification of lifecycle failures, as reported to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The listener could not register its service record / bind
    ListenSetupFailed,
    /// The listener's accept failed; the listener simply ends
    AcceptFailed,
    /// An outbound connect attempt failed or timed out
    OutboundConnectFailed,
    /// The session read loop ended
    SessionClosed,
    /// A write to the session failed
    WriteFailed,
    /// No session is alive to write to
    NoActiveSession,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ListenSetupFailed => "listen setup failed",
            ErrorKind::AcceptFailed => "accept failed",
            ErrorKind::OutboundConnectFailed => "outbound connect failed",
            ErrorKind::SessionClosed => "session closed",
            ErrorKind::WriteFailed => "write failed",
            ErrorKind::NoActiveSession => "no active session",
        };
        f.write_str(s)
    }
}

/// Errors returned by the connection manager's public operations
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Listen setup failed: {0}")]
    ListenSetupFailed(String),

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Outbound connect to {endpoint} failed: {reason}")]
    OutboundConnectFailed { endpoint: String, reason: String },

    #[error("Session closed")]
    SessionClosed,

    #[error("Write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("No active session")]
    NoActiveSession,

    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("Connection manager has been shut down")]
    ManagerClosed,
}

impl ConnectionError {
    /// Map to the notification kind, if this error has one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ConnectionError::ListenSetupFailed(_) => Some(ErrorKind::ListenSetupFailed),
            ConnectionError::AcceptFailed(_) => Some(ErrorKind::AcceptFailed),
            ConnectionError::OutboundConnectFailed { .. } => Some(ErrorKind::OutboundConnectFailed),
            ConnectionError::SessionClosed => Some(ErrorKind::SessionClosed),
            ConnectionError::WriteFailed(_) => Some(ErrorKind::WriteFailed),
            ConnectionError::NoActiveSession => Some(ErrorKind::NoActiveSession),
            ConnectionError::InvalidEndpoint(_) | ConnectionError::ManagerClosed => None,
        }
    }
}

//! Transport trait abstraction for pluggable rendezvous backends

use anyhow::Result;
use async_trait::async_trait;
use bt_chat_shared::{Endpoint, ServiceId};
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected byte stream to a peer
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed stream handed from a role to its session worker
pub type BoxedStream = Box<dyn TransportStream>;

/// A connection accepted by a listener
pub struct Accepted {
    pub stream: BoxedStream,
    pub peer: Endpoint,
}

/// A bound server socket waiting for inbound peers
///
/// Dropping the listener closes the socket and unregisters the service.
#[async_trait]
pub trait TransportListener: Send {
    /// Wait for the next inbound connection
    async fn accept(&mut self) -> Result<Accepted>;

    /// Address peers should connect to, if the transport knows it
    fn local_endpoint(&self) -> Option<Endpoint> {
        None
    }
}

/// Factory for listening and connecting on one kind of transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind a server socket advertising `service` under `name`
    async fn listen(&self, service: ServiceId, name: &str) -> Result<Box<dyn TransportListener>>;

    /// Open a connection to `service` on `endpoint`
    async fn connect(&self, endpoint: &Endpoint, service: ServiceId) -> Result<BoxedStream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

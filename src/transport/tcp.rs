//! TCP simulation transport for development without a Bluetooth radio
//!
//! Endpoints are socket addresses. The service identifier is not part of a
//! TCP rendezvous, so every peer simply listens on its configured address.

use crate::transport::traits::{Accepted, BoxedStream, Transport, TransportListener};
use anyhow::Result;
use async_trait::async_trait;
use bt_chat_shared::{ConnectionError, Endpoint, ServiceId};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Default address a simulated peer listens on
pub const DEFAULT_TCP_LISTEN_ADDR: &str = "127.0.0.1:9000";

/// TCP transport bound to one local listen address
pub struct TcpTransport {
    listen_addr: SocketAddr,
}

impl TcpTransport {
    /// Create a new TCP transport that listens on `listen_addr`
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }
}

/// Bound TCP server socket
pub struct TcpTransportListener {
    inner: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        debug!("[TCP] Accepted connection from {}", addr);
        Ok(Accepted {
            stream: Box::new(stream),
            peer: Endpoint::new(addr.to_string()),
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .local_addr()
            .ok()
            .map(|addr| Endpoint::new(addr.to_string()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, service: ServiceId, name: &str) -> Result<Box<dyn TransportListener>> {
        let inner = TcpListener::bind(self.listen_addr).await?;
        info!(
            "[TCP] Listening on {} for {} ({})",
            inner.local_addr()?,
            name,
            service
        );
        Ok(Box::new(TcpTransportListener { inner }))
    }

    async fn connect(&self, endpoint: &Endpoint, _service: ServiceId) -> Result<BoxedStream> {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .map_err(|_| ConnectionError::InvalidEndpoint(endpoint.address.clone()))?;

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

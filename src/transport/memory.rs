//! In-process transport over `tokio::io::duplex` pipes
//!
//! Every peer gets a [`MemoryTransport`] from a shared [`MemoryHub`]. Addresses
//! with no live listener refuse connections; addresses marked silent accept
//! the attempt but never answer, which is how a stalled peer looks.

use crate::transport::traits::{Accepted, BoxedStream, Transport, TransportListener};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bt_chat_shared::{Endpoint, ServiceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

/// Buffer size of each in-memory pipe direction
const PIPE_CAPACITY: usize = 64 * 1024;

enum Slot {
    Listening {
        service: ServiceId,
        tx: mpsc::Sender<(DuplexStream, Endpoint)>,
    },
    Silent {
        pending: Arc<AtomicUsize>,
    },
}

/// Shared address space for in-memory peers
#[derive(Clone, Default)]
pub struct MemoryHub {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a peer at `address`
    pub fn transport(&self, address: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            local: Endpoint::new(address),
        }
    }

    /// Make connects to `address` hang until cancelled
    pub fn silence(&self, address: impl Into<String>) {
        let mut slots = self.lock();
        slots.insert(
            address.into(),
            Slot::Silent {
                pending: Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    /// Connect attempts currently hanging on a silent address
    pub fn pending_connects(&self, address: &str) -> usize {
        match self.lock().get(address) {
            Some(Slot::Silent { pending }) => pending.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Whether a listener is currently bound at `address`
    pub fn is_listening(&self, address: &str) -> bool {
        matches!(
            self.lock().get(address),
            Some(Slot::Listening { tx, .. }) if !tx.is_closed()
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // A poisoned map is still structurally valid
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One peer's view of a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    local: Endpoint,
}

impl MemoryTransport {
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }
}

/// Listener bound to a hub address
pub struct MemoryListener {
    rx: mpsc::Receiver<(DuplexStream, Endpoint)>,
    local: Endpoint,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let (stream, peer) = self
            .rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("Listener unbound"))?;
        Ok(Accepted {
            stream: Box::new(stream),
            peer,
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        Some(self.local.clone())
    }
}

/// Decrements a silent slot's pending count when the attempt is dropped
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, service: ServiceId, _name: &str) -> Result<Box<dyn TransportListener>> {
        let mut slots = self.hub.lock();
        if let Some(Slot::Listening { tx, .. }) = slots.get(&self.local.address) {
            if !tx.is_closed() {
                bail!("Address already bound: {}", self.local.address);
            }
        }

        let (tx, rx) = mpsc::channel(8);
        slots.insert(self.local.address.clone(), Slot::Listening { service, tx });
        Ok(Box::new(MemoryListener {
            rx,
            local: self.local.clone(),
        }))
    }

    async fn connect(&self, endpoint: &Endpoint, service: ServiceId) -> Result<BoxedStream> {
        let target = {
            let slots = self.hub.lock();
            match slots.get(&endpoint.address) {
                Some(Slot::Listening { service: bound, tx }) => {
                    if *bound != service {
                        bail!("Service {} not found on {}", service, endpoint.address);
                    }
                    Ok(tx.clone())
                }
                Some(Slot::Silent { pending }) => {
                    pending.fetch_add(1, Ordering::SeqCst);
                    Err(PendingGuard(pending.clone()))
                }
                None => bail!("Connection refused by {}", endpoint.address),
            }
        };

        match target {
            Ok(tx) => {
                let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
                tx.send((remote, self.local.clone()))
                    .await
                    .map_err(|_| anyhow!("Connection refused by {}", endpoint.address))?;
                Ok(Box::new(local))
            }
            // Held until the attempt is dropped
            Err(_guard) => futures::future::pending().await,
        }
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

//! Bluetooth peer discovery
//!
//! Discovery sits outside the connection lifecycle: it produces `Endpoint`s
//! for the user to pick from. The lifecycle only needs to stop a running
//! scan before connecting, since inquiry and connection setup contend for
//! the radio.

/// Ability to stop an in-progress discovery scan
pub trait DiscoveryControl: Send + Sync + 'static {
    fn cancel_discovery(&self);
}

/// Used when nothing is ever scanning
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

impl DiscoveryControl for NoDiscovery {
    fn cancel_discovery(&self) {}
}

#[cfg(feature = "bluetooth")]
pub use scan::{DiscoveryConfig, PeerDiscovery};

#[cfg(feature = "bluetooth")]
mod scan {
    use super::DiscoveryControl;
    use anyhow::Result;
    use bluer::{Adapter, AdapterEvent, Address};
    use bt_chat_shared::{protocol, Endpoint};
    use futures::StreamExt;
    use std::collections::HashSet;
    use std::sync::{Mutex, MutexGuard};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info};

    /// Configuration for Bluetooth discovery
    #[derive(Debug, Clone)]
    pub struct DiscoveryConfig {
        /// How long to scan for devices
        pub scan_duration: Duration,
        /// Only report devices whose name starts with this
        pub name_prefix: Option<String>,
    }

    impl Default for DiscoveryConfig {
        fn default() -> Self {
            Self {
                scan_duration: Duration::from_secs(protocol::SCAN_DURATION_SECS),
                name_prefix: None,
            }
        }
    }

    /// Scans for nearby devices on one adapter, one scan at a time
    pub struct PeerDiscovery {
        config: DiscoveryConfig,
        cancel: Mutex<CancellationToken>,
    }

    impl PeerDiscovery {
        pub fn new(config: DiscoveryConfig) -> Self {
            Self {
                config,
                cancel: Mutex::new(CancellationToken::new()),
            }
        }

        /// Scan until the configured duration elapses or the scan is cancelled
        ///
        /// Devices found before a cancellation are still returned.
        pub async fn discover(&self, adapter: &Adapter) -> Result<Vec<Endpoint>> {
            let cancel = self.begin();
            let mut peers = Vec::new();
            let mut seen: HashSet<Address> = HashSet::new();

            let scan = async {
                // Bonded devices are candidates even when not advertising
                for addr in adapter.device_addresses().await? {
                    if let Some(endpoint) = self.endpoint_if_wanted(adapter, addr).await {
                        seen.insert(addr);
                        peers.push(endpoint);
                    }
                }

                let discover = adapter.discover_devices().await?;
                tokio::pin!(discover);

                while let Some(evt) = discover.next().await {
                    if let AdapterEvent::DeviceAdded(addr) = evt {
                        if !seen.insert(addr) {
                            continue;
                        }
                        if let Some(endpoint) = self.endpoint_if_wanted(adapter, addr).await {
                            debug!("[BT] Found {}", endpoint);
                            peers.push(endpoint);
                        }
                    }
                }
                Ok::<_, anyhow::Error>(())
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = timeout(self.config.scan_duration, scan) => Some(res),
            };

            match outcome {
                None => info!("[BT] Discovery scan cancelled"),
                // Timeout is expected, not an error
                Some(Err(_)) => info!("[BT] Discovery scan completed"),
                Some(Ok(res)) => res?,
            }

            Ok(peers)
        }

        /// Arm a fresh token for the scan about to run
        ///
        /// A cancel that lands any time after this, including before the
        /// scan's first await, stops that scan. Earlier cancels are forgotten.
        fn begin(&self) -> CancellationToken {
            let token = CancellationToken::new();
            *self.lock() = token.clone();
            token
        }

        fn lock(&self) -> MutexGuard<'_, CancellationToken> {
            self.cancel.lock().unwrap_or_else(|e| e.into_inner())
        }

        async fn endpoint_if_wanted(&self, adapter: &Adapter, addr: Address) -> Option<Endpoint> {
            let device = adapter.device(addr).ok()?;
            let name = device.name().await.ok().flatten();

            if let Some(ref prefix) = self.config.name_prefix {
                match name {
                    Some(ref n) if n.starts_with(prefix) => {}
                    _ => return None,
                }
            }

            Some(Endpoint {
                address: addr.to_string(),
                name,
            })
        }
    }

    impl DiscoveryControl for PeerDiscovery {
        fn cancel_discovery(&self) {
            self.lock().cancel();
        }
    }

}

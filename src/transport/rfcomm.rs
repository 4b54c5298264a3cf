//! RFCOMM transport implementation for Bluetooth connections
//!
//! Without a fixed channel the listener registers a service record for the
//! chat UUID with BlueZ and peers find it through SDP. With a fixed channel
//! raw RFCOMM sockets are used instead and no service record is published.

use crate::transport::traits::{Accepted, BoxedStream, Transport, TransportListener};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::rfcomm::{
    Listener, Profile, ProfileHandle, ReqError, Role, SocketAddr as RfcommAddr,
    Stream as RfcommStream,
};
use bluer::{Adapter, Address, Session};
use bt_chat_shared::{ConnectionError, Endpoint, ServiceId};
use futures::StreamExt;
use tracing::{debug, info};

/// Configuration for the RFCOMM transport
#[derive(Debug, Clone, Default)]
pub struct RfcommConfig {
    /// Fixed RFCOMM channel; `None` rendezvous through the service record
    pub channel: Option<u8>,
    /// Require an authenticated (bonded) link
    pub require_authentication: bool,
}

/// RFCOMM transport on the default BlueZ adapter
pub struct RfcommTransport {
    session: Session,
    adapter: Adapter,
    config: RfcommConfig,
}

impl RfcommTransport {
    /// Open a BlueZ session and power up the default adapter
    pub async fn new(config: RfcommConfig) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!(
            "[BT] Using adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        Ok(Self {
            session,
            adapter,
            config,
        })
    }

    /// The adapter backing this transport
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Make this adapter visible to scanning peers for `timeout_secs`
    pub async fn set_discoverable(&self, timeout_secs: u32) -> Result<()> {
        self.adapter.set_discoverable_timeout(timeout_secs).await?;
        self.adapter.set_discoverable(true).await?;
        info!("[BT] Discoverable for {}s", timeout_secs);
        Ok(())
    }

    /// Bond with `endpoint` unless it is already paired
    pub async fn pair(&self, endpoint: &Endpoint) -> Result<()> {
        let addr = parse_address(endpoint)?;
        let device = self.adapter.device(addr)?;

        if device.is_paired().await? {
            info!("[BT] Bond state for {}: {}", endpoint, bond_state(true));
            return Ok(());
        }

        info!("[BT] Bonding with {}", endpoint);
        device
            .pair()
            .await
            .map_err(|e| anyhow!("Pairing with {} failed: {}", endpoint, e))?;
        info!(
            "[BT] Bond state for {}: {}",
            endpoint,
            bond_state(device.is_paired().await?)
        );
        Ok(())
    }

    async fn register_profile(&self, profile: Profile) -> Result<ProfileHandle> {
        Ok(self.session.register_profile(profile).await?)
    }

    fn profile(&self, service: ServiceId, name: &str, role: Role) -> Profile {
        Profile {
            uuid: service.uuid(),
            name: Some(name.to_string()),
            role: Some(role),
            channel: self.config.channel.map(u16::from),
            require_authentication: Some(self.config.require_authentication),
            require_authorization: Some(false),
            ..Default::default()
        }
    }
}

/// Resolve a peer address into an endpoint, picking up its name if known
async fn endpoint_for(adapter: &Adapter, addr: Address) -> Endpoint {
    let name = match adapter.device(addr) {
        Ok(device) => device.name().await.ok().flatten(),
        Err(_) => None,
    };
    Endpoint {
        address: addr.to_string(),
        name,
    }
}

fn parse_address(endpoint: &Endpoint) -> Result<Address> {
    let addr: Address = endpoint
        .address
        .parse()
        .map_err(|_| ConnectionError::InvalidEndpoint(endpoint.address.clone()))?;
    Ok(addr)
}

fn bond_state(paired: bool) -> &'static str {
    if paired {
        "bonded"
    } else {
        "not bonded"
    }
}

enum ListenerKind {
    /// Service record registered with BlueZ
    Profile(ProfileHandle),
    /// Raw socket bound to a fixed channel
    Socket(Listener),
}

/// Bound RFCOMM server; dropping it unregisters the service record
pub struct RfcommTransportListener {
    kind: ListenerKind,
    adapter: Adapter,
}

#[async_trait]
impl TransportListener for RfcommTransportListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let (stream, addr) = match &mut self.kind {
            ListenerKind::Profile(handle) => {
                let req = handle
                    .next()
                    .await
                    .ok_or_else(|| anyhow!("Service record unregistered"))?;
                let addr = req.device();
                (req.accept()?, addr)
            }
            ListenerKind::Socket(listener) => {
                let (stream, sa) = listener.accept().await?;
                (stream, sa.addr)
            }
        };

        debug!("[BT] Accepted RFCOMM connection from {}", addr);
        let peer = endpoint_for(&self.adapter, addr).await;
        Ok(Accepted {
            stream: Box::new(stream),
            peer,
        })
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    async fn listen(&self, service: ServiceId, name: &str) -> Result<Box<dyn TransportListener>> {
        let kind = match self.config.channel {
            Some(channel) => {
                let listener = Listener::bind(RfcommAddr::new(Address::any(), channel)).await?;
                info!("[BT] Listening on RFCOMM channel {}", channel);
                ListenerKind::Socket(listener)
            }
            None => {
                let profile = self.profile(service, name, Role::Server);
                let handle = self.register_profile(profile).await?;
                info!("[BT] Registered service record {} ({})", name, service);
                ListenerKind::Profile(handle)
            }
        };

        Ok(Box::new(RfcommTransportListener {
            kind,
            adapter: self.adapter.clone(),
        }))
    }

    async fn connect(&self, endpoint: &Endpoint, service: ServiceId) -> Result<BoxedStream> {
        let target = parse_address(endpoint)?;

        if self.config.require_authentication {
            self.pair(endpoint).await?;
        }

        if let Some(channel) = self.config.channel {
            info!("[BT] Connecting to {} channel {}", target, channel);
            let stream = RfcommStream::connect(RfcommAddr::new(target, channel))
                .await
                .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;
            return Ok(Box::new(stream));
        }

        // BlueZ resolves the service record and hands the socket back
        // through our client profile as a connect request.
        info!("[BT] Connecting to {} service {}", target, service);
        let profile = self.profile(service, "bt-chat-client", Role::Client);
        let mut handle = self.register_profile(profile).await?;
        let device = self.adapter.device(target)?;
        let uuid = service.uuid();

        let connect = device.connect_profile(&uuid);
        tokio::pin!(connect);
        let mut requested = false;

        loop {
            tokio::select! {
                res = &mut connect, if !requested => {
                    requested = true;
                    res.map_err(|e| anyhow!("RFCOMM profile connect failed: {}", e))?;
                }
                req = handle.next() => {
                    let req = req.ok_or_else(|| anyhow!("Client profile unregistered"))?;
                    if req.device() == target {
                        let stream = req.accept()?;
                        return Ok(Box::new(stream));
                    }
                    debug!("[BT] Rejecting unexpected request from {}", req.device());
                    req.reject(ReqError::Rejected);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

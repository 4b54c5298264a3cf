use anyhow::Result;
use bt_chat::transport::{TcpTransport, DEFAULT_TCP_LISTEN_ADDR};
use bt_chat::{
    protocol, ChatEvent, ConnectionManager, Endpoint, EventReceiver, ManagerConfig, ServiceId,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bt-chat")]
#[command(version)]
#[command(about = "Point-to-point chat over Bluetooth RFCOMM")]
struct Cli {
    /// Transport to rendezvous over
    #[arg(long, value_enum, default_value_t = TransportKind::Rfcomm)]
    transport: TransportKind,

    /// Listen address for the TCP simulation
    #[arg(long, default_value = DEFAULT_TCP_LISTEN_ADDR)]
    listen_addr: SocketAddr,

    /// Use a fixed RFCOMM channel instead of a service record
    #[arg(long)]
    channel: Option<u8>,

    /// Require a bonded link, pairing with the peer before connecting
    #[arg(long)]
    require_auth: bool,

    /// Keep accepting inbound peers after the first one
    #[arg(long)]
    auto_relisten: bool,

    /// Give up on an outbound connection after this many seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Length of a discovery scan in seconds
    #[arg(long, default_value_t = protocol::SCAN_DURATION_SECS)]
    scan_seconds: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a peer to connect, then chat
    Listen {
        /// Make the adapter discoverable while waiting
        #[arg(long)]
        discoverable: bool,
    },
    /// Connect to a peer, then chat
    Connect {
        /// Bluetooth address (or host:port with --transport tcp)
        address: String,
    },
    /// List nearby Bluetooth devices
    Scan {
        /// Only show devices whose name starts with this
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Bond with a Bluetooth device
    Pair {
        /// Bluetooth address of the device
        address: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Bluetooth RFCOMM through BlueZ
    Rfcomm,
    /// TCP simulation for development
    Tcp,
}

/// One line typed into the chat
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Message(String),
    Scan,
    Connect(String),
    Pair(String),
}

impl Input {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }

        let mut words = line.split_whitespace();
        let input = match words.next() {
            Some("/scan") => Input::Scan,
            Some("/connect") => Input::Connect(words.next()?.to_string()),
            Some("/pair") => Input::Pair(words.next()?.to_string()),
            _ => Input::Message(line.to_string()),
        };
        Some(input)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = ManagerConfig {
        auto_relisten: cli.auto_relisten,
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        ..Default::default()
    };

    match &cli.command {
        Commands::Scan { prefix } => {
            let scanner = open_scanner(&cli, prefix.clone()).await?;
            print_peers(&scanner.scan().await?);
            Ok(())
        }
        Commands::Pair { address } => {
            let scanner = open_scanner(&cli, None).await?;
            scanner.pair(address).await
        }
        Commands::Listen { discoverable } => {
            let peer = open_peer(&cli, config).await?;
            if *discoverable {
                match &peer.scanner {
                    Some(scanner) => scanner.set_discoverable().await?,
                    None => warn!("Discoverable mode needs the rfcomm transport"),
                }
            }
            peer.manager.start().await?;
            chat(peer).await
        }
        Commands::Connect { address } => {
            let peer = open_peer(&cli, config).await?;
            // Listen as well; the first session established wins
            peer.manager.start().await?;
            peer.manager
                .start_outbound(Endpoint::new(address.clone()), ServiceId::chat())
                .await?;
            chat(peer).await
        }
    }
}

/// A running manager plus, on Bluetooth, the scanner it shares discovery with
struct Peer {
    manager: ConnectionManager,
    events: EventReceiver,
    scanner: Option<bluetooth::Scanner>,
}

async fn open_scanner(cli: &Cli, name_prefix: Option<String>) -> Result<bluetooth::Scanner> {
    bluetooth::Scanner::open(
        cli.channel,
        cli.require_auth,
        Duration::from_secs(cli.scan_seconds),
        name_prefix,
    )
    .await
}

async fn open_peer(cli: &Cli, config: ManagerConfig) -> Result<Peer> {
    match cli.transport {
        TransportKind::Tcp => {
            info!("Using TCP simulation on {}", cli.listen_addr);
            let transport = TcpTransport::new(cli.listen_addr);
            let (manager, events) = ConnectionManager::new(Arc::new(transport), config);
            Ok(Peer {
                manager,
                events,
                scanner: None,
            })
        }
        TransportKind::Rfcomm => {
            let scanner = open_scanner(cli, None).await?;
            let (manager, events) = scanner.manager(config);
            Ok(Peer {
                manager,
                events,
                scanner: Some(scanner),
            })
        }
    }
}

fn print_peers(peers: &[Endpoint]) {
    if peers.is_empty() {
        println!("No devices found");
    }
    for peer in peers {
        println!("{}\t{}", peer.address, peer.name.as_deref().unwrap_or("-"));
    }
}

/// Relay stdin lines to the peer and print what comes back
async fn chat(peer: Peer) -> Result<()> {
    let Peer {
        manager,
        mut events,
        scanner,
    } = peer;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match Input::parse(&line) {
                    Some(Input::Message(text)) => {
                        if let Err(e) = manager.write(text.as_bytes()).await {
                            warn!("Message not sent: {}", e);
                        }
                    }
                    Some(Input::Connect(address)) => {
                        // Stops a running scan before dialing
                        if let Err(e) = manager.start_outbound(Endpoint::new(address), ServiceId::chat()).await {
                            warn!("Cannot connect: {}", e);
                        }
                    }
                    Some(Input::Scan) => match &scanner {
                        Some(scanner) => {
                            let scanner = scanner.clone();
                            tokio::spawn(async move {
                                match scanner.scan().await {
                                    Ok(peers) => print_peers(&peers),
                                    Err(e) => warn!("Scan failed: {}", e),
                                }
                            });
                        }
                        None => warn!("Scanning needs the rfcomm transport"),
                    },
                    Some(Input::Pair(address)) => match &scanner {
                        Some(scanner) => {
                            let scanner = scanner.clone();
                            tokio::spawn(async move {
                                if let Err(e) = scanner.pair(&address).await {
                                    warn!("{}", e);
                                }
                            });
                        }
                        None => warn!("Pairing needs the rfcomm transport"),
                    },
                    None => {}
                },
                None => break,
            },
            event = events.recv() => match event {
                Some(ChatEvent::IncomingMessage { text, .. }) => println!("< {}", text),
                Some(ChatEvent::SessionEstablished { peer, origin }) => {
                    info!("Connected to {} ({})", peer, origin);
                }
                Some(ChatEvent::StateChanged(state)) => info!("State: {}", state),
                Some(ChatEvent::SessionError { kind, reason }) => warn!("{}: {}", kind, reason),
                None => {
                    error!("Connection manager closed");
                    break;
                }
            },
            _ = &mut ctrl_c => break,
        }
    }

    manager.shutdown().await;
    Ok(())
}

#[cfg(feature = "bluetooth")]
mod bluetooth {
    use anyhow::Result;
    use bt_chat::discovery::{DiscoveryConfig, PeerDiscovery};
    use bt_chat::transport::{RfcommConfig, RfcommTransport};
    use bt_chat::{protocol, ConnectionManager, Endpoint, EventReceiver, ManagerConfig};
    use std::sync::Arc;
    use std::time::Duration;

    /// Adapter access shared by scans, pairing and the connection manager
    #[derive(Clone)]
    pub struct Scanner {
        transport: Arc<RfcommTransport>,
        discovery: Arc<PeerDiscovery>,
    }

    impl Scanner {
        pub async fn open(
            channel: Option<u8>,
            require_authentication: bool,
            scan_duration: Duration,
            name_prefix: Option<String>,
        ) -> Result<Self> {
            let transport = RfcommTransport::new(RfcommConfig {
                channel,
                require_authentication,
            })
            .await?;
            let discovery = PeerDiscovery::new(DiscoveryConfig {
                scan_duration,
                name_prefix,
            });

            Ok(Self {
                transport: Arc::new(transport),
                discovery: Arc::new(discovery),
            })
        }

        /// Manager whose outbound attempts stop this scanner's scans
        pub fn manager(&self, config: ManagerConfig) -> (ConnectionManager, EventReceiver) {
            ConnectionManager::with_discovery(self.transport.clone(), self.discovery.clone(), config)
        }

        pub async fn scan(&self) -> Result<Vec<Endpoint>> {
            self.discovery.discover(self.transport.adapter()).await
        }

        pub async fn pair(&self, address: &str) -> Result<()> {
            self.transport.pair(&Endpoint::new(address)).await
        }

        pub async fn set_discoverable(&self) -> Result<()> {
            self.transport
                .set_discoverable(protocol::DISCOVERABLE_TIMEOUT_SECS)
                .await
        }
    }
}

#[cfg(not(feature = "bluetooth"))]
mod bluetooth {
    use anyhow::{bail, Result};
    use bt_chat::{ConnectionManager, Endpoint, EventReceiver, ManagerConfig};
    use std::time::Duration;

    /// Never constructed without Bluetooth support
    #[derive(Clone)]
    pub enum Scanner {}

    impl Scanner {
        pub async fn open(
            _channel: Option<u8>,
            _require_authentication: bool,
            _scan_duration: Duration,
            _name_prefix: Option<String>,
        ) -> Result<Self> {
            bail!("built without Bluetooth support; use --transport tcp")
        }

        pub fn manager(&self, _config: ManagerConfig) -> (ConnectionManager, EventReceiver) {
            match *self {}
        }

        pub async fn scan(&self) -> Result<Vec<Endpoint>> {
            match *self {}
        }

        pub async fn pair(&self, _address: &str) -> Result<()> {
            match *self {}
        }

        pub async fn set_discoverable(&self) -> Result<()> {
            match *self {}
        }
    }
}

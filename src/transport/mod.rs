pub mod memory;
#[cfg(feature = "bluetooth")]
pub mod rfcomm;
pub mod tcp;
pub mod traits;

pub use memory::{MemoryHub, MemoryTransport};
#[cfg(feature = "bluetooth")]
pub use rfcomm::{RfcommConfig, RfcommTransport};
pub use tcp::{TcpTransport, DEFAULT_TCP_LISTEN_ADDR};
pub use traits::{Accepted, BoxedStream, Transport, TransportListener, TransportStream};

//! Session worker: relays bytes over one established connection
//!
//! The connection is split into a read loop that publishes everything the
//! peer sends, and a write loop that drains a bounded queue of write
//! requests. Callers wait for their own write to reach the transport, so
//! backpressure is the transport's.

use super::role::{EventSink, ReportSender, RoleHandle, RoleId, RoleKind, RoleReport};
use crate::transport::BoxedStream;
use bt_chat_shared::{ChatEvent, ConnectionError, Endpoint, ErrorKind, SessionOrigin};
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Session buffer sizing
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionConfig {
    pub read_buffer_size: usize,
    pub write_queue_depth: usize,
}

struct WriteRequest {
    bytes: Bytes,
    reply: oneshot::Sender<io::Result<()>>,
}

/// Cloneable handle for writing to a session
#[derive(Clone)]
pub(crate) struct SessionWriter {
    tx: mpsc::Sender<WriteRequest>,
}

impl SessionWriter {
    /// Write the whole span, waiting until the transport has taken it
    pub(crate) async fn write(&self, bytes: Bytes) -> Result<(), ConnectionError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(WriteRequest { bytes, reply })
            .await
            .map_err(|_| ConnectionError::SessionClosed)?;

        match done.await {
            Ok(result) => result.map_err(ConnectionError::WriteFailed),
            Err(_) => Err(ConnectionError::SessionClosed),
        }
    }
}

/// A live session and the two tasks relaying it
pub(crate) struct SessionWorker {
    id: RoleId,
    peer: Endpoint,
    origin: SessionOrigin,
    writer: SessionWriter,
    _reader: RoleHandle,
    _write_loop: RoleHandle,
}

impl SessionWorker {
    /// Start relaying over `stream`
    pub(crate) fn spawn(
        id: RoleId,
        stream: BoxedStream,
        peer: Endpoint,
        origin: SessionOrigin,
        config: SessionConfig,
        events: EventSink,
        reports: ReportSender,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(config.write_queue_depth.max(1));

        info!("[SESSION] #{} started with {} ({})", id, peer, origin);

        let reader = RoleHandle::spawn(
            id,
            RoleKind::Session,
            read_loop(id, read_half, config.read_buffer_size, events.clone(), reports),
        );
        let write_loop = RoleHandle::spawn(id, RoleKind::Session, write_loop(id, write_half, rx, events));

        Self {
            id,
            peer,
            origin,
            writer: SessionWriter { tx },
            _reader: reader,
            _write_loop: write_loop,
        }
    }

    pub(crate) fn id(&self) -> RoleId {
        self.id
    }

    pub(crate) fn peer(&self) -> &Endpoint {
        &self.peer
    }

    pub(crate) fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub(crate) fn writer(&self) -> SessionWriter {
        self.writer.clone()
    }

    /// Close the connection; both halves are dropped with their tasks
    pub(crate) fn cancel(self) {
        info!("[SESSION] #{} with {} cancelled", self.id, self.peer);
    }
}

async fn read_loop<R>(id: RoleId, mut reader: R, buffer_size: usize, events: EventSink, reports: ReportSender)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "peer closed the connection".to_string(),
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                debug!("[SESSION] #{} received {} bytes: {}", id, n, text);
                events.emit(ChatEvent::IncomingMessage { text, bytes_read: n });
            }
            Err(e) => break format!("read failed: {}", e),
        }
    };

    info!("[SESSION] #{} read loop ended: {}", id, reason);
    let _ = reports.send(RoleReport::SessionEnded { id, reason });
}

async fn write_loop<W>(id: RoleId, mut writer: W, mut requests: mpsc::Receiver<WriteRequest>, events: EventSink)
where
    W: AsyncWrite + Unpin,
{
    while let Some(WriteRequest { bytes, reply }) = requests.recv().await {
        debug!(
            "[SESSION] #{} writing {} bytes: {}",
            id,
            bytes.len(),
            String::from_utf8_lossy(&bytes)
        );

        let result = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        // Inbound traffic keeps flowing; the read loop decides when the
        // session is over.
        if let Err(ref e) = result {
            warn!("[SESSION] #{} write failed: {}", id, e);
            events.error(ErrorKind::WriteFailed, e.to_string());
        }

        let _ = reply.send(result);
    }
}

//! Connection manager: owns which listener, initiator and session are current

use super::initiator::{self, PendingTarget};
use super::listener;
use super::role::{EventSink, ReportSender, RoleHandle, RoleId, RoleKind, RoleReport};
use super::session::{SessionConfig, SessionWorker};
use crate::discovery::{DiscoveryControl, NoDiscovery};
use crate::transport::{BoxedStream, Transport};
use bt_chat_shared::{
    protocol, ChatEvent, ConnectionError, ConnectionState, Endpoint, ErrorKind, LifecycleEvent,
    LifecycleStateMachine, ServiceId, SessionOrigin, TransitionResult,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Service record both peers rendezvous on
    pub service: ServiceId,
    /// Name advertised with the service record
    pub service_name: String,
    /// Keep accepting after the first inbound peer
    pub auto_relisten: bool,
    /// Outbound attempts are abandoned after this long
    pub connect_timeout: Duration,
    /// Session read buffer size
    pub read_buffer_size: usize,
    /// Writes queued per session before callers wait
    pub write_queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service: ServiceId::chat(),
            service_name: protocol::SERVICE_NAME.into(),
            auto_relisten: false,
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            read_buffer_size: protocol::READ_BUFFER_SIZE,
            write_queue_depth: protocol::WRITE_QUEUE_DEPTH,
        }
    }
}

/// Receives lifecycle notifications from a manager
pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Roles currently owned by the manager, guarded by one lock
#[derive(Default)]
struct Roles {
    fsm: LifecycleStateMachine,
    listener: Option<RoleHandle>,
    initiator: Option<RoleHandle>,
    session: Option<SessionWorker>,
}

struct Inner {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn DiscoveryControl>,
    events: EventSink,
    reports: ReportSender,
    next_id: AtomicU64,
    roles: Mutex<Roles>,
}

/// Manages the single peer-to-peer chat connection
///
/// Control methods only swap roles under the lock and return; every accept,
/// connect, read and write happens on role tasks.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    supervisor: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a manager over `transport`, returning it with its event stream
    pub fn new(transport: Arc<dyn Transport>, config: ManagerConfig) -> (Self, EventReceiver) {
        Self::with_discovery(transport, Arc::new(NoDiscovery), config)
    }

    /// Create a manager that stops `discovery` before each outbound attempt
    pub fn with_discovery(
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn DiscoveryControl>,
        config: ManagerConfig,
    ) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            transport,
            discovery,
            events: EventSink::new(event_tx),
            reports: report_tx,
            next_id: AtomicU64::new(1),
            roles: Mutex::new(Roles::default()),
        });

        // Spawn the supervisor that applies role outcomes
        let supervisor = tokio::spawn(supervise(inner.clone(), report_rx));

        (Self { inner, supervisor }, event_rx)
    }

    /// Cancel any outbound attempt and make sure a listener is running
    pub async fn start(&self) -> Result<(), ConnectionError> {
        let mut roles = self.inner.roles.lock().await;
        if roles.fsm.state() == ConnectionState::Closed {
            return Err(ConnectionError::ManagerClosed);
        }

        if let Some(initiator) = roles.initiator.take() {
            initiator.cancel();
            self.inner.apply(&mut roles, LifecycleEvent::OutboundStopped);
        }

        if roles.listener.is_none() {
            let id = self.inner.next_id();
            let inner = &self.inner;
            let role = listener::run(
                id,
                inner.transport.clone(),
                inner.config.service,
                inner.config.service_name.clone(),
                inner.config.auto_relisten,
                inner.reports.clone(),
            );
            roles.listener = Some(RoleHandle::spawn(id, RoleKind::Listener, role));
            self.inner.apply(&mut roles, LifecycleEvent::ListenerStarted);
        } else {
            debug!("[MANAGER] Listener already running");
        }

        Ok(())
    }

    /// Replace any outbound attempt with one targeting `endpoint`
    ///
    /// A live session is left alone until the new attempt succeeds.
    pub async fn start_outbound(&self, endpoint: Endpoint, service: ServiceId) -> Result<(), ConnectionError> {
        let mut roles = self.inner.roles.lock().await;
        if roles.fsm.state() == ConnectionState::Closed {
            return Err(ConnectionError::ManagerClosed);
        }

        if let Some(previous) = roles.initiator.take() {
            info!("[MANAGER] Superseding outbound attempt #{}", previous.id());
            previous.cancel();
        }

        let id = self.inner.next_id();
        let role = initiator::run(
            id,
            self.inner.transport.clone(),
            self.inner.discovery.clone(),
            PendingTarget { endpoint, service },
            self.inner.config.connect_timeout,
            self.inner.reports.clone(),
        );
        roles.initiator = Some(RoleHandle::spawn(id, RoleKind::Initiator, role));
        self.inner.apply(&mut roles, LifecycleEvent::OutboundStarted);

        Ok(())
    }

    /// Write `bytes` to the current session
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let writer = {
            let roles = self.inner.roles.lock().await;
            roles
                .session
                .as_ref()
                .map(SessionWorker::writer)
                .ok_or(ConnectionError::NoActiveSession)?
        };

        writer.write(Bytes::copy_from_slice(bytes)).await
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.inner.roles.lock().await.fsm.state()
    }

    /// Peer of the current session, if any
    pub async fn peer(&self) -> Option<Endpoint> {
        let roles = self.inner.roles.lock().await;
        roles.session.as_ref().map(|s| s.peer().clone())
    }

    /// Cancel every role and close the manager for good
    pub async fn shutdown(&self) {
        let mut roles = self.inner.roles.lock().await;

        if let Some(listener) = roles.listener.take() {
            listener.cancel();
        }
        if let Some(initiator) = roles.initiator.take() {
            initiator.cancel();
        }
        if let Some(session) = roles.session.take() {
            session.cancel();
            self.inner.events.error(ErrorKind::SessionClosed, "connection manager shut down");
        }

        self.inner.apply(&mut roles, LifecycleEvent::Shutdown);
        info!("[MANAGER] Shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // The supervisor holds the other reference to the roles; once both
        // are gone every role handle is dropped and its task aborted.
        self.supervisor.abort();
    }
}

impl Inner {
    fn next_id(&self) -> RoleId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Feed a lifecycle event to the state machine and notify on change
    fn apply(&self, roles: &mut Roles, event: LifecycleEvent) {
        match roles.fsm.process_event(event) {
            TransitionResult::Changed { from, to } => {
                info!("[MANAGER] {} -> {}", from, to);
                self.events.emit(ChatEvent::StateChanged(to));
            }
            TransitionResult::Unchanged(_) => {}
            TransitionResult::Rejected { event } => {
                debug!("[MANAGER] Ignoring {:?} after shutdown", event);
            }
        }
    }

    /// Replace any current session with one over `stream`
    fn establish_session(&self, roles: &mut Roles, stream: BoxedStream, peer: Endpoint, origin: SessionOrigin) {
        if let Some(previous) = roles.session.take() {
            info!(
                "[MANAGER] Replacing {} session with {}",
                previous.origin(),
                previous.peer()
            );
            previous.cancel();
            self.events.error(ErrorKind::SessionClosed, "replaced by a new session");
        }

        self.events.emit(ChatEvent::SessionEstablished {
            peer: peer.clone(),
            origin,
        });
        self.apply(roles, LifecycleEvent::SessionStarted);

        let config = SessionConfig {
            read_buffer_size: self.config.read_buffer_size,
            write_queue_depth: self.config.write_queue_depth,
        };
        let worker = SessionWorker::spawn(
            self.next_id(),
            stream,
            peer,
            origin,
            config,
            self.events.clone(),
            self.reports.clone(),
        );
        roles.session = Some(worker);
    }

    /// Apply one role outcome, ignoring outcomes from superseded roles
    async fn handle_report(&self, report: RoleReport) {
        let mut roles = self.roles.lock().await;

        match report {
            RoleReport::Accepted {
                id,
                stream,
                peer,
                last,
            } => {
                if roles.listener.as_ref().map(RoleHandle::id) != Some(id) {
                    debug!("[MANAGER] Dropping connection from stale listener #{}", id);
                    return;
                }

                self.establish_session(&mut roles, stream, peer, SessionOrigin::Inbound);

                // The first session established wins over a pending outbound attempt
                if let Some(initiator) = roles.initiator.take() {
                    info!(
                        "[MANAGER] Inbound peer arrived first, dropping outbound attempt #{}",
                        initiator.id()
                    );
                    initiator.cancel();
                    self.apply(&mut roles, LifecycleEvent::OutboundStopped);
                }

                if last {
                    roles.listener = None;
                    self.apply(&mut roles, LifecycleEvent::ListenerStopped);
                }
            }

            RoleReport::ListenerEnded { id, error } => {
                if roles.listener.as_ref().map(RoleHandle::id) != Some(id) {
                    return;
                }

                roles.listener = None;
                warn!("[MANAGER] Listener ended: {}", error);
                self.events.failure(&error);
                self.apply(&mut roles, LifecycleEvent::ListenerStopped);
            }

            RoleReport::Connected { id, stream, peer } => {
                if roles.initiator.as_ref().map(RoleHandle::id) != Some(id) {
                    info!("[MANAGER] Discarding superseded connection to {}", peer);
                    return;
                }

                roles.initiator = None;
                self.establish_session(&mut roles, stream, peer, SessionOrigin::Outbound);
                self.apply(&mut roles, LifecycleEvent::OutboundStopped);
            }

            RoleReport::ConnectFailed { id, peer, reason } => {
                if roles.initiator.as_ref().map(RoleHandle::id) != Some(id) {
                    return;
                }

                roles.initiator = None;
                let error = ConnectionError::OutboundConnectFailed {
                    endpoint: peer.address,
                    reason,
                };
                self.events.failure(&error);
                self.apply(&mut roles, LifecycleEvent::OutboundStopped);
            }

            RoleReport::SessionEnded { id, reason } => {
                if roles.session.as_ref().map(SessionWorker::id) != Some(id) {
                    return;
                }

                if let Some(session) = roles.session.take() {
                    info!("[MANAGER] Session with {} ended", session.peer());
                }
                self.events.error(ErrorKind::SessionClosed, reason);
                self.apply(&mut roles, LifecycleEvent::SessionEnded);
            }
        }
    }
}

/// Apply role outcomes one at a time, in arrival order
async fn supervise(inner: Arc<Inner>, mut reports: mpsc::UnboundedReceiver<RoleReport>) {
    while let Some(report) = reports.recv().await {
        inner.handle_report(report).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, TcpTransport};
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    fn manager(hub: &MemoryHub, address: &str, config: ManagerConfig) -> (ConnectionManager, EventReceiver) {
        ConnectionManager::new(Arc::new(hub.transport(address)), config)
    }

    /// Receive events until one matches, failing after `WAIT`
    async fn wait_for<F>(events: &mut EventReceiver, mut pred: F) -> ChatEvent
    where
        F: FnMut(&ChatEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Everything emitted within a short quiet period
    async fn drain(events: &mut EventReceiver) -> Vec<ChatEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
            seen.push(event);
        }
        seen
    }

    async fn wait_listening(hub: &MemoryHub, address: &str) {
        timeout(WAIT, async {
            while !hub.is_listening(address) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener never bound");
    }

    fn is_state(state: ConnectionState) -> impl FnMut(&ChatEvent) -> bool {
        move |e| *e == ChatEvent::StateChanged(state)
    }

    /// A listening on "AA" and B connected to it
    async fn connected_pair(
        hub: &MemoryHub,
    ) -> (ConnectionManager, EventReceiver, ConnectionManager, EventReceiver) {
        let (a, mut a_events) = manager(hub, "AA", ManagerConfig::default());
        let (b, mut b_events) = manager(hub, "BB", ManagerConfig::default());

        a.start().await.unwrap();
        wait_listening(hub, "AA").await;
        b.start_outbound(Endpoint::new("AA"), ServiceId::chat()).await.unwrap();

        wait_for(&mut a_events, is_state(ConnectionState::Connected)).await;
        wait_for(&mut b_events, is_state(ConnectionState::Connected)).await;
        (a, a_events, b, b_events)
    }

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.service, ServiceId::chat());
        assert!(!config.auto_relisten);
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_start_twice_keeps_one_listener() {
        let hub = MemoryHub::new();
        let (a, mut events) = manager(&hub, "AA", ManagerConfig::default());

        a.start().await.unwrap();
        a.start().await.unwrap();
        wait_listening(&hub, "AA").await;

        // A second listener would fail to bind the same address
        let seen = drain(&mut events).await;
        assert_eq!(seen, vec![ChatEvent::StateChanged(ConnectionState::Listening)]);
        assert_eq!(a.state().await, ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_concurrent_start_keeps_one_listener() {
        let hub = MemoryHub::new();
        let (a, mut events) = manager(&hub, "AA", ManagerConfig::default());

        let (first, second) = tokio::join!(a.start(), a.start());
        first.unwrap();
        second.unwrap();
        wait_listening(&hub, "AA").await;

        let seen = drain(&mut events).await;
        assert_eq!(seen, vec![ChatEvent::StateChanged(ConnectionState::Listening)]);
    }

    #[tokio::test]
    async fn test_handshake_and_message() {
        let hub = MemoryHub::new();
        let (a, mut a_events) = manager(&hub, "AA", ManagerConfig::default());
        let (b, mut b_events) = manager(&hub, "BB", ManagerConfig::default());

        a.start().await.unwrap();
        assert_eq!(a_events.recv().await, Some(ChatEvent::StateChanged(ConnectionState::Listening)));
        wait_listening(&hub, "AA").await;

        b.start_outbound(Endpoint::new("AA"), ServiceId::chat()).await.unwrap();
        assert_eq!(b_events.recv().await, Some(ChatEvent::StateChanged(ConnectionState::Connecting)));

        let established = wait_for(&mut a_events, |e| matches!(e, ChatEvent::SessionEstablished { .. })).await;
        assert_eq!(
            established,
            ChatEvent::SessionEstablished {
                peer: Endpoint::new("BB"),
                origin: SessionOrigin::Inbound,
            }
        );
        wait_for(&mut a_events, is_state(ConnectionState::Connected)).await;

        let established = wait_for(&mut b_events, |e| matches!(e, ChatEvent::SessionEstablished { .. })).await;
        assert_eq!(
            established,
            ChatEvent::SessionEstablished {
                peer: Endpoint::new("AA"),
                origin: SessionOrigin::Outbound,
            }
        );
        wait_for(&mut b_events, is_state(ConnectionState::Connected)).await;

        b.write(b"hi").await.unwrap();
        let incoming = wait_for(&mut a_events, |e| matches!(e, ChatEvent::IncomingMessage { .. })).await;
        assert_eq!(
            incoming,
            ChatEvent::IncomingMessage {
                text: "hi".into(),
                bytes_read: 2,
            }
        );

        assert_eq!(a.peer().await, Some(Endpoint::new("BB")));
        assert_eq!(b.peer().await, Some(Endpoint::new("AA")));

        // The listener does not re-arm by default
        assert!(!hub.is_listening("AA"));
    }

    #[tokio::test]
    async fn test_refused_connect_returns_to_idle() {
        let hub = MemoryHub::new();
        let (b, mut events) = manager(&hub, "BB", ManagerConfig::default());

        b.start_outbound(Endpoint::new("ZZ"), ServiceId::chat()).await.unwrap();

        let seen = drain(&mut events).await;
        assert_eq!(seen.len(), 3, "{:?}", seen);
        assert_eq!(seen[0], ChatEvent::StateChanged(ConnectionState::Connecting));
        assert!(matches!(
            seen[1],
            ChatEvent::SessionError {
                kind: ErrorKind::OutboundConnectFailed,
                ..
            }
        ));
        assert_eq!(seen[2], ChatEvent::StateChanged(ConnectionState::Idle));

        assert_eq!(b.state().await, ConnectionState::Idle);
        assert!(matches!(b.write(b"x").await, Err(ConnectionError::NoActiveSession)));
    }

    #[tokio::test]
    async fn test_failed_connect_falls_back_to_listening() {
        let hub = MemoryHub::new();
        let (b, mut events) = manager(&hub, "BB", ManagerConfig::default());

        b.start().await.unwrap();
        b.start_outbound(Endpoint::new("ZZ"), ServiceId::chat()).await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, ChatEvent::SessionError { kind: ErrorKind::OutboundConnectFailed, .. })
        })
        .await;
        wait_for(&mut events, is_state(ConnectionState::Listening)).await;
    }

    #[tokio::test]
    async fn test_new_outbound_supersedes_pending_attempt() {
        let hub = MemoryHub::new();
        hub.silence("CC");
        let (a, _a_events) = manager(&hub, "AA", ManagerConfig::default());
        let (b, mut b_events) = manager(&hub, "BB", ManagerConfig::default());

        a.start().await.unwrap();
        wait_listening(&hub, "AA").await;

        b.start_outbound(Endpoint::new("CC"), ServiceId::chat()).await.unwrap();
        timeout(WAIT, async {
            while hub.pending_connects("CC") == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        b.start_outbound(Endpoint::new("AA"), ServiceId::chat()).await.unwrap();
        wait_for(&mut b_events, is_state(ConnectionState::Connected)).await;
        assert_eq!(b.peer().await, Some(Endpoint::new("AA")));

        // The superseded attempt was dropped, not left hanging
        timeout(WAIT, async {
            while hub.pending_connects("CC") > 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("superseded attempt still pending");

        let established = drain(&mut b_events)
            .await
            .into_iter()
            .filter(|e| matches!(e, ChatEvent::SessionEstablished { .. }))
            .count();
        assert_eq!(established, 0);
    }

    #[tokio::test]
    async fn test_inbound_peer_wins_over_pending_attempt() {
        let hub = MemoryHub::new();
        hub.silence("CC");
        let (a, mut a_events) = manager(&hub, "AA", ManagerConfig::default());
        let (b, mut b_events) = manager(&hub, "BB", ManagerConfig::default());

        a.start().await.unwrap();
        wait_listening(&hub, "AA").await;
        a.start_outbound(Endpoint::new("CC"), ServiceId::chat()).await.unwrap();
        timeout(WAIT, async {
            while hub.pending_connects("CC") == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        b.start_outbound(Endpoint::new("AA"), ServiceId::chat()).await.unwrap();
        wait_for(&mut b_events, is_state(ConnectionState::Connected)).await;

        let established = wait_for(&mut a_events, |e| matches!(e, ChatEvent::SessionEstablished { .. })).await;
        assert_eq!(
            established,
            ChatEvent::SessionEstablished {
                peer: Endpoint::new("BB"),
                origin: SessionOrigin::Inbound,
            }
        );
        wait_for(&mut a_events, is_state(ConnectionState::Connected)).await;
        assert_eq!(a.state().await, ConnectionState::Connected);

        // The stalled attempt is gone, so it can no longer replace B's session
        timeout(WAIT, async {
            while hub.pending_connects("CC") > 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbound attempt still pending");

        b.write(b"hi").await.unwrap();
        let incoming = wait_for(&mut a_events, |e| matches!(e, ChatEvent::IncomingMessage { .. })).await;
        assert_eq!(
            incoming,
            ChatEvent::IncomingMessage {
                text: "hi".into(),
                bytes_read: 2,
            }
        );
        assert_eq!(a.peer().await, Some(Endpoint::new("BB")));
    }

    #[tokio::test]
    async fn test_start_cancels_pending_attempt() {
        let hub = MemoryHub::new();
        hub.silence("CC");
        let (b, mut events) = manager(&hub, "BB", ManagerConfig::default());

        b.start_outbound(Endpoint::new("CC"), ServiceId::chat()).await.unwrap();
        b.start().await.unwrap();

        let seen = drain(&mut events).await;
        assert_eq!(
            seen,
            vec![
                ChatEvent::StateChanged(ConnectionState::Connecting),
                ChatEvent::StateChanged(ConnectionState::Idle),
                ChatEvent::StateChanged(ConnectionState::Listening),
            ]
        );
        assert_eq!(hub.pending_connects("CC"), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let hub = MemoryHub::new();
        hub.silence("CC");
        let config = ManagerConfig {
            connect_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let (b, mut events) = manager(&hub, "BB", config);

        b.start_outbound(Endpoint::new("CC"), ServiceId::chat()).await.unwrap();

        let failure = wait_for(&mut events, |e| matches!(e, ChatEvent::SessionError { .. })).await;
        match failure {
            ChatEvent::SessionError { kind, reason } => {
                assert_eq!(kind, ErrorKind::OutboundConnectFailed);
                assert!(reason.contains("timed out"), "{}", reason);
            }
            _ => unreachable!(),
        }
        assert_eq!(hub.pending_connects("CC"), 0);
    }

    #[tokio::test]
    async fn test_peer_close_reports_session_closed_once() {
        let hub = MemoryHub::new();
        let (a, _a_events, b, mut b_events) = connected_pair(&hub).await;

        a.shutdown().await;

        let mut seen = Vec::new();
        timeout(WAIT, async {
            while let Some(event) = b_events.recv().await {
                let idle = event == ChatEvent::StateChanged(ConnectionState::Idle);
                seen.push(event);
                if idle {
                    break;
                }
            }
        })
        .await
        .expect("peer never went idle");
        seen.extend(drain(&mut b_events).await);

        let closed = seen
            .iter()
            .filter(|e| matches!(e, ChatEvent::SessionError { kind: ErrorKind::SessionClosed, .. }))
            .count();
        assert_eq!(closed, 1, "{:?}", seen);

        assert!(matches!(b.write(b"anyone?").await, Err(ConnectionError::NoActiveSession)));
        assert_eq!(b.peer().await, None);
    }

    #[tokio::test]
    async fn test_bytes_survive_chunking() {
        let hub = MemoryHub::new();
        let (_a, mut a_events, b, _b_events) = connected_pair(&hub).await;

        let payload: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        for chunk in payload.as_bytes().chunks(700) {
            b.write(chunk).await.unwrap();
        }

        let mut received = String::new();
        while received.len() < payload.len() {
            match wait_for(&mut a_events, |e| matches!(e, ChatEvent::IncomingMessage { .. })).await {
                ChatEvent::IncomingMessage { text, bytes_read } => {
                    assert!(bytes_read <= 1024);
                    assert_eq!(text.len(), bytes_read);
                    received.push_str(&text);
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_auto_relisten_accepts_next_peer() {
        let hub = MemoryHub::new();
        let config = ManagerConfig {
            auto_relisten: true,
            ..Default::default()
        };
        let (a, mut a_events) = manager(&hub, "AA", config);
        let (b, mut b_events) = manager(&hub, "BB", ManagerConfig::default());
        let (c, mut c_events) = manager(&hub, "CC", ManagerConfig::default());

        a.start().await.unwrap();
        wait_listening(&hub, "AA").await;

        b.start_outbound(Endpoint::new("AA"), ServiceId::chat()).await.unwrap();
        wait_for(&mut b_events, is_state(ConnectionState::Connected)).await;
        wait_for(&mut a_events, is_state(ConnectionState::Connected)).await;
        assert!(hub.is_listening("AA"));

        c.start_outbound(Endpoint::new("AA"), ServiceId::chat()).await.unwrap();
        wait_for(&mut c_events, is_state(ConnectionState::Connected)).await;
        wait_for(&mut a_events, |e| {
            *e == ChatEvent::SessionEstablished {
                peer: Endpoint::new("CC"),
                origin: SessionOrigin::Inbound,
            }
        })
        .await;

        // A dropped B's session in favour of C's
        wait_for(&mut b_events, |e| {
            matches!(e, ChatEvent::SessionError { kind: ErrorKind::SessionClosed, .. })
        })
        .await;
        assert_eq!(a.peer().await, Some(Endpoint::new("CC")));
        assert_eq!(a.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let hub = MemoryHub::new();
        let (a, mut events) = manager(&hub, "AA", ManagerConfig::default());

        a.start().await.unwrap();
        wait_listening(&hub, "AA").await;
        a.shutdown().await;

        wait_for(&mut events, is_state(ConnectionState::Closed)).await;
        assert_eq!(a.state().await, ConnectionState::Closed);
        assert!(matches!(a.start().await, Err(ConnectionError::ManagerClosed)));
        assert!(matches!(
            a.start_outbound(Endpoint::new("BB"), ServiceId::chat()).await,
            Err(ConnectionError::ManagerClosed)
        ));

        timeout(WAIT, async {
            while hub.is_listening("AA") {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener still bound after shutdown");
    }

    #[tokio::test]
    async fn test_listen_setup_failure_is_reported() {
        let hub = MemoryHub::new();
        let _squatter = hub.transport("AA").listen(ServiceId::chat(), "other").await.unwrap();
        let (a, mut events) = manager(&hub, "AA", ManagerConfig::default());

        a.start().await.unwrap();
        let failure = wait_for(&mut events, |e| {
            matches!(e, ChatEvent::SessionError { kind: ErrorKind::ListenSetupFailed, .. })
        })
        .await;
        match failure {
            ChatEvent::SessionError { reason, .. } => {
                assert!(reason.starts_with("Listen setup failed"), "{}", reason);
            }
            _ => unreachable!(),
        }
        wait_for(&mut events, is_state(ConnectionState::Idle)).await;
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let (a, mut a_events) = ConnectionManager::new(Arc::new(TcpTransport::new(addr)), ManagerConfig::default());
        let (b, mut b_events) = ConnectionManager::new(
            Arc::new(TcpTransport::new("127.0.0.1:0".parse().unwrap())),
            ManagerConfig::default(),
        );

        a.start().await.unwrap();

        // Retry until the listener has bound
        let mut connected = false;
        for _ in 0..20 {
            b.start_outbound(Endpoint::new(addr.to_string()), ServiceId::chat()).await.unwrap();
            let outcome = wait_for(&mut b_events, |e| {
                matches!(e, ChatEvent::SessionEstablished { .. } | ChatEvent::SessionError { .. })
            })
            .await;
            if matches!(outcome, ChatEvent::SessionEstablished { .. }) {
                connected = true;
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        assert!(connected, "never connected to {}", addr);
        wait_for(&mut a_events, is_state(ConnectionState::Connected)).await;

        a.write(b"over tcp").await.unwrap();
        let incoming = wait_for(&mut b_events, |e| matches!(e, ChatEvent::IncomingMessage { .. })).await;
        assert_eq!(
            incoming,
            ChatEvent::IncomingMessage {
                text: "over tcp".into(),
                bytes_read: 8,
            }
        );
    }
}

//! Listener role: binds the service and accepts inbound peers

use super::role::{ReportSender, RoleId, RoleReport};
use crate::transport::{Accepted, Transport};
use bt_chat_shared::{ConnectionError, ServiceId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bind `service` and hand accepted connections to the manager
///
/// With `relisten` unset the role ends after the first accepted peer.
/// Cancellation aborts the task and drops the bound socket with it, so a
/// cancelled listener reports nothing.
pub(crate) async fn run(
    id: RoleId,
    transport: Arc<dyn Transport>,
    service: ServiceId,
    service_name: String,
    relisten: bool,
    reports: ReportSender,
) {
    let mut listener = match transport.listen(service, &service_name).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("[LISTENER] Setup failed on {}: {}", transport.name(), e);
            let _ = reports.send(RoleReport::ListenerEnded {
                id,
                error: ConnectionError::ListenSetupFailed(e.to_string()),
            });
            return;
        }
    };

    match listener.local_endpoint() {
        Some(local) => info!("[LISTENER] Waiting for peers on {}", local),
        None => info!("[LISTENER] Waiting for peers via {}", transport.name()),
    }

    loop {
        match listener.accept().await {
            Ok(Accepted { stream, peer }) => {
                info!("[LISTENER] Accepted connection from {}", peer);
                let last = !relisten;
                let _ = reports.send(RoleReport::Accepted {
                    id,
                    stream,
                    peer,
                    last,
                });
                if last {
                    return;
                }
            }
            Err(e) => {
                debug!("[LISTENER] Accept ended: {}", e);
                let _ = reports.send(RoleReport::ListenerEnded {
                    id,
                    error: ConnectionError::AcceptFailed(e.to_string()),
                });
                return;
            }
        }
    }
}

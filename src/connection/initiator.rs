//! Initiator role: one outbound connect attempt to a chosen peer

use super::role::{ReportSender, RoleId, RoleReport};
use crate::discovery::DiscoveryControl;
use crate::transport::Transport;
use bt_chat_shared::{Endpoint, ServiceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// The peer and service an outbound attempt targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTarget {
    pub endpoint: Endpoint,
    pub service: ServiceId,
}

/// Attempt one connection to `target` and report the outcome
///
/// A failed or timed-out attempt drops whatever socket the transport had
/// opened before reporting.
pub(crate) async fn run(
    id: RoleId,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn DiscoveryControl>,
    target: PendingTarget,
    connect_timeout: Duration,
    reports: ReportSender,
) {
    discovery.cancel_discovery();

    info!(
        "[INITIATOR] Connecting to {} via {} ({})",
        target.endpoint,
        transport.name(),
        target.service
    );

    let attempt = timeout(
        connect_timeout,
        transport.connect(&target.endpoint, target.service),
    )
    .await;

    let report = match attempt {
        Ok(Ok(stream)) => {
            info!("[INITIATOR] Connected to {}", target.endpoint);
            RoleReport::Connected {
                id,
                stream,
                peer: target.endpoint,
            }
        }
        Ok(Err(e)) => {
            warn!("[INITIATOR] Connect to {} failed: {}", target.endpoint, e);
            RoleReport::ConnectFailed {
                id,
                peer: target.endpoint,
                reason: e.to_string(),
            }
        }
        Err(_) => {
            warn!(
                "[INITIATOR] Connect to {} timed out after {:?}",
                target.endpoint, connect_timeout
            );
            RoleReport::ConnectFailed {
                id,
                peer: target.endpoint,
                reason: format!("timed out after {:?}", connect_timeout),
            }
        }
    };

    let _ = reports.send(report);
}

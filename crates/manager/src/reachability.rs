//! Network reachability as observed by the host platform.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use blobxfer_protocol::NetworkStatus;

/// Receiving side of the reachability channel, handed to the manager.
#[derive(Clone)]
pub struct Reachability {
    rx: watch::Receiver<NetworkStatus>,
}

/// Publishing side, owned by whatever monitors the network.
#[derive(Clone)]
pub struct ReachabilityHandle {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl Reachability {
    pub fn new(initial: NetworkStatus) -> (Self, ReachabilityHandle) {
        let (tx, rx) = watch::channel(initial);
        (Self { rx }, ReachabilityHandle { tx: Arc::new(tx) })
    }

    pub fn current(&self) -> NetworkStatus {
        *self.rx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.rx.clone()
    }
}

impl ReachabilityHandle {
    /// Publishes a new status. Repeating the current status is a no-op.
    pub fn set(&self, status: NetworkStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(status = ?status, "network status changed");
        }
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }
}

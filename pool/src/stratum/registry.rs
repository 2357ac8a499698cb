//! Live connections of one pool instance.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::protocol::{encode_line, StratumNotification};
use crate::jobs::Job;
use crate::metrics::prometheus as metrics;
use crate::session::WorkerContext;

/// Serialized line queued for one connection's writer.
pub type OutboundMessage = Arc<String>;

/// What the registry and broadcasters need to reach a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub peer: SocketAddr,
    pub context: Arc<Mutex<WorkerContext>>,
    outbound: mpsc::Sender<OutboundMessage>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: String,
        peer: SocketAddr,
        context: Arc<Mutex<WorkerContext>>,
        outbound: mpsc::Sender<OutboundMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            context,
            outbound,
            cancel,
        }
    }

    /// Queue without waiting. A full queue means the peer is not keeping up;
    /// the connection is cancelled instead of buffering without bound.
    pub fn try_send(&self, message: OutboundMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::inc_send_queue_overflows();
                tracing::warn!(peer = %self.peer, conn = %self.id, "send queue full, dropping connection");
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a reply, waiting at most `timeout` for room. On timeout the
    /// connection is cancelled.
    pub async fn send(&self, message: OutboundMessage, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.outbound.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(peer = %self.peer, conn = %self.id, "send timed out, dropping connection");
                self.cancel.cancel();
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) -> usize {
        let mut connections = self.connections.write();
        connections.insert(handle.id.clone(), handle);
        let count = connections.len();
        metrics::set_connections(count);
        count
    }

    pub fn deregister(&self, id: &str) -> usize {
        let mut connections = self.connections.write();
        connections.remove(id);
        let count = connections.len();
        metrics::set_connections(count);
        count
    }

    pub fn connected_miner_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Copy of all handles; the registry lock is released on return.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.read().values().cloned().collect()
    }

    /// Send `mining.notify` for `job` to every subscribed connection.
    ///
    /// Never waits on a connection. Returns how many were reached.
    pub fn broadcast_job(&self, job: &Job) -> usize {
        let notification = StratumNotification::notify(job.notify_params(job.clean_jobs()));
        let line = match encode_line(&notification) {
            Ok(line) => Arc::new(line),
            Err(e) => {
                tracing::error!(job_id = job.id(), "failed to encode job notification: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for handle in self.snapshot() {
            // Checked and queued under the context lock so a concurrent
            // subscribe cannot interleave its own notify out of order.
            let ctx = handle.context.lock();
            if !ctx.subscribed || ctx.disconnected {
                continue;
            }
            if handle.try_send(Arc::clone(&line)) {
                delivered += 1;
            }
        }

        metrics::inc_job_broadcasts();
        tracing::debug!(job_id = job.id(), delivered, "job broadcast");
        delivered
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) fn handle(id: &str, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<OutboundMessage>) {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 5000);
        let ctx = Arc::new(Mutex::new(WorkerContext::new(id.to_string(), peer, 1.0, false)));
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(id.to_string(), peer, ctx, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn register_and_deregister_track_count() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle("a", 4);
        let (b, _rx_b) = handle("b", 4);
        assert_eq!(registry.register(a), 1);
        assert_eq!(registry.register(b), 2);
        assert_eq!(registry.deregister("a"), 1);
        assert_eq!(registry.connected_miner_count(), 1);
        assert_eq!(registry.snapshot()[0].id, "b");
    }

    #[test]
    fn full_queue_cancels_connection() {
        let (h, _rx) = handle("slow", 1);
        assert!(h.try_send(Arc::new("one".into())));
        assert!(!h.try_send(Arc::new("two".into())));
        assert!(h.is_closed());
    }
}

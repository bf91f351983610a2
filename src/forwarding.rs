//! Forwarding table: maps a tunnel IP to the `Connection` that owns it.
//!
//! Per the redesign note in the design docs, the table owns cheap
//! `ConnectionHandle` values (an id and a sender into that connection's tx
//! queue) keyed by IP, rather than aliased pointers into the `Connection`
//! worker state itself. Registration is exclusive; lookup is shared.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::ip::ANY;

/// Maximum number of packets a Connection's egress queue holds before a
/// sender blocks. Blocking push is this tunnel's chosen backpressure
/// policy (see design docs §5): a full queue surfaces congestion to the
/// sender's own flow control rather than silently dropping packets.
pub const TX_QUEUE_DEPTH: usize = 256;

/// A cheap, cloneable reference to a registered Connection: its id (for
/// loop-back detection) and a sender into its egress queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ConnectionHandle {
    pub fn new(id: u64, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { id, tx }
    }

    /// Push a packet onto this connection's egress queue, blocking if full.
    /// Returns an error once the receiving Transmit worker has shut down.
    pub async fn forward(&self, packet: Vec<u8>) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| TunnelError::Transport("egress queue closed".into()))
    }
}

/// `IpAddr -> ConnectionHandle`, reader-writer locked.
#[derive(Default)]
pub struct ForwardingTable {
    inner: RwLock<HashMap<IpAddr, ConnectionHandle>>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under `tunnel_ip`. Inserting a duplicate key is a
    /// fatal programming error: the invariant is that at most one
    /// Connection owns any given tunnel IP (and at most one owns `ANY`).
    pub async fn register(&self, tunnel_ip: IpAddr, handle: ConnectionHandle) -> Result<()> {
        let mut table = self.inner.write().await;
        if table.contains_key(&tunnel_ip) {
            return Err(TunnelError::Fatal(format!(
                "duplicate forwarding-table key {tunnel_ip}"
            )));
        }
        table.insert(tunnel_ip, handle);
        debug!(%tunnel_ip, "registered connection in forwarding table");
        Ok(())
    }

    /// Remove the entry for `tunnel_ip`, if present.
    pub async fn deregister(&self, tunnel_ip: IpAddr) {
        let mut table = self.inner.write().await;
        if table.remove(&tunnel_ip).is_some() {
            debug!(%tunnel_ip, "deregistered connection from forwarding table");
        }
    }

    /// Look up the egress target for `destination`, falling back to the
    /// `ANY` pseudo-connection (the local TUN) when there is no specific
    /// match.
    pub async fn lookup(&self, destination: IpAddr) -> Option<ConnectionHandle> {
        let table = self.inner.read().await;
        table
            .get(&destination)
            .or_else(|| table.get(&ANY))
            .cloned()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> (ConnectionHandle, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(TX_QUEUE_DEPTH);
        (ConnectionHandle::new(id, tx), rx)
    }

    #[tokio::test]
    async fn lookup_falls_back_to_any() {
        let table = ForwardingTable::new();
        let (tun_handle, _rx) = handle(1);
        table.register(ANY, tun_handle).await.unwrap();

        let found = table.lookup("8.8.8.8".parse().unwrap()).await.unwrap();
        assert_eq!(found.id, 1);
    }

    #[tokio::test]
    async fn specific_entry_shadows_any_fallback() {
        let table = ForwardingTable::new();
        let (tun_handle, _rx1) = handle(1);
        let (peer_handle, _rx2) = handle(2);
        table.register(ANY, tun_handle).await.unwrap();
        table.register("11.0.0.3".parse().unwrap(), peer_handle).await.unwrap();

        let found = table.lookup("11.0.0.3".parse().unwrap()).await.unwrap();
        assert_eq!(found.id, 2);
    }

    #[tokio::test]
    async fn duplicate_key_is_fatal() {
        let table = ForwardingTable::new();
        let (h1, _rx1) = handle(1);
        let (h2, _rx2) = handle(2);
        table.register("11.0.0.3".parse().unwrap(), h1).await.unwrap();
        let err = table
            .register("11.0.0.3".parse().unwrap(), h2)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Fatal(_)));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn deregister_removes_entry() {
        let table = ForwardingTable::new();
        let (h, _rx) = handle(1);
        table.register("11.0.0.3".parse().unwrap(), h).await.unwrap();
        table.deregister("11.0.0.3".parse().unwrap()).await;
        assert!(table.lookup("11.0.0.3".parse().unwrap()).await.is_none());
    }
}

//! Process-wide state bundled into one context and passed explicitly,
//! replacing the package-level globals of the original implementation
//! (forwarding table, IPAM pool, connection-id counter).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;

use crate::error::Result;
use crate::forwarding::ForwardingTable;
use crate::ipam::Ipam;

/// Shared state for one running server or client process.
pub struct Runtime {
    pub forwarding: Arc<ForwardingTable>,
    pub ipam: Arc<Ipam>,
    next_connection_id: AtomicU64,
}

impl Runtime {
    pub fn new(pool_prefix: IpNet, max_pool_size: usize) -> Result<(Arc<Self>, IpNet)> {
        let (ipam, network) = Ipam::init(pool_prefix, max_pool_size)?;
        Ok((
            Arc::new(Self {
                forwarding: Arc::new(ForwardingTable::new()),
                ipam: Arc::new(ipam),
                next_connection_id: AtomicU64::new(0),
            }),
            network,
        ))
    }

    /// Allocate the next monotonic, process-wide unique connection id.
    /// Ids start at 1; wrapping back to 0 is a fatal programming error
    /// (exhausted after 2^64 connections, which cannot happen in practice
    /// but is checked to match the original implementation's guard).
    pub fn next_connection_id(&self) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        assert_ne!(id, 0, "connection id counter wrapped around");
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_monotonic_and_nonzero() {
        let (rt, _) = Runtime::new("11.0.0.0/24".parse().unwrap(), 8).unwrap();
        let a = rt.next_connection_id();
        let b = rt.next_connection_id();
        assert!(a >= 1);
        assert!(b > a);
    }
}

//! IP Address Management: a leasable pool of addresses bound to one CIDR.
//!
//! All operations hold a single mutex; pool size is bounded by
//! configuration and each operation is O(pool size), so no further
//! structure (free lists, bitmaps) is warranted.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

use ipnet::IpNet;
use tracing::{info, warn};

use crate::error::{Result, TunnelError};
use crate::ip::{family_of, usable_hosts};

struct Slot {
    addr: IpAddr,
    leased_at: Option<Instant>,
    in_use: bool,
}

struct Pool {
    network: IpNet,
    slots: Vec<Slot>,
}

/// A leasable pool of tunnel addresses bound to one network prefix.
pub struct Ipam {
    pool: Mutex<Pool>,
}

impl Ipam {
    /// Precompute the lease pool for `prefix`, capped at `max_pool_size`
    /// entries. Rejects v4 prefixes shorter than /30 and v6 prefixes
    /// shorter than /126 (too small to host a peer pair plus network and
    /// broadcast addresses). Returns the network prefix as installed
    /// locally on the TUN device.
    pub fn init(prefix: IpNet, max_pool_size: usize) -> Result<(Self, IpNet)> {
        let addr = prefix.addr();
        match addr {
            IpAddr::V4(_) if prefix.prefix_len() > 30 => {
                return Err(TunnelError::Config(
                    "IPv4 network must be at least /30".into(),
                ))
            }
            IpAddr::V6(_) if prefix.prefix_len() > 126 => {
                return Err(TunnelError::Config(
                    "IPv6 network must be at least /126".into(),
                ))
            }
            _ => {}
        }

        // usable_hosts - 2: exclude the network and broadcast addresses.
        let usable = usable_hosts(prefix).saturating_sub(2);
        let capped = usable.min(1u128 << 32).min(max_pool_size as u128);
        let count = capped as usize;

        let network_addr = prefix.network();
        let mut slots = Vec::with_capacity(count);
        // One extra `next_addr` beyond the first usable host: the first
        // usable host is reserved for the local endpoint's own interface
        // address, so the pool itself starts at the second usable host.
        let mut cursor = next_addr(network_addr);
        for _ in 0..count {
            cursor = next_addr(cursor);
            if cursor == network_addr {
                cursor = next_addr(cursor);
            }
            slots.push(Slot {
                addr: cursor,
                leased_at: None,
                in_use: false,
            });
        }

        info!(
            network = %prefix,
            pool_size = slots.len(),
            "initialized IP address pool"
        );

        Ok((
            Self {
                pool: Mutex::new(Pool {
                    network: prefix,
                    slots,
                }),
            },
            prefix,
        ))
    }

    /// Lease the first unused address whose family matches `hint`. `hint`
    /// affects only family selection, never specific-address pinning.
    pub fn lease(&self, hint: IpAddr) -> Option<IpAddr> {
        let mut pool = self.pool.lock().expect("ipam mutex poisoned");
        let family = family_of(hint);
        for slot in pool.slots.iter_mut() {
            if slot.in_use || family_of(slot.addr) != family {
                continue;
            }
            slot.in_use = true;
            slot.leased_at = Some(Instant::now());
            return Some(slot.addr);
        }
        warn!(%hint, "no free IP address available for lease");
        None
    }

    /// Release a previously leased address. Releasing an address not in
    /// the pool is a non-fatal warning.
    pub fn release(&self, addr: IpAddr) {
        let mut pool = self.pool.lock().expect("ipam mutex poisoned");
        for slot in pool.slots.iter_mut() {
            if slot.addr == addr {
                slot.in_use = false;
                slot.leased_at = None;
                return;
            }
        }
        warn!(%addr, "attempted to release address not in pool");
    }

    /// The network this pool was initialized with.
    pub fn network(&self) -> IpNet {
        self.pool.lock().expect("ipam mutex poisoned").network
    }

    /// Number of addresses currently leased out (test/diagnostic use).
    #[cfg(test)]
    fn leased_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|s| s.in_use)
            .count()
    }
}

fn next_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(u32::from(v4).wrapping_add(1).into()),
        IpAddr::V6(v6) => IpAddr::V6(u128::from(v6).wrapping_add(1).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_30_yields_exactly_two_leases() {
        let net: IpNet = "11.0.0.0/30".parse().unwrap();
        let (ipam, _) = Ipam::init(net, 32).unwrap();
        let hint: IpAddr = "0.0.0.0".parse().unwrap();

        let a = ipam.lease(hint).unwrap();
        let b = ipam.lease(hint).unwrap();
        assert!(ipam.lease(hint).is_none());
        assert_ne!(a, b);
        assert_eq!(ipam.leased_count(), 2);
    }

    #[test]
    fn lease_skips_network_address_and_starts_at_second_usable() {
        let net: IpNet = "11.0.0.0/24".parse().unwrap();
        let (ipam, _) = Ipam::init(net, 4).unwrap();
        let hint: IpAddr = "0.0.0.0".parse().unwrap();

        let first = ipam.lease(hint).unwrap();
        assert_eq!(first, "11.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn release_then_release_returns_a_valid_lease() {
        let net: IpNet = "11.0.0.0/24".parse().unwrap();
        let (ipam, _) = Ipam::init(net, 4).unwrap();
        let hint: IpAddr = "0.0.0.0".parse().unwrap();

        let a = ipam.lease(hint).unwrap();
        ipam.release(a);
        let b = ipam.lease(hint).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn releasing_unknown_address_is_non_fatal() {
        let net: IpNet = "11.0.0.0/24".parse().unwrap();
        let (ipam, _) = Ipam::init(net, 4).unwrap();
        ipam.release("9.9.9.9".parse().unwrap());
    }

    #[test]
    fn rejects_too_small_v4_prefix() {
        let net: IpNet = "11.0.0.0/31".parse().unwrap();
        assert!(Ipam::init(net, 32).is_err());
    }

    #[test]
    fn max_pool_size_caps_the_pool() {
        let net: IpNet = "11.0.0.0/24".parse().unwrap();
        let (ipam, _) = Ipam::init(net, 4).unwrap();
        assert_eq!(ipam.pool.lock().unwrap().slots.len(), 4);
    }

    #[test]
    fn lease_honors_family_hint() {
        let net: IpNet = "fd00::/120".parse().unwrap();
        let (ipam, _) = Ipam::init(net, 8).unwrap();
        let v4_hint: IpAddr = "0.0.0.0".parse().unwrap();
        assert!(ipam.lease(v4_hint).is_none());
        let v6_hint: IpAddr = "::".parse().unwrap();
        assert!(ipam.lease(v6_hint).is_some());
    }
}

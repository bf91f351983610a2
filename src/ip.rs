//! Small helpers around `std::net` / `ipnet` types used throughout the
//! tunnel: the `ANY` forwarding-table sentinel and prefix<->range
//! conversions used by the ROUTE_ADVERTISEMENT capsule.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::error::{Result, TunnelError};

/// Sentinel IP `0.0.0.0` used as the forwarding-table key for the local
/// TUN endpoint (the "default" pseudo-connection).
pub const ANY: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// IP protocol version byte as carried on the wire (4 or 6).
pub fn family_of(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 6,
    }
}

/// Maximum prefix length for the address family of `addr` (32 or 128).
pub fn family_bits(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Number of usable host addresses in `prefix` (2^(bits-prefixlen)),
/// saturating so oversized IPv6 ranges don't overflow.
pub fn usable_hosts(net: IpNet) -> u128 {
    let host_bits = match net {
        IpNet::V4(n) => 32u32.saturating_sub(n.prefix_len() as u32),
        IpNet::V6(n) => 128u32.saturating_sub(n.prefix_len() as u32),
    };
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}

/// Convert an inclusive `[start, end]` address range into a single CIDR
/// prefix, failing if the range is not prefix-aligned (i.e. `start` is not
/// the network address and `end` is not the broadcast/last address of some
/// prefix length).
pub fn range_to_prefix(start: IpAddr, end: IpAddr) -> Result<IpNet> {
    match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => {
            let bits = find_prefix_len(u32::from(s), u32::from(e), 32)?;
            let net = IpNet::new(IpAddr::V4(s), bits)
                .map_err(|e| TunnelError::Decode(format!("invalid v4 prefix: {e}")))?;
            if net.network() != IpAddr::V4(s) {
                return Err(TunnelError::Decode("range is not prefix-aligned".into()));
            }
            Ok(net)
        }
        (IpAddr::V6(s), IpAddr::V6(e)) => {
            let bits = find_prefix_len(u128::from(s), u128::from(e), 128)?;
            let net = IpNet::new(IpAddr::V6(s), bits)
                .map_err(|e| TunnelError::Decode(format!("invalid v6 prefix: {e}")))?;
            if net.network() != IpAddr::V6(s) {
                return Err(TunnelError::Decode("range is not prefix-aligned".into()));
            }
            Ok(net)
        }
        _ => Err(TunnelError::Decode(
            "address range mixes IPv4 and IPv6".into(),
        )),
    }
}

/// Find the prefix length `p` such that `end - start == 2^(max_bits-p) - 1`,
/// i.e. the smallest prefix whose range is exactly `[start, end]`.
fn find_prefix_len<T>(start: T, end: T, max_bits: u32) -> Result<u8>
where
    T: Copy + PartialOrd + Into<u128>,
{
    if end < start {
        return Err(TunnelError::Decode("range end precedes start".into()));
    }
    let span: u128 = end.into() - start.into();
    let range_size = span
        .checked_add(1)
        .ok_or_else(|| TunnelError::Decode("address range overflows".into()))?;
    if !range_size.is_power_of_two() {
        return Err(TunnelError::Decode(
            "address range is not prefix-aligned".into(),
        ));
    }
    let host_bits = range_size.trailing_zeros();
    let prefix_len = max_bits
        .checked_sub(host_bits)
        .ok_or_else(|| TunnelError::Decode("address range larger than address family".into()))?;
    Ok(prefix_len as u8)
}

/// Split a prefix into its inclusive `(first, last)` address range, as
/// carried on the wire by ROUTE_ADVERTISEMENT.
pub fn prefix_to_range(net: IpNet) -> (IpAddr, IpAddr) {
    (net.network(), net.broadcast())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn any_is_unspecified_v4() {
        assert_eq!(ANY, IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
    }

    #[test]
    fn range_round_trips_through_prefix() {
        let net: IpNet = "11.0.0.0/24".parse().unwrap();
        let (first, last) = prefix_to_range(net);
        let back = range_to_prefix(first, last).unwrap();
        assert_eq!(back, net);
    }

    #[test]
    fn non_aligned_range_is_rejected() {
        let start: IpAddr = "11.0.0.1".parse().unwrap();
        let end: IpAddr = "11.0.0.5".parse().unwrap();
        assert!(range_to_prefix(start, end).is_err());
    }

    #[test]
    fn usable_hosts_matches_slash_30() {
        let net: IpNet = "11.0.0.0/30".parse().unwrap();
        assert_eq!(usable_hosts(net), 4);
    }
}

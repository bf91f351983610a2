//! CONNECT-IP capsule codec.
//!
//! A capsule on the wire is `type (varint) | length (varint) | payload
//! (length bytes)`. This module decodes/encodes the four capsule types
//! used by this tunnel from/to an async byte stream; the stream itself is
//! whatever carries the CONNECT-IP control channel (an HTTP/3 request
//! stream, wrapped by [`crate::transport`]).

use std::net::IpAddr;

use ipnet::IpNet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::{Result, TunnelError};
use crate::ip::{self, family_bits, family_of};
use crate::varint;

/// Largest payload this codec will allocate for a single capsule.
pub const MAX_CAPSULE_LEN: u64 = 64 * 1024;

/// Capsule type tags, fixed by the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleType {
    /// Present for protocol compliance; IP packets travel as HTTP/3
    /// datagrams, not as DATAGRAM capsules, so this tunnel never emits one.
    Datagram,
    AddressAssign,
    AddressRequest,
    RouteAdvertisement,
}

impl CapsuleType {
    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0x00 => Some(Self::Datagram),
            0x01 => Some(Self::AddressAssign),
            0x02 => Some(Self::AddressRequest),
            0x03 => Some(Self::RouteAdvertisement),
            _ => None,
        }
    }

    fn tag(self) -> u64 {
        match self {
            Self::Datagram => 0x00,
            Self::AddressAssign => 0x01,
            Self::AddressRequest => 0x02,
            Self::RouteAdvertisement => 0x03,
        }
    }
}

/// A decoded capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capsule {
    /// `ADDRESS_ASSIGN`. `request_id == 0` is the server's reply to the
    /// implicit request; any value is otherwise just echoed back.
    AddressAssign { request_id: u64, address: IpNet },
    /// `ADDRESS_REQUEST`. `request_id` must be non-zero on the wire.
    AddressRequest { request_id: u64, address: IpNet },
    /// `ROUTE_ADVERTISEMENT`. `protocol` is carried for forward
    /// compatibility but unused by any forwarding decision.
    RouteAdvertisement { prefix: IpNet, protocol: u8 },
}

fn parse_address(version: u8, addr_bytes: &[u8], prefix_len: u8) -> Result<IpNet> {
    let addr: IpAddr = match (version, addr_bytes.len()) {
        (4, 4) => IpAddr::from(<[u8; 4]>::try_from(addr_bytes).unwrap()),
        (6, 16) => IpAddr::from(<[u8; 16]>::try_from(addr_bytes).unwrap()),
        (v, _) => return Err(TunnelError::Decode(format!("unsupported IP version {v}"))),
    };
    if prefix_len > family_bits(addr) {
        return Err(TunnelError::Decode(format!(
            "prefix length {prefix_len} invalid for family of {addr}"
        )));
    }
    IpNet::new(addr, prefix_len).map_err(|e| TunnelError::Decode(format!("invalid prefix: {e}")))
}

fn encode_address(buf: &mut Vec<u8>, net: IpNet) {
    let addr = net.addr();
    buf.push(family_of(addr));
    match addr {
        IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
    }
    buf.push(net.prefix_len());
}

/// Decode a single capsule's payload given its already-parsed type tag.
fn decode_payload(typ: CapsuleType, payload: &[u8]) -> Result<Capsule> {
    let mut pos = 0usize;
    match typ {
        CapsuleType::Datagram => Err(TunnelError::Decode(
            "DATAGRAM capsule unexpected on control stream".into(),
        )),
        CapsuleType::AddressAssign | CapsuleType::AddressRequest => {
            let (request_id, n) = varint::decode(&payload[pos..])?;
            pos += n;
            if typ == CapsuleType::AddressRequest && request_id == 0 {
                return Err(TunnelError::Decode(
                    "ADDRESS_REQUEST with request_id 0 is a protocol error".into(),
                ));
            }
            let version = *payload
                .get(pos)
                .ok_or_else(|| TunnelError::Decode("short ADDRESS capsule".into()))?;
            pos += 1;
            let addr_len = match version {
                4 => 4,
                6 => 16,
                v => return Err(TunnelError::Decode(format!("unknown IP version {v}"))),
            };
            let addr_bytes = payload
                .get(pos..pos + addr_len)
                .ok_or_else(|| TunnelError::Decode("short ADDRESS capsule".into()))?;
            pos += addr_len;
            let prefix_len = *payload
                .get(pos)
                .ok_or_else(|| TunnelError::Decode("short ADDRESS capsule".into()))?;
            let address = parse_address(version, addr_bytes, prefix_len)?;
            Ok(if typ == CapsuleType::AddressAssign {
                Capsule::AddressAssign { request_id, address }
            } else {
                Capsule::AddressRequest { request_id, address }
            })
        }
        CapsuleType::RouteAdvertisement => {
            let version = *payload
                .get(pos)
                .ok_or_else(|| TunnelError::Decode("short ROUTE capsule".into()))?;
            pos += 1;
            let addr_len = match version {
                4 => 4,
                6 => 16,
                v => return Err(TunnelError::Decode(format!("unknown IP version {v}"))),
            };
            let start_bytes = payload
                .get(pos..pos + addr_len)
                .ok_or_else(|| TunnelError::Decode("short ROUTE capsule".into()))?;
            pos += addr_len;
            let end_bytes = payload
                .get(pos..pos + addr_len)
                .ok_or_else(|| TunnelError::Decode("short ROUTE capsule".into()))?;
            pos += addr_len;
            let protocol = *payload
                .get(pos)
                .ok_or_else(|| TunnelError::Decode("short ROUTE capsule".into()))?;

            let start: IpAddr = match version {
                4 => IpAddr::from(<[u8; 4]>::try_from(start_bytes).unwrap()),
                _ => IpAddr::from(<[u8; 16]>::try_from(start_bytes).unwrap()),
            };
            let end: IpAddr = match version {
                4 => IpAddr::from(<[u8; 4]>::try_from(end_bytes).unwrap()),
                _ => IpAddr::from(<[u8; 16]>::try_from(end_bytes).unwrap()),
            };
            let prefix = ip::range_to_prefix(start, end)?;
            Ok(Capsule::RouteAdvertisement { prefix, protocol })
        }
    }
}

/// Read and decode the next capsule from `r`. Returns `Ok(None)` for an
/// unknown capsule type (logged, skipped, not fatal) and `Err` for any
/// decode failure, which the caller treats as end-of-stream.
pub async fn read_capsule<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Capsule>> {
    let tag = varint::read_async(r).await?;
    let len = varint::read_async(r).await?;
    if len > MAX_CAPSULE_LEN {
        return Err(TunnelError::Decode(format!(
            "capsule length {len} exceeds maximum {MAX_CAPSULE_LEN}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| TunnelError::Decode(format!("short capsule payload: {e}")))?;

    let Some(typ) = CapsuleType::from_tag(tag) else {
        warn!(tag, len, "skipping unknown capsule type");
        return Ok(None);
    };
    decode_payload(typ, &payload).map(Some)
}

fn encode_capsule(typ: CapsuleType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    varint::encode(typ.tag(), &mut out);
    varint::encode(payload.len() as u64, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Encode `capsule` to its wire form.
pub fn encode(capsule: &Capsule) -> Vec<u8> {
    match capsule {
        Capsule::AddressAssign { request_id, address } => {
            let mut payload = Vec::new();
            varint::encode(*request_id, &mut payload);
            encode_address(&mut payload, *address);
            encode_capsule(CapsuleType::AddressAssign, &payload)
        }
        Capsule::AddressRequest { request_id, address } => {
            debug_assert_ne!(*request_id, 0, "ADDRESS_REQUEST id must not be zero");
            let mut payload = Vec::new();
            varint::encode(*request_id, &mut payload);
            encode_address(&mut payload, *address);
            encode_capsule(CapsuleType::AddressRequest, &payload)
        }
        Capsule::RouteAdvertisement { prefix, protocol } => {
            let (first, last) = ip::prefix_to_range(*prefix);
            let mut payload = Vec::new();
            payload.push(family_of(first));
            match (first, last) {
                (IpAddr::V4(f), IpAddr::V4(l)) => {
                    payload.extend_from_slice(&f.octets());
                    payload.extend_from_slice(&l.octets());
                }
                (IpAddr::V6(f), IpAddr::V6(l)) => {
                    payload.extend_from_slice(&f.octets());
                    payload.extend_from_slice(&l.octets());
                }
                _ => unreachable!("prefix_to_range preserves address family"),
            }
            payload.push(*protocol);
            encode_capsule(CapsuleType::RouteAdvertisement, &payload)
        }
    }
}

/// Write `capsule` to `w`.
pub async fn write_capsule<W: AsyncWrite + Unpin>(w: &mut W, capsule: &Capsule) -> Result<()> {
    w.write_all(&encode(capsule)).await?;
    Ok(())
}

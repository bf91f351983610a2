//! A CONNECT-IP/MASQUE layer-3 VPN: IP packets tunneled as HTTP/3
//! datagrams over a QUIC connection, with address assignment and route
//! advertisement negotiated over an HTTP capsule control stream.

pub mod auth;
pub mod capsule;
pub mod config;
pub mod connection;
pub mod error;
pub mod forwarding;
pub mod ip;
pub mod ipam;
pub mod routing;
pub mod runtime;
pub mod session;
pub mod tls;
pub mod transport;
pub mod tun;
pub mod varint;

pub use connection::{Connection, DatagramEndpoint};
pub use error::{Result, TunnelError};
pub use forwarding::ForwardingTable;
pub use ipam::Ipam;
pub use runtime::Runtime;

//! CONNECT-IP session state machines.
//!
//! A session owns the capsule control stream for one peer (server side) or
//! for the tunnel's own uplink (client side). It is independent of the
//! datagram path: IP packets flow as HTTP/3 datagrams through
//! [`crate::connection`], while this module only negotiates address
//! assignment and route advertisement over the capsule stream.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::capsule::{read_capsule, write_capsule, Capsule};
use crate::error::{Result, TunnelError};
use crate::ipam::Ipam;
use crate::routing::RouteInstaller;

/// Server-side CONNECT-IP session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    AwaitRequest,
    Steady,
}

/// Client-side CONNECT-IP session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Start,
    AwaitingAssign,
    ReceivingRoutes,
}

/// Negotiate the server half of one peer's capsule session: lease an
/// address and assign it. Returns the stream (so the caller can keep
/// driving it) and the assigned address; the caller is expected to spawn
/// the datapath [`crate::connection::Connection`] immediately afterward
/// and then drive [`run_server_steady_state`] concurrently with it, rather
/// than waiting for the whole session to finish before the peer can
/// forward any packets.
pub async fn negotiate_server_session<S>(
    mut stream: S,
    ipam: &Ipam,
    hint_family: IpAddr,
) -> Result<(S, IpNet)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut state = ServerState::AwaitRequest;
    let network = ipam.network();
    let assigned = loop {
        let Some(capsule) = read_capsule(&mut stream).await? else {
            continue;
        };
        match (state, capsule) {
            (ServerState::AwaitRequest, Capsule::AddressRequest { request_id, address }) => {
                let hint = if address.addr().is_unspecified() {
                    hint_family
                } else {
                    address.addr()
                };
                let leased = ipam
                    .lease(hint)
                    .ok_or_else(|| TunnelError::Resource("address pool exhausted".into()))?;
                let assigned = IpNet::new(leased, network.prefix_len())
                    .expect("leased address matches pool prefix length");
                write_capsule(
                    &mut stream,
                    &Capsule::AddressAssign {
                        request_id,
                        address: assigned,
                    },
                )
                .await?;
                state = ServerState::Steady;
                break assigned;
            }
            (ServerState::AwaitRequest, other) => {
                warn!(?other, "discarding capsule received before address request");
            }
            _ => unreachable!("loop only runs in AwaitRequest state"),
        }
    };

    debug_assert_eq!(state, ServerState::Steady);
    Ok((stream, assigned))
}

/// Drive the server's steady state on an already-negotiated session:
/// advertise the configured routes, then keep reading (and discarding or
/// rejecting) control traffic until the peer's stream ends. Meant to run
/// concurrently with the peer's datapath Connection, not before it.
pub async fn run_server_steady_state<S>(mut stream: S, routes: &[IpNet]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    for route in routes {
        write_capsule(
            &mut stream,
            &Capsule::RouteAdvertisement {
                prefix: *route,
                protocol: 0,
            },
        )
        .await?;
    }

    loop {
        match read_capsule(&mut stream).await {
            Ok(Some(Capsule::AddressRequest { .. })) => {
                warn!("multiple address requests are not supported, ignoring");
            }
            Ok(Some(other)) => {
                warn!(?other, "unexpected capsule in steady state, ignoring");
            }
            Ok(None) => continue,
            Err(err) => {
                info!(%err, "peer control stream ended");
                return Ok(());
            }
        }
    }
}

/// Negotiate the client half: request an address and wait for assignment,
/// installing the interface address once it arrives. Returns the stream
/// and the assigned address; the caller spawns the datapath Connection
/// immediately afterward and drives [`run_client_route_loop`] concurrently.
pub async fn negotiate_client_session<S>(
    mut stream: S,
    want_family: IpAddr,
    route_installer: &Arc<dyn RouteInstaller>,
    iface: &str,
) -> Result<(S, IpNet)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut state = ClientState::Start;

    let requested = IpNet::new(want_family, if want_family.is_ipv4() { 0 } else { 0 })
        .expect("unspecified address is valid for any prefix length");
    write_capsule(
        &mut stream,
        &Capsule::AddressRequest {
            request_id: 1,
            address: requested,
        },
    )
    .await?;
    state = ClientState::AwaitingAssign;

    let assigned = loop {
        let Some(capsule) = read_capsule(&mut stream).await? else {
            continue;
        };
        match (state, capsule) {
            (ClientState::AwaitingAssign, Capsule::AddressAssign { address, .. }) => {
                route_installer.configure_interface(iface, address).await?;
                state = ClientState::ReceivingRoutes;
                break address;
            }
            (ClientState::AwaitingAssign, Capsule::RouteAdvertisement { .. }) => {
                warn!("discarding route advertisement received before address assignment");
            }
            (ClientState::AwaitingAssign, other) => {
                warn!(?other, "discarding unexpected capsule before address assignment");
            }
            _ => unreachable!("loop only runs in AwaitingAssign state"),
        }
    };

    debug_assert_eq!(state, ClientState::ReceivingRoutes);
    Ok((stream, assigned))
}

/// Drive the client's route-receiving state on an already-negotiated
/// session: install each advertised route as it arrives, recording it in
/// `installed_routes` so the caller can uninstall it on teardown, until
/// the server's stream ends. `port` is the local QUIC socket's UDP source
/// port, needed to install the policy routes a default-route
/// advertisement requires.
pub async fn run_client_route_loop<S>(
    mut stream: S,
    route_installer: Arc<dyn RouteInstaller>,
    iface: &str,
    installed_routes: &tokio::sync::Mutex<Vec<IpNet>>,
    port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        match read_capsule(&mut stream).await {
            Ok(Some(Capsule::RouteAdvertisement { prefix, .. })) => {
                let is_default = prefix.prefix_len() == 0;
                if let Err(err) = route_installer.install(iface, prefix, is_default, port).await {
                    warn!(%err, route = %prefix, "failed to install advertised route");
                } else {
                    installed_routes.lock().await.push(prefix);
                }
            }
            Ok(Some(Capsule::AddressAssign { .. })) => {
                warn!("received a second address assignment, ignoring");
            }
            Ok(Some(other)) => {
                warn!(?other, "unexpected capsule in route-receiving state, ignoring");
            }
            Ok(None) => continue,
            Err(err) => {
                info!(%err, "server control stream ended");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::NullRouteInstaller;
    use tokio::io::duplex;

    #[tokio::test]
    async fn server_leases_and_assigns_an_address() {
        let (client_side, server_side) = duplex(4096);
        let (ipam, _network) = Ipam::init("11.0.0.0/24".parse().unwrap(), 8).unwrap();

        let server_task = tokio::spawn(async move {
            negotiate_server_session(server_side, &ipam, "0.0.0.0".parse().unwrap()).await
        });

        let mut client_side = client_side;
        write_capsule(
            &mut client_side,
            &Capsule::AddressRequest {
                request_id: 1,
                address: "0.0.0.0/0".parse().unwrap(),
            },
        )
        .await
        .unwrap();

        let reply = read_capsule(&mut client_side).await.unwrap().unwrap();
        match reply {
            Capsule::AddressAssign { address, .. } => {
                assert_eq!(address, "11.0.0.2/24".parse().unwrap());
            }
            other => panic!("expected AddressAssign, got {other:?}"),
        }

        drop(client_side);
        let (_stream, assigned) = server_task.await.unwrap().unwrap();
        assert_eq!(assigned, "11.0.0.2/24".parse().unwrap());
    }

    #[tokio::test]
    async fn server_emits_one_route_advertisement_per_configured_route() {
        let (client_side, server_side) = duplex(4096);
        let (ipam, _network) = Ipam::init("11.0.0.0/24".parse().unwrap(), 8).unwrap();
        let routes: Vec<IpNet> = vec!["10.0.0.0/8".parse().unwrap(), "192.168.0.0/16".parse().unwrap()];

        let server_task = tokio::spawn(async move {
            let (stream, _assigned) =
                negotiate_server_session(server_side, &ipam, "0.0.0.0".parse().unwrap())
                    .await
                    .unwrap();
            run_server_steady_state(stream, &routes).await
        });

        let mut client_side = client_side;
        write_capsule(
            &mut client_side,
            &Capsule::AddressRequest {
                request_id: 1,
                address: "0.0.0.0/0".parse().unwrap(),
            },
        )
        .await
        .unwrap();

        let assign = read_capsule(&mut client_side).await.unwrap().unwrap();
        assert!(matches!(assign, Capsule::AddressAssign { .. }));

        let first = read_capsule(&mut client_side).await.unwrap().unwrap();
        let second = read_capsule(&mut client_side).await.unwrap().unwrap();
        assert_eq!(
            first,
            Capsule::RouteAdvertisement {
                prefix: "10.0.0.0/8".parse().unwrap(),
                protocol: 0,
            }
        );
        assert_eq!(
            second,
            Capsule::RouteAdvertisement {
                prefix: "192.168.0.0/16".parse().unwrap(),
                protocol: 0,
            }
        );

        drop(client_side);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_installs_routes_after_assignment() {
        let (client_side, mut server_side) = duplex(4096);
        let installer: Arc<dyn RouteInstaller> = Arc::new(NullRouteInstaller);

        let client_task = tokio::spawn(async move {
            let (stream, assigned) = negotiate_client_session(
                client_side,
                "0.0.0.0".parse().unwrap(),
                &installer,
                "tun0",
            )
            .await
            .unwrap();
            let routes = tokio::sync::Mutex::new(Vec::new());
            run_client_route_loop(stream, installer, "tun0", &routes, 4433)
                .await
                .unwrap();
            assigned
        });

        let req = read_capsule(&mut server_side).await.unwrap().unwrap();
        assert!(matches!(req, Capsule::AddressRequest { request_id: 1, .. }));

        write_capsule(
            &mut server_side,
            &Capsule::AddressAssign {
                request_id: 1,
                address: "11.0.0.2/24".parse().unwrap(),
            },
        )
        .await
        .unwrap();

        write_capsule(
            &mut server_side,
            &Capsule::RouteAdvertisement {
                prefix: "0.0.0.0/0".parse().unwrap(),
                protocol: 0,
            },
        )
        .await
        .unwrap();

        drop(server_side);
        let assigned = client_task.await.unwrap();
        assert_eq!(assigned, "11.0.0.2/24".parse().unwrap());
    }
}

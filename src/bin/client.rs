//! masquetun-client: dials a CONNECT-IP/MASQUE server over HTTP/3, requests
//! a tunnel address, and forwards IP packets between the local TUN device
//! and the server for the lifetime of the session.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use bytes::Bytes;
use clap::Parser;
use h3::client::RequestStream;
use http::StatusCode;
use masquetun::config::{resolve_client_config, ClientArgs};
use masquetun::forwarding::ForwardingTable;
use masquetun::routing::{LinuxRouteInstaller, RouteInstaller};
use masquetun::transport::{spawn_control_bridge, H3DatagramEndpoint};
use masquetun::tun::TunDevice;
use masquetun::{connection, ip, session};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// MASQUE CONNECT-IP path template; the two wildcards are the target host
/// and the client's local UDP source port, per spec.md §4.6/§6.
const MASQUE_PATH_TEMPLATE: &str = "/.well-known/masque/ip/{}/{}/";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = ClientArgs::parse();
    let config = resolve_client_config(args).context("resolving client configuration")?;

    let tun = Arc::new(
        TunDevice::create(&config.iface, config.mtu as usize).context("creating TUN device")?,
    );
    let route_installer: Arc<dyn RouteInstaller> = Arc::new(LinuxRouteInstaller);
    route_installer
        .disable_redirects(tun.name())
        .await
        .context("disabling ICMP redirects")?;

    let forwarding = Arc::new(ForwardingTable::new());

    let (server_host, server_port) = split_host_port(&config.server)?;
    let remote_addr = resolve_addr(&server_host, server_port).await?;

    let local_bind: SocketAddr = if remote_addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let mut endpoint = quinn::Endpoint::client(local_bind).context("binding client QUIC socket")?;
    let local_port = endpoint.local_addr().context("reading local QUIC socket address")?.port();

    let client_identity = config.client_cert.as_deref().zip(config.client_key.as_deref());
    let tls_config = masquetun::tls::client_tls_config(
        config.ca.as_deref(),
        client_identity,
        config.insecure_skip_verify,
    )
    .context("building client TLS configuration")?;
    let quic_client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config.as_ref().clone())
            .context("adapting TLS config to QUIC")?,
    ));
    endpoint.set_default_client_config(quic_client_config);

    info!(server = %config.server, %remote_addr, "connecting to masquetun server");
    let quic_conn = endpoint
        .connect(remote_addr, &server_host)
        .context("starting QUIC handshake")?
        .await
        .context("completing QUIC handshake")?;

    let h3_conn = h3_quinn::Connection::new(quic_conn);
    let (driver, mut send_request) =
        h3::client::new(h3_conn).await.context("establishing h3 connection")?;
    let driver = Arc::new(Mutex::new(driver));

    let path = MASQUE_PATH_TEMPLATE
        .replacen("{}", &server_host, 1)
        .replacen("{}", &local_port.to_string(), 1);
    let uri = format!("https://{server_host}{path}");

    let mut builder = http::Request::builder()
        .method("CONNECT")
        .uri(uri)
        .header("capsule-protocol", "?1");
    if let Some(username) = &config.username {
        let password = config.password.as_deref().unwrap_or_default();
        builder = builder.header(
            http::header::AUTHORIZATION,
            basic_auth_header(username, password),
        );
    }
    let request = builder.body(()).context("building CONNECT-IP request")?;

    let mut stream: RequestStream<_, Bytes> = send_request
        .send_request(request)
        .await
        .context("sending CONNECT-IP request")?;

    let response = stream
        .recv_response()
        .await
        .context("receiving CONNECT-IP response")?;
    if response.status() != StatusCode::OK {
        return Err(anyhow!(
            "server rejected CONNECT-IP request: {}",
            response.status()
        ));
    }
    let echoed_capsule_protocol = response
        .headers()
        .get("capsule-protocol")
        .and_then(|v| v.to_str().ok());
    if echoed_capsule_protocol != Some("?1") {
        tracing::warn!(
            ?echoed_capsule_protocol,
            "server did not echo capsule-protocol header in its response"
        );
    }

    let stream_id = stream.id();
    let (send, recv) = stream.split();
    let (control_stream, _bridge) = spawn_control_bridge(send, recv);

    let want_family: IpAddr = config
        .iprequest
        .as_deref()
        .unwrap_or("0.0.0.0")
        .parse()
        .context("parsing --iprequest")?;
    let iface = config.iface.clone();
    let (control_stream, assigned) = session::negotiate_client_session(
        control_stream,
        want_family,
        &route_installer,
        &iface,
    )
    .await
    .context("negotiating client capsule session")?;

    info!(address = %assigned, "tunnel address assigned");

    connection::spawn(
        0,
        assigned.addr(),
        String::new(),
        false,
        tun.clone(),
        forwarding.clone(),
        route_installer.clone(),
        None,
        0,
    )
    .await
    .context("registering local TUN connection")?;

    let datagram_endpoint = Arc::new(H3DatagramEndpoint::new(driver.clone(), stream_id));
    let remote = connection::spawn(
        1,
        ip::ANY,
        String::new(),
        false,
        datagram_endpoint,
        forwarding.clone(),
        route_installer.clone(),
        None,
        local_port,
    )
    .await
    .context("registering remote peer connection")?;

    // Runs concurrently with the Connections spawned above, so packets
    // already flow while routes keep arriving over the control stream.
    session::run_client_route_loop(
        control_stream,
        route_installer.clone(),
        &iface,
        &remote.routes,
        local_port,
    )
    .await
    .context("running client route loop")?;

    info!("session ended");
    Ok(())
}

fn split_host_port(server: &str) -> Result<(String, u16)> {
    let without_scheme = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("h3://"))
        .unwrap_or(server);
    let (host, port) = without_scheme
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("--server must be host:port, got {server}"))?;
    let port: u16 = port
        .trim_end_matches('/')
        .parse()
        .with_context(|| format!("invalid port in {server}"))?;
    Ok((host.to_string(), port))
}

async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("no addresses found for {host}:{port}"))
}

fn basic_auth_header(username: &str, password: &str) -> String {
    let credentials = format!("{username}:{password}");
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scheme_and_port() {
        assert_eq!(
            split_host_port("https://vpn.example.com:4433").unwrap(),
            ("vpn.example.com".to_string(), 4433)
        );
        assert_eq!(
            split_host_port("vpn.example.com:4433").unwrap(),
            ("vpn.example.com".to_string(), 4433)
        );
    }

    #[test]
    fn rejects_missing_port() {
        assert!(split_host_port("vpn.example.com").is_err());
    }

    #[test]
    fn basic_auth_header_matches_rfc7617_form() {
        let header = basic_auth_header("alice", "hunter2");
        assert!(header.starts_with("Basic "));
    }
}

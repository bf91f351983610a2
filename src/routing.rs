//! Host route/address plumbing: the operations a Connection or session
//! needs performed against the OS routing table when a peer is granted a
//! route, and undone when it disconnects.
//!
//! The original implementation shells out to `ip`/`ip route`/`ip rule`
//! directly; we keep that approach (it is how Linux VPN tunnels are
//! conventionally driven from userspace) but hide it behind a trait so the
//! Connection/session code never depends on a concrete OS mechanism.

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

/// Routing table used for policy-routed default-route installs, kept
/// separate from the main table so a VPN-wide default route doesn't shadow
/// the control-plane connection back to the server itself.
pub const POLICY_TABLE: u32 = 100;

/// Priority of the `ip rule` that exempts the local QUIC control socket's
/// own traffic (matched by UDP source port) from the policy table, so the
/// installed default route doesn't swallow the tunnel's own packets.
const EXEMPT_RULE_PRIORITY: u32 = 100;

/// Priority of the `ip rule` that sends everything else into the policy
/// table. Must sort after [`EXEMPT_RULE_PRIORITY`].
const DEFAULT_RULE_PRIORITY: u32 = 101;

#[async_trait]
pub trait RouteInstaller: Send + Sync {
    /// Assign `addr` to `iface` (a TUN interface name) and bring it up.
    async fn configure_interface(&self, iface: &str, addr: IpNet) -> Result<()>;

    /// Install a route to `prefix` via `iface`. `is_default` selects
    /// policy-routing (a dedicated table plus `ip rule`s keyed on the
    /// local QUIC socket's UDP source port `port`) over a plain
    /// `ip route add` for non-default prefixes; `port` is unused
    /// otherwise.
    async fn install(&self, iface: &str, prefix: IpNet, is_default: bool, port: u16) -> Result<()>;

    /// Undo a previously installed route. `port` distinguishes which
    /// `ip rule` priority to remove when multiple peers share table 100.
    async fn uninstall(&self, prefix: IpNet, port: u16) -> Result<()>;

    /// Disable ICMP redirect sending on `iface` (the host should never act
    /// as a router advertising shortcuts for tunnel traffic).
    async fn disable_redirects(&self, iface: &str) -> Result<()>;
}

/// Drives `ip`/`sysctl` via subprocess, matching the original
/// implementation's `setup_ip`/`setup_route`/`setup_default_route` shell
/// commands.
pub struct LinuxRouteInstaller;

impl LinuxRouteInstaller {
    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        debug!(program, ?args, "running network configuration command");
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| TunnelError::Resource(format!("spawning {program} failed: {e}")))?;
        if !status.success() {
            return Err(TunnelError::Resource(format!(
                "{program} {args:?} exited with {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RouteInstaller for LinuxRouteInstaller {
    async fn configure_interface(&self, iface: &str, addr: IpNet) -> Result<()> {
        self.run(
            "ip",
            &["addr", "add", &addr.to_string(), "dev", iface],
        )
        .await?;
        self.run("ip", &["link", "set", "dev", iface, "up"]).await
    }

    async fn install(&self, iface: &str, prefix: IpNet, is_default: bool, port: u16) -> Result<()> {
        if is_default {
            let table = POLICY_TABLE.to_string();
            let exempt_priority = EXEMPT_RULE_PRIORITY.to_string();
            let default_priority = DEFAULT_RULE_PRIORITY.to_string();
            let sport = port.to_string();
            self.run(
                "ip",
                &["route", "add", "default", "dev", iface, "table", &table],
            )
            .await?;
            // Traffic leaving on the tunnel's own QUIC socket (matched by
            // source port) stays on the main table, or the policy default
            // route below would loop it back into the tunnel.
            self.run(
                "ip",
                &[
                    "rule", "add", "priority", &exempt_priority, "iif", "lo", "ipproto", "udp",
                    "sport", &sport, "lookup", "main",
                ],
            )
            .await?;
            self.run(
                "ip",
                &[
                    "rule", "add", "priority", &default_priority, "not", "iif", "lo", "ipproto",
                    "udp", "sport", &sport, "lookup", &table,
                ],
            )
            .await
        } else {
            self.run(
                "ip",
                &["route", "add", &prefix.to_string(), "dev", iface],
            )
            .await
        }
    }

    async fn uninstall(&self, prefix: IpNet, port: u16) -> Result<()> {
        // Best effort: either the plain route or the policy rules may
        // exist, never both, and deletion failures here are not fatal to
        // shutdown.
        if self
            .run("ip", &["route", "del", &prefix.to_string()])
            .await
            .is_err()
        {
            let exempt_priority = EXEMPT_RULE_PRIORITY.to_string();
            let default_priority = DEFAULT_RULE_PRIORITY.to_string();
            let sport = port.to_string();
            if let Err(err) = self
                .run(
                    "ip",
                    &[
                        "rule", "del", "priority", &exempt_priority, "iif", "lo", "ipproto",
                        "udp", "sport", &sport,
                    ],
                )
                .await
            {
                warn!(%err, route = %prefix, "failed to remove exempt policy rule");
            }
            if let Err(err) = self
                .run(
                    "ip",
                    &[
                        "rule", "del", "priority", &default_priority, "not", "iif", "lo",
                        "ipproto", "udp", "sport", &sport,
                    ],
                )
                .await
            {
                warn!(%err, route = %prefix, "failed to remove default policy rule");
            }
        }
        Ok(())
    }

    async fn disable_redirects(&self, iface: &str) -> Result<()> {
        self.run(
            "sysctl",
            &["-w", &format!("net.ipv4.conf.{iface}.send_redirects=0")],
        )
        .await
    }
}

/// No-op installer: used by the client (which has no peers to route for)
/// and by tests that exercise Connection logic without touching the host
/// network stack.
pub struct NullRouteInstaller;

#[async_trait]
impl RouteInstaller for NullRouteInstaller {
    async fn configure_interface(&self, _iface: &str, _addr: IpNet) -> Result<()> {
        Ok(())
    }

    async fn install(&self, _iface: &str, _prefix: IpNet, _is_default: bool, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn uninstall(&self, _prefix: IpNet, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn disable_redirects(&self, _iface: &str) -> Result<()> {
        Ok(())
    }
}

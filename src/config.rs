//! CLI argument parsing and the tunnel's plain `key: value` config file
//! format. CLI flags override whatever a config file specifies; a config
//! file that doesn't exist yet is autogenerated with defaults and the
//! process exits so the operator can review it before the first real run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use ipnet::IpNet;
use tracing::info;

use crate::auth::{generate_demo_password, UserStore};
use crate::error::{Result, TunnelError};

#[derive(Parser, Debug, Clone)]
#[command(name = "masquetun-server", about = "CONNECT-IP/MASQUE tunnel server")]
pub struct ServerArgs {
    #[arg(long, default_value = "/etc/masquetun/server.conf")]
    pub config: PathBuf,

    #[arg(long)]
    pub listen: Option<String>,

    #[arg(long)]
    pub pool: Option<String>,

    #[arg(long)]
    pub max_pool_size: Option<usize>,

    /// Space-separated CIDRs advertised to every peer as routes.
    #[arg(long, num_args = 0.., value_delimiter = ' ')]
    pub routes: Option<Vec<String>>,

    #[arg(long)]
    pub iface: Option<String>,

    /// TUN device MTU.
    #[arg(long)]
    pub mtu: Option<u16>,

    #[arg(long)]
    pub cert: Option<PathBuf>,

    #[arg(long)]
    pub key: Option<PathBuf>,

    #[arg(long)]
    pub client_ca: Option<PathBuf>,

    #[arg(long)]
    pub default_route: Option<bool>,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "masquetun-client", about = "CONNECT-IP/MASQUE tunnel client")]
pub struct ClientArgs {
    #[arg(long, default_value = "/etc/masquetun/client.conf")]
    pub config: PathBuf,

    #[arg(long)]
    pub server: Option<String>,

    #[arg(long)]
    pub iface: Option<String>,

    /// TUN device MTU.
    #[arg(long)]
    pub mtu: Option<u16>,

    /// Tunnel address to request from the server (0.0.0.0 lets the server
    /// pick any address of its default family).
    #[arg(long)]
    pub iprequest: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub ca: Option<PathBuf>,

    #[arg(long)]
    pub client_cert: Option<PathBuf>,

    #[arg(long)]
    pub client_key: Option<PathBuf>,

    #[arg(long)]
    pub insecure_skip_verify: bool,
}

/// Fully resolved server configuration, after merging the config file with
/// any CLI overrides.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub pool: IpNet,
    pub max_pool_size: usize,
    pub routes: Vec<IpNet>,
    pub iface: String,
    pub mtu: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: Option<PathBuf>,
    pub default_route: bool,
    pub users: UserStore,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub iface: String,
    pub mtu: u16,
    pub iprequest: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

/// Parse a `# comment` / `key: value` config file into a flat map. Blank
/// lines and lines starting with `#` are ignored.
fn parse_kv_file(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

fn load_kv_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| TunnelError::Config(format!("reading {}: {e}", path.display())))?;
    Ok(parse_kv_file(&contents))
}

/// Write a commented, default-filled config file for the operator to
/// review and edit. Called when `--config` points at a file that does not
/// exist yet.
pub fn write_default_server_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TunnelError::Config(format!("creating {}: {e}", parent.display())))?;
    }
    let demo_password = generate_demo_password();
    let contents = format!(
        "# masquetun server configuration\n\
         listen: 0.0.0.0:4433\n\
         pool: 11.0.0.0/24\n\
         max_pool_size: 32\n\
         iface: tun0\n\
         mtu: 1350\n\
         cert: /etc/masquetun/server.crt\n\
         key: /etc/masquetun/server.key\n\
         # client_ca: /etc/masquetun/ca.crt\n\
         # routes: 10.0.0.0/8 192.168.0.0/16\n\
         default_route: false\n\
         \n\
         # Bootstrap account; change the password before exposing this server.\n\
         user.demo: {demo_password}\n"
    );
    std::fs::write(path, contents)
        .map_err(|e| TunnelError::Config(format!("writing {}: {e}", path.display())))?;
    info!(path = %path.display(), user = "demo", password = %demo_password, "generated default server config");
    Ok(())
}

pub fn write_default_client_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TunnelError::Config(format!("creating {}: {e}", parent.display())))?;
    }
    let contents = "# masquetun client configuration\n\
         server: https://vpn.example.com:4433\n\
         iface: tun0\n\
         mtu: 1350\n\
         username: demo\n\
         # password: set me\n\
         # ca: /etc/masquetun/ca.crt\n\
         insecure_skip_verify: false\n";
    std::fs::write(path, contents)
        .map_err(|e| TunnelError::Config(format!("writing {}: {e}", path.display())))?;
    info!(path = %path.display(), "generated default client config");
    Ok(())
}

fn get<'a>(kv: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    kv.get(key).map(String::as_str)
}

pub fn resolve_server_config(args: ServerArgs) -> Result<ServerConfig> {
    if !args.config.exists() {
        write_default_server_config(&args.config)?;
    }
    let kv = load_kv_file(&args.config)?;

    let listen = args
        .listen
        .or_else(|| get(&kv, "listen").map(str::to_owned))
        .ok_or_else(|| TunnelError::Config("missing listen address".into()))?;

    let pool_str = args
        .pool
        .or_else(|| get(&kv, "pool").map(str::to_owned))
        .ok_or_else(|| TunnelError::Config("missing pool prefix".into()))?;
    let pool: IpNet = pool_str
        .parse()
        .map_err(|e| TunnelError::Config(format!("invalid pool prefix {pool_str}: {e}")))?;

    let max_pool_size = args.max_pool_size.or_else(|| {
        get(&kv, "max_pool_size").and_then(|v| v.parse().ok())
    }).unwrap_or(32);

    let routes_strs: Vec<String> = match args.routes {
        Some(routes) if !routes.is_empty() => routes,
        _ => get(&kv, "routes")
            .map(|v| v.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default(),
    };
    let mut routes = Vec::with_capacity(routes_strs.len());
    for route in routes_strs {
        routes.push(
            route
                .parse::<IpNet>()
                .map_err(|e| TunnelError::Config(format!("invalid route prefix {route}: {e}")))?,
        );
    }

    let iface = args
        .iface
        .or_else(|| get(&kv, "iface").map(str::to_owned))
        .unwrap_or_else(|| "tun0".to_string());

    let mtu = args
        .mtu
        .or_else(|| get(&kv, "mtu").and_then(|v| v.parse().ok()))
        .unwrap_or(1350);

    let cert = args
        .cert
        .or_else(|| get(&kv, "cert").map(PathBuf::from))
        .ok_or_else(|| TunnelError::Config("missing cert path".into()))?;
    let key = args
        .key
        .or_else(|| get(&kv, "key").map(PathBuf::from))
        .ok_or_else(|| TunnelError::Config("missing key path".into()))?;
    let client_ca = args
        .client_ca
        .or_else(|| get(&kv, "client_ca").map(PathBuf::from));

    let default_route = args.default_route.or_else(|| {
        get(&kv, "default_route").and_then(|v| v.parse().ok())
    }).unwrap_or(false);

    let mut users = UserStore::new();
    for (key, value) in &kv {
        if let Some(username) = key.strip_prefix("user.") {
            users.add_user(username, value);
        }
    }
    if users.is_empty() {
        return Err(TunnelError::Config(
            "config file defines no users; add at least one user.<name>: <secret> entry".into(),
        ));
    }

    Ok(ServerConfig {
        listen,
        pool,
        max_pool_size,
        routes,
        iface,
        mtu,
        cert,
        key,
        client_ca,
        default_route,
        users,
    })
}

pub fn resolve_client_config(args: ClientArgs) -> Result<ClientConfig> {
    if !args.config.exists() {
        write_default_client_config(&args.config)?;
    }
    let kv = load_kv_file(&args.config)?;

    let server = args
        .server
        .or_else(|| get(&kv, "server").map(str::to_owned))
        .ok_or_else(|| TunnelError::Config("missing server address".into()))?;
    let iface = args
        .iface
        .or_else(|| get(&kv, "iface").map(str::to_owned))
        .unwrap_or_else(|| "tun0".to_string());
    let mtu = args
        .mtu
        .or_else(|| get(&kv, "mtu").and_then(|v| v.parse().ok()))
        .unwrap_or(1350);
    let iprequest = args.iprequest.or_else(|| get(&kv, "iprequest").map(str::to_owned));
    let username = args.username.or_else(|| get(&kv, "username").map(str::to_owned));
    let password = args.password.or_else(|| get(&kv, "password").map(str::to_owned));
    let ca = args.ca.or_else(|| get(&kv, "ca").map(PathBuf::from));
    let client_cert = args.client_cert.or_else(|| get(&kv, "client_cert").map(PathBuf::from));
    let client_key = args.client_key.or_else(|| get(&kv, "client_key").map(PathBuf::from));
    let insecure_skip_verify = args.insecure_skip_verify
        || get(&kv, "insecure_skip_verify").and_then(|v| v.parse().ok()).unwrap_or(false);

    Ok(ClientConfig {
        server,
        iface,
        mtu,
        iprequest,
        username,
        password,
        ca,
        client_cert,
        client_key,
        insecure_skip_verify,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines_and_skips_comments() {
        let kv = parse_kv_file(
            "# a comment\nlisten: 0.0.0.0:4433\n\npool: 11.0.0.0/24\nuser.alice: hunter2\n",
        );
        assert_eq!(kv.get("listen").unwrap(), "0.0.0.0:4433");
        assert_eq!(kv.get("pool").unwrap(), "11.0.0.0/24");
        assert_eq!(kv.get("user.alice").unwrap(), "hunter2");
        assert_eq!(kv.len(), 3);
    }

    #[test]
    fn cli_override_wins_over_config_file() {
        let dir = std::env::temp_dir().join(format!("masquetun-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.conf");
        std::fs::write(
            &path,
            "listen: 0.0.0.0:1\npool: 11.0.0.0/24\ncert: a\nkey: b\nuser.demo: x\n",
        )
        .unwrap();

        let args = ServerArgs {
            config: path,
            listen: Some("0.0.0.0:9999".into()),
            pool: None,
            max_pool_size: None,
            routes: None,
            iface: None,
            mtu: None,
            cert: None,
            key: None,
            client_ca: None,
            default_route: None,
        };
        let resolved = resolve_server_config(args).unwrap();
        assert_eq!(resolved.listen, "0.0.0.0:9999");
        assert_eq!(resolved.pool, "11.0.0.0/24".parse().unwrap());
    }

    #[test]
    fn missing_users_is_a_config_error() {
        let dir = std::env::temp_dir().join(format!("masquetun-test-nousers-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.conf");
        std::fs::write(
            &path,
            "listen: 0.0.0.0:1\npool: 11.0.0.0/24\ncert: a\nkey: b\n",
        )
        .unwrap();

        let args = ServerArgs {
            config: path,
            listen: None,
            pool: None,
            max_pool_size: None,
            routes: None,
            iface: None,
            mtu: None,
            cert: None,
            key: None,
            client_ca: None,
            default_route: None,
        };
        assert!(resolve_server_config(args).is_err());
    }

    #[test]
    fn routes_flag_parses_each_cidr() {
        let dir = std::env::temp_dir().join(format!("masquetun-test-routes-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.conf");
        std::fs::write(
            &path,
            "listen: 0.0.0.0:1\npool: 11.0.0.0/24\ncert: a\nkey: b\nuser.demo: x\n",
        )
        .unwrap();

        let args = ServerArgs {
            config: path,
            listen: None,
            pool: None,
            max_pool_size: None,
            routes: Some(vec!["10.0.0.0/8".into(), "192.168.0.0/16".into()]),
            iface: None,
            mtu: None,
            cert: None,
            key: None,
            client_ca: None,
            default_route: None,
        };
        let resolved = resolve_server_config(args).unwrap();
        assert_eq!(
            resolved.routes,
            vec!["10.0.0.0/8".parse::<IpNet>().unwrap(), "192.168.0.0/16".parse::<IpNet>().unwrap()]
        );
        assert_eq!(resolved.mtu, 1350);
    }
}

use clap::{value_parser, Parser};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::net::HostPort;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Local proxy that authenticates to an upstream proxy with Kerberos",
    long_about = "kproxy listens on a local port and relays HTTP requests and CONNECT tunnels to an upstream corporate proxy, answering its Kerberos/SPNEGO (or Digest/Basic) challenges on behalf of local clients.\n\nThe password is best passed through the KPROXY_PASSWORD environment variable.\n"
)]
pub struct Cli {
    /// Local port to listen on
    #[arg(short, long, default_value_t = 3129)]
    pub port: u16,

    /// IP address to bind the local listener
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub listen_ip: IpAddr,

    /// Upstream proxy host
    #[arg(long)]
    pub proxy_host: String,

    /// Upstream proxy port
    #[arg(long, value_parser = value_parser!(u16).range(1..))]
    pub proxy_port: u16,

    /// Kerberos user name (defaults to the login user)
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Kerberos domain, e.g. "corp.example.com"
    #[arg(short = 'd', long, env = "USERDOMAIN")]
    pub domain: Option<String>,

    /// Kerberos password
    #[arg(long, env = "KPROXY_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Use this KDC instead of DNS discovery
    #[arg(long, value_name = "HOST[:PORT]")]
    pub kdc: Option<String>,

    /// Use this krb5.conf instead of DNS discovery
    #[arg(long, value_name = "PATH")]
    pub krb5_conf: Option<PathBuf>,

    /// Directory for credential caches and generated Kerberos configuration
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Maximum pooled upstream connections
    #[arg(long, default_value_t = 100)]
    pub max_connections: usize,

    /// Maximum pooled upstream connections per route
    #[arg(long, default_value_t = 20)]
    pub max_connections_per_route: usize,

    /// Seconds an idle pooled connection is kept
    #[arg(long, default_value_t = 30)]
    pub max_connection_idle: u64,

    /// Seconds between idle connection sweeps
    #[arg(long, default_value_t = 30)]
    pub eviction_period: u64,

    /// Evict idle pooled connections: 1 or 0
    #[arg(long, value_parser = value_parser!(u8).range(0..=1), default_value_t = 1)]
    pub eviction_enabled: u8,

    /// Kernel buffer size for accepted local sockets
    #[arg(long, default_value_t = 65536)]
    pub server_socket_buffer_size: usize,

    /// Kernel buffer size for upstream sockets
    #[arg(long, default_value_t = 65536)]
    pub socket_buffer_size: usize,

    /// Attempts for a request the upstream proxy answers with 407
    #[arg(long, default_value_t = 3)]
    pub repeats_on_failure: usize,

    /// Seconds before ticket expiry at which the credential is renewed
    #[arg(long, default_value_t = 60)]
    pub ticket_threshold: u64,
}

/// User identity the proxy authenticates as
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub domain: String,
    pub password: String,
}

impl Identity {
    pub fn new(
        username: impl Into<String>,
        domain: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            password: password.into(),
        }
    }

    pub fn realm(&self) -> String {
        self.domain.to_uppercase()
    }

    /// `user@REALM`
    pub fn principal(&self) -> String {
        format!("{}@{}", self.username, self.realm())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Proxy configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream: HostPort,
    pub identity: Identity,
    pub kdc: Option<String>,
    pub krb5_conf: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub max_connections: usize,
    pub max_connections_per_route: usize,
    pub max_connection_idle: Duration,
    pub eviction_period: Duration,
    pub eviction_enabled: bool,
    pub server_socket_buffer_size: usize,
    pub socket_buffer_size: usize,
    pub repeats_on_failure: usize,
    pub ticket_threshold: Duration,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let proxy_host = args.proxy_host.trim().to_string();
        if proxy_host.is_empty() {
            return Err(color_eyre::eyre::eyre!("--proxy-host must not be empty"));
        }

        let username = args
            .username
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| color_eyre::eyre::eyre!("No user name given and none found in the environment"))?;

        let domain = args
            .domain
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| color_eyre::eyre::eyre!("--domain is required"))?;

        if args.password.is_empty() {
            return Err(color_eyre::eyre::eyre!("Password must not be empty"));
        }

        if args.max_connections == 0 || args.max_connections_per_route == 0 {
            return Err(color_eyre::eyre::eyre!("Connection limits must be at least 1"));
        }
        if args.max_connections_per_route > args.max_connections {
            return Err(color_eyre::eyre::eyre!(
                "--max-connections-per-route ({}) exceeds --max-connections ({})",
                args.max_connections_per_route,
                args.max_connections
            ));
        }
        if args.eviction_enabled == 1 && args.eviction_period == 0 {
            return Err(color_eyre::eyre::eyre!("--eviction-period must be positive"));
        }

        if let Some(path) = args.krb5_conf.as_ref() {
            if !path.is_file() {
                return Err(color_eyre::eyre::eyre!("krb5.conf not found: {}", path.display()));
            }
        }

        let work_dir = args
            .work_dir
            .unwrap_or_else(|| std::env::temp_dir().join("kproxy"));

        Ok(Self {
            listen_addr: SocketAddr::new(args.listen_ip, args.port),
            upstream: HostPort::new(proxy_host, args.proxy_port),
            identity: Identity::new(username.trim(), domain.trim(), args.password),
            kdc: args.kdc.filter(|k| !k.trim().is_empty()),
            krb5_conf: args.krb5_conf,
            work_dir,
            max_connections: args.max_connections,
            max_connections_per_route: args.max_connections_per_route,
            max_connection_idle: Duration::from_secs(args.max_connection_idle),
            eviction_period: Duration::from_secs(args.eviction_period),
            eviction_enabled: args.eviction_enabled == 1,
            server_socket_buffer_size: args.server_socket_buffer_size,
            socket_buffer_size: args.socket_buffer_size,
            repeats_on_failure: args.repeats_on_failure,
            ticket_threshold: Duration::from_secs(args.ticket_threshold),
        })
    }

    /// Whether KDCs come from configuration rather than discovery.
    pub fn has_static_kdc(&self) -> bool {
        self.kdc.is_some() || self.krb5_conf.is_some()
    }

    /// Configuration for tests, pointing at the given upstream.
    #[cfg(test)]
    pub fn for_tests(upstream: HostPort) -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            upstream,
            identity: Identity::new("alice", "corp.example.com", "secret"),
            kdc: None,
            krb5_conf: None,
            work_dir: std::env::temp_dir().join("kproxy-tests"),
            max_connections: 10,
            max_connections_per_route: 5,
            max_connection_idle: Duration::from_secs(30),
            eviction_period: Duration::from_secs(30),
            eviction_enabled: false,
            server_socket_buffer_size: 0,
            socket_buffer_size: 0,
            repeats_on_failure: 3,
            ticket_threshold: Duration::from_secs(60),
        }
    }
}

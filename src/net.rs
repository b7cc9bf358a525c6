use socket2::SockRef;
use std::fmt;
use std::io;
use tokio::net::TcpStream;
use tracing::debug;

/// Host and port of a proxy or tunnel target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, including bracketed IPv6 literals.
    pub fn parse(authority: &str, default_port: u16) -> Option<Self> {
        let authority = authority.trim();
        if authority.is_empty() {
            return None;
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return None;
                }
                Some(Self::new(host, port.parse().ok()?))
            }
            Some(_) => None,
            None => Some(Self::new(authority, default_port)),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Pool partition key: upstream proxy plus final target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub proxy: HostPort,
    pub target: HostPort,
}

impl Route {
    pub fn new(proxy: HostPort, target: HostPort) -> Self {
        Self { proxy, target }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.target, self.proxy)
    }
}

/// Disable Nagle and size the kernel buffers of an accepted or outgoing
/// socket.
pub fn tune_socket(stream: &TcpStream, buffer_size: usize) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if buffer_size > 0 {
        let socket = SockRef::from(stream);
        socket.set_recv_buffer_size(buffer_size)?;
        socket.set_send_buffer_size(buffer_size)?;
    }
    Ok(())
}

/// Open a tuned TCP connection to `addr`.
pub async fn connect(addr: &HostPort, buffer_size: usize) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    if let Err(e) = tune_socket(&stream, buffer_size) {
        debug!(%addr, "Socket tuning failed: {}", e);
    }
    Ok(stream)
}

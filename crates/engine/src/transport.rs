//! Stream addresses and the TCP connect path.

use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;

const TCP_SCHEME: &str = "tcp://";

/// `host:port` target of a session, parsed from `[tcp://]host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAddress {
    host: String,
    port: u16,
}

impl StreamAddress {
    pub fn parse(address: &str) -> Result<Self, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = address.trim();
        let rest = trimmed.strip_prefix(TCP_SCHEME).unwrap_or(trimmed);
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number in 1-65535"))?;
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve and connect, then apply the socket options from `config`.
    pub fn connect(&self, config: &EngineConfig) -> io::Result<TcpStream> {
        let target = self.resolve()?;
        let stream = match config.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&target, timeout)?,
            None => TcpStream::connect(target)?,
        };

        configure(&stream, config);
        debug!(peer = %target, "Transport connected");
        Ok(stream)
    }

    fn resolve(&self) -> io::Result<SocketAddr> {
        self.to_string()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"))
    }
}

impl fmt::Display for StreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for StreamAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Socket options are best effort: a refused option is logged, not fatal.
fn configure(stream: &TcpStream, config: &EngineConfig) {
    if let Err(e) = stream.set_nodelay(config.tcp_nodelay) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if config.recv_buffer_bytes > 0 {
        if let Err(e) = SockRef::from(stream).set_recv_buffer_size(config.recv_buffer_bytes) {
            warn!(bytes = config.recv_buffer_bytes, "Failed to set SO_RCVBUF: {}", e);
        }
    }
}

/// Unblock a thread parked in `read` on another handle to the same socket.
pub(crate) fn force_close(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
        // NotConnected just means the peer got there first.
        if e.kind() != io::ErrorKind::NotConnected {
            debug!("Transport shutdown: {}", e);
        }
    }
}

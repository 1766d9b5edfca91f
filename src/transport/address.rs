//! Remote endpoint addresses.
//!
//! Accepted forms:
//! - `tcp://host:port`
//! - `ws://host[:port][/path]` (port defaults to 80)
//! - `unix:///path/to.sock` (unix hosts only)
//!
//! `wss://` is rejected: TLS is not provided by this crate.

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::{Result, WireError};

/// Address scheme, which also selects the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// TCP stream socket.
    Tcp,
    /// WebSocket over TCP.
    Ws,
    /// Unix domain stream socket.
    #[cfg(unix)]
    Unix,
}

impl Scheme {
    /// URL scheme string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            #[cfg(unix)]
            Scheme::Unix => "unix",
        }
    }

    fn parse(scheme: &str) -> Result<Self> {
        match scheme {
            "tcp" => Ok(Scheme::Tcp),
            "ws" => Ok(Scheme::Ws),
            #[cfg(unix)]
            "unix" => Ok(Scheme::Unix),
            "wss" => Err(WireError::UnsupportedScheme(
                "wss (TLS is not supported)".into(),
            )),
            other => Err(WireError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed endpoint address: scheme, host, port and path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Address {
    /// TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            host: host.into(),
            port,
            path: String::new(),
        }
    }

    /// WebSocket address. An empty path becomes `/`.
    pub fn ws(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            scheme: Scheme::Ws,
            host: host.into(),
            port,
            path,
        }
    }

    /// Unix domain socket address.
    #[cfg(unix)]
    pub fn unix(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            scheme: Scheme::Unix,
            host: String::new(),
            port: 0,
            path: path.as_ref().to_string_lossy().into_owned(),
        }
    }

    /// Parse an address string.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input.trim())
            .map_err(|e| WireError::InvalidAddress(format!("{}: {}", input, e)))?;
        let scheme = Scheme::parse(url.scheme())?;

        match scheme {
            Scheme::Tcp => {
                let host = host_of(&url, input)?;
                let port = url.port().ok_or_else(|| {
                    WireError::InvalidAddress(format!("{}: tcp address needs a port", input))
                })?;
                Ok(Self::tcp(host, port))
            }
            Scheme::Ws => {
                let host = host_of(&url, input)?;
                let port = url.port_or_known_default().unwrap_or(80);
                let mut path = url.path().to_string();
                if let Some(query) = url.query() {
                    path.push('?');
                    path.push_str(query);
                }
                Ok(Self::ws(host, port, path))
            }
            #[cfg(unix)]
            Scheme::Unix => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(WireError::InvalidAddress(format!(
                        "{}: unix address needs a socket path",
                        input
                    )));
                }
                Ok(Self::unix(path))
            }
        }
    }

    /// Address scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or IP literal (empty for unix sockets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port (0 for unix sockets).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path: the WebSocket resource or the unix socket file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn host_of(url: &Url, input: &str) -> Result<String> {
    match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => Ok(domain.to_string()),
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        _ => Err(WireError::InvalidAddress(format!("{}: missing host", input))),
    }
}

impl FromStr for Address {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Tcp => write!(f, "tcp://{}", self.authority()),
            Scheme::Ws => write!(f, "ws://{}{}", self.authority(), self.path),
            #[cfg(unix)]
            Scheme::Unix => write!(f, "unix://{}", self.path),
        }
    }
}

//! Stream-socket transport.
//!
//! - TCP on every platform
//! - Unix Domain Socket on unix hosts
//!
//! # Example
//!
//! ```ignore
//! use objwire::transport::{Address, StreamListener};
//!
//! let listener = StreamListener::bind(&Address::parse("tcp://127.0.0.1:0")?).await?;
//! let link = listener.accept().await?;
//! ```

use std::io::{self, IoSlice};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{Address, Link, ReceiveHalf, Scheme, SendHalf, Transport};
use crate::cancel::CancelToken;
use crate::error::{Result, WireError};

/// Write half over any `AsyncWrite`.
pub struct StreamSender<W> {
    writer: W,
}

impl<W> StreamSender<W> {
    /// Wrap a write half.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> SendHalf for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn supports_gather(&self) -> bool {
        self.writer.is_write_vectored()
    }

    async fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<usize> {
        match segments {
            [] => Ok(0),
            [single] => self.writer.write(single).await,
            _ => self.writer.write_vectored(segments).await,
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Read half over any `AsyncRead`.
pub struct StreamReceiver<R> {
    reader: R,
}

impl<R> StreamReceiver<R> {
    /// Wrap a read half.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> ReceiveHalf for StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}

/// Build a link from any bidirectional byte stream (e.g. `tokio::io::duplex`).
pub fn stream_link<S>(stream: S) -> Link
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    Link::new(StreamSender::new(writer), StreamReceiver::new(reader))
}

fn tcp_link(stream: TcpStream) -> Result<Link> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Ok(Link::new(StreamSender::new(writer), StreamReceiver::new(reader)))
}

#[cfg(unix)]
fn unix_link(stream: tokio::net::UnixStream) -> Link {
    let (reader, writer) = stream.into_split();
    Link::new(StreamSender::new(writer), StreamReceiver::new(reader))
}

/// Connects `tcp://` and `unix://` addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTransport;

#[async_trait]
impl Transport for StreamTransport {
    async fn connect(&self, address: &Address, cancel: &CancelToken) -> Result<Link> {
        let connect = async {
            match address.scheme() {
                Scheme::Tcp => {
                    let stream = TcpStream::connect((address.host(), address.port())).await?;
                    tcp_link(stream)
                }
                #[cfg(unix)]
                Scheme::Unix => {
                    let stream = tokio::net::UnixStream::connect(address.path()).await?;
                    Ok(unix_link(stream))
                }
                other => Err(WireError::UnsupportedScheme(format!(
                    "{} is not a stream scheme",
                    other
                ))),
            }
        };

        cancel
            .run_until_cancelled(connect)
            .await
            .unwrap_or(Err(WireError::Cancelled))
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Listener for inbound stream links.
///
/// A unix socket file is removed when the listener is dropped.
pub struct StreamListener {
    kind: ListenerKind,
    address: Address,
}

impl StreamListener {
    /// Bind to a `tcp://` or `unix://` address.
    ///
    /// TCP port 0 picks a free port; see [`local_address`](Self::local_address).
    /// For unix sockets any stale socket file at the path is removed first.
    pub async fn bind(address: &Address) -> Result<Self> {
        match address.scheme() {
            Scheme::Tcp => {
                let listener = TcpListener::bind((address.host(), address.port())).await?;
                let local = listener.local_addr()?;
                Ok(Self {
                    kind: ListenerKind::Tcp(listener),
                    address: Address::tcp(local.ip().to_string(), local.port()),
                })
            }
            #[cfg(unix)]
            Scheme::Unix => {
                let path = std::path::Path::new(address.path());
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Self {
                    kind: ListenerKind::Unix(listener),
                    address: address.clone(),
                })
            }
            other => Err(WireError::UnsupportedScheme(format!(
                "{} is not a stream scheme",
                other
            ))),
        }
    }

    /// Accept one inbound link.
    pub async fn accept(&self) -> Result<Link> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(%peer, listener = %self.address, "Accepted TCP link");
                tcp_link(stream)
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _peer) = listener.accept().await?;
                tracing::debug!(listener = %self.address, "Accepted unix link");
                Ok(unix_link(stream))
            }
        }
    }

    /// The bound address (with the actual port for TCP).
    pub fn local_address(&self) -> &Address {
        &self.address
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let ListenerKind::Unix(_) = self.kind {
                let _ = std::fs::remove_file(self.address.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_stream_link_roundtrip() {
        let (a, b) = duplex(64);
        let mut left = stream_link(a);
        let mut right = stream_link(b);

        let sent = left
            .sender
            .send(&[IoSlice::new(b"hello")])
            .await
            .unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let n = right.receiver.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_close_yields_zero_read() {
        let (a, b) = duplex(64);
        let mut left = stream_link(a);
        let mut right = stream_link(b);

        left.sender.close().await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(right.receiver.receive(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tcp_listener_connect() {
        let listener = StreamListener::bind(&Address::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let address = listener.local_address().clone();
        assert_ne!(address.port(), 0);

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let link = StreamTransport
            .connect(&address, &CancelToken::new())
            .await
            .unwrap();

        assert!(link.sender.supports_gather());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = StreamTransport
            .connect(&Address::tcp("127.0.0.1", 9), &cancel)
            .await;
        assert!(matches!(result, Err(WireError::Cancelled)));
    }

    #[tokio::test]
    async fn test_ws_address_rejected() {
        let result = StreamListener::bind(&Address::ws("127.0.0.1", 0, "/")).await;
        assert!(matches!(result, Err(WireError::UnsupportedScheme(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objwire.sock");
        let address = Address::unix(&path);

        let listener = StreamListener::bind(&address).await.unwrap();
        assert!(path.exists());

        let accept = tokio::spawn(async move {
            let link = listener.accept().await.map(|_| ());
            (listener, link)
        });
        StreamTransport
            .connect(&address, &CancelToken::new())
            .await
            .unwrap();

        let (listener, link) = accept.await.unwrap();
        link.unwrap();
        drop(listener);
        assert!(!path.exists());
    }
}

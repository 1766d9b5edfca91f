//! Message-socket transport (WebSocket).
//!
//! Each `send` becomes one binary message. Incoming messages are handed to
//! the receive pipeline as a byte stream: a message larger than the receive
//! buffer is delivered over several receives.

use std::io::{self, IoSlice};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

use super::{Address, Link, ReceiveHalf, Scheme, SendHalf, Transport};
use crate::cancel::CancelToken;
use crate::error::{Result, WireError};

fn ws_to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Write half over a WebSocket sink.
pub struct MessageSender<S> {
    sink: S,
}

impl<S> MessageSender<S> {
    /// Wrap a message sink.
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S> SendHalf for MessageSender<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    fn supports_gather(&self) -> bool {
        false
    }

    async fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<usize> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        if total == 0 {
            return Ok(0);
        }

        let mut payload = Vec::with_capacity(total);
        for segment in segments {
            payload.extend_from_slice(segment);
        }

        self.sink
            .send(Message::Binary(payload))
            .await
            .map_err(ws_to_io)?;
        Ok(total)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_to_io(e)),
        }
    }
}

/// Read half over a WebSocket stream.
pub struct MessageReceiver<S> {
    stream: S,
    /// Unread tail of the last message.
    pending: Bytes,
}

impl<S> MessageReceiver<S> {
    /// Wrap a message stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
        }
    }
}

#[async_trait]
impl<S> ReceiveHalf for MessageReceiver<S>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send,
{
    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            let message = match self.stream.next().await {
                None => return Ok(0),
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(0),
                Some(Err(e)) => return Err(ws_to_io(e)),
            };

            match message {
                Message::Binary(data) => self.pending = Bytes::from(data),
                Message::Text(text) => self.pending = Bytes::from(text.into_bytes()),
                Message::Close(frame) => {
                    debug!(?frame, "WebSocket peer closed");
                    return Ok(0);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("WebSocket control message skipped");
                }
            }
        }

        let count = buf.len().min(self.pending.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.advance(count);
        Ok(count)
    }
}

fn message_link<T>(ws: tokio_tungstenite::WebSocketStream<T>) -> Link
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Link::new(MessageSender::new(sink), MessageReceiver::new(stream))
}

/// Connects `ws://` addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageTransport;

#[async_trait]
impl Transport for MessageTransport {
    async fn connect(&self, address: &Address, cancel: &CancelToken) -> Result<Link> {
        if address.scheme() != Scheme::Ws {
            return Err(WireError::UnsupportedScheme(format!(
                "{} is not a message scheme",
                address.scheme()
            )));
        }

        let url = address.to_string();
        let connect = async {
            let (ws, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
            debug!(%url, status = %response.status(), "WebSocket handshake completed");
            Ok::<_, WireError>(message_link(ws))
        };

        cancel
            .run_until_cancelled(connect)
            .await
            .unwrap_or(Err(WireError::Cancelled))
    }
}

/// Listener for inbound WebSocket links.
pub struct MessageListener {
    listener: TcpListener,
    address: Address,
}

impl MessageListener {
    /// Bind to the host and port of a `ws://` address.
    pub async fn bind(address: &Address) -> Result<Self> {
        if address.scheme() != Scheme::Ws {
            return Err(WireError::UnsupportedScheme(format!(
                "{} is not a message scheme",
                address.scheme()
            )));
        }

        let listener = TcpListener::bind((address.host(), address.port())).await?;
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            address: Address::ws(local.ip().to_string(), local.port(), address.path()),
        })
    }

    /// Accept one inbound link and complete the WebSocket handshake.
    pub async fn accept(&self) -> Result<Link> {
        let (stream, peer): (TcpStream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let ws = tokio_tungstenite::accept_async(stream).await?;
        debug!(%peer, listener = %self.address, "Accepted WebSocket link");
        Ok(message_link(ws))
    }

    /// The bound address (with the actual port).
    pub fn local_address(&self) -> &Address {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn test_receive_splits_large_message() {
        let messages = vec![Ok(Message::Binary(b"abcdefgh".to_vec()))];
        let mut receiver = MessageReceiver::new(stream::iter(messages));

        let mut buf = [0u8; 3];
        assert_eq!(receiver.receive(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(receiver.receive(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"def");
        assert_eq!(receiver.receive(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"gh");
        assert_eq!(receiver.receive(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receive_skips_control_messages() {
        let messages = vec![
            Ok(Message::Ping(vec![1])),
            Ok(Message::Binary(Vec::new())),
            Ok(Message::Text("hi".to_string())),
            Ok(Message::Close(None)),
            Ok(Message::Binary(b"late".to_vec())),
        ];
        let mut receiver = MessageReceiver::new(stream::iter(messages));

        let mut buf = [0u8; 16];
        assert_eq!(receiver.receive(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(receiver.receive(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receive_error_propagates() {
        let messages = vec![Err(WsError::Utf8)];
        let mut receiver = MessageReceiver::new(stream::iter(messages));

        let mut buf = [0u8; 16];
        assert!(receiver.receive(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_websocket_roundtrip() {
        let listener = MessageListener::bind(&Address::ws("127.0.0.1", 0, "/objects"))
            .await
            .unwrap();
        let address = listener.local_address().clone();

        let server = tokio::spawn(async move {
            let mut link = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = link.receiver.receive(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let mut link = MessageTransport
            .connect(&address, &CancelToken::new())
            .await
            .unwrap();
        assert!(!link.sender.supports_gather());

        let sent = link
            .sender
            .send(&[IoSlice::new(b"one "), IoSlice::new(b"message")])
            .await
            .unwrap();
        assert_eq!(sent, 11);

        assert_eq!(server.await.unwrap(), b"one message");
    }

    #[tokio::test]
    async fn test_tcp_address_rejected() {
        let result = MessageTransport
            .connect(&Address::tcp("127.0.0.1", 1), &CancelToken::new())
            .await;
        assert!(matches!(result, Err(WireError::UnsupportedScheme(_))));
    }
}

//! Transport module - the abstract link contract and its socket backends.
//!
//! Provides:
//! - TCP and Unix domain sockets (stream sockets, [`StreamTransport`])
//! - WebSocket (message socket, [`MessageTransport`])
//!
//! A transport turns an [`Address`] into a [`Link`]: one [`SendHalf`] and one
//! [`ReceiveHalf`]. Each half is driven by exactly one pipeline task and every
//! operation takes `&mut self`, so a link never has two writes or two reads in
//! flight.

mod address;
mod message;
mod stream;

use std::io::{self, IoSlice};

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::Result;

pub use address::{Address, Scheme};
pub use message::{MessageListener, MessageReceiver, MessageSender, MessageTransport};
pub use stream::{stream_link, StreamListener, StreamReceiver, StreamSender, StreamTransport};

/// Write side of a link.
#[async_trait]
pub trait SendHalf: Send {
    /// Whether `send` accepts more than one segment per call.
    ///
    /// When `false` the send pipeline submits only the front buffer.
    fn supports_gather(&self) -> bool;

    /// Write some prefix of `segments`, returning the bytes accepted.
    ///
    /// A short count is a partial write; the caller resubmits the rest.
    async fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Close the write direction.
    async fn close(&mut self) -> io::Result<()>;
}

/// Read side of a link.
#[async_trait]
pub trait ReceiveHalf: Send {
    /// Read into `buf`, returning the bytes read. `0` means the peer closed.
    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// An established, split connection.
pub struct Link {
    /// Write half.
    pub sender: Box<dyn SendHalf>,
    /// Read half.
    pub receiver: Box<dyn ReceiveHalf>,
}

impl Link {
    /// Pair two halves.
    pub fn new<S, R>(sender: S, receiver: R) -> Self
    where
        S: SendHalf + 'static,
        R: ReceiveHalf + 'static,
    {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("gather", &self.sender.supports_gather())
            .finish()
    }
}

/// Something that can open links to addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `address`.
    ///
    /// Returns [`WireError::Cancelled`](crate::WireError::Cancelled) if `cancel` fires first.
    async fn connect(&self, address: &Address, cancel: &CancelToken) -> Result<Link>;
}

/// Transport that picks a backend from the address scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransport;

#[async_trait]
impl Transport for DefaultTransport {
    async fn connect(&self, address: &Address, cancel: &CancelToken) -> Result<Link> {
        match address.scheme() {
            Scheme::Ws => MessageTransport.connect(address, cancel).await,
            _ => StreamTransport.connect(address, cancel).await,
        }
    }
}


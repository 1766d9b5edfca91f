//! # objwire
//!
//! Buffered async transport for a distributed shared-object store.
//!
//! The crate moves opaque bytes between a protocol session and a socket. It
//! never interprets payloads.
//!
//! ## Architecture
//!
//! - **Buffer pool**: fixed-capacity buffers recycled across connections
//! - **Send pipeline**: drains session output with scatter/gather writes
//! - **Receive pipeline**: pumps received bytes into the session
//! - **Connection**: both pipelines over one link, with a single error path
//! - **Remote endpoint**: keeps a connection alive with backoff and
//!   cancellable attempts
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use objwire::{Address, LinkConfig, RemoteEndpoint, Session};
//!
//! #[tokio::main]
//! async fn main() -> objwire::Result<()> {
//!     let address: Address = "tcp://127.0.0.1:7400".parse()?;
//!     let endpoint = RemoteEndpoint::new(
//!         address,
//!         |_: &Address| -> Arc<dyn Session> { Arc::new(MySession::default()) },
//!         LinkConfig::from_env()?,
//!     )?;
//!     endpoint.start();
//!     // ...
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod transport;

mod cancel;
mod connection;
mod endpoint;
mod flow;
mod receive;
mod send;
mod session;

pub use buffer::{Buff, BufferPool, PoolStats};
pub use cancel::CancelToken;
pub use config::{LinkConfig, ReconnectConfig};
pub use connection::{Connection, ConnectionHandle, ConnectionObserver, ConnectionState};
pub use endpoint::{AttemptHandle, RemoteEndpoint, Status};
pub use error::{Result, WireError, DISCONNECTED};
pub use flow::{ReadGate, SuspendGuard};
pub use receive::{Pumped, ReceivePipeline};
pub use send::{OutgoingQueue, SendPipeline, MAX_DRAIN_BYTES, MAX_GATHER_SEGMENTS};
pub use session::{Session, SessionFactory};
pub use transport::{
    Address, DefaultTransport, Link, MessageListener, MessageTransport, ReceiveHalf, Scheme,
    SendHalf, StreamListener, StreamTransport, Transport,
};

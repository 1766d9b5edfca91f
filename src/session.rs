//! Protocol-layer contract.
//!
//! A [`Session`] is the opaque producer and consumer of bytes on one
//! connection. The transport never interprets payloads: it asks the session
//! for outgoing buffers and hands it incoming ones.
//!
//! # Example
//!
//! ```ignore
//! use objwire::{Buff, BufferPool, OutgoingQueue, Session};
//!
//! struct Echo { pending: parking_lot::Mutex<Vec<u8>> }
//!
//! impl Session for Echo {
//!     fn fill(&self, pool: &BufferPool, max_bytes: usize) -> Option<OutgoingQueue> {
//!         let mut pending = self.pending.lock();
//!         if pending.is_empty() { return None; }
//!         let take = pending.len().min(max_bytes);
//!         let mut queue = OutgoingQueue::new();
//!         queue.write_all(pool, &pending[..take]);
//!         pending.drain(..take);
//!         Some(queue)
//!     }
//!
//!     fn read(&self, buff: &mut Buff) -> objwire::Result<()> {
//!         self.pending.lock().extend_from_slice(buff.remaining_slice());
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;

use crate::buffer::{Buff, BufferPool};
use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::send::OutgoingQueue;
use crate::transport::Address;

/// Producer/consumer of a connection's bytes.
///
/// `fill` and `write_complete` run on the connection's writer task, `read` on
/// its reader task, so implementations must be `Sync`.
pub trait Session: Send + Sync + 'static {
    /// Produce up to roughly `max_bytes` of outgoing data.
    ///
    /// `None` (or an empty queue) means nothing more to send for now; the
    /// writer goes idle until [`ConnectionHandle::request_write`] is called.
    fn fill(&self, pool: &BufferPool, max_bytes: usize) -> Option<OutgoingQueue>;

    /// Consume received bytes in `buff.position()..buff.limit()`.
    ///
    /// The leading `header_reserve` bytes before the position are free for
    /// the session's use. The buffer is recycled when this returns, so data
    /// that must outlive the call has to be copied (see [`Buff::to_bytes`]).
    /// An error is fatal to the connection.
    fn read(&self, buff: &mut Buff) -> Result<()>;

    /// The writer drained everything `fill` produced and went idle.
    fn write_complete(&self) {}

    /// The connection started; `handle` stays valid for its lifetime.
    fn on_started(&self, _handle: ConnectionHandle) {}

    /// Both pipelines have stopped.
    fn on_closed(&self) {}
}

/// Creates a fresh session for every connection an endpoint makes.
pub trait SessionFactory: Send + Sync + 'static {
    /// Build the session for a new connection to `address`.
    fn create(&self, address: &Address) -> Arc<dyn Session>;
}

impl<F> SessionFactory for F
where
    F: Fn(&Address) -> Arc<dyn Session> + Send + Sync + 'static,
{
    fn create(&self, address: &Address) -> Arc<dyn Session> {
        self(address)
    }
}

//! Buffer module - pooled byte regions and their allocator.
//!
//! Every byte that crosses a connection travels in a [`Buff`] leased from a
//! [`BufferPool`]:
//! - outgoing buffers are filled by the session and drained by the send pipeline
//! - incoming buffers are filled by the receive pipeline and handed to the session
//!
//! A buffer is recycled exactly once per lease. `recycle` takes the buffer by
//! value, so it cannot be touched afterwards; debug builds additionally poison
//! idle buffers and assert on any mutation of a locked buffer.

mod buff;
mod pool;

pub use buff::Buff;
pub use pool::{BufferPool, PoolStats, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE, POISON};

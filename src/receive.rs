//! Receive pipeline: pumps a link's receive half into pooled buffers.
//!
//! Each pump leases a buffer positioned at `header_reserve`, receives into
//! the space after it, hands `header_reserve..header_reserve + n` to the
//! session, and recycles the buffer. Exactly one receive is outstanding at a
//! time.

use std::sync::Arc;

use crate::buffer::{Buff, BufferPool};
use crate::error::{Result, WireError};
use crate::flow::ReadGate;
use crate::session::Session;
use crate::transport::ReceiveHalf;

/// Outcome of one pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pumped {
    /// `n` bytes were delivered to the session.
    Delivered(usize),
    /// The peer closed the link (zero-length receive).
    Disconnected,
}

/// Drives one link's receive half.
///
/// The in-flight buffer is held by the pipeline, so dropping a pump future
/// mid-receive leaves it to [`shutdown`](Self::shutdown) to recycle.
pub struct ReceivePipeline {
    receiver: Box<dyn ReceiveHalf>,
    pool: Arc<BufferPool>,
    header_reserve: usize,
    gate: ReadGate,
    current: Option<Buff>,
}

impl ReceivePipeline {
    /// Create a pipeline over `receiver`.
    pub fn new(
        receiver: Box<dyn ReceiveHalf>,
        pool: Arc<BufferPool>,
        header_reserve: usize,
        gate: ReadGate,
    ) -> Self {
        Self {
            receiver,
            pool,
            header_reserve,
            gate,
            current: None,
        }
    }

    /// Receive once and deliver the bytes to `session`.
    pub async fn pump_once(&mut self, session: &dyn Session) -> Result<Pumped> {
        let pool = &self.pool;
        let reserve = self.header_reserve;
        let buff = self
            .current
            .get_or_insert_with(|| pool.acquire_for_receive(reserve));

        let received = self.receiver.receive(buff.spare_mut()).await;
        let length = match received {
            Ok(0) => {
                self.release();
                return Ok(Pumped::Disconnected);
            }
            Ok(n) => n,
            Err(e) => {
                self.release();
                return Err(e.into());
            }
        };

        // The buffer stays in `current` while the session reads it, so an
        // unwinding `read` still leaves it for `release`.
        let Some(buff) = self.current.as_mut() else {
            return Err(WireError::InvalidState("receive buffer missing".into()));
        };
        buff.set_limit(reserve + length);

        let delivered = session.read(buff);
        self.release();
        delivered?;

        Ok(Pumped::Delivered(length))
    }

    /// Pump until the peer disconnects or an error occurs.
    ///
    /// Waits on the read gate between pumps. Returns `Ok(())` on orderly
    /// disconnect.
    pub async fn run(&mut self, session: &dyn Session) -> Result<()> {
        loop {
            self.gate.wait_open().await;
            match self.pump_once(session).await? {
                Pumped::Delivered(n) => {
                    tracing::trace!(bytes = n, "Delivered received bytes");
                }
                Pumped::Disconnected => return Ok(()),
            }
        }
    }

    /// Recycle the in-flight buffer, if any.
    pub fn release(&mut self) {
        if let Some(buff) = self.current.take() {
            self.pool.recycle(buff);
        }
    }

    /// Flow-control gate shared with the connection.
    pub fn gate(&self) -> &ReadGate {
        &self.gate
    }
}

impl Drop for ReceivePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

//! Send pipeline: drains outgoing buffers through a link's send half.
//!
//! # Architecture
//!
//! ```text
//! Session::fill ─► OutgoingQueue ─► SendPipeline::drain ─► SendHalf
//!                       ▲                   │
//!                       └── partial write ──┘  (front buffer advanced)
//! ```
//!
//! A drain cycle asks the session for work whenever the queue runs dry and
//! ends when the session has nothing more to send. Fully written buffers go
//! back to the pool immediately; at most one buffer (the front) is ever
//! partially consumed.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;

use crate::buffer::{Buff, BufferPool};
use crate::error::Result;
use crate::session::Session;
use crate::transport::SendHalf;

/// Default byte budget for one `fill` request.
pub const MAX_DRAIN_BYTES: usize = 0xFFFF;

/// Maximum buffers submitted in one gathered write.
pub const MAX_GATHER_SEGMENTS: usize = 64;

/// FIFO of flipped buffers awaiting transmission.
///
/// Each buffer's `position..limit` is the data still to send.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    buffers: VecDeque<Buff>,
}

impl OutgoingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer ready for sending.
    pub fn push(&mut self, buff: Buff) {
        self.buffers.push_back(buff);
    }

    /// Move every buffer of `other` to the back of this queue.
    pub fn append(&mut self, mut other: OutgoingQueue) {
        self.buffers.append(&mut other.buffers);
    }

    /// Copy `data` into freshly acquired buffers and queue them.
    ///
    /// Returns the number of buffers used.
    pub fn write_all(&mut self, pool: &BufferPool, mut data: &[u8]) -> usize {
        let mut used = 0;
        while !data.is_empty() {
            let mut buff = pool.acquire();
            let copied = buff.put_slice(data);
            buff.flip();
            self.buffers.push_back(buff);
            data = &data[copied..];
            used += 1;
        }
        used
    }

    /// Whether no buffers are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of queued buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Unsent bytes across all buffers.
    pub fn remaining_bytes(&self) -> usize {
        self.buffers.iter().map(Buff::remaining).sum()
    }

    /// Oldest buffer.
    pub fn front(&self) -> Option<&Buff> {
        self.buffers.front()
    }

    /// Unsent regions of up to `max` leading buffers, empty ones skipped.
    pub fn segments(&self, max: usize) -> Vec<IoSlice<'_>> {
        self.buffers
            .iter()
            .filter(|b| b.has_remaining())
            .take(max)
            .map(|b| IoSlice::new(b.remaining_slice()))
            .collect()
    }

    /// Account for `written` bytes leaving the front of the queue.
    ///
    /// Fully sent buffers are popped and recycled; a partially sent buffer
    /// has its position advanced and stays at the front. Returns the number
    /// of buffers recycled.
    pub fn consume(&mut self, written: usize, pool: &BufferPool) -> usize {
        debug_assert!(
            written <= self.remaining_bytes(),
            "wrote {} bytes with only {} queued",
            written,
            self.remaining_bytes()
        );

        let mut left = written;
        let mut recycled = 0;
        while let Some(front) = self.buffers.front_mut() {
            let remaining = front.remaining();
            if remaining <= left {
                left -= remaining;
                if let Some(done) = self.buffers.pop_front() {
                    pool.recycle(done);
                    recycled += 1;
                }
            } else {
                front.advance(left);
                break;
            }
        }
        recycled
    }

    /// Return every queued buffer to the pool.
    pub fn recycle_all(&mut self, pool: &BufferPool) {
        for buff in self.buffers.drain(..) {
            pool.recycle(buff);
        }
    }
}

/// Drives one link's send half.
///
/// The pipeline owns its queue, so buffers in flight when a drain is
/// cancelled are still recycled by [`shutdown`](Self::shutdown).
pub struct SendPipeline {
    sender: Box<dyn SendHalf>,
    queue: OutgoingQueue,
    pool: Arc<BufferPool>,
    max_drain_bytes: usize,
}

impl SendPipeline {
    /// Create a pipeline over `sender`.
    pub fn new(sender: Box<dyn SendHalf>, pool: Arc<BufferPool>, max_drain_bytes: usize) -> Self {
        Self {
            sender,
            queue: OutgoingQueue::new(),
            pool,
            max_drain_bytes,
        }
    }

    /// Run one drain cycle.
    ///
    /// Writes until the session's `fill` returns nothing, then calls
    /// `write_complete`. Returns the bytes written during the cycle.
    pub async fn drain(&mut self, session: &dyn Session) -> Result<usize> {
        let mut total = 0;
        loop {
            if self.queue.remaining_bytes() == 0 {
                // Drop any empty buffers left by the session.
                self.queue.recycle_all(&self.pool);

                match session.fill(&self.pool, self.max_drain_bytes) {
                    Some(queue) if queue.remaining_bytes() > 0 => self.queue.append(queue),
                    Some(mut queue) => {
                        queue.recycle_all(&self.pool);
                        session.write_complete();
                        return Ok(total);
                    }
                    None => {
                        session.write_complete();
                        return Ok(total);
                    }
                }
            }

            total += self.write_once().await?;
        }
    }

    /// Submit pending data once and account for what the transport took.
    async fn write_once(&mut self) -> Result<usize> {
        // Leading empty buffers would be submitted as zero-length writes.
        self.queue.consume(0, &self.pool);

        let written = if self.sender.supports_gather() {
            let segments = self.queue.segments(MAX_GATHER_SEGMENTS);
            self.sender.send(&segments).await?
        } else {
            let front = match self.queue.front() {
                Some(front) => front.remaining_slice(),
                None => return Ok(0),
            };
            self.sender.send(&[IoSlice::new(front)]).await?
        };

        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "send accepted 0 bytes with data pending",
            )
            .into());
        }

        self.queue.consume(written, &self.pool);
        Ok(written)
    }

    /// Unsent buffers currently held.
    pub fn queued(&self) -> &OutgoingQueue {
        &self.queue
    }

    /// Recycle queued buffers and close the send direction.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.queue.recycle_all(&self.pool);
        self.sender.close().await?;
        Ok(())
    }

    /// Recycle queued buffers without touching the transport.
    pub fn release(&mut self) {
        self.queue.recycle_all(&self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flipped(pool: &BufferPool, len: usize, byte: u8) -> Buff {
        let mut buff = pool.acquire();
        buff.put_slice(&vec![byte; len]);
        buff.flip();
        buff
    }

    /// Sender that accepts at most `chunk` bytes per call.
    struct ChunkedSender {
        gather: bool,
        chunk: usize,
        out: Arc<Mutex<Vec<u8>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SendHalf for ChunkedSender {
        fn supports_gather(&self) -> bool {
            self.gather
        }

        async fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.gather {
                assert_eq!(segments.len(), 1);
            }
            let mut budget = self.chunk;
            let mut out = self.out.lock();
            for segment in segments {
                let take = segment.len().min(budget);
                out.extend_from_slice(&segment[..take]);
                budget -= take;
                if budget == 0 {
                    break;
                }
            }
            Ok(self.chunk - budget)
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ZeroSender;

    #[async_trait]
    impl SendHalf for ZeroSender {
        fn supports_gather(&self) -> bool {
            true
        }

        async fn send(&mut self, _segments: &[IoSlice<'_>]) -> io::Result<usize> {
            Ok(0)
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Session that hands out prepared payloads one `fill` at a time.
    struct ScriptedSession {
        payloads: Mutex<VecDeque<Vec<u8>>>,
        completes: AtomicUsize,
    }

    impl ScriptedSession {
        fn new(payloads: Vec<Vec<u8>>) -> Self {
            Self {
                payloads: Mutex::new(payloads.into()),
                completes: AtomicUsize::new(0),
            }
        }
    }

    impl Session for ScriptedSession {
        fn fill(&self, pool: &BufferPool, _max_bytes: usize) -> Option<OutgoingQueue> {
            let payload = self.payloads.lock().pop_front()?;
            let mut queue = OutgoingQueue::new();
            queue.write_all(pool, &payload);
            Some(queue)
        }

        fn read(&self, _buff: &mut Buff) -> Result<()> {
            Ok(())
        }

        fn write_complete(&self) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chunked(gather: bool, chunk: usize) -> (ChunkedSender, Arc<Mutex<Vec<u8>>>, Arc<AtomicUsize>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sender = ChunkedSender {
            gather,
            chunk,
            out: out.clone(),
            calls: calls.clone(),
        };
        (sender, out, calls)
    }

    #[test]
    fn test_consume_partial_write_scenario() {
        let pool = BufferPool::new(8192);
        let mut queue = OutgoingQueue::new();
        queue.push(flipped(&pool, 100, 1));
        queue.push(flipped(&pool, 4096, 2));
        queue.push(flipped(&pool, 32, 3));

        let recycled = queue.consume(150, &pool);

        assert_eq!(recycled, 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().unwrap().position(), 50);
        assert_eq!(queue.front().unwrap().remaining(), 4046);
        assert_eq!(queue.remaining_bytes(), 4046 + 32);
        assert_eq!(pool.stats().leased, 2);
    }

    #[test]
    fn test_consume_exact_boundary() {
        let pool = BufferPool::new(64);
        let mut queue = OutgoingQueue::new();
        queue.push(flipped(&pool, 10, 1));
        queue.push(flipped(&pool, 10, 2));

        assert_eq!(queue.consume(10, &pool), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().position(), 0);
    }

    #[test]
    fn test_consume_zero_drops_leading_empty_buffers() {
        let pool = BufferPool::new(64);
        let mut queue = OutgoingQueue::new();
        queue.push(flipped(&pool, 0, 0));
        queue.push(flipped(&pool, 5, 1));

        assert_eq!(queue.consume(0, &pool), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remaining_bytes(), 5);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "wrote")]
    fn test_consume_more_than_queued_asserts() {
        let pool = BufferPool::new(64);
        let mut queue = OutgoingQueue::new();
        queue.push(flipped(&pool, 10, 1));

        queue.consume(11, &pool);
    }

    #[test]
    fn test_segments_capped() {
        let pool = BufferPool::new(16);
        let mut queue = OutgoingQueue::new();
        for _ in 0..(MAX_GATHER_SEGMENTS + 6) {
            queue.push(flipped(&pool, 4, 9));
        }
        assert_eq!(queue.segments(MAX_GATHER_SEGMENTS).len(), MAX_GATHER_SEGMENTS);
        queue.recycle_all(&pool);
        assert_eq!(pool.stats().leased, 0);
    }

    #[test]
    fn test_write_all_spans_buffers() {
        let pool = BufferPool::new(8);
        let mut queue = OutgoingQueue::new();

        assert_eq!(queue.write_all(&pool, b"0123456789abcdefXY"), 3);
        assert_eq!(queue.remaining_bytes(), 18);
        assert_eq!(queue.front().unwrap().remaining_slice(), b"01234567");
        queue.recycle_all(&pool);
    }

    #[tokio::test]
    async fn test_drain_gather_partial_writes_byte_exact() {
        let pool = Arc::new(BufferPool::new(64));
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let session = ScriptedSession::new(vec![payload.clone()]);
        let (sender, out, _calls) = chunked(true, 37);
        let mut pipeline = SendPipeline::new(Box::new(sender), pool.clone(), MAX_DRAIN_BYTES);

        let written = pipeline.drain(&session).await.unwrap();

        assert_eq!(written, 1000);
        assert_eq!(*out.lock(), payload);
        assert_eq!(session.completes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_drain_without_gather_sends_front_only() {
        let pool = Arc::new(BufferPool::new(16));
        let session = ScriptedSession::new(vec![vec![7u8; 40], vec![8u8; 5]]);
        let (sender, out, calls) = chunked(false, 1024);
        let mut pipeline = SendPipeline::new(Box::new(sender), pool.clone(), MAX_DRAIN_BYTES);

        let written = pipeline.drain(&session).await.unwrap();

        assert_eq!(written, 45);
        // 16 + 16 + 8 from the first fill, then 5 from the second.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(out.lock().len(), 45);
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_drain_nothing_to_send() {
        let pool = Arc::new(BufferPool::new(16));
        let session = ScriptedSession::new(vec![]);
        let (sender, _out, calls) = chunked(true, 16);
        let mut pipeline = SendPipeline::new(Box::new(sender), pool, MAX_DRAIN_BYTES);

        assert_eq!(pipeline.drain(&session).await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_empty_queue_counts_as_idle() {
        let pool = Arc::new(BufferPool::new(16));
        let session = ScriptedSession::new(vec![Vec::new(), b"never".to_vec()]);
        let (sender, _out, calls) = chunked(true, 16);
        let mut pipeline = SendPipeline::new(Box::new(sender), pool, MAX_DRAIN_BYTES);

        assert_eq!(pipeline.drain(&session).await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.payloads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_write_is_failure() {
        let pool = Arc::new(BufferPool::new(16));
        let session = ScriptedSession::new(vec![b"stuck".to_vec()]);
        let mut pipeline = SendPipeline::new(Box::new(ZeroSender), pool.clone(), MAX_DRAIN_BYTES);

        let err = pipeline.drain(&session).await.unwrap_err();
        match err {
            crate::WireError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(pipeline.queued().remaining_bytes(), 5);
        pipeline.shutdown().await.unwrap();
        assert_eq!(pool.stats().leased, 0);
    }
}

//! Fixed-capacity byte region with `position` / `limit` cursors.
//!
//! ```text
//! 0            position          limit          capacity
//! ├──────────────┼─────────────────┼───────────────┤
//! │   consumed   │    remaining    │     spare     │
//! │  / reserved  │                 │               │
//! ```
//!
//! Outgoing buffers are written from `position` forward and then [`flip`]ped so
//! that `position..limit` is the data still to send. Incoming buffers start at
//! the header reserve and `position..limit` is the data received.
//!
//! [`flip`]: Buff::flip

/// A pooled, reusable byte buffer.
pub struct Buff {
    /// Backing storage (fixed size).
    data: Box<[u8]>,
    /// Next byte to read or write.
    position: usize,
    /// End of valid data.
    limit: usize,
    /// Set while the buffer sits in the pool.
    locked: bool,
}

impl Buff {
    /// Create a standalone buffer not owned by any pool.
    ///
    /// Pool-managed buffers should be obtained with
    /// [`BufferPool::acquire`](super::BufferPool::acquire).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
            locked: false,
        }
    }

    /// Total size of the backing storage.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current cursor.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// End of valid data.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between `position` and `limit`.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Whether any bytes remain between `position` and `limit`.
    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Whether the buffer is currently held by the pool.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Move the cursor. Must not pass `limit`.
    pub fn set_position(&mut self, position: usize) {
        self.check_unlocked();
        debug_assert!(
            position <= self.limit,
            "position {} past limit {}",
            position,
            self.limit
        );
        self.position = position.min(self.limit);
    }

    /// Move the end of valid data. Must stay within capacity and not fall
    /// behind `position`.
    pub fn set_limit(&mut self, limit: usize) {
        self.check_unlocked();
        debug_assert!(
            limit <= self.capacity(),
            "limit {} past capacity {}",
            limit,
            self.capacity()
        );
        self.limit = limit.min(self.capacity());
        if self.position > self.limit {
            self.position = self.limit;
        }
    }

    /// Advance the cursor by `count` consumed bytes.
    pub fn advance(&mut self, count: usize) {
        self.check_unlocked();
        debug_assert!(
            count <= self.remaining(),
            "advance by {} with only {} remaining",
            count,
            self.remaining()
        );
        self.position = (self.position + count).min(self.limit);
    }

    /// Turn a written buffer into a readable one: `limit = position`,
    /// `position = start`.
    pub fn flip_from(&mut self, start: usize) {
        self.check_unlocked();
        debug_assert!(start <= self.position);
        self.limit = self.position;
        self.position = start.min(self.limit);
    }

    /// Shorthand for [`flip_from(0)`](Self::flip_from).
    pub fn flip(&mut self) {
        self.flip_from(0);
    }

    /// Reset cursors for a fresh write.
    pub fn clear(&mut self) {
        self.check_unlocked();
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Copy as much of `src` as fits between `position` and `limit`.
    ///
    /// Returns the number of bytes copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        self.check_unlocked();
        let count = src.len().min(self.remaining());
        self.data[self.position..self.position + count].copy_from_slice(&src[..count]);
        self.position += count;
        count
    }

    /// Data between `position` and `limit`.
    #[inline]
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Writable region between `position` and the end of capacity.
    ///
    /// This is the area a receive fills.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.check_unlocked();
        &mut self.data[self.position..]
    }

    /// Leading region in front of `position`.
    ///
    /// For receive buffers this is the header reserve, free for the session
    /// to prepend framing without moving the payload.
    pub fn reserved_mut(&mut self) -> &mut [u8] {
        self.check_unlocked();
        &mut self.data[..self.position]
    }

    /// Whole backing storage, valid or not.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copy the remaining bytes out (for sessions that keep data past `read`).
    pub fn to_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(self.remaining_slice())
    }

    /// Poison and lock the buffer on its way into the pool.
    pub(crate) fn lock(&mut self, poison: Option<u8>) {
        if let Some(byte) = poison {
            self.data.fill(byte);
        }
        self.position = 0;
        self.limit = 0;
        self.locked = true;
    }

    /// Unlock a buffer leaving the pool, ready for writing.
    pub(crate) fn unlock(&mut self) {
        self.locked = false;
        self.position = 0;
        self.limit = self.capacity();
    }

    #[inline]
    fn check_unlocked(&self) {
        debug_assert!(!self.locked, "mutation of a recycled buffer");
    }
}

impl std::fmt::Debug for Buff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buff")
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("locked", &self.locked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_writable() {
        let buff = Buff::with_capacity(64);
        assert_eq!(buff.capacity(), 64);
        assert_eq!(buff.position(), 0);
        assert_eq!(buff.limit(), 64);
        assert_eq!(buff.remaining(), 64);
        assert!(!buff.is_locked());
    }

    #[test]
    fn test_put_slice_and_flip() {
        let mut buff = Buff::with_capacity(16);
        assert_eq!(buff.put_slice(b"hello"), 5);
        assert_eq!(buff.position(), 5);

        buff.flip();
        assert_eq!(buff.position(), 0);
        assert_eq!(buff.limit(), 5);
        assert_eq!(buff.remaining_slice(), b"hello");
    }

    #[test]
    fn test_put_slice_truncates_at_limit() {
        let mut buff = Buff::with_capacity(4);
        assert_eq!(buff.put_slice(b"abcdef"), 4);
        assert_eq!(buff.remaining(), 0);
        assert_eq!(buff.put_slice(b"x"), 0);
    }

    #[test]
    fn test_advance_consumes_remaining() {
        let mut buff = Buff::with_capacity(8);
        buff.put_slice(b"abcdef");
        buff.flip();

        buff.advance(2);
        assert_eq!(buff.remaining_slice(), b"cdef");
        buff.advance(4);
        assert!(!buff.has_remaining());
    }

    #[test]
    fn test_flip_from_keeps_reserve() {
        let mut buff = Buff::with_capacity(32);
        buff.set_position(8);
        buff.put_slice(b"payload");
        buff.flip_from(8);

        assert_eq!(buff.position(), 8);
        assert_eq!(buff.remaining_slice(), b"payload");
        assert_eq!(buff.reserved_mut().len(), 8);
    }

    #[test]
    fn test_set_limit_pulls_position_back() {
        let mut buff = Buff::with_capacity(32);
        buff.set_position(20);
        buff.set_limit(10);
        assert_eq!(buff.position(), 10);
        assert_eq!(buff.remaining(), 0);
    }

    #[test]
    fn test_spare_mut_starts_at_position() {
        let mut buff = Buff::with_capacity(32);
        buff.set_position(12);
        assert_eq!(buff.spare_mut().len(), 20);
    }

    #[test]
    fn test_lock_poisons_contents() {
        let mut buff = Buff::with_capacity(8);
        buff.put_slice(b"secret!!");
        buff.lock(Some(0xDD));

        assert!(buff.is_locked());
        assert!(buff.as_slice().iter().all(|&b| b == 0xDD));
        assert_eq!(buff.remaining(), 0);

        buff.unlock();
        assert!(!buff.is_locked());
        assert_eq!(buff.limit(), 8);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "mutation of a recycled buffer")]
    fn test_mutating_locked_buffer_asserts() {
        let mut buff = Buff::with_capacity(8);
        buff.lock(None);
        buff.set_position(0);
    }

    #[test]
    fn test_to_bytes_copies_remaining() {
        let mut buff = Buff::with_capacity(8);
        buff.put_slice(b"abc");
        buff.flip();
        buff.advance(1);
        assert_eq!(&buff.to_bytes()[..], b"bc");
    }
}

use bytes::BytesMut;

/// BufferPool is a scope-local, fixed number of fixed-capacity byte buffers.
/// Buffers are allocated once and re-used: an acquired buffer is lent out to
/// its user, and a released buffer is cleared and keeps its capacity for the
/// next acquisition.
pub struct BufferPool {
    free: Vec<BytesMut>,
    slots: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(slots: usize, capacity: usize) -> Self {
        Self {
            free: (0..slots).map(|_| BytesMut::with_capacity(capacity)).collect(),
            slots,
            capacity,
        }
    }

    /// Fixed capacity of every slot. Users must not grow a buffer beyond it.
    #[inline]
    pub fn slot_capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently available.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn acquire(&mut self) -> Option<BytesMut> {
        let buf = self.free.pop();
        if buf.is_none() {
            tracing::debug!(slots = self.slots, "buffer pool is exhausted");
        }
        buf
    }

    pub fn release(&mut self, mut buf: BytesMut) {
        debug_assert!(self.free.len() < self.slots, "more slots released than acquired");
        buf.clear();
        self.free.push(buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let mut pool = BufferPool::new(2, 64);
        let mut a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        a.extend_from_slice(b"hello");
        pool.release(a);
        assert_eq!(pool.available(), 1);

        let c = pool.acquire().unwrap();
        assert!(c.is_empty());
        assert!(c.capacity() >= pool.slot_capacity());

        pool.release(b);
        pool.release(c);
        assert_eq!(pool.available(), 2);
    }
}

use crate::frame::DataFlags;
use crate::pool::BufferPool;
use crate::progress::PartitionOffset;
use crate::StreamError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// QueuedMessage is a message, or the remainder of a partially delivered
/// message, which awaits delivery to the session of its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub correlation_id: Bytes,
    /// Identifiers of the message's destination (such as a service and method),
    /// which are opaque to the queue.
    pub identifiers: Bytes,
    pub metadata: Bytes,
    pub trace_id: u64,
    pub authorization: u64,
    pub progress: PartitionOffset,
    pub deferred: u32,
    pub flags: DataFlags,
    pub reserved: u32,
    pub payload: Option<Bytes>,
}

impl QueuedMessage {
    /// Length of the payload, where an absent payload is empty.
    pub fn length(&self) -> usize {
        self.payload.as_ref().map(Bytes::len).unwrap_or_default()
    }
}

/// Outcome of offering a queued message for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message was delivered in full.
    Full,
    /// This many leading bytes of the payload were delivered.
    Partial(usize),
    /// Nothing could be delivered.
    Blocked,
}

/// QueueBuffer holds messages which can't yet be delivered, in insertion
/// order, serialized into a single buffer borrowed from the scope's pool.
///
/// Records are laid out back-to-back, each prefixed by its length.
/// Removing a record shifts the records which follow it down over its span.
/// The buffer is borrowed on first use, and should be returned with
/// `release_if_empty` after each flush.
#[derive(Debug, Default)]
pub struct QueueBuffer {
    buf: Option<BytesMut>,
}

impl QueueBuffer {
    pub fn is_empty(&self) -> bool {
        self.buf.as_ref().map(BytesMut::is_empty).unwrap_or(true)
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.records().count()
    }

    /// Append a message to the tail of the queue.
    /// Fails if no buffer is available, or the message doesn't fit.
    pub fn enqueue(&mut self, pool: &mut BufferPool, message: &QueuedMessage) -> Result<(), StreamError> {
        if message.correlation_id.len() > u16::MAX as usize
            || message.identifiers.len() > u16::MAX as usize
        {
            return Err(StreamError::Malformed("oversized correlation identifiers"));
        }

        let mut buf = match self.buf.take() {
            Some(buf) => buf,
            None => pool.acquire().ok_or(StreamError::BufferExhausted)?,
        };

        if buf.len() + encoded_len(message) > pool.slot_capacity() {
            if buf.is_empty() {
                pool.release(buf);
            } else {
                self.buf = Some(buf);
            }
            return Err(StreamError::BufferExhausted);
        }

        encode(message, &mut buf);
        self.buf = Some(buf);
        Ok(())
    }

    /// Is any message of `correlation_id` queued?
    pub fn contains(&self, correlation_id: &[u8]) -> bool {
        self.records()
            .any(|record| correlation_id_of(record) == correlation_id)
    }

    /// Offer queued messages of `correlation_id` to `deliver`, in order.
    /// Fully delivered messages are removed. A partial delivery leaves its
    /// remainder at the head, as a continuation of the message, and stops
    /// the flush, as does a blocked delivery.
    /// Returns the number of messages fully delivered.
    pub fn flush_matching(
        &mut self,
        correlation_id: &[u8],
        mut deliver: impl FnMut(&QueuedMessage) -> Delivery,
    ) -> usize {
        let Some(buf) = self.buf.as_mut() else {
            return 0;
        };
        let mut offset = 0;
        let mut delivered = 0;

        while offset < buf.len() {
            let end = offset + record_len(&buf[offset..]);

            if correlation_id_of(&buf[offset..end]) != correlation_id {
                offset = end;
                continue;
            }
            let message = decode(&buf[offset..end]);

            match deliver(&message) {
                Delivery::Full => {
                    remove(buf, offset, end);
                    delivered += 1;
                }
                Delivery::Partial(0) | Delivery::Blocked => break,
                Delivery::Partial(n) => {
                    debug_assert!(n < message.length());

                    let remainder = QueuedMessage {
                        flags: message.flags.without_init(),
                        payload: message.payload.map(|p| p.slice(n.min(p.len())..)),
                        ..message
                    };
                    let mut rewritten = BytesMut::with_capacity(encoded_len(&remainder));
                    encode(&remainder, &mut rewritten);

                    // The remainder is never larger than the original.
                    let next = offset + rewritten.len();
                    buf[offset..next].copy_from_slice(&rewritten);
                    remove(buf, next, end);
                    break;
                }
            }
        }
        delivered
    }

    /// Discard all queued messages of `correlation_id`,
    /// returning the number discarded.
    pub fn discard_matching(&mut self, correlation_id: &[u8]) -> usize {
        self.flush_matching(correlation_id, |_| Delivery::Full)
    }

    /// Return the buffer to the pool if no messages remain.
    pub fn release_if_empty(&mut self, pool: &mut BufferPool) {
        if self.is_empty() {
            if let Some(buf) = self.buf.take() {
                pool.release(buf);
            }
        }
    }

    /// Discard all messages and return the buffer to the pool.
    pub fn clear(&mut self, pool: &mut BufferPool) {
        if let Some(buf) = self.buf.take() {
            pool.release(buf);
        }
    }

    fn records(&self) -> impl Iterator<Item = &[u8]> {
        let mut rest: &[u8] = self.buf.as_deref().unwrap_or_default();

        std::iter::from_fn(move || {
            if rest.is_empty() {
                return None;
            }
            let (record, next) = rest.split_at(record_len(rest));
            rest = next;
            Some(record)
        })
    }
}

// Record layout, all little-endian:
//   u32 length of the record, including this prefix
//   u16 correlation id length, then its bytes
//   u16 identifiers length, then their bytes
//   u32 metadata length, then its bytes
//   u64 trace id, u64 authorization
//   i32 partition id, i64 partition offset
//   u32 deferred, u8 flags, u32 reserved
//   i32 payload length (-1 if absent), then its bytes
fn encoded_len(m: &QueuedMessage) -> usize {
    4 + 2
        + m.correlation_id.len()
        + 2
        + m.identifiers.len()
        + 4
        + m.metadata.len()
        + 8
        + 8
        + 4
        + 8
        + 4
        + 1
        + 4
        + 4
        + m.length()
}

fn encode(m: &QueuedMessage, buf: &mut BytesMut) {
    buf.put_u32_le(encoded_len(m) as u32);
    buf.put_u16_le(m.correlation_id.len() as u16);
    buf.put_slice(&m.correlation_id);
    buf.put_u16_le(m.identifiers.len() as u16);
    buf.put_slice(&m.identifiers);
    buf.put_u32_le(m.metadata.len() as u32);
    buf.put_slice(&m.metadata);
    buf.put_u64_le(m.trace_id);
    buf.put_u64_le(m.authorization);
    buf.put_i32_le(m.progress.partition_id);
    buf.put_i64_le(m.progress.offset);
    buf.put_u32_le(m.deferred);
    buf.put_u8(m.flags.0);
    buf.put_u32_le(m.reserved);

    match &m.payload {
        Some(payload) => {
            buf.put_i32_le(payload.len() as i32);
            buf.put_slice(payload);
        }
        None => buf.put_i32_le(-1),
    }
}

fn record_len(buf: &[u8]) -> usize {
    (&buf[..4]).get_u32_le() as usize
}

fn correlation_id_of(record: &[u8]) -> &[u8] {
    let len = (&record[4..6]).get_u16_le() as usize;
    &record[6..6 + len]
}

fn decode(mut record: &[u8]) -> QueuedMessage {
    fn take(record: &mut &[u8], len: usize) -> Bytes {
        let bytes = Bytes::copy_from_slice(&record[..len]);
        record.advance(len);
        bytes
    }

    let _len = record.get_u32_le();
    let n = record.get_u16_le() as usize;
    let correlation_id = take(&mut record, n);
    let n = record.get_u16_le() as usize;
    let identifiers = take(&mut record, n);
    let n = record.get_u32_le() as usize;
    let metadata = take(&mut record, n);
    let trace_id = record.get_u64_le();
    let authorization = record.get_u64_le();
    let progress = PartitionOffset::new(record.get_i32_le(), record.get_i64_le());
    let deferred = record.get_u32_le();
    let flags = DataFlags(record.get_u8());
    let reserved = record.get_u32_le();

    let payload = match record.get_i32_le() {
        -1 => None,
        n => Some(take(&mut record, n as usize)),
    };
    debug_assert!(record.is_empty());

    QueuedMessage {
        correlation_id,
        identifiers,
        metadata,
        trace_id,
        authorization,
        progress,
        deferred,
        flags,
        reserved,
        payload,
    }
}

// Shift bytes following `end` down to `begin`, removing the span between.
fn remove(buf: &mut BytesMut, begin: usize, end: usize) {
    buf.copy_within(end.., begin);
    buf.truncate(buf.len() - (end - begin));
}

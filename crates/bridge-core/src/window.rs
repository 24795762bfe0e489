use crate::StreamError;

/// StreamWindow tracks flow-control of one direction of one stream half.
///
/// `sequence` is the absolute number of bytes (including padding) sent so far,
/// and `acknowledge` is the portion of `sequence` the receiver has consumed.
/// The receiver extends credit to `acknowledge + maximum`, so that the sender
/// may have at most `maximum` unacknowledged bytes outstanding.
///
/// A sending half moves `sequence` forward and ratchets `acknowledge` and
/// `maximum` upon received windows. A receiving half validates the sender's
/// `sequence` against the credit it has granted, and grants more credit as
/// it consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamWindow {
    sequence: u64,
    acknowledge: u64,
    maximum: u32,
    padding: u32,
    budget_id: u64,
}

impl StreamWindow {
    pub fn new(sequence: u64, acknowledge: u64, maximum: u32) -> Self {
        debug_assert!(acknowledge <= sequence);
        Self {
            sequence,
            acknowledge,
            maximum,
            padding: 0,
            budget_id: 0,
        }
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
    #[inline]
    pub fn acknowledge(&self) -> u64 {
        self.acknowledge
    }
    #[inline]
    pub fn maximum(&self) -> u32 {
        self.maximum
    }
    #[inline]
    pub fn padding(&self) -> u32 {
        self.padding
    }
    #[inline]
    pub fn budget_id(&self) -> u64 {
        self.budget_id
    }

    /// Available window: bytes which may be sent before further acknowledgement.
    #[inline]
    pub fn window(&self) -> u32 {
        (self.acknowledge + self.maximum as u64)
            .saturating_sub(self.sequence)
            .min(u32::MAX as u64) as u32
    }

    /// Bytes sent but not yet acknowledged.
    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.sequence - self.acknowledge
    }

    /// Bytes to be reserved for a payload of `length`, including framing padding.
    #[inline]
    pub fn reserved(&self, length: usize) -> u32 {
        (length as u64 + self.padding as u64).min(u32::MAX as u64) as u32
    }

    /// Advance to `sequence` plus `reserved`, where pure control events
    /// (end, flush without data) pass `reserved = 0`.
    pub fn advance(&mut self, sequence: u64, reserved: u32) -> Result<(), StreamError> {
        if sequence < self.sequence {
            return Err(StreamError::SequenceRegressed {
                previous: self.sequence,
                sequence,
            });
        }
        self.sequence = sequence + reserved as u64;
        debug_assert!(self.acknowledge <= self.sequence);
        Ok(())
    }

    /// Send `reserved` bytes within the available window.
    pub fn send(&mut self, reserved: u32) -> Result<(), StreamError> {
        let window = self.window();
        if reserved > window {
            return Err(StreamError::WindowExceeded { reserved, window });
        }
        self.sequence += reserved as u64;
        Ok(())
    }

    /// Receive `reserved` bytes at `sequence` from the sender, which must
    /// not regress and must fit within the credit granted to the sender.
    pub fn on_data(&mut self, sequence: u64, reserved: u32) -> Result<(), StreamError> {
        let limit = self.acknowledge + self.maximum as u64;

        if sequence < self.sequence {
            return Err(StreamError::SequenceRegressed {
                previous: self.sequence,
                sequence,
            });
        } else if sequence + reserved as u64 > limit {
            return Err(StreamError::WindowExceeded {
                reserved,
                window: limit.saturating_sub(sequence).min(u32::MAX as u64) as u32,
            });
        }
        self.sequence = sequence + reserved as u64;
        Ok(())
    }

    /// Apply a window received from the peer. `acknowledge` and `maximum`
    /// only ratchet forward, and `acknowledge` may never pass `sequence`.
    /// A rejected update leaves the window unchanged.
    pub fn on_window(
        &mut self,
        acknowledge: u64,
        maximum: u32,
        padding: u32,
        budget_id: u64,
    ) -> Result<(), StreamError> {
        if acknowledge < self.acknowledge {
            return Err(StreamError::AcknowledgeRegressed {
                previous: self.acknowledge,
                acknowledge,
            });
        } else if maximum < self.maximum {
            return Err(StreamError::MaximumShrank {
                previous: self.maximum,
                maximum,
            });
        } else if acknowledge > self.sequence {
            return Err(StreamError::AcknowledgeExceedsSequence {
                acknowledge,
                sequence: self.sequence,
            });
        }

        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self.padding = padding;
        self.budget_id = budget_id;
        Ok(())
    }

    /// Grant credit to the sender as its receiver. Requested values which
    /// would regress or acknowledge unsent bytes are clamped.
    /// Returns true if the window changed.
    pub fn grant(&mut self, acknowledge: u64, maximum: u32, padding: u32, budget_id: u64) -> bool {
        let acknowledge = acknowledge.clamp(self.acknowledge, self.sequence);
        let maximum = maximum.max(self.maximum);

        let next = Self {
            sequence: self.sequence,
            acknowledge,
            maximum,
            padding,
            budget_id,
        };
        if next == *self {
            return false;
        }
        *self = next;
        true
    }
}

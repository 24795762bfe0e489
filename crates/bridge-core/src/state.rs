/// Direction of a stream, relative to the party which opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Flows from the opening (client) party.
    Initial,
    /// Flows back to the opening party.
    Reply,
}

impl Direction {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Direction::Initial => Direction::Reply,
            Direction::Reply => Direction::Initial,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Initial => f.write_str("initial"),
            Direction::Reply => f.write_str("reply"),
        }
    }
}

/// Lifecycle phase of one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Opening,
    Opened,
    Closing,
    Closed,
}

/// StreamState is the set of lifecycle phases reached by each direction
/// of a stream. Transitions are pure and only ever add bits, so a phase
/// once reached is never forgotten. Reaching Opened implies Opening,
/// and reaching Closed implies Closing.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamState(u8);

impl StreamState {
    pub const INITIAL_OPENING: u8 = 0x01;
    pub const INITIAL_OPENED: u8 = 0x02;
    pub const INITIAL_CLOSING: u8 = 0x04;
    pub const INITIAL_CLOSED: u8 = 0x08;
    pub const REPLY_OPENING: u8 = 0x10;
    pub const REPLY_OPENED: u8 = 0x20;
    pub const REPLY_CLOSING: u8 = 0x40;
    pub const REPLY_CLOSED: u8 = 0x80;

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Transition `direction` into `phase`, returning the new state.
    #[inline]
    #[must_use]
    pub const fn to(self, direction: Direction, phase: Phase) -> Self {
        let bits = match phase {
            Phase::Opening => 0x01,
            Phase::Opened => 0x03,
            Phase::Closing => 0x04,
            Phase::Closed => 0x0c,
        };
        Self(self.0 | (bits << shift(direction)))
    }

    /// Has `direction` reached `phase`?
    #[inline]
    pub const fn is(self, direction: Direction, phase: Phase) -> bool {
        let bit = match phase {
            Phase::Opening => 0x01,
            Phase::Opened => 0x02,
            Phase::Closing => 0x04,
            Phase::Closed => 0x08,
        };
        self.0 & (bit << shift(direction)) != 0
    }

    /// Is `direction` open, having begun but not yet closing?
    #[inline]
    pub const fn is_open(self, direction: Direction) -> bool {
        self.is(direction, Phase::Opening) && !self.is(direction, Phase::Closing)
    }

    /// Are both directions closed?
    #[inline]
    pub const fn is_closed(self) -> bool {
        self.is(Direction::Initial, Phase::Closed) && self.is(Direction::Reply, Phase::Closed)
    }
}

const fn shift(direction: Direction) -> u8 {
    match direction {
        Direction::Initial => 0,
        Direction::Reply => 4,
    }
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [&str; 8] = [
            "INITIAL_OPENING",
            "INITIAL_OPENED",
            "INITIAL_CLOSING",
            "INITIAL_CLOSED",
            "REPLY_OPENING",
            "REPLY_OPENED",
            "REPLY_CLOSING",
            "REPLY_CLOSED",
        ];
        let names: Vec<&str> = (0..8)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .map(|bit| NAMES[bit])
            .collect();

        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

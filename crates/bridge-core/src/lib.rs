//! Core machinery of the protocol bridge: stream frames and flow-control
//! windows, proxied stream halves, correlation of asynchronous replies,
//! buffering of back-pressured messages, resumable progress tokens,
//! and the single-threaded scopes which drive it all.

pub mod config;
pub mod correlation;
pub mod engine;
pub mod frame;
pub mod half;
pub mod idle;
pub mod pool;
pub mod progress;
pub mod proxy;
pub mod queue;
pub mod route;
pub mod scope;
pub mod state;
pub mod testing;
pub mod window;

pub use budget::{BudgetIndex, BudgetTable, Flusher};
pub use config::EngineConfig;
pub use correlation::CorrelationRegistry;
pub use engine::Engine;
pub use frame::{Abort, Begin, Data, DataFlags, End, Flush, Frame, Header, Reset, Window};
pub use half::{Half, Role};
pub use progress::PartitionOffset;
pub use route::{Attributes, Resolve, Route, RouteTable};
pub use scope::{Binding, Context, Emit, Scope, ScopeHandle, Task};
pub use state::{Direction, Phase, StreamState};
pub use window::StreamWindow;

/// StreamError is a failure which is fatal to the stream that raised it,
/// but never to the scope or process. Proxies map it into Reset and Abort
/// frames on every half they own, and release the stream's resources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("sequence regressed from {previous} to {sequence}")]
    SequenceRegressed { previous: u64, sequence: u64 },
    #[error("acknowledge regressed from {previous} to {acknowledge}")]
    AcknowledgeRegressed { previous: u64, acknowledge: u64 },
    #[error("maximum shrank from {previous} to {maximum}")]
    MaximumShrank { previous: u32, maximum: u32 },
    #[error("acknowledge {acknowledge} exceeds sequence {sequence}")]
    AcknowledgeExceedsSequence { acknowledge: u64, sequence: u64 },
    #[error("reserved {reserved} exceeds the available window of {window}")]
    WindowExceeded { reserved: u32, window: u32 },
    #[error("{0} stream is already open")]
    AlreadyOpen(Direction),
    #[error("{0} stream is not open")]
    NotOpen(Direction),
    #[error("{0} stream is closed")]
    Closed(Direction),
    #[error("no budget slot is available for budget {0}")]
    BudgetExhausted(u64),
    #[error("no buffer slot is available")]
    BufferExhausted,
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("unexpected {kind} frame of the {direction} stream")]
    Unexpected {
        kind: &'static str,
        direction: Direction,
    },
}

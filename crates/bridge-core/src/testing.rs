//! Utilities for testing bindings without a transport.
use crate::frame::{Abort, Begin, Data, DataFlags, End, Frame, Header, Reset, Window};
use crate::scope::{Context, Emit, Scope};
use crate::EngineConfig;
use budget::BudgetTable;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// Recorder is an emitter which records frames for later inspection.
pub struct Recorder<X>(Arc<Mutex<Vec<Frame<X>>>>);

impl<X> Clone for Recorder<X> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<X> Default for Recorder<X> {
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<X: Send> Emit<X> for Recorder<X> {
    fn emit(&mut self, frame: Frame<X>) {
        self.0.lock().unwrap().push(frame);
    }
}

impl<X> Recorder<X> {
    /// Take all frames recorded so far.
    pub fn take(&self) -> Vec<Frame<X>> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a Scope at index zero which records its emitted frames.
pub fn scope<X: Send + 'static>(config: &EngineConfig) -> (Scope<X>, Recorder<X>) {
    let recorder = Recorder::default();
    let budgets = Arc::new(BudgetTable::new(config.budget_slots));
    let scope = Scope::new(0, config, budgets, Box::new(recorder.clone()));
    (scope, recorder)
}

/// Context of `binding_id` within the scope, for driving streams
/// of a binding without dispatching frames to it.
pub fn context<X: Send + 'static>(scope: &mut Scope<X>, binding_id: u64) -> Context<'_, X> {
    scope.context(binding_id)
}

/// Header of `stream_id` at the given sequence, acknowledge, and maximum.
pub fn header(stream_id: u64, sequence: u64, acknowledge: u64, maximum: u32) -> Header {
    Header {
        stream_id,
        sequence,
        acknowledge,
        maximum,
        ..Default::default()
    }
}

pub fn begin<X>(routed_id: u64, stream_id: u64, extension: Option<X>) -> Frame<X> {
    Frame::Begin(Begin {
        header: Header {
            routed_id,
            ..header(stream_id, 0, 0, 0)
        },
        affinity: 0,
        extension,
    })
}

pub fn data<X>(
    stream_id: u64,
    sequence: u64,
    flags: DataFlags,
    reserved: u32,
    payload: &[u8],
    extension: Option<X>,
) -> Frame<X> {
    Frame::Data(Data {
        header: header(stream_id, sequence, 0, 0),
        budget_id: 0,
        flags,
        reserved,
        payload: Some(Bytes::copy_from_slice(payload)),
        extension,
    })
}

pub fn end<X>(stream_id: u64, sequence: u64, extension: Option<X>) -> Frame<X> {
    Frame::End(End {
        header: header(stream_id, sequence, 0, 0),
        extension,
    })
}

pub fn abort<X>(stream_id: u64, sequence: u64, extension: Option<X>) -> Frame<X> {
    Frame::Abort(Abort {
        header: header(stream_id, sequence, 0, 0),
        extension,
    })
}

pub fn window<X>(
    stream_id: u64,
    sequence: u64,
    acknowledge: u64,
    maximum: u32,
    padding: u32,
) -> Frame<X> {
    Frame::Window(Window {
        header: header(stream_id, sequence, acknowledge, maximum),
        budget_id: 0,
        padding,
        capabilities: 0,
    })
}

pub fn reset<X>(stream_id: u64, extension: Option<X>) -> Frame<X> {
    Frame::Reset(Reset {
        header: header(stream_id, 0, 0, 0),
        extension,
    })
}

use crate::frame::{Abort, Begin, Data, DataFlags, End, Flush, Frame, Header, Reset, Window};
use crate::scope::Context;
use crate::state::{Direction, Phase, StreamState};
use crate::window::StreamWindow;
use crate::StreamError;
use budget::BudgetIndex;
use bytes::Bytes;

/// Role of a Half within a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Faces the party which opened the stream: receives the initial
    /// direction, and sends the reply direction.
    Server,
    /// Faces a delegate the proxy opened: sends the initial direction,
    /// and receives the reply direction.
    Client,
}

/// Half is one side of a proxied stream: a pair of initial and reply
/// stream ids, their lifecycle state, and the flow-control window of each.
///
/// `do_*` methods emit frames, and `on_*` methods validate received frames.
/// A Half never decides what to do with a frame: that's up to the proxy
/// which owns it, and which typically translates an `on_*` of one Half
/// into a `do_*` of another.
#[derive(Debug)]
pub struct Half {
    origin_id: u64,
    routed_id: u64,
    initial_id: u64,
    reply_id: u64,
    authorization: u64,
    affinity: u64,
    role: Role,
    state: StreamState,
    initial: StreamWindow,
    reply: StreamWindow,
    debitor: Option<BudgetIndex>,
}

impl Half {
    /// Accept a new stream as its server, binding its ids to `key`.
    pub fn accept<X: Send + 'static>(
        cx: &mut Context<'_, X>,
        key: u64,
        begin: &Begin<X>,
    ) -> Result<Self, StreamError> {
        let Header {
            origin_id,
            routed_id,
            stream_id,
            sequence,
            acknowledge,
            authorization,
            ..
        } = begin.header;

        if acknowledge > sequence {
            return Err(StreamError::AcknowledgeExceedsSequence {
                acknowledge,
                sequence,
            });
        }

        let half = Self {
            origin_id,
            routed_id,
            initial_id: stream_id,
            reply_id: stream_id ^ 1,
            authorization,
            affinity: begin.affinity,
            role: Role::Server,
            state: StreamState::default().to(Direction::Initial, Phase::Opening),
            initial: StreamWindow::new(sequence, acknowledge, 0),
            reply: StreamWindow::default(),
            debitor: None,
        };
        cx.bind(half.initial_id, key);
        cx.bind(half.reply_id, key);

        Ok(half)
    }

    /// Connect a new delegate stream to `routed_id` as its client,
    /// binding its ids to `key`. Nothing is emitted until `do_begin`.
    pub fn connect<X: Send + 'static>(
        cx: &mut Context<'_, X>,
        key: u64,
        routed_id: u64,
        authorization: u64,
        affinity: u64,
    ) -> Self {
        let initial_id = cx.supply_initial_id();

        let half = Self {
            origin_id: cx.binding_id(),
            routed_id,
            initial_id,
            reply_id: initial_id ^ 1,
            authorization,
            affinity,
            role: Role::Client,
            state: StreamState::default(),
            initial: StreamWindow::default(),
            reply: StreamWindow::default(),
            debitor: None,
        };
        cx.bind(half.initial_id, key);
        cx.bind(half.reply_id, key);

        half
    }

    #[inline]
    pub fn origin_id(&self) -> u64 {
        self.origin_id
    }
    #[inline]
    pub fn routed_id(&self) -> u64 {
        self.routed_id
    }
    #[inline]
    pub fn initial_id(&self) -> u64 {
        self.initial_id
    }
    #[inline]
    pub fn reply_id(&self) -> u64 {
        self.reply_id
    }
    #[inline]
    pub fn authorization(&self) -> u64 {
        self.authorization
    }
    #[inline]
    pub fn affinity(&self) -> u64 {
        self.affinity
    }
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }
    #[inline]
    pub fn state(&self) -> StreamState {
        self.state
    }
    #[inline]
    pub fn initial(&self) -> &StreamWindow {
        &self.initial
    }
    #[inline]
    pub fn reply(&self) -> &StreamWindow {
        &self.reply
    }
    /// Are both directions closed?
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Direction which this Half receives.
    #[inline]
    pub fn inbound_dir(&self) -> Direction {
        match self.role {
            Role::Server => Direction::Initial,
            Role::Client => Direction::Reply,
        }
    }
    /// Direction which this Half sends.
    #[inline]
    pub fn outbound_dir(&self) -> Direction {
        self.inbound_dir().opposite()
    }
    #[inline]
    pub fn inbound_id(&self) -> u64 {
        match self.role {
            Role::Server => self.initial_id,
            Role::Client => self.reply_id,
        }
    }
    #[inline]
    pub fn outbound_id(&self) -> u64 {
        match self.role {
            Role::Server => self.reply_id,
            Role::Client => self.initial_id,
        }
    }
    #[inline]
    pub fn inbound(&self) -> &StreamWindow {
        match self.role {
            Role::Server => &self.initial,
            Role::Client => &self.reply,
        }
    }
    #[inline]
    pub fn outbound(&self) -> &StreamWindow {
        match self.role {
            Role::Server => &self.reply,
            Role::Client => &self.initial,
        }
    }
    /// Is the inbound direction begun, and not yet closing?
    #[inline]
    pub fn is_inbound_open(&self) -> bool {
        self.state.is_open(self.inbound_dir())
    }
    /// Is the outbound direction begun, and not yet closing?
    #[inline]
    pub fn is_outbound_open(&self) -> bool {
        self.state.is_open(self.outbound_dir())
    }

    fn inbound_mut(&mut self) -> &mut StreamWindow {
        match self.role {
            Role::Server => &mut self.initial,
            Role::Client => &mut self.reply,
        }
    }
    fn outbound_mut(&mut self) -> &mut StreamWindow {
        match self.role {
            Role::Server => &mut self.reply,
            Role::Client => &mut self.initial,
        }
    }

    fn header(&self, stream_id: u64, window: &StreamWindow, trace_id: u64) -> Header {
        Header {
            origin_id: self.origin_id,
            routed_id: self.routed_id,
            stream_id,
            sequence: window.sequence(),
            acknowledge: window.acknowledge(),
            maximum: window.maximum(),
            trace_id,
            authorization: self.authorization,
        }
    }
    fn outbound_header(&self, trace_id: u64) -> Header {
        self.header(self.outbound_id(), self.outbound(), trace_id)
    }
    fn inbound_header(&self, trace_id: u64) -> Header {
        self.header(self.inbound_id(), self.inbound(), trace_id)
    }

    fn check_open(&self, dir: Direction) -> Result<(), StreamError> {
        if !self.state.is(dir, Phase::Opening) {
            Err(StreamError::NotOpen(dir))
        } else if self.state.is(dir, Phase::Closing) {
            Err(StreamError::Closed(dir))
        } else {
            Ok(())
        }
    }

    pub fn do_begin<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        extension: Option<X>,
    ) -> Result<(), StreamError> {
        let dir = self.outbound_dir();
        if self.state.is(dir, Phase::Opening) {
            return Err(StreamError::AlreadyOpen(dir));
        }
        self.state = self.state.to(dir, Phase::Opening);

        cx.emit(Frame::Begin(Begin {
            header: self.outbound_header(trace_id),
            affinity: self.affinity,
            extension,
        }));
        Ok(())
    }

    /// Send data of `reserved` bytes, which must fit the outbound window.
    /// Fails without emitting anything if the outbound direction isn't open.
    pub fn do_data<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        flags: DataFlags,
        reserved: u32,
        payload: Option<Bytes>,
        extension: Option<X>,
    ) -> Result<(), StreamError> {
        self.check_open(self.outbound_dir())?;

        let header = self.outbound_header(trace_id);
        self.outbound_mut().send(reserved)?;

        cx.emit(Frame::Data(Data {
            header,
            budget_id: self.outbound().budget_id(),
            flags,
            reserved,
            payload,
            extension,
        }));
        Ok(())
    }

    pub fn do_flush<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        reserved: u32,
        extension: Option<X>,
    ) -> Result<(), StreamError> {
        self.check_open(self.outbound_dir())?;

        let header = self.outbound_header(trace_id);
        self.outbound_mut().send(reserved)?;

        cx.emit(Frame::Flush(Flush {
            header,
            budget_id: self.outbound().budget_id(),
            reserved,
            extension,
        }));
        Ok(())
    }

    /// End the outbound direction. Once closing, further calls are no-ops.
    pub fn do_end<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        extension: Option<X>,
    ) {
        let dir = self.outbound_dir();
        if self.state.is(dir, Phase::Closing) {
            return;
        }
        let begun = self.state.is(dir, Phase::Opening);
        self.state = self.state.to(dir, Phase::Closed);

        if begun {
            cx.emit(Frame::End(End {
                header: self.outbound_header(trace_id),
                extension,
            }));
        }
    }

    /// Abort the outbound direction. Once closing, further calls are no-ops.
    pub fn do_abort<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        extension: Option<X>,
    ) {
        let dir = self.outbound_dir();
        if self.state.is(dir, Phase::Closing) {
            return;
        }
        let begun = self.state.is(dir, Phase::Opening);
        self.state = self.state.to(dir, Phase::Closed);

        if begun {
            cx.emit(Frame::Abort(Abort {
                header: self.outbound_header(trace_id),
                extension,
            }));
        }
    }

    /// Grant credit of the inbound direction to its sender.
    /// A Window is emitted if the grant changed, or opens the direction.
    pub fn do_window<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        acknowledge: u64,
        maximum: u32,
        padding: u32,
        budget_id: u64,
    ) {
        let dir = self.inbound_dir();
        if !self.state.is_open(dir) {
            return;
        }
        let changed = self
            .inbound_mut()
            .grant(acknowledge, maximum, padding, budget_id);

        if changed || !self.state.is(dir, Phase::Opened) {
            self.state = self.state.to(dir, Phase::Opened);

            cx.emit(Frame::Window(Window {
                header: self.inbound_header(trace_id),
                budget_id,
                padding,
                capabilities: 0,
            }));
        }
    }

    /// Grant credit of the inbound direction which mirrors `source`,
    /// the outbound window of a peer Half to which inbound data is forwarded.
    /// Bytes still outstanding to `source` remain unacknowledged here,
    /// and `extra_padding` covers framing the proxy adds when forwarding.
    pub fn mirror_window<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        source: &StreamWindow,
        extra_padding: u32,
    ) {
        let acknowledge = self
            .inbound()
            .sequence()
            .saturating_sub(source.outstanding());

        self.do_window(
            cx,
            trace_id,
            acknowledge,
            source.maximum(),
            source.padding().saturating_add(extra_padding),
            source.budget_id(),
        )
    }

    /// Reset the inbound direction. Once closed, further calls are no-ops.
    pub fn do_reset<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        trace_id: u64,
        extension: Option<X>,
    ) {
        let dir = self.inbound_dir();
        if self.state.is(dir, Phase::Closed) {
            return;
        }
        self.state = self.state.to(dir, Phase::Closed);

        cx.emit(Frame::Reset(Reset {
            header: self.inbound_header(trace_id),
            extension,
        }));
    }

    /// Reset the inbound and abort the outbound direction, closing the Half.
    pub fn cleanup<X: Send + 'static>(&mut self, cx: &mut Context<'_, X>, trace_id: u64) {
        self.do_reset(cx, trace_id, None);
        self.do_abort(cx, trace_id, None);
    }

    /// Receive the begin of the inbound direction of a client.
    pub fn on_begin<X>(&mut self, begin: &Begin<X>) -> Result<(), StreamError> {
        let dir = self.inbound_dir();
        let Header {
            sequence,
            acknowledge,
            ..
        } = begin.header;

        if self.state.is(dir, Phase::Opening) {
            return Err(StreamError::AlreadyOpen(dir));
        } else if acknowledge > sequence {
            return Err(StreamError::AcknowledgeExceedsSequence {
                acknowledge,
                sequence,
            });
        }
        *self.inbound_mut() = StreamWindow::new(sequence, acknowledge, 0);
        self.state = self.state.to(dir, Phase::Opening);
        Ok(())
    }

    pub fn on_data<X>(&mut self, data: &Data<X>) -> Result<(), StreamError> {
        self.check_open(self.inbound_dir())?;

        if (data.reserved as usize) < data.length() {
            return Err(StreamError::Malformed("data reserving less than its payload"));
        }
        self.inbound_mut()
            .on_data(data.header.sequence, data.reserved)
    }

    pub fn on_flush<X>(&mut self, flush: &Flush<X>) -> Result<(), StreamError> {
        self.check_open(self.inbound_dir())?;
        self.inbound_mut()
            .on_data(flush.header.sequence, flush.reserved)
    }

    pub fn on_end<X>(&mut self, end: &End<X>) -> Result<(), StreamError> {
        let dir = self.inbound_dir();
        self.check_open(dir)?;
        self.inbound_mut().advance(end.header.sequence, 0)?;
        self.state = self.state.to(dir, Phase::Closed);
        Ok(())
    }

    /// Receive an abort of the inbound direction, which is closed
    /// even if the abort is itself in error.
    pub fn on_abort<X>(&mut self, _abort: &Abort<X>) -> Result<(), StreamError> {
        let dir = self.inbound_dir();
        let result = self.check_open(dir);
        self.state = self.state.to(dir, Phase::Closed);
        result
    }

    /// Receive a window of the outbound direction.
    /// Windows which race with the close of the direction are ignored.
    pub fn on_window(&mut self, window: &Window) -> Result<(), StreamError> {
        let dir = self.outbound_dir();
        if !self.state.is(dir, Phase::Opening) {
            return Err(StreamError::NotOpen(dir));
        } else if self.state.is(dir, Phase::Closed) {
            return Ok(());
        }
        self.outbound_mut().on_window(
            window.header.acknowledge,
            window.header.maximum,
            window.padding,
            window.budget_id,
        )?;
        self.state = self.state.to(dir, Phase::Opened);
        Ok(())
    }

    /// Receive a reset of the outbound direction. Returns false if
    /// the direction was already closed.
    pub fn on_reset<X>(&mut self, _reset: &Reset<X>) -> bool {
        let dir = self.outbound_dir();
        if self.state.is(dir, Phase::Closed) {
            return false;
        }
        self.state = self.state.to(dir, Phase::Closed);
        true
    }

    /// Claim between `minimum` and `maximum` bytes to send, bounded by the
    /// outbound window and, if the window draws from a budget, by a claim
    /// of that budget. Returns zero if the claim can't be made now: the
    /// binding is flushed when budget credit becomes available.
    pub fn claim<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        minimum: u32,
        maximum: u32,
        deferred: u32,
    ) -> Result<u32, StreamError> {
        let maximum = maximum.min(self.outbound().window());
        if maximum == 0 || maximum < minimum {
            return Ok(0);
        }

        let budget_id = self.outbound().budget_id();
        if budget_id == 0 {
            return Ok(maximum);
        }
        let watcher_id = self.outbound_id();

        let index = match self.debitor {
            Some(index) if index.budget_id() == budget_id => index,
            prior => {
                if let Some(prior) = prior {
                    cx.budgets().release(prior, watcher_id);
                }
                self.debitor = None;

                let index = cx
                    .budgets()
                    .acquire(budget_id, watcher_id, cx.flusher(watcher_id))
                    .ok_or(StreamError::BudgetExhausted(budget_id))?;
                self.debitor = Some(index);
                index
            }
        };

        Ok(cx
            .budgets()
            .claim(index, watcher_id, minimum, maximum, deferred))
    }

    /// Release resources of the Half: its bound stream ids and any budget
    /// registration. The Half must not be used after.
    pub fn release<X: Send + 'static>(&mut self, cx: &mut Context<'_, X>) {
        cx.unbind(self.initial_id);
        cx.unbind(self.reply_id);

        if let Some(index) = self.debitor.take() {
            cx.budgets().release(index, self.outbound_id());
        }
    }
}

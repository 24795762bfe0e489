use crate::frame::{self, Begin, Frame, Header, Reset};
use crate::idle::{IdleConfig, IdleStrategy};
use crate::pool::BufferPool;
use crate::EngineConfig;
use budget::{BudgetTable, Flusher};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Emit frames to the transport. Emission never blocks: the transport
/// delivers frames asynchronously, and in order per stream.
pub trait Emit<X>: Send {
    fn emit(&mut self, frame: Frame<X>);
}

impl<X: Send> Emit<X> for mpsc::UnboundedSender<Frame<X>> {
    fn emit(&mut self, frame: Frame<X>) {
        if let Err(mpsc::error::SendError(frame)) = self.send(frame) {
            tracing::debug!(
                stream_id = frame.stream_id(),
                kind = frame.kind(),
                "dropping frame of a closed transport"
            );
        }
    }
}

/// Task is a unit of work executed by a Scope.
pub enum Task<X> {
    /// Frame received from the transport.
    Frame(Frame<X>),
    /// Attach a binding to the scope.
    Attach(Box<dyn Binding<X>>),
    /// Detach the binding having this id.
    Detach(u64),
    /// Credit is available to a stream which was waiting on its budget.
    BudgetFlush { stream_id: u64, trace_id: u64 },
}

/// Binding is an attached configuration of a protocol bridge which owns
/// the proxies of its streams. Scopes route frames to bindings by stream:
/// a Begin of a new initial stream goes to the binding named by its
/// `routed_id`, and all other frames go to the binding which bound
/// the stream id, along with the key it was bound with.
pub trait Binding<X>: Send {
    fn id(&self) -> u64;

    fn attach(&mut self, _cx: &mut Context<'_, X>) {}

    /// Begin a new stream of the binding. Returns false if the stream
    /// is refused, in which case the scope resets it.
    fn new_stream(&mut self, cx: &mut Context<'_, X>, begin: Begin<X>) -> bool;

    fn on_frame(&mut self, cx: &mut Context<'_, X>, key: u64, frame: Frame<X>);

    fn on_signal(&mut self, _cx: &mut Context<'_, X>, _signal_id: u64) {}

    fn on_budget_flush(
        &mut self,
        _cx: &mut Context<'_, X>,
        _key: u64,
        _stream_id: u64,
        _trace_id: u64,
    ) {
    }

    fn detach(&mut self, _cx: &mut Context<'_, X>) {}
}

/// State of a Scope which is lent to bindings, through a Context.
pub struct ScopeState<X> {
    index: u8,
    emitter: Box<dyn Emit<X>>,
    tx: mpsc::UnboundedSender<Task<X>>,
    // Bound streams, mapped to their (binding id, key).
    streams: HashMap<u64, (u64, u64)>,
    next_stream: u64,
    next_trace: u64,
    next_timer: u64,
    budgets: Arc<BudgetTable>,
    pool: BufferPool,
    // Scheduled signals, ordered on (deadline, timer id) and mapped to (binding id, signal id).
    timers: BTreeMap<(Instant, u64), (u64, u64)>,
    deadlines: HashMap<u64, Instant>,
}

/// Context of a binding invocation.
pub struct Context<'a, X> {
    binding_id: u64,
    state: &'a mut ScopeState<X>,
}

impl<'a, X: Send + 'static> Context<'a, X> {
    #[inline]
    pub fn binding_id(&self) -> u64 {
        self.binding_id
    }

    #[inline]
    pub fn scope_index(&self) -> u8 {
        self.state.index
    }

    pub fn emit(&mut self, frame: Frame<X>) {
        tracing::trace!(
            stream_id = frame.stream_id(),
            kind = frame.kind(),
            sequence = frame.header().sequence,
            acknowledge = frame.header().acknowledge,
            maximum = frame.header().maximum,
            "emit"
        );
        self.state.emitter.emit(frame);
    }

    /// Route future frames of `stream_id` to this binding under `key`.
    pub fn bind(&mut self, stream_id: u64, key: u64) {
        let prior = self.state.streams.insert(stream_id, (self.binding_id, key));
        debug_assert!(prior.is_none(), "stream {stream_id} is already bound");
    }

    pub fn unbind(&mut self, stream_id: u64) {
        self.state.streams.remove(&stream_id);
    }

    /// Supply a new initial (odd) stream id. Its reply id is `initial_id ^ 1`.
    /// Ids are namespaced by scope, and never collide with one another.
    pub fn supply_initial_id(&mut self) -> u64 {
        self.state.next_stream += 1;
        ((self.state.index as u64 + 1) << 56) | (self.state.next_stream << 1) | 0x01
    }

    pub fn supply_trace_id(&mut self) -> u64 {
        self.state.next_trace += 1;
        ((self.state.index as u64 + 1) << 56) | self.state.next_trace
    }

    pub fn supply_budget_id(&self) -> u64 {
        self.state.budgets.supply_budget_id(self.state.index)
    }

    pub fn budgets(&self) -> &Arc<BudgetTable> {
        &self.state.budgets
    }

    /// Flusher which notifies this scope that `stream_id` may claim again.
    pub fn flusher(&self, stream_id: u64) -> Flusher {
        let tx = self.state.tx.clone();
        Arc::new(move |trace_id| {
            let _ = tx.send(Task::BudgetFlush {
                stream_id,
                trace_id,
            });
        })
    }

    pub fn pool(&mut self) -> &mut BufferPool {
        &mut self.state.pool
    }

    /// Schedule `signal_id` to be delivered to this binding after `delay`.
    /// Returns a timer id which may be cancelled.
    pub fn schedule(&mut self, delay: Duration, signal_id: u64) -> u64 {
        self.state.next_timer += 1;
        let timer_id = self.state.next_timer;
        let deadline = Instant::now() + delay;

        self.state
            .timers
            .insert((deadline, timer_id), (self.binding_id, signal_id));
        self.state.deadlines.insert(timer_id, deadline);
        timer_id
    }

    /// Cancel a scheduled signal. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, timer_id: u64) -> bool {
        match self.state.deadlines.remove(&timer_id) {
            Some(deadline) => self.state.timers.remove(&(deadline, timer_id)).is_some(),
            None => false,
        }
    }
}

/// Scope is a single-threaded worker which owns a set of bindings, and
/// executes the tasks sent to it one after another. Nothing a scope owns
/// is shared with other scopes, except for the BudgetTable.
pub struct Scope<X> {
    bindings: HashMap<u64, Box<dyn Binding<X>>>,
    state: ScopeState<X>,
    rx: mpsc::UnboundedReceiver<Task<X>>,
}

/// ScopeHandle sends tasks to a Scope from anywhere.
pub struct ScopeHandle<X> {
    index: u8,
    tx: mpsc::UnboundedSender<Task<X>>,
}

impl<X> Clone for ScopeHandle<X> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            tx: self.tx.clone(),
        }
    }
}

impl<X> ScopeHandle<X> {
    pub fn send(&self, task: Task<X>) -> anyhow::Result<()> {
        self.tx
            .send(task)
            .map_err(|_| anyhow::anyhow!("scope {} has stopped", self.index))
    }

    pub fn frame(&self, frame: Frame<X>) -> anyhow::Result<()> {
        self.send(Task::Frame(frame))
    }

    pub fn attach(&self, binding: Box<dyn Binding<X>>) -> anyhow::Result<()> {
        self.send(Task::Attach(binding))
    }

    pub fn detach(&self, binding_id: u64) -> anyhow::Result<()> {
        self.send(Task::Detach(binding_id))
    }
}

impl<X: Send + 'static> Scope<X> {
    pub fn new(
        index: u8,
        config: &EngineConfig,
        budgets: Arc<BudgetTable>,
        emitter: Box<dyn Emit<X>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            bindings: HashMap::new(),
            state: ScopeState {
                index,
                emitter,
                tx,
                streams: HashMap::new(),
                next_stream: 0,
                next_trace: 0,
                next_timer: 0,
                budgets,
                pool: BufferPool::new(config.buffer_slots, config.buffer_slot_capacity),
                timers: BTreeMap::new(),
                deadlines: HashMap::new(),
            },
            rx,
        }
    }

    pub fn index(&self) -> u8 {
        self.state.index
    }

    pub fn handle(&self) -> ScopeHandle<X> {
        ScopeHandle {
            index: self.state.index,
            tx: self.state.tx.clone(),
        }
    }

    pub(crate) fn context(&mut self, binding_id: u64) -> Context<'_, X> {
        Context {
            binding_id,
            state: &mut self.state,
        }
    }

    /// Number of streams currently bound within the scope.
    pub fn bound_streams(&self) -> usize {
        self.state.streams.len()
    }

    /// Number of buffer slots currently available to the scope.
    pub fn available_buffers(&self) -> usize {
        self.state.pool.available()
    }

    /// Execute a task.
    pub fn dispatch(&mut self, task: Task<X>) {
        match task {
            Task::Frame(frame) => self.on_frame(frame),
            Task::Attach(binding) => self.attach(binding),
            Task::Detach(binding_id) => self.detach(binding_id),
            Task::BudgetFlush {
                stream_id,
                trace_id,
            } => self.on_budget_flush(stream_id, trace_id),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(scope = self.state.index, binding_id = binding.id()))]
    pub fn attach(&mut self, mut binding: Box<dyn Binding<X>>) {
        let binding_id = binding.id();

        binding.attach(&mut Context {
            binding_id,
            state: &mut self.state,
        });
        if let Some(mut prior) = self.bindings.insert(binding_id, binding) {
            tracing::warn!("replaced an attached binding having the same id");
            prior.detach(&mut Context {
                binding_id,
                state: &mut self.state,
            });
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(scope = self.state.index))]
    pub fn detach(&mut self, binding_id: u64) {
        let Some(mut binding) = self.bindings.remove(&binding_id) else {
            tracing::debug!("binding is not attached");
            return;
        };
        binding.detach(&mut Context {
            binding_id,
            state: &mut self.state,
        });

        // Drop any streams and signals the binding left behind.
        self.state
            .streams
            .retain(|_, (bound_id, _)| *bound_id != binding_id);

        let deadlines = &mut self.state.deadlines;
        self.state.timers.retain(|(_, timer_id), (bound_id, _)| {
            if *bound_id == binding_id {
                deadlines.remove(timer_id);
                false
            } else {
                true
            }
        });
    }

    fn on_frame(&mut self, frame: Frame<X>) {
        let stream_id = frame.stream_id();

        if let Some(&(binding_id, key)) = self.state.streams.get(&stream_id) {
            if let Some(binding) = self.bindings.get_mut(&binding_id) {
                binding.on_frame(
                    &mut Context {
                        binding_id,
                        state: &mut self.state,
                    },
                    key,
                    frame,
                );
                return;
            }
        }

        match frame {
            Frame::Begin(begin) if frame::is_initial(stream_id) => {
                let header = begin.header;

                let accepted = match self.bindings.get_mut(&header.routed_id) {
                    Some(binding) => binding.new_stream(
                        &mut Context {
                            binding_id: header.routed_id,
                            state: &mut self.state,
                        },
                        begin,
                    ),
                    None => false,
                };

                if !accepted {
                    tracing::debug!(
                        stream_id,
                        routed_id = header.routed_id,
                        "refusing stream without a binding"
                    );
                    self.state.emitter.emit(Frame::Reset(Reset {
                        header: Header {
                            maximum: 0,
                            ..header
                        },
                        extension: None,
                    }));
                }
            }
            frame => {
                tracing::trace!(stream_id, kind = frame.kind(), "dropping frame of unknown stream");
            }
        }
    }

    fn on_budget_flush(&mut self, stream_id: u64, trace_id: u64) {
        let Some(&(binding_id, key)) = self.state.streams.get(&stream_id) else {
            return; // Stream closed since credit was awaited.
        };
        if let Some(binding) = self.bindings.get_mut(&binding_id) {
            binding.on_budget_flush(
                &mut Context {
                    binding_id,
                    state: &mut self.state,
                },
                key,
                stream_id,
                trace_id,
            );
        }
    }

    /// Fire signals which are due as of `now`. Returns the number fired.
    pub fn fire_signals(&mut self, now: Instant) -> usize {
        let mut fired = 0;

        while let Some(&(deadline, timer_id)) = self.state.timers.keys().next() {
            if deadline > now {
                break;
            }
            let Some((binding_id, signal_id)) = self.state.timers.remove(&(deadline, timer_id))
            else {
                break;
            };
            self.state.deadlines.remove(&timer_id);

            if let Some(binding) = self.bindings.get_mut(&binding_id) {
                binding.on_signal(
                    &mut Context {
                        binding_id,
                        state: &mut self.state,
                    },
                    signal_id,
                );
            }
            fired += 1;
        }
        fired
    }

    /// Deadline of the next scheduled signal.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Execute all ready tasks and due signals, without blocking.
    /// Returns the amount of work done.
    pub fn poll(&mut self) -> usize {
        let mut work = 0;
        while let Ok(task) = self.rx.try_recv() {
            self.dispatch(task);
            work += 1;
        }
        work + self.fire_signals(Instant::now())
    }

    /// Run the scope until `shutdown` is cancelled, then detach its bindings.
    #[tracing::instrument(level = "debug", skip_all, fields(scope = self.state.index))]
    pub async fn run(mut self, idle: IdleConfig, shutdown: CancellationToken) {
        let mut idle = IdleStrategy::new(idle);
        tracing::debug!("scope started");

        loop {
            if self.poll() != 0 {
                idle.reset();
                continue;
            }
            let limit = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(task) = self.rx.recv() => {
                    self.dispatch(task);
                    idle.reset();
                }
                _ = idle.idle(limit) => (),
            }
        }

        let binding_ids: Vec<u64> = self.bindings.keys().copied().collect();
        for binding_id in binding_ids {
            self.detach(binding_id);
        }
        tracing::debug!("scope stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{Data, DataFlags, End, Flush};
    use crate::testing;
    use std::sync::Mutex;

    // Binding which accepts streams having a non-zero affinity,
    // echoes their frames, and logs what it observes.
    struct Echo {
        id: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Binding<()> for Echo {
        fn id(&self) -> u64 {
            self.id
        }
        fn attach(&mut self, cx: &mut Context<'_, ()>) {
            cx.schedule(Duration::ZERO, 7);
            let cancelled = cx.schedule(Duration::ZERO, 8);
            assert!(cx.cancel(cancelled));
            assert!(!cx.cancel(cancelled));
            cx.schedule(Duration::from_secs(3600), 9);
        }
        fn new_stream(&mut self, cx: &mut Context<'_, ()>, begin: Begin<()>) -> bool {
            if begin.affinity == 0 {
                return false;
            }
            cx.bind(begin.header.stream_id, 1);
            cx.emit(Frame::Begin(Begin {
                header: Header {
                    stream_id: begin.header.stream_id ^ 1,
                    ..begin.header
                },
                affinity: begin.affinity,
                extension: None,
            }));
            true
        }
        fn on_frame(&mut self, cx: &mut Context<'_, ()>, key: u64, frame: Frame<()>) {
            assert_eq!(key, 1);
            match &frame {
                Frame::Flush(_) => cx.flusher(frame.stream_id())(42),
                Frame::End(_) => cx.unbind(frame.stream_id()),
                _ => (),
            }
            cx.emit(frame);
        }
        fn on_signal(&mut self, _cx: &mut Context<'_, ()>, signal_id: u64) {
            self.log.lock().unwrap().push(format!("signal {signal_id}"));
        }
        fn on_budget_flush(
            &mut self,
            _cx: &mut Context<'_, ()>,
            key: u64,
            stream_id: u64,
            trace_id: u64,
        ) {
            self.log
                .lock()
                .unwrap()
                .push(format!("flush {key} {stream_id} {trace_id}"));
        }
        fn detach(&mut self, _cx: &mut Context<'_, ()>) {
            self.log.lock().unwrap().push("detach".to_string());
        }
    }

    #[test]
    fn test_scope_routing_and_signals() {
        let (mut scope, recorder) = testing::scope::<()>(&EngineConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        scope.dispatch(Task::Attach(Box::new(Echo {
            id: 5,
            log: log.clone(),
        })));
        assert_eq!(scope.fire_signals(Instant::now() + Duration::from_secs(1)), 1);
        assert!(scope.next_deadline().is_some());

        let begin = |stream_id, routed_id, affinity| {
            Task::Frame(Frame::Begin(Begin {
                header: Header {
                    stream_id,
                    routed_id,
                    ..Default::default()
                },
                affinity,
                extension: None,
            }))
        };
        scope.dispatch(begin(1, 5, 1));
        scope.dispatch(begin(3, 5, 0)); // Refused by the binding.
        scope.dispatch(begin(5, 99, 1)); // No such binding.
        assert_eq!(scope.bound_streams(), 1);

        let kinds: Vec<_> = recorder
            .take()
            .iter()
            .map(|f| (f.kind(), f.stream_id()))
            .collect();
        assert_eq!(kinds, vec![("begin", 0), ("reset", 3), ("reset", 5)]);

        let header = Header {
            stream_id: 1,
            ..Default::default()
        };
        scope.dispatch(Task::Frame(Frame::Data(Data {
            header,
            budget_id: 0,
            flags: DataFlags::COMPLETE,
            reserved: 5,
            payload: Some(bytes::Bytes::from_static(b"hello")),
            extension: None,
        })));
        scope.dispatch(Task::Frame(Frame::Flush(Flush {
            header,
            budget_id: 0,
            reserved: 0,
            extension: None,
        })));
        // The flusher posted a task, which runs on the next poll.
        assert_eq!(scope.poll(), 1);

        scope.dispatch(Task::Frame(Frame::End(End {
            header,
            extension: None,
        })));
        // Unbound: dropped.
        scope.dispatch(Task::Frame(Frame::End(End {
            header,
            extension: None,
        })));
        assert_eq!(recorder.take().len(), 3);

        scope.handle().detach(5).unwrap();
        assert_eq!(scope.poll(), 1);
        assert_eq!(scope.next_deadline(), None);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "signal 7".to_string(),
                "flush 1 1 42".to_string(),
                "detach".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_scope_run_until_shutdown() {
        let (scope, recorder) = testing::scope::<()>(&EngineConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = scope.handle();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(scope.run(IdleConfig::default(), shutdown.clone()));

        handle
            .attach(Box::new(Echo {
                id: 5,
                log: log.clone(),
            }))
            .unwrap();
        handle
            .frame(Frame::Begin(Begin {
                header: Header {
                    stream_id: 1,
                    routed_id: 5,
                    ..Default::default()
                },
                affinity: 1,
                extension: None,
            }))
            .unwrap();

        while recorder.len() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert!(handle.detach(5).is_err(), "scope has stopped");
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("detach"));
    }
}

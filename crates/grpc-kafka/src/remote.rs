use crate::ext::{Extension, GrpcEx, KafkaDataEx, KafkaEx};
use crate::helper::{reply_headers, HeaderHelper};
use crate::options::{CorrelationHeaders, RemoteRoute, RemoteServerOptions};
use crate::{Context, Frame, STATUS_ABORTED, STATUS_INTERNAL, STATUS_OK};
use bridge_core::progress::PartitionOffset;
use bridge_core::queue::{Delivery, QueueBuffer, QueuedMessage};
use bridge_core::{
    Begin, Binding, CorrelationRegistry, Data, DataFlags, Half, Resolve, StreamError,
};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const INITIATE_SIGNAL: u64 = 1;
/// Error replies which may await the producer of errors at once.
const MAX_PENDING_ERRORS: usize = 1024;

const FETCH_KEY: u64 = 0;
const ERRORS_KEY: u64 = 1;

/// RemoteServerBinding serves requests of a Kafka topic by calling remote
/// gRPC servers, and produces their replies to the topic each request
/// names in its reply-to header.
///
/// Requests and replies are correlated by a correlation id header.
/// Messages of a correlation id are delivered to a GrpcClient which makes the
/// gRPC call. The first message of an id which isn't in flight begins a call
/// to the service and method named by its headers, and a tombstone ends the
/// call's requests. A message which can't be served is answered with
/// a tombstone of status "13" on the binding's own reply topic.
///
/// Fetched messages are committed once delivered in full,
/// or once answered as errors. Error replies which can't be produced
/// now wait for the producer of errors, and commit once produced.
pub struct RemoteServerBinding {
    binding_id: u64,
    options: RemoteServerOptions,
    routes: Box<dyn Resolve<RemoteRoute>>,
    initiate: Option<u64>,
    fetch: Option<Half>,
    errors: Option<Half>,
    clients: CorrelationRegistry<GrpcClient>,
    keys: HashMap<u64, Bytes>,
    queue: QueueBuffer,
    pending_errors: VecDeque<PendingError>,
    message: Option<Fetched>,
    next_key: u64,
}

struct PendingError {
    trace_id: u64,
    correlation_id: Bytes,
    partition: PartitionOffset,
}

/// The fetched message now being received, which may span fragments.
struct Fetched {
    helper: HeaderHelper,
    partition: PartitionOffset,
    deferred: u32,
    target: Target,
}

#[derive(Clone)]
enum Target {
    Client(Bytes),
    Errors,
    /// Answered by a pending error reply, which commits the message.
    Pending,
    Ignore,
}

impl RemoteServerBinding {
    pub fn new(
        binding_id: u64,
        options: RemoteServerOptions,
        routes: impl Resolve<RemoteRoute> + 'static,
    ) -> Self {
        Self {
            binding_id,
            options,
            routes: Box::new(routes),
            initiate: None,
            fetch: None,
            errors: None,
            clients: CorrelationRegistry::default(),
            keys: HashMap::new(),
            queue: QueueBuffer::default(),
            pending_errors: VecDeque::new(),
            message: None,
            next_key: ERRORS_KEY,
        }
    }

    /// Number of in-flight gRPC calls.
    pub fn clients(&self) -> usize {
        self.clients.len()
    }

    /// Is the fetch of requests open?
    pub fn is_fetching(&self) -> bool {
        self.fetch.is_some()
    }

    fn schedule_initiate(&mut self, cx: &mut Context<'_>, delay: Duration) {
        if let Some(timer_id) = self.initiate.take() {
            cx.cancel(timer_id);
        }
        self.initiate = Some(cx.schedule(delay, INITIATE_SIGNAL));
    }

    /// Open the fetch of requests, and the producer of errors,
    /// if they're not already open.
    #[tracing::instrument(level = "debug", skip_all, fields(binding_id = self.binding_id))]
    fn initiate(&mut self, cx: &mut Context<'_>) {
        let trace_id = cx.supply_trace_id();
        let kafka_id = self.options.kafka_id;

        if self.fetch.is_none() {
            let mut fetch = Half::connect(cx, FETCH_KEY, kafka_id, 0, 0);
            let _ = fetch.do_begin(
                cx,
                trace_id,
                Some(Extension::Kafka(KafkaEx::Fetch {
                    topic: self.options.topic.clone(),
                    partitions: vec![PartitionOffset::SENTINEL],
                    filters: Vec::new(),
                })),
            );
            self.fetch = Some(fetch);
            tracing::debug!(topic = %self.options.topic, "fetching requests");
        }
        if self.errors.is_none() {
            let mut errors = Half::connect(cx, ERRORS_KEY, kafka_id, 0, 0);
            let _ = errors.do_begin(
                cx,
                trace_id,
                Some(Extension::Kafka(KafkaEx::Produce {
                    topic: self.options.reply_to.clone(),
                })),
            );
            self.errors = Some(errors);
        }
        self.flush_pending_errors(cx);
    }

    fn on_fetch_frame(&mut self, cx: &mut Context<'_>, frame: Frame) -> Result<(), StreamError> {
        let Some(fetch) = self.fetch.as_mut() else {
            return Ok(());
        };
        let stream_id = frame.stream_id();
        let trace_id = frame.header().trace_id;

        if stream_id == fetch.inbound_id() {
            match frame {
                Frame::Begin(begin) => {
                    fetch.on_begin(&begin)?;
                    let maximum = cx.pool().slot_capacity() as u32;
                    let acknowledge = fetch.inbound().sequence();
                    fetch.do_window(cx, trace_id, acknowledge, maximum, 0, 0);
                }
                Frame::Data(data) => {
                    fetch.on_data(&data)?;
                    self.on_fetch_data(cx, data)?;

                    // Messages are consumed as they're received,
                    // whether delivered or queued.
                    if let Some(fetch) = self.fetch.as_mut() {
                        let acknowledge = fetch.inbound().sequence();
                        let maximum = fetch.inbound().maximum();
                        fetch.do_window(cx, trace_id, acknowledge, maximum, 0, 0);
                    }
                }
                Frame::Flush(flush) => fetch.on_flush(&flush)?,
                Frame::End(end) => {
                    fetch.on_end(&end)?;
                    self.on_fetch_closed(cx, trace_id);
                }
                Frame::Abort(abort) => {
                    let _ = fetch.on_abort(&abort);
                    self.on_fetch_closed(cx, trace_id);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka fetch")),
            }
        } else if stream_id == fetch.outbound_id() {
            match frame {
                Frame::Window(window) => fetch.on_window(&window)?,
                Frame::Reset(reset) => {
                    fetch.on_reset(&reset);
                    self.on_fetch_closed(cx, trace_id);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka fetch")),
            }
        }
        Ok(())
    }

    fn on_fetch_closed(&mut self, cx: &mut Context<'_>, trace_id: u64) {
        if let Some(mut fetch) = self.fetch.take() {
            fetch.cleanup(cx, trace_id);
            fetch.release(cx);
        }
        self.message = None;

        tracing::debug!(interval = ?self.options.initiate_interval, "fetch of requests closed");
        self.schedule_initiate(cx, self.options.initiate_interval);
    }

    fn on_errors_frame(&mut self, cx: &mut Context<'_>, frame: Frame) -> Result<(), StreamError> {
        let Some(errors) = self.errors.as_mut() else {
            return Ok(());
        };
        let trace_id = frame.header().trace_id;

        match frame {
            Frame::Window(window) => {
                errors.on_window(&window)?;
                self.flush_pending_errors(cx);
            }
            Frame::Begin(begin) => errors.on_begin(&begin)?,
            Frame::End(end) => errors.on_end(&end)?,
            Frame::Reset(_) | Frame::Abort(_) => self.on_errors_closed(cx, trace_id),
            _ => return Err(StreamError::Malformed("unexpected frame of Kafka produce")),
        }
        Ok(())
    }

    fn on_errors_closed(&mut self, cx: &mut Context<'_>, trace_id: u64) {
        if let Some(mut errors) = self.errors.take() {
            errors.cleanup(cx, trace_id);
            errors.release(cx);
        }
        self.schedule_initiate(cx, self.options.initiate_interval);
    }

    fn on_fetch_data(&mut self, cx: &mut Context<'_>, data: Data<Extension>) -> Result<(), StreamError> {
        let trace_id = data.header.trace_id;

        if data.flags.is_init() {
            let ex = data
                .extension
                .as_ref()
                .and_then(Extension::kafka_data)
                .cloned()
                .unwrap_or_default();
            let helper = HeaderHelper::visit(&ex, &self.options.options.correlation);
            let target = self.target(cx, &data, &helper);

            self.message = Some(Fetched {
                helper,
                partition: ex.partition,
                deferred: ex.deferred,
                target,
            });
        }
        let Some(message) = self.message.as_ref() else {
            tracing::debug!(stream_id = data.header.stream_id, "ignoring fragment of unknown message");
            return Ok(());
        };
        let (partition, deferred) = (message.partition, message.deferred);
        let target = message.target.clone();
        let fin = data.flags.is_fin();

        let committed = match target {
            Target::Client(correlation_id) => {
                self.deliver(cx, correlation_id, deferred, partition, data)
            }
            Target::Errors if data.flags.is_init() => {
                let correlation_id = message.helper.correlation_id.clone();
                let answered = self.reply_error(cx, trace_id, correlation_id, partition);

                if !answered {
                    if let Some(message) = self.message.as_mut() {
                        message.target = Target::Pending;
                    }
                }
                answered
            }
            Target::Errors | Target::Ignore => true,
            Target::Pending => false,
        };

        if fin {
            self.message = None;

            if committed {
                self.commit(cx, trace_id, partition);
            }
        }
        Ok(())
    }

    /// Determine the target of a new message, beginning a call if required.
    fn target(&mut self, cx: &mut Context<'_>, data: &Data<Extension>, helper: &HeaderHelper) -> Target {
        let Some(correlation_id) = helper.correlation_id.clone() else {
            return Target::Errors;
        };
        if self.clients.lookup(&correlation_id).is_some() {
            return Target::Client(correlation_id);
        } else if data.payload.is_none() {
            // End of requests of a call which is no longer in flight.
            return Target::Ignore;
        } else if !helper.resolved() {
            return Target::Errors;
        }

        let Some(routed) = self
            .routes
            .resolve(data.header.authorization, &helper.attributes())
        else {
            tracing::debug!(attributes = ?helper.attributes(), "no route for request");
            return Target::Errors;
        };

        self.next_key += 1;
        let key = self.next_key;

        let client = GrpcClient::new(
            cx,
            key,
            correlation_id.clone(),
            &routed,
            helper,
            self.options.kafka_id,
            helper.reply_to.as_deref().unwrap_or(&self.options.reply_to),
            data.header.trace_id,
            data.header.authorization,
        );
        self.keys.insert(key, correlation_id.clone());
        self.clients.insert(correlation_id.clone(), client);

        Target::Client(correlation_id)
    }

    /// Deliver a fragment of a message to the GrpcClient of `correlation_id`,
    /// queueing whatever can't be delivered now. Returns true if the message
    /// was delivered through this fragment, and may be committed.
    fn deliver(
        &mut self,
        cx: &mut Context<'_>,
        correlation_id: Bytes,
        deferred: u32,
        partition: PartitionOffset,
        data: Data<Extension>,
    ) -> bool {
        let Some(client) = self.clients.lookup_mut(&correlation_id) else {
            return true;
        };
        let trace_id = data.header.trace_id;

        let queued = QueuedMessage {
            correlation_id: correlation_id.clone(),
            identifiers: Bytes::new(),
            metadata: Bytes::new(),
            trace_id,
            authorization: data.header.authorization,
            progress: partition,
            deferred,
            flags: data.flags,
            reserved: data.reserved,
            payload: data.payload,
        };

        // A backlog of the correlation id is delivered first.
        let delivery = if self.queue.contains(&correlation_id) {
            Ok(Delivery::Blocked)
        } else {
            client.deliver(cx, trace_id, queued.flags, deferred, queued.payload.as_ref())
        };

        let remainder = match delivery {
            Ok(Delivery::Full) => return true,
            Ok(Delivery::Blocked) => queued,
            Ok(Delivery::Partial(n)) => QueuedMessage {
                flags: queued.flags.without_init(),
                payload: queued.payload.map(|p| p.slice(n..)),
                ..queued
            },
            Err(error) => {
                tracing::warn!(%error, "failed to deliver request");
                self.fail_client(cx, trace_id, &correlation_id, STATUS_INTERNAL);
                return true;
            }
        };

        if let Err(error) = self.queue_grpc_message(cx, &remainder) {
            tracing::warn!(%error, "failed to queue request");
            self.fail_client(cx, trace_id, &correlation_id, STATUS_INTERNAL);
            return true;
        }
        false
    }

    fn queue_grpc_message(
        &mut self,
        cx: &mut Context<'_>,
        message: &QueuedMessage,
    ) -> Result<(), StreamError> {
        self.queue.enqueue(cx.pool(), message)?;

        tracing::trace!(
            correlation_id = %String::from_utf8_lossy(&message.correlation_id),
            length = message.length(),
            "queued request"
        );
        Ok(())
    }

    /// Deliver queued messages of `correlation_id` to its GrpcClient,
    /// as its window allows.
    fn flush_grpc_messages_if_buffered(&mut self, cx: &mut Context<'_>, correlation_id: &Bytes) {
        if !self.queue.contains(correlation_id) {
            return;
        }
        let Some(client) = self.clients.lookup_mut(correlation_id) else {
            return;
        };
        let mut commits = Vec::new();
        let mut failure = None;

        self.queue.flush_matching(correlation_id, |message| {
            let delivery = client.deliver(
                cx,
                message.trace_id,
                message.flags,
                message.deferred,
                message.payload.as_ref(),
            );
            match delivery {
                Ok(Delivery::Full) => {
                    if message.flags.is_fin() {
                        commits.push((message.trace_id, message.progress));
                    }
                    Delivery::Full
                }
                Ok(delivery) => delivery,
                Err(error) => {
                    // A failed call is answered with an error status,
                    // which completes its message.
                    let progress = message.flags.is_fin().then_some(message.progress);
                    failure = Some((message.trace_id, progress, error));
                    Delivery::Blocked
                }
            }
        });
        self.queue.release_if_empty(cx.pool());

        for (trace_id, partition) in commits {
            self.commit(cx, trace_id, partition);
        }
        if let Some((trace_id, progress, error)) = failure {
            tracing::warn!(%error, "failed to deliver queued request");
            self.fail_client(cx, trace_id, correlation_id, STATUS_INTERNAL);

            if let Some(partition) = progress {
                self.commit(cx, trace_id, partition);
            }
        }
    }

    fn commit(&mut self, cx: &mut Context<'_>, trace_id: u64, partition: PartitionOffset) {
        let Some(fetch) = self.fetch.as_mut() else {
            return;
        };
        let partition = PartitionOffset::new(partition.partition_id, partition.offset + 1);

        if let Err(error) = fetch.do_flush(
            cx,
            trace_id,
            0,
            Some(Extension::Kafka(KafkaEx::Commit { partition })),
        ) {
            tracing::debug!(%error, "failed to commit request");
        }
    }

    /// Answer a message which can't be served with a tombstone of status "13".
    /// Returns true if the message is answered (or can never be), and false
    /// if its reply must first wait for the producer of errors.
    fn reply_error(
        &mut self,
        cx: &mut Context<'_>,
        trace_id: u64,
        correlation_id: Option<Bytes>,
        partition: PartitionOffset,
    ) -> bool {
        let Some(correlation_id) = correlation_id else {
            tracing::warn!("discarding request without a correlation id");
            return true;
        };
        tracing::debug!(
            correlation_id = %String::from_utf8_lossy(&correlation_id),
            "replying to unserved request"
        );

        if self.pending_errors.is_empty() && self.produce_error(cx, trace_id, &correlation_id) {
            return true;
        }
        if self.pending_errors.len() >= MAX_PENDING_ERRORS {
            tracing::warn!(
                correlation_id = %String::from_utf8_lossy(&correlation_id),
                pending = self.pending_errors.len(),
                "discarding error reply, as too many are pending"
            );
            return true;
        }
        self.pending_errors.push_back(PendingError {
            trace_id,
            correlation_id,
            partition,
        });
        false
    }

    /// Produce an error tombstone for `correlation_id`, if the producer
    /// of errors is open and its window allows.
    fn produce_error(&mut self, cx: &mut Context<'_>, trace_id: u64, correlation_id: &Bytes) -> bool {
        let Some(errors) = self.errors.as_mut() else {
            return false;
        };
        let extension = Extension::Kafka(KafkaEx::Data(KafkaDataEx {
            headers: reply_headers(&self.options.options.correlation, correlation_id, Some(STATUS_INTERNAL)),
            ..Default::default()
        }));
        let reserved = errors.outbound().padding();

        match errors.do_data(cx, trace_id, DataFlags::COMPLETE, reserved, None, Some(extension)) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(%error, "deferring error reply");
                false
            }
        }
    }

    /// Produce pending error replies in order, committing each message
    /// they answer.
    fn flush_pending_errors(&mut self, cx: &mut Context<'_>) {
        while let Some(pending) = self.pending_errors.front() {
            let (trace_id, partition) = (pending.trace_id, pending.partition);
            let correlation_id = pending.correlation_id.clone();

            if !self.produce_error(cx, trace_id, &correlation_id) {
                break;
            }
            self.pending_errors.pop_front();
            self.commit(cx, trace_id, partition);
        }
    }

    fn fail_client(&mut self, cx: &mut Context<'_>, trace_id: u64, correlation_id: &Bytes, status: &str) {
        if let Some(client) = self.clients.lookup_mut(correlation_id) {
            client.fail(cx, trace_id, &self.options.options.correlation, status);
        }
        self.remove_client_if_closed(cx, correlation_id);
    }

    fn remove_client_if_closed(&mut self, cx: &mut Context<'_>, correlation_id: &Bytes) {
        let Some(mut client) = self
            .clients
            .remove_if_closed(correlation_id, GrpcClient::is_closed)
        else {
            return;
        };
        client.release(cx);
        self.keys.remove(&client.key);

        self.queue.discard_matching(correlation_id);
        self.queue.release_if_empty(cx.pool());

        tracing::debug!(
            correlation_id = %String::from_utf8_lossy(correlation_id),
            "gRPC call closed"
        );
    }
}

impl Binding<Extension> for RemoteServerBinding {
    fn id(&self) -> u64 {
        self.binding_id
    }

    #[tracing::instrument(level = "debug", skip_all, fields(binding_id = self.binding_id))]
    fn attach(&mut self, cx: &mut Context<'_>) {
        self.schedule_initiate(cx, Duration::ZERO);
    }

    fn new_stream(&mut self, _cx: &mut Context<'_>, _begin: Begin<Extension>) -> bool {
        false
    }

    fn on_frame(&mut self, cx: &mut Context<'_>, key: u64, frame: Frame) {
        let trace_id = frame.header().trace_id;

        match key {
            FETCH_KEY => {
                if let Err(error) = self.on_fetch_frame(cx, frame) {
                    tracing::warn!(%error, "resetting fetch of requests");
                    self.on_fetch_closed(cx, trace_id);
                }
            }
            ERRORS_KEY => {
                if let Err(error) = self.on_errors_frame(cx, frame) {
                    tracing::warn!(%error, "resetting producer of errors");
                    self.on_errors_closed(cx, trace_id);
                }
            }
            key => {
                let Some(correlation_id) = self.keys.get(&key).cloned() else {
                    return;
                };
                let Some(client) = self.clients.lookup_mut(&correlation_id) else {
                    return;
                };

                match client.on_frame(cx, &self.options.options.correlation, frame) {
                    Ok(true) => self.flush_grpc_messages_if_buffered(cx, &correlation_id),
                    Ok(false) => (),
                    Err(error) => {
                        tracing::warn!(%error, key, "resetting gRPC call");
                        client.fail(cx, trace_id, &self.options.options.correlation, STATUS_INTERNAL);
                    }
                }
                self.remove_client_if_closed(cx, &correlation_id);
            }
        }
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, signal_id: u64) {
        if signal_id == INITIATE_SIGNAL {
            self.initiate = None;
            self.initiate(cx);
        }
    }

    fn on_budget_flush(&mut self, cx: &mut Context<'_>, key: u64, _stream_id: u64, _trace_id: u64) {
        if let Some(correlation_id) = self.keys.get(&key).cloned() {
            self.flush_grpc_messages_if_buffered(cx, &correlation_id);
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(binding_id = self.binding_id))]
    fn detach(&mut self, cx: &mut Context<'_>) {
        if let Some(timer_id) = self.initiate.take() {
            cx.cancel(timer_id);
        }
        let trace_id = cx.supply_trace_id();

        for (_, mut client) in self.clients.drain() {
            client.fail(cx, trace_id, &self.options.options.correlation, STATUS_ABORTED);
            client.release(cx);
        }
        self.keys.clear();
        self.queue.clear(cx.pool());
        self.pending_errors.clear();
        self.message = None;

        for mut half in [self.fetch.take(), self.errors.take()].into_iter().flatten() {
            half.cleanup(cx, trace_id);
            half.release(cx);
        }
    }
}

/// GrpcClient is the gRPC call of a correlation id. It streams request
/// messages of the id into the call, and produces the call's replies,
/// and finally a tombstone bearing its status, to the reply topic.
pub struct GrpcClient {
    key: u64,
    correlation_id: Bytes,
    grpc: Half,
    producer: Half,
}

impl GrpcClient {
    #[allow(clippy::too_many_arguments)]
    fn new(
        cx: &mut Context<'_>,
        key: u64,
        correlation_id: Bytes,
        routed: &RemoteRoute,
        helper: &HeaderHelper,
        kafka_id: u64,
        reply_to: &str,
        trace_id: u64,
        authorization: u64,
    ) -> Self {
        let mut grpc = Half::connect(cx, key, routed.route.id, authorization, 0);
        let mut producer = Half::connect(cx, key, kafka_id, authorization, 0);

        let _ = grpc.do_begin(
            cx,
            trace_id,
            Some(Extension::Grpc(GrpcEx::Begin {
                scheme: routed.with.scheme.clone(),
                authority: routed.with.authority.clone(),
                service: helper.service.clone().unwrap_or_default(),
                method: helper.method.clone().unwrap_or_default(),
                metadata: Vec::new(),
            })),
        );
        let _ = producer.do_begin(
            cx,
            trace_id,
            Some(Extension::Kafka(KafkaEx::Produce {
                topic: reply_to.to_string(),
            })),
        );
        tracing::debug!(
            key,
            correlation_id = %String::from_utf8_lossy(&correlation_id),
            reply_to,
            "calling gRPC server"
        );

        Self {
            key,
            correlation_id,
            grpc,
            producer,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.grpc.is_closed() && self.producer.is_closed()
    }

    /// Deliver a fragment of a request message into the gRPC call.
    /// Returns the number of leading payload bytes which were delivered,
    /// as bounded by the call's window and budget. If fewer than all bytes
    /// are delivered, the fragment is sent without its FIN flag.
    pub fn on_kafka_data(
        &mut self,
        cx: &mut Context<'_>,
        trace_id: u64,
        flags: DataFlags,
        deferred: u32,
        payload: &Bytes,
    ) -> Result<u32, StreamError> {
        Ok(self
            .send(cx, trace_id, flags, deferred, payload)?
            .unwrap_or_default())
    }

    /// Send a leading portion of `payload`, returning its length,
    /// or None if nothing could be sent.
    fn send(
        &mut self,
        cx: &mut Context<'_>,
        trace_id: u64,
        flags: DataFlags,
        deferred: u32,
        payload: &Bytes,
    ) -> Result<Option<u32>, StreamError> {
        if !self.grpc.is_outbound_open() {
            return Ok(None);
        }
        let padding = self.grpc.outbound().padding();
        let length = u32::try_from(payload.len())
            .map_err(|_| StreamError::Malformed("request message length"))?;

        let (Some(minimum), Some(maximum)) = (
            padding.checked_add(length.min(1)),
            padding.checked_add(length),
        ) else {
            return Err(StreamError::Malformed("window padding of gRPC call"));
        };

        let claimed = self.grpc.claim(cx, minimum, maximum, deferred)?;
        if claimed < minimum {
            return Ok(None);
        }
        let delivered = claimed - padding;

        let flags = if delivered < length {
            flags.without_fin()
        } else {
            flags
        };
        let extension = (flags.is_init() && deferred != 0)
            .then(|| Extension::Grpc(GrpcEx::Data { deferred }));

        self.grpc.do_data(
            cx,
            trace_id,
            flags,
            claimed,
            Some(payload.slice(..delivered as usize)),
            extension,
        )?;
        Ok(Some(delivered))
    }

    /// Deliver a fragment of a request message, where an absent payload
    /// is a tombstone which ends the call's requests.
    fn deliver(
        &mut self,
        cx: &mut Context<'_>,
        trace_id: u64,
        flags: DataFlags,
        deferred: u32,
        payload: Option<&Bytes>,
    ) -> Result<Delivery, StreamError> {
        let Some(payload) = payload else {
            self.grpc.do_end(cx, trace_id, None);
            return Ok(Delivery::Full);
        };
        if self.grpc.state().is(self.grpc.outbound_dir(), bridge_core::Phase::Closing) {
            tracing::debug!(length = payload.len(), "discarding request of a closed gRPC call");
            return Ok(Delivery::Full);
        }

        // An empty message is sent only once the call's padding is claimed.
        if payload.is_empty() {
            return Ok(match self.send(cx, trace_id, flags, deferred, payload)? {
                Some(_) => Delivery::Full,
                None => Delivery::Blocked,
            });
        }

        Ok(match self.on_kafka_data(cx, trace_id, flags, deferred, payload)? as usize {
            0 => Delivery::Blocked,
            delivered if delivered == payload.len() => Delivery::Full,
            delivered => Delivery::Partial(delivered),
        })
    }

    /// Handle a frame of the call or its reply producer. Returns true if the
    /// gRPC window was updated, and queued requests should be flushed.
    fn on_frame(
        &mut self,
        cx: &mut Context<'_>,
        names: &CorrelationHeaders,
        frame: Frame,
    ) -> Result<bool, StreamError> {
        let stream_id = frame.stream_id();
        let trace_id = frame.header().trace_id;

        if stream_id == self.grpc.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    self.grpc.on_window(&window)?;
                    return Ok(true);
                }
                Frame::Reset(reset) => {
                    self.grpc.on_reset(&reset);
                    let status = reset
                        .extension
                        .as_ref()
                        .and_then(Extension::grpc_status)
                        .unwrap_or(STATUS_ABORTED)
                        .to_string();
                    self.complete(cx, trace_id, names, &status);
                    self.grpc.cleanup(cx, trace_id);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of gRPC call")),
            }
        } else if stream_id == self.grpc.inbound_id() {
            match frame {
                Frame::Begin(begin) => {
                    self.grpc.on_begin(&begin)?;
                    self.grpc
                        .mirror_window(cx, trace_id, self.producer.outbound(), 0);
                }
                Frame::Data(data) => {
                    self.grpc.on_data(&data)?;

                    let extension = data.flags.is_init().then(|| {
                        Extension::Kafka(KafkaEx::Data(KafkaDataEx {
                            headers: reply_headers(names, &self.correlation_id, None),
                            ..Default::default()
                        }))
                    });
                    self.producer.do_data(
                        cx,
                        trace_id,
                        data.flags,
                        data.reserved,
                        data.payload,
                        extension,
                    )?;
                }
                Frame::End(end) => {
                    self.grpc.on_end(&end)?;
                    self.complete(cx, trace_id, names, STATUS_OK);
                }
                Frame::Abort(abort) => {
                    let _ = self.grpc.on_abort(&abort);
                    let status = abort
                        .extension
                        .as_ref()
                        .and_then(Extension::grpc_status)
                        .unwrap_or(STATUS_ABORTED)
                        .to_string();
                    self.complete(cx, trace_id, names, &status);
                    self.grpc.cleanup(cx, trace_id);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of gRPC call")),
            }
        } else if stream_id == self.producer.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    self.producer.on_window(&window)?;
                    self.grpc
                        .mirror_window(cx, trace_id, self.producer.outbound(), 0);
                }
                Frame::Reset(reset) => {
                    self.producer.on_reset(&reset);
                    self.fail(cx, trace_id, names, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka produce")),
            }
        } else if stream_id == self.producer.inbound_id() {
            match frame {
                Frame::Begin(begin) => self.producer.on_begin(&begin)?,
                Frame::End(end) => self.producer.on_end(&end)?,
                Frame::Abort(abort) => {
                    let _ = self.producer.on_abort(&abort);
                    self.fail(cx, trace_id, names, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka produce")),
            }
        }
        Ok(false)
    }

    /// Produce the reply tombstone of the call with `status`, and end the producer.
    fn complete(&mut self, cx: &mut Context<'_>, trace_id: u64, names: &CorrelationHeaders, status: &str) {
        if self.producer.is_outbound_open() {
            let extension = Extension::Kafka(KafkaEx::Data(KafkaDataEx {
                headers: reply_headers(names, &self.correlation_id, Some(status)),
                ..Default::default()
            }));
            let reserved = self.producer.outbound().padding();

            if let Err(error) =
                self.producer
                    .do_data(cx, trace_id, DataFlags::COMPLETE, reserved, None, Some(extension))
            {
                tracing::debug!(%error, "failed to produce reply tombstone");
            }
        }
        self.producer.do_end(cx, trace_id, None);
    }

    /// Abort the call with `status`, and close its producer.
    fn fail(&mut self, cx: &mut Context<'_>, trace_id: u64, names: &CorrelationHeaders, status: &str) {
        self.complete(cx, trace_id, names, status);
        self.producer.do_reset(cx, trace_id, None);
        self.grpc.do_abort(cx, trace_id, crate::grpc_abort(status));
        self.grpc.do_reset(cx, trace_id, crate::grpc_reset(status));
    }

    fn release(&mut self, cx: &mut Context<'_>) {
        self.grpc.release(cx);
        self.producer.release(cx);
    }
}

use crate::ext::{Extension, GrpcEx, KafkaEx};
use crate::options::{FetchRoute, GrpcKafkaOptions};
use crate::{Context, Frame, STATUS_ABORTED, STATUS_INTERNAL};
use bridge_core::progress::{self, PartitionOffset};
use bridge_core::{Begin, Binding, Half, Resolve, StreamError};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};

/// Least number of partitions for which a progress token is accounted
/// in the padding of fetched messages.
const PROGRESS_PARTITIONS: usize = 16;

/// FetchBinding serves each gRPC call by fetching messages of a Kafka topic,
/// which are streamed to the caller as gRPC messages.
///
/// Each message is extended with a trailing protobuf field holding a
/// progress token of the fetch. A caller which re-connects with the last
/// token it received, as gRPC metadata, resumes its fetch after that message.
///
/// The fetch's window is padded for a token of twice the partitions seen
/// so far, so a message of a partition not yet seen always fits. The window
/// is re-granted with more padding as partitions are discovered.
pub struct FetchBinding {
    binding_id: u64,
    options: GrpcKafkaOptions,
    routes: Box<dyn Resolve<FetchRoute>>,
    proxies: HashMap<u64, FetchProxy>,
    next_key: u64,
}

struct FetchProxy {
    server: Half,
    delegate: Half,
    /// Next offset to fetch of each partition.
    progress: BTreeMap<i32, i64>,
    /// Partition offset of the message now being fragmented, if any.
    fragment: Option<PartitionOffset>,
    /// Padding of the fetch's window for the progress token.
    overhead: u32,
}

impl FetchBinding {
    pub fn new(
        binding_id: u64,
        options: GrpcKafkaOptions,
        routes: impl Resolve<FetchRoute> + 'static,
    ) -> Self {
        Self {
            binding_id,
            options,
            routes: Box::new(routes),
            proxies: HashMap::new(),
            next_key: 0,
        }
    }

    /// Least padding added to each message for its progress token.
    pub fn overhead(&self) -> u32 {
        overhead(self.options.reliability.field, 0)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl Binding<Extension> for FetchBinding {
    fn id(&self) -> u64 {
        self.binding_id
    }

    fn new_stream(&mut self, cx: &mut Context<'_>, begin: Begin<Extension>) -> bool {
        let Some(ex) = begin.extension.as_ref().and_then(Extension::as_grpc) else {
            tracing::debug!(stream_id = begin.header.stream_id, "refusing begin which isn't gRPC");
            return false;
        };
        let GrpcEx::Begin { service, method, .. } = ex else {
            return false;
        };
        let attributes = crate::call_attributes(service, method);

        let Some(routed) =
            self.routes.resolve(begin.header.authorization, &attributes)
        else {
            tracing::debug!(?attributes, "no route for gRPC fetch");
            return false;
        };

        let partitions = match ex
            .metadata(&self.options.reliability.metadata)
            .and_then(|token| std::str::from_utf8(token).ok())
        {
            Some(token) => progress::decode(token),
            None => vec![PartitionOffset::SENTINEL],
        };

        self.next_key += 1;
        let key = self.next_key;

        let server = match Half::accept(cx, key, &begin) {
            Ok(server) => server,
            Err(error) => {
                tracing::warn!(%error, stream_id = begin.header.stream_id, "refusing malformed begin");
                return false;
            }
        };
        let mut delegate = Half::connect(
            cx,
            key,
            routed.route.id,
            begin.header.authorization,
            begin.affinity,
        );

        let progress: BTreeMap<i32, i64> = partitions
            .iter()
            .filter(|p| p.partition_id >= 0)
            .map(|p| (p.partition_id, p.offset))
            .collect();
        let overhead = overhead(self.options.reliability.field, progress.len());

        let _ = delegate.do_begin(
            cx,
            begin.header.trace_id,
            Some(Extension::Kafka(KafkaEx::Fetch {
                topic: routed.with.topic.clone(),
                partitions,
                filters: routed.with.filters.clone(),
            })),
        );
        tracing::debug!(key, topic = %routed.with.topic, "fetching for gRPC call");

        self.proxies.insert(
            key,
            FetchProxy {
                server,
                delegate,
                progress,
                fragment: None,
                overhead,
            },
        );
        true
    }

    fn on_frame(&mut self, cx: &mut Context<'_>, key: u64, frame: Frame) {
        let Some(proxy) = self.proxies.get_mut(&key) else {
            return;
        };
        let trace_id = frame.header().trace_id;

        if let Err(error) = proxy.on_frame(cx, self.options.reliability.field, frame) {
            tracing::warn!(%error, key, "resetting gRPC fetch");
            proxy.fail(cx, trace_id, STATUS_INTERNAL);
        }

        if proxy.server.is_closed() && proxy.delegate.is_closed() {
            proxy.server.release(cx);
            proxy.delegate.release(cx);
            self.proxies.remove(&key);
            tracing::debug!(key, "gRPC fetch closed");
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(binding_id = self.binding_id))]
    fn detach(&mut self, cx: &mut Context<'_>) {
        for (_, mut proxy) in self.proxies.drain() {
            let trace_id = cx.supply_trace_id();
            proxy.fail(cx, trace_id, STATUS_ABORTED);
            proxy.server.release(cx);
            proxy.delegate.release(cx);
        }
    }
}

impl FetchProxy {
    fn on_frame(
        &mut self,
        cx: &mut Context<'_>,
        field: u32,
        frame: Frame,
    ) -> Result<(), StreamError> {
        let stream_id = frame.stream_id();
        let trace_id = frame.header().trace_id;

        if stream_id == self.server.inbound_id() {
            match frame {
                // Requests of the call are consumed.
                Frame::Data(data) => {
                    self.server.on_data(&data)?;
                    self.server
                        .mirror_window(cx, trace_id, self.delegate.outbound(), 0);
                }
                Frame::Flush(flush) => {
                    self.server.on_flush(&flush)?;
                    self.server
                        .mirror_window(cx, trace_id, self.delegate.outbound(), 0);
                }
                Frame::End(end) => {
                    self.server.on_end(&end)?;
                    self.delegate.do_end(cx, trace_id, None);
                }
                Frame::Abort(abort) => {
                    self.server.on_abort(&abort)?;
                    self.delegate.do_abort(cx, trace_id, None);
                    self.server.cleanup(cx, trace_id);
                    self.delegate.cleanup(cx, trace_id);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of gRPC call")),
            }
        } else if stream_id == self.server.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    self.server.on_window(&window)?;
                    self.delegate
                        .mirror_window(cx, trace_id, self.server.outbound(), self.overhead);
                }
                Frame::Reset(reset) => {
                    self.server.on_reset(&reset);
                    self.delegate.do_reset(cx, trace_id, None);
                    self.server.cleanup(cx, trace_id);
                    self.delegate.cleanup(cx, trace_id);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of gRPC call")),
            }
        } else if stream_id == self.delegate.inbound_id() {
            match frame {
                Frame::Begin(begin) => {
                    self.delegate.on_begin(&begin)?;
                    self.server.do_begin(cx, trace_id, None)?;
                }
                Frame::Data(data) => {
                    self.delegate.on_data(&data)?;

                    let length = data.length();
                    let ex = data.extension.as_ref().and_then(Extension::kafka_data);
                    if data.flags.is_init() {
                        self.fragment = ex.map(|ex| ex.partition);
                    }

                    let mut payload = data.payload;
                    let mut discovered = false;
                    if data.flags.is_fin() {
                        if let Some(partition) = self.fragment.take() {
                            discovered = self
                                .progress
                                .insert(partition.partition_id, partition.offset + 1)
                                .is_none();
                        }
                        let token = progress::encode(&self.partitions());
                        let trailer = progress_field(field, &token);

                        let mut buf = BytesMut::with_capacity(length + trailer.len());
                        if let Some(payload) = payload {
                            buf.extend_from_slice(&payload);
                        }
                        buf.extend_from_slice(&trailer);
                        payload = Some(buf.freeze());
                    }

                    let length = payload.as_ref().map(Bytes::len).unwrap_or_default();
                    let reserved = length as u32 + self.server.outbound().padding();
                    let extension = ex
                        .filter(|ex| ex.deferred != 0)
                        .map(|ex| Extension::Grpc(GrpcEx::Data { deferred: ex.deferred }));

                    self.server
                        .do_data(cx, trace_id, data.flags, reserved, payload, extension)?;

                    let overhead = overhead(field, self.progress.len());
                    if discovered && overhead > self.overhead {
                        tracing::debug!(
                            partitions = self.progress.len(),
                            overhead,
                            "growing padding for progress"
                        );
                        self.overhead = overhead;
                        self.delegate
                            .mirror_window(cx, trace_id, self.server.outbound(), overhead);
                    }
                }
                Frame::Flush(flush) => {
                    self.delegate.on_flush(&flush)?;
                }
                Frame::End(end) => {
                    self.delegate.on_end(&end)?;
                    self.server.do_end(cx, trace_id, None);
                }
                Frame::Abort(abort) => {
                    self.delegate.on_abort(&abort)?;
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka fetch")),
            }
        } else if stream_id == self.delegate.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    self.delegate.on_window(&window)?;
                    self.server
                        .mirror_window(cx, trace_id, self.delegate.outbound(), 0);
                }
                Frame::Reset(reset) => {
                    self.delegate.on_reset(&reset);
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka fetch")),
            }
        }
        Ok(())
    }

    /// Abort and reset the gRPC call with `status`, and close the fetch.
    fn fail(&mut self, cx: &mut Context<'_>, trace_id: u64, status: &str) {
        self.server.do_abort(cx, trace_id, crate::grpc_abort(status));
        self.server.do_reset(cx, trace_id, crate::grpc_reset(status));
        self.delegate.cleanup(cx, trace_id);
    }

    fn partitions(&self) -> Vec<PartitionOffset> {
        self.progress
            .iter()
            .map(|(&partition_id, &offset)| PartitionOffset::new(partition_id, offset))
            .collect()
    }
}

/// Padding of a progress field which covers twice `partitions`,
/// and no fewer than PROGRESS_PARTITIONS.
fn overhead(field: u32, partitions: usize) -> u32 {
    let partitions = (partitions * 2).max(PROGRESS_PARTITIONS);
    let token = progress::encode(&vec![PartitionOffset::default(); partitions]);
    progress_field(field, &token).len() as u32
}

/// Protobuf length-delimited field `field` holding `token`.
pub fn progress_field(field: u32, token: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(10 + token.len());
    put_varint(&mut buf, (u64::from(field) << 3) | 2);
    put_varint(&mut buf, token.len() as u64);
    buf.put_slice(token.as_bytes());
    buf.freeze()
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8(value as u8 | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

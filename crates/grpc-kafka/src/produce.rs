use crate::ext::{Extension, GrpcEx, KafkaDataEx, KafkaEx, KafkaFilter, KafkaHeader};
use crate::helper::{reply_headers, HeaderHelper};
use crate::options::{CorrelationHeaders, GrpcKafkaOptions, ProduceRoute};
use crate::{Context, Frame, STATUS_ABORTED, STATUS_INTERNAL, STATUS_OK};
use bridge_core::progress::{PartitionOffset, LIVE};
use bridge_core::{Begin, Binding, DataFlags, Half, Resolve, StreamError};
use bytes::Bytes;
use std::collections::HashMap;

/// ProduceBinding serves each gRPC call by producing its request messages
/// to a Kafka topic, under a correlation id which is unique to the call.
/// Replies bearing that correlation id are fetched from a reply topic,
/// and are streamed back to the caller until a reply tombstone
/// completes the call with its status.
pub struct ProduceBinding {
    binding_id: u64,
    options: GrpcKafkaOptions,
    routes: Box<dyn Resolve<ProduceRoute>>,
    proxies: HashMap<u64, ProduceProxy>,
    next_key: u64,
}

struct ProduceProxy {
    correlation_id: Bytes,
    service: String,
    method: String,
    reply_to: String,
    server: Half,
    producer: Half,
    replies: Half,
}

impl ProduceBinding {
    pub fn new(
        binding_id: u64,
        options: GrpcKafkaOptions,
        routes: impl Resolve<ProduceRoute> + 'static,
    ) -> Self {
        Self {
            binding_id,
            options,
            routes: Box::new(routes),
            proxies: HashMap::new(),
            next_key: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl Binding<Extension> for ProduceBinding {
    fn id(&self) -> u64 {
        self.binding_id
    }

    fn new_stream(&mut self, cx: &mut Context<'_>, begin: Begin<Extension>) -> bool {
        let Some(GrpcEx::Begin { service, method, .. }) =
            begin.extension.as_ref().and_then(Extension::as_grpc)
        else {
            tracing::debug!(stream_id = begin.header.stream_id, "refusing begin which isn't gRPC");
            return false;
        };
        let attributes = crate::call_attributes(service, method);

        let Some(routed) =
            self.routes.resolve(begin.header.authorization, &attributes)
        else {
            tracing::debug!(?attributes, "no route for gRPC produce");
            return false;
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
        let Begin {
            header, affinity, ..
        } = begin;

        let mut producer = Half::connect(cx, key, routed.route.id, header.authorization, affinity);
        let mut replies = Half::connect(cx, key, routed.route.id, header.authorization, affinity);

        let correlation_id = Bytes::from(uuid::Uuid::new_v4().to_string());
        let names = &self.options.correlation;

        let _ = producer.do_begin(
            cx,
            header.trace_id,
            Some(Extension::Kafka(KafkaEx::Produce {
                topic: routed.with.topic.clone(),
            })),
        );
        let _ = replies.do_begin(
            cx,
            header.trace_id,
            Some(Extension::Kafka(KafkaEx::Fetch {
                topic: routed.with.reply_to.clone(),
                partitions: vec![PartitionOffset::new(-1, LIVE)],
                filters: vec![KafkaFilter::Header {
                    name: names.correlation_id.clone(),
                    value: String::from_utf8_lossy(&correlation_id).into_owned(),
                }],
            })),
        );
        tracing::debug!(
            key,
            topic = %routed.with.topic,
            reply_to = %routed.with.reply_to,
            correlation_id = %String::from_utf8_lossy(&correlation_id),
            "producing for gRPC call"
        );

        self.proxies.insert(
            key,
            ProduceProxy {
                correlation_id,
                service: service.clone(),
                method: method.clone(),
                reply_to: routed.with.reply_to.clone(),
                server,
                producer,
                replies,
            },
        );
        true
    }

    fn on_frame(&mut self, cx: &mut Context<'_>, key: u64, frame: Frame) {
        let Some(proxy) = self.proxies.get_mut(&key) else {
            return;
        };
        let trace_id = frame.header().trace_id;

        if let Err(error) = proxy.on_frame(cx, &self.options.correlation, frame) {
            tracing::warn!(%error, key, "resetting gRPC produce");
            proxy.fail(cx, trace_id, STATUS_INTERNAL);
        }

        // Released only once the call and both delegates are closed.
        if proxy.server.is_closed() && proxy.producer.is_closed() && proxy.replies.is_closed() {
            proxy.server.release(cx);
            proxy.producer.release(cx);
            proxy.replies.release(cx);
            self.proxies.remove(&key);
            tracing::debug!(key, "gRPC produce closed");
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(binding_id = self.binding_id))]
    fn detach(&mut self, cx: &mut Context<'_>) {
        for (_, mut proxy) in self.proxies.drain() {
            let trace_id = cx.supply_trace_id();
            proxy.fail(cx, trace_id, STATUS_ABORTED);
            proxy.server.release(cx);
            proxy.producer.release(cx);
            proxy.replies.release(cx);
        }
    }
}

impl ProduceProxy {
    fn on_frame(
        &mut self,
        cx: &mut Context<'_>,
        names: &CorrelationHeaders,
        frame: Frame,
    ) -> Result<(), StreamError> {
        let stream_id = frame.stream_id();
        let trace_id = frame.header().trace_id;

        if stream_id == self.server.inbound_id() {
            match frame {
                Frame::Data(data) => {
                    self.server.on_data(&data)?;

                    let extension = data.flags.is_init().then(|| self.request_ex(names));
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
                    self.server.on_end(&end)?;

                    let tombstone = self.request_ex(names);
                    let reserved = self.producer.outbound().padding();
                    self.producer.do_data(
                        cx,
                        trace_id,
                        DataFlags::COMPLETE,
                        reserved,
                        None,
                        Some(tombstone),
                    )?;
                    self.producer.do_end(cx, trace_id, None);
                }
                Frame::Abort(abort) => {
                    self.server.on_abort(&abort)?;
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of gRPC call")),
            }
        } else if stream_id == self.server.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    self.server.on_window(&window)?;
                    self.replies
                        .mirror_window(cx, trace_id, self.server.outbound(), 0);
                }
                Frame::Reset(reset) => {
                    self.server.on_reset(&reset);
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of gRPC call")),
            }
        } else if stream_id == self.producer.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    self.producer.on_window(&window)?;
                    self.server
                        .mirror_window(cx, trace_id, self.producer.outbound(), 0);
                }
                Frame::Reset(reset) => {
                    self.producer.on_reset(&reset);
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka produce")),
            }
        } else if stream_id == self.producer.inbound_id() {
            match frame {
                Frame::Begin(begin) => self.producer.on_begin(&begin)?,
                Frame::End(end) => self.producer.on_end(&end)?,
                Frame::Abort(abort) => {
                    self.producer.on_abort(&abort)?;
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka produce")),
            }
        } else if stream_id == self.replies.outbound_id() {
            match frame {
                Frame::Window(window) => self.replies.on_window(&window)?,
                Frame::Reset(reset) => {
                    self.replies.on_reset(&reset);
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka fetch")),
            }
        } else if stream_id == self.replies.inbound_id() {
            match frame {
                Frame::Begin(begin) => {
                    self.replies.on_begin(&begin)?;
                    self.server.do_begin(cx, trace_id, None)?;
                }
                Frame::Data(data) if data.payload.is_none() => {
                    self.replies.on_data(&data)?;

                    let status = data
                        .extension
                        .as_ref()
                        .and_then(Extension::kafka_data)
                        .and_then(|ex| HeaderHelper::visit(ex, names).status)
                        .unwrap_or_else(|| STATUS_OK.to_string());

                    if status == STATUS_OK {
                        self.server.do_end(cx, trace_id, None);
                    } else {
                        self.server.do_abort(cx, trace_id, crate::grpc_abort(&status));
                        self.server.do_reset(cx, trace_id, crate::grpc_reset(&status));
                        // Requests of a failed call are no longer produced.
                        self.producer.cleanup(cx, trace_id);
                    }
                    // The call is complete: stop fetching its replies.
                    self.replies.do_end(cx, trace_id, None);
                    self.replies.do_reset(cx, trace_id, None);
                }
                Frame::Data(data) => {
                    self.replies.on_data(&data)?;
                    self.server.do_data(
                        cx,
                        trace_id,
                        data.flags,
                        data.reserved,
                        data.payload,
                        None,
                    )?;
                }
                Frame::Flush(flush) => self.replies.on_flush(&flush)?,
                Frame::End(end) => {
                    self.replies.on_end(&end)?;
                    self.server.do_end(cx, trace_id, None);
                }
                Frame::Abort(abort) => {
                    self.replies.on_abort(&abort)?;
                    self.fail(cx, trace_id, STATUS_ABORTED);
                }
                _ => return Err(StreamError::Malformed("unexpected frame of Kafka fetch")),
            }
        }
        Ok(())
    }

    /// Extension of the first fragment of each request message,
    /// and of the request tombstone.
    fn request_ex(&self, names: &CorrelationHeaders) -> Extension {
        let mut headers = reply_headers(names, &self.correlation_id, None);
        headers.extend([
            KafkaHeader::new(&names.service, self.service.clone()),
            KafkaHeader::new(&names.method, self.method.clone()),
            KafkaHeader::new(&names.reply_to, self.reply_to.clone()),
        ]);

        Extension::Kafka(KafkaEx::Data(KafkaDataEx {
            headers,
            ..Default::default()
        }))
    }

    /// Abort and reset the gRPC call with `status`, and close both delegates.
    fn fail(&mut self, cx: &mut Context<'_>, trace_id: u64, status: &str) {
        self.server.do_abort(cx, trace_id, crate::grpc_abort(status));
        self.server.do_reset(cx, trace_id, crate::grpc_reset(status));
        self.producer.cleanup(cx, trace_id);
        self.replies.cleanup(cx, trace_id);
    }
}

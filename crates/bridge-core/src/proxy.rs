use crate::frame::{Begin, Frame};
use crate::half::Half;
use crate::route::{Attributes, Resolve};
use crate::scope::{Binding, Context};
use crate::state::Direction;
use crate::StreamError;
use std::collections::HashMap;
use std::sync::Arc;

/// Translate the extensions of a 1:1 proxy between its two protocols.
/// Every method but `attributes` defaults to passing extensions through.
pub trait Translate<X>: Send {
    /// Attributes of a new stream, against which it's routed.
    fn attributes(&self, begin: &Begin<X>) -> Attributes;

    /// Translate the extension of a begin, sent to `routed_id`.
    fn begin(&self, _routed_id: u64, extension: Option<X>) -> Option<X> {
        extension
    }
    fn reply_begin(&self, extension: Option<X>) -> Option<X> {
        extension
    }
    fn data(&self, extension: Option<X>) -> Option<X> {
        extension
    }
    fn reply_data(&self, extension: Option<X>) -> Option<X> {
        extension
    }
    /// Padding which the proxy adds to each reply message it forwards.
    fn reply_padding(&self) -> u32 {
        0
    }
}

/// Forward is a binding which proxies each of its streams 1:1 to a routed
/// delegate stream, forwarding frames between the two with translation.
///
/// Flow control is mirrored end-to-end: the upstream initial window mirrors
/// the delegate's, and the delegate reply window mirrors the upstream's.
/// A reset or abort of either side, or any protocol violation, cleans up
/// both sides.
pub struct Forward<X, T> {
    binding_id: u64,
    resolver: Arc<dyn Resolve>,
    translate: T,
    proxies: HashMap<u64, ForwardProxy>,
    next_key: u64,
    _extension: std::marker::PhantomData<fn() -> X>,
}

struct ForwardProxy {
    server: Half,
    client: Half,
}

impl<X, T> Forward<X, T> {
    pub fn new(binding_id: u64, resolver: Arc<dyn Resolve>, translate: T) -> Self {
        Self {
            binding_id,
            resolver,
            translate,
            proxies: HashMap::new(),
            next_key: 0,
            _extension: Default::default(),
        }
    }

    /// Number of active proxies.
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl<X: Send + 'static, T: Translate<X>> Binding<X> for Forward<X, T> {
    fn id(&self) -> u64 {
        self.binding_id
    }

    fn new_stream(&mut self, cx: &mut Context<'_, X>, begin: Begin<X>) -> bool {
        let attributes = self.translate.attributes(&begin);
        let Some(routed_id) = self
            .resolver
            .resolve(begin.header.authorization, &attributes)
        else {
            tracing::debug!(?attributes, "no route for stream");
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
        let mut client = Half::connect(
            cx,
            key,
            routed_id,
            begin.header.authorization,
            begin.affinity,
        );

        let trace_id = begin.header.trace_id;
        let extension = self.translate.begin(routed_id, begin.extension);

        // A newly connected client is never already open.
        let _ = client.do_begin(cx, trace_id, extension);

        tracing::debug!(
            key,
            initial_id = server.initial_id(),
            delegate_id = client.initial_id(),
            "forwarding stream"
        );
        self.proxies.insert(key, ForwardProxy { server, client });
        true
    }

    fn on_frame(&mut self, cx: &mut Context<'_, X>, key: u64, frame: Frame<X>) {
        let Some(proxy) = self.proxies.get_mut(&key) else {
            return;
        };
        let trace_id = frame.header().trace_id;

        if let Err(error) = proxy.on_frame(cx, &self.translate, frame) {
            tracing::warn!(%error, key, "resetting forwarded stream");
            proxy.server.cleanup(cx, trace_id);
            proxy.client.cleanup(cx, trace_id);
        }

        if proxy.server.is_closed() && proxy.client.is_closed() {
            proxy.server.release(cx);
            proxy.client.release(cx);
            self.proxies.remove(&key);
            tracing::debug!(key, "forwarded stream closed");
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(binding_id = self.binding_id))]
    fn detach(&mut self, cx: &mut Context<'_, X>) {
        for (_, mut proxy) in self.proxies.drain() {
            let trace_id = cx.supply_trace_id();
            proxy.server.cleanup(cx, trace_id);
            proxy.client.cleanup(cx, trace_id);
            proxy.server.release(cx);
            proxy.client.release(cx);
        }
    }
}

impl ForwardProxy {
    fn on_frame<X: Send + 'static>(
        &mut self,
        cx: &mut Context<'_, X>,
        translate: &impl Translate<X>,
        frame: Frame<X>,
    ) -> Result<(), StreamError> {
        let stream_id = frame.stream_id();
        let Self { server, client } = self;

        if stream_id == server.inbound_id() {
            match frame {
                Frame::Data(data) => {
                    server.on_data(&data)?;
                    client.do_data(
                        cx,
                        data.header.trace_id,
                        data.flags,
                        data.reserved,
                        data.payload,
                        translate.data(data.extension),
                    )?;
                }
                Frame::Flush(flush) => {
                    server.on_flush(&flush)?;
                    client.do_flush(cx, flush.header.trace_id, flush.reserved, flush.extension)?;
                }
                Frame::End(end) => {
                    server.on_end(&end)?;
                    client.do_end(cx, end.header.trace_id, end.extension);
                }
                Frame::Abort(abort) => {
                    let trace_id = abort.header.trace_id;
                    server.on_abort(&abort)?;
                    client.do_abort(cx, trace_id, abort.extension);
                    server.cleanup(cx, trace_id);
                    client.cleanup(cx, trace_id);
                }
                frame => return Err(unexpected(&frame, server.inbound_dir())),
            }
        } else if stream_id == server.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    server.on_window(&window)?;
                    client.mirror_window(cx, window.header.trace_id, server.outbound(), translate.reply_padding());
                }
                Frame::Reset(reset) => {
                    let trace_id = reset.header.trace_id;
                    server.on_reset(&reset);
                    client.do_reset(cx, trace_id, reset.extension);
                    server.cleanup(cx, trace_id);
                    client.cleanup(cx, trace_id);
                }
                frame => return Err(unexpected(&frame, server.outbound_dir())),
            }
        } else if stream_id == client.inbound_id() {
            match frame {
                Frame::Begin(begin) => {
                    client.on_begin(&begin)?;
                    server.do_begin(cx, begin.header.trace_id, translate.reply_begin(begin.extension))?;
                }
                Frame::Data(data) => {
                    client.on_data(&data)?;
                    server.do_data(
                        cx,
                        data.header.trace_id,
                        data.flags,
                        data.reserved,
                        data.payload,
                        translate.reply_data(data.extension),
                    )?;
                }
                Frame::Flush(flush) => {
                    client.on_flush(&flush)?;
                    server.do_flush(cx, flush.header.trace_id, flush.reserved, flush.extension)?;
                }
                Frame::End(end) => {
                    client.on_end(&end)?;
                    server.do_end(cx, end.header.trace_id, end.extension);
                }
                Frame::Abort(abort) => {
                    let trace_id = abort.header.trace_id;
                    client.on_abort(&abort)?;
                    server.do_abort(cx, trace_id, abort.extension);
                    server.cleanup(cx, trace_id);
                    client.cleanup(cx, trace_id);
                }
                frame => return Err(unexpected(&frame, client.inbound_dir())),
            }
        } else if stream_id == client.outbound_id() {
            match frame {
                Frame::Window(window) => {
                    client.on_window(&window)?;
                    server.mirror_window(cx, window.header.trace_id, client.outbound(), 0);
                }
                Frame::Reset(reset) => {
                    let trace_id = reset.header.trace_id;
                    client.on_reset(&reset);
                    server.do_reset(cx, trace_id, reset.extension);
                    server.cleanup(cx, trace_id);
                    client.cleanup(cx, trace_id);
                }
                frame => return Err(unexpected(&frame, client.outbound_dir())),
            }
        }
        Ok(())
    }
}

fn unexpected<X>(frame: &Frame<X>, direction: Direction) -> StreamError {
    StreamError::Unexpected {
        kind: frame.kind(),
        direction,
    }
}

use bridge_core::testing::{self, Recorder};
use bridge_core::{Data, DataFlags, EngineConfig, Frame as AnyFrame, Scope, Task};
use bytes::Bytes;
use grpc_kafka::{
    Extension, Frame, GrpcEx, KafkaDataEx, KafkaEx, KafkaHeader, RemoteRoute,
    RemoteServerBinding, RemoteServerOptions,
};
use bridge_core::progress::PartitionOffset;
use pretty_assertions::assert_eq;

const BINDING_ID: u64 = 20;
const GRPC_ID: u64 = 30;
const KAFKA_ID: u64 = 40;

/// Streams of the binding's fetch of requests, and its producer of errors.
struct Remote {
    scope: Scope<Extension>,
    recorder: Recorder<Extension>,
    fetch_id: u64,
    errors_id: u64,
}

impl Remote {
    fn start() -> Self {
        let (mut scope, recorder) = testing::scope(&EngineConfig::default());

        let options: RemoteServerOptions = serde_json::from_value(serde_json::json!({
            "kafkaId": KAFKA_ID,
            "topic": "requests",
            "replyTo": "errors",
            "initiateInterval": "5s",
        }))
        .unwrap();
        let routes: Vec<RemoteRoute> = serde_json::from_value(serde_json::json!([
            {
                "id": GRPC_ID,
                "when": [{"service": "example.Echo"}],
                "with": {"authority": "echo.example:8080"},
            },
        ]))
        .unwrap();

        scope.dispatch(Task::Attach(Box::new(RemoteServerBinding::new(
            BINDING_ID, options, routes,
        ))));
        // Fires the initiate signal.
        assert_eq!(scope.poll(), 1);

        let frames = recorder.take();
        let [AnyFrame::Begin(fetch), AnyFrame::Begin(errors)] = &frames[..] else {
            panic!("expected fetch and produce begins, not {frames:?}");
        };
        assert_eq!(
            fetch.extension,
            Some(Extension::Kafka(KafkaEx::Fetch {
                topic: "requests".to_string(),
                partitions: vec![PartitionOffset::SENTINEL],
                filters: Vec::new(),
            }))
        );
        assert_eq!(
            errors.extension,
            Some(Extension::Kafka(KafkaEx::Produce {
                topic: "errors".to_string()
            }))
        );
        assert_eq!(fetch.header.routed_id, KAFKA_ID);

        let mut remote = Self {
            scope,
            recorder,
            fetch_id: fetch.header.stream_id,
            errors_id: errors.header.stream_id,
        };

        remote.frame(testing::begin(KAFKA_ID, remote.fetch_id ^ 1, None));
        remote.frame(testing::window(remote.errors_id, 0, 0, 8192, 0));

        let frames = remote.recorder.take();
        let [AnyFrame::Window(window)] = &frames[..] else {
            panic!("expected fetch window, not {frames:?}");
        };
        assert_eq!(window.header.stream_id, remote.fetch_id ^ 1);
        assert_eq!(window.header.maximum, 65536);

        remote
    }

    fn frame(&mut self, frame: Frame) {
        self.scope.dispatch(Task::Frame(frame));
    }

    /// Deliver a fetched request having `headers`, at `sequence` of the fetch.
    fn request(
        &mut self,
        sequence: u64,
        headers: &[(&str, &str)],
        payload: Option<&[u8]>,
        offset: i64,
    ) {
        let payload = payload.map(Bytes::copy_from_slice);
        let frame = Frame::Data(Data {
            header: testing::header(self.fetch_id ^ 1, sequence, 0, 0),
            budget_id: 0,
            flags: DataFlags::COMPLETE,
            reserved: payload.as_ref().map(Bytes::len).unwrap_or_default() as u32,
            payload,
            extension: Some(Extension::Kafka(KafkaEx::Data(KafkaDataEx {
                partition: PartitionOffset::new(0, offset),
                headers: headers
                    .iter()
                    .map(|(name, value)| KafkaHeader::new(name, value.to_string()))
                    .collect(),
                ..Default::default()
            }))),
        });
        self.frame(frame);
    }
}

fn committed(frame: &Frame) -> Option<PartitionOffset> {
    match frame {
        AnyFrame::Flush(flush) => match &flush.extension {
            Some(Extension::Kafka(KafkaEx::Commit { partition })) => Some(*partition),
            _ => None,
        },
        _ => None,
    }
}

fn header<'f>(frame: &'f Frame, name: &str) -> Option<&'f [u8]> {
    let AnyFrame::Data(data) = frame else {
        return None;
    };
    data.extension
        .as_ref()
        .and_then(Extension::kafka_data)
        .and_then(|ex| ex.header(name))
        .map(|value| &value[..])
}

#[test]
fn test_unresolved_request_replies_error_and_commits() {
    let mut remote = Remote::start();

    // Has a correlation id, but no service or method.
    remote.request(0, &[("bridge:correlation-id", "abc")], Some(b"ping"), 42);

    let frames = remote.recorder.take();
    assert_eq!(frames.len(), 3, "{frames:?}");

    // Tombstone of status "13" on the configured reply topic.
    let AnyFrame::Data(tombstone) = &frames[0] else {
        panic!("expected data, not {frames:?}");
    };
    assert_eq!(tombstone.header.stream_id, remote.errors_id);
    assert!(tombstone.payload.is_none());
    assert_eq!(header(&frames[0], "bridge:correlation-id"), Some(&b"abc"[..]));
    assert_eq!(header(&frames[0], "bridge:status"), Some(&b"13"[..]));

    // The request is still committed.
    assert_eq!(frames[1].stream_id(), remote.fetch_id);
    assert_eq!(committed(&frames[1]), Some(PartitionOffset::new(0, 43)));

    // And acknowledged.
    let AnyFrame::Window(window) = &frames[2] else {
        panic!("expected window, not {frames:?}");
    };
    assert_eq!(window.header.acknowledge, 4);

    // A request without any route is also an error.
    remote.request(
        4,
        &[
            ("bridge:correlation-id", "def"),
            ("bridge:service", "example.Other"),
            ("bridge:method", "Unary"),
        ],
        Some(b"ping"),
        43,
    );
    let frames = remote.recorder.take();
    assert_eq!(header(&frames[0], "bridge:correlation-id"), Some(&b"def"[..]));
    assert_eq!(header(&frames[0], "bridge:status"), Some(&b"13"[..]));
    assert_eq!(committed(&frames[1]), Some(PartitionOffset::new(0, 44)));
    assert_eq!(remote.scope.bound_streams(), 4);
}

#[test]
fn test_partial_delivery_is_queued_and_drained() {
    let mut remote = Remote::start();
    let call = [
        ("bridge:correlation-id", "c1"),
        ("bridge:service", "example.Echo"),
        ("bridge:method", "Unary"),
        ("bridge:reply-to", "replies"),
    ];

    // The first request begins a call, and is queued until the call has a window.
    remote.request(0, &call, Some(b"hi"), 7);

    let frames = remote.recorder.take();
    let [AnyFrame::Begin(grpc), AnyFrame::Begin(producer), AnyFrame::Window(_)] = &frames[..]
    else {
        panic!("expected call begins and fetch window, not {frames:?}");
    };
    assert_eq!(grpc.header.routed_id, GRPC_ID);
    assert_eq!(
        grpc.extension,
        Some(Extension::Grpc(GrpcEx::Begin {
            scheme: "http".to_string(),
            authority: "echo.example:8080".to_string(),
            service: "example.Echo".to_string(),
            method: "Unary".to_string(),
            metadata: Vec::new(),
        }))
    );
    assert_eq!(producer.header.routed_id, KAFKA_ID);
    assert_eq!(
        producer.extension,
        Some(Extension::Kafka(KafkaEx::Produce {
            topic: "replies".to_string()
        }))
    );
    let (grpc_id, producer_id) = (grpc.header.stream_id, producer.header.stream_id);

    // A window of 202 drains the first request, and leaves 200.
    remote.frame(testing::window(grpc_id, 0, 0, 202, 0));

    let frames = remote.recorder.take();
    assert_eq!(frames.len(), 2, "{frames:?}");
    let AnyFrame::Data(data) = &frames[0] else {
        panic!("expected data, not {frames:?}");
    };
    assert_eq!(data.header.stream_id, grpc_id);
    assert_eq!(data.payload.as_deref(), Some(&b"hi"[..]));
    assert_eq!(data.flags, DataFlags::COMPLETE);
    assert_eq!(committed(&frames[1]), Some(PartitionOffset::new(0, 8)));

    // Only 200 of 1000 bytes fit the window: the rest is queued.
    let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    remote.request(2, &call, Some(&payload), 8);

    let frames = remote.recorder.take();
    let [AnyFrame::Data(first), AnyFrame::Window(_)] = &frames[..] else {
        panic!("expected data and fetch window, not {frames:?}");
    };
    assert_eq!(first.payload.as_deref(), Some(&payload[..200]));
    assert_eq!(first.reserved, 200);
    assert_eq!(first.flags, DataFlags::INIT);

    // Window updates drain the remainder in order, as continuations.
    remote.frame(testing::window(grpc_id, 0, 202, 500, 0));
    remote.frame(testing::window(grpc_id, 0, 702, 500, 0));

    let frames = remote.recorder.take();
    assert_eq!(frames.len(), 3, "{frames:?}");
    let (AnyFrame::Data(second), AnyFrame::Data(third)) = (&frames[0], &frames[1]) else {
        panic!("expected data, not {frames:?}");
    };
    assert_eq!(second.payload.as_deref(), Some(&payload[200..700]));
    assert_eq!(second.flags, DataFlags::CONTINUATION);
    assert_eq!(third.payload.as_deref(), Some(&payload[700..]));
    assert_eq!(third.flags, DataFlags::FIN);
    assert_eq!(committed(&frames[2]), Some(PartitionOffset::new(0, 9)));

    // A request tombstone ends the call's requests.
    remote.request(1002, &call, None, 9);
    let frames = remote.recorder.take();
    assert_eq!((frames[0].kind(), frames[0].stream_id()), ("end", grpc_id));
    assert_eq!(committed(&frames[1]), Some(PartitionOffset::new(0, 10)));

    // Replies of the call are produced, followed by a tombstone of its status.
    remote.frame(testing::begin(GRPC_ID, grpc_id ^ 1, None));
    remote.frame(testing::window(producer_id, 0, 0, 1024, 0));
    remote.frame(testing::data(grpc_id ^ 1, 0, DataFlags::COMPLETE, 4, b"pong", None));
    remote.frame(testing::end(grpc_id ^ 1, 4, None));

    let frames: Vec<_> = remote
        .recorder
        .take()
        .into_iter()
        .filter(|f| f.kind() != "window")
        .collect();
    assert_eq!(frames.len(), 3, "{frames:?}");

    let AnyFrame::Data(reply) = &frames[0] else {
        panic!("expected data, not {frames:?}");
    };
    assert_eq!(reply.header.stream_id, producer_id);
    assert_eq!(reply.payload.as_deref(), Some(&b"pong"[..]));
    assert_eq!(header(&frames[0], "bridge:correlation-id"), Some(&b"c1"[..]));

    let AnyFrame::Data(tombstone) = &frames[1] else {
        panic!("expected data, not {frames:?}");
    };
    assert!(tombstone.payload.is_none());
    assert_eq!(header(&frames[1], "bridge:status"), Some(&b"0"[..]));
    assert_eq!((frames[2].kind(), frames[2].stream_id()), ("end", producer_id));

    // The call is removed once its producer also closes.
    remote.frame(testing::begin(KAFKA_ID, producer_id ^ 1, None));
    assert_eq!(remote.scope.bound_streams(), 8);
    remote.frame(testing::end(producer_id ^ 1, 0, None));
    assert_eq!(remote.scope.bound_streams(), 4);
}

#[test]
fn test_fetch_reset_reinitiates() {
    let mut remote = Remote::start();

    remote.frame(testing::reset(remote.fetch_id, None));
    let frames = remote.recorder.take();
    assert_eq!(frames.len(), 1, "{frames:?}");
    assert_eq!(frames[0].kind(), "reset");
    assert_eq!(frames[0].stream_id(), remote.fetch_id ^ 1);

    // Nothing is due until the initiate interval elapses.
    assert_eq!(remote.scope.poll(), 0);
    let deadline = remote.scope.next_deadline().unwrap();
    assert_eq!(remote.scope.fire_signals(deadline), 1);

    let frames = remote.recorder.take();
    let [AnyFrame::Begin(fetch)] = &frames[..] else {
        panic!("expected fetch begin, not {frames:?}");
    };
    assert_ne!(fetch.header.stream_id, remote.fetch_id);
    assert!(matches!(
        fetch.extension,
        Some(Extension::Kafka(KafkaEx::Fetch { .. }))
    ));

    // Detaching closes the fetch and producer.
    remote.scope.dispatch(Task::Detach(BINDING_ID));
    let kinds: Vec<_> = remote.recorder.take().iter().map(|f| f.kind()).collect();
    assert_eq!(kinds, vec!["reset", "abort", "reset", "abort"]);
    assert_eq!(remote.scope.bound_streams(), 0);
}

#[test]
fn test_unrepresentable_window_padding_fails_call() {
    let mut remote = Remote::start();
    let call = [
        ("bridge:correlation-id", "c1"),
        ("bridge:service", "example.Echo"),
        ("bridge:method", "Unary"),
    ];
    remote.request(0, &call, Some(b"hi"), 7);

    let frames = remote.recorder.take();
    let [AnyFrame::Begin(grpc), AnyFrame::Begin(producer), AnyFrame::Window(_)] = &frames[..]
    else {
        panic!("expected call begins and fetch window, not {frames:?}");
    };
    let (grpc_id, producer_id) = (grpc.header.stream_id, producer.header.stream_id);

    // Padding which can't be added to any message length.
    remote.frame(testing::window(grpc_id, 0, 0, 1000, u32::MAX));

    let frames = remote.recorder.take();
    let summary: Vec<_> = frames.iter().map(|f| (f.kind(), f.stream_id())).collect();
    assert_eq!(
        summary,
        vec![
            ("data", producer_id),
            ("end", producer_id),
            ("reset", producer_id ^ 1),
            ("abort", grpc_id),
            ("reset", grpc_id ^ 1),
            ("flush", remote.fetch_id),
        ]
    );
    assert_eq!(header(&frames[0], "bridge:status"), Some(&b"13"[..]));
    let AnyFrame::Abort(abort) = &frames[3] else {
        unreachable!()
    };
    assert_eq!(
        abort.extension.as_ref().and_then(Extension::grpc_status),
        Some("13")
    );
    // The failed request is answered, and committed.
    assert_eq!(committed(&frames[5]), Some(PartitionOffset::new(0, 8)));
    assert_eq!(remote.scope.bound_streams(), 4);
}

#[test]
fn test_error_reply_waits_for_its_producer() {
    let mut remote = Remote::start();

    // The producer of errors fails, and is re-initiated later.
    remote.frame(testing::reset(remote.errors_id, None));
    let kinds: Vec<_> = remote.recorder.take().iter().map(|f| f.kind()).collect();
    assert_eq!(kinds, vec!["reset", "abort"]);

    // Without a producer, the error reply and commit both wait.
    remote.request(0, &[("bridge:correlation-id", "abc")], Some(b"ping"), 42);
    let frames = remote.recorder.take();
    let [AnyFrame::Window(window)] = &frames[..] else {
        panic!("expected only the fetch window, not {frames:?}");
    };
    assert_eq!(window.header.acknowledge, 4);

    let deadline = remote.scope.next_deadline().unwrap();
    assert_eq!(remote.scope.fire_signals(deadline), 1);

    let frames = remote.recorder.take();
    assert_eq!(frames.len(), 3, "{frames:?}");
    let AnyFrame::Begin(errors) = &frames[0] else {
        panic!("expected produce begin, not {frames:?}");
    };
    assert_ne!(errors.header.stream_id, remote.errors_id);

    assert_eq!(frames[1].stream_id(), errors.header.stream_id);
    assert_eq!(header(&frames[1], "bridge:correlation-id"), Some(&b"abc"[..]));
    assert_eq!(header(&frames[1], "bridge:status"), Some(&b"13"[..]));
    assert_eq!(committed(&frames[2]), Some(PartitionOffset::new(0, 43)));
}

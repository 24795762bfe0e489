use bridge_core::progress::{self, PartitionOffset};
use bridge_core::testing::{self, Recorder};
use bridge_core::{Begin, Data, DataFlags, EngineConfig, Header, Scope, Task};
use bytes::Bytes;
use grpc_kafka::ext::GrpcMetadata;
use grpc_kafka::fetch::progress_field;
use grpc_kafka::{Extension, FetchBinding, FetchRoute, Frame, GrpcEx, KafkaDataEx, KafkaEx};
use pretty_assertions::assert_eq;

const BINDING_ID: u64 = 10;
const KAFKA_ID: u64 = 40;
/// Initial stream of the gRPC call, whose reply stream is `CALL_ID ^ 1`.
const CALL_ID: u64 = 3;

fn setup() -> (Scope<Extension>, Recorder<Extension>, u32) {
    let (mut scope, recorder) = testing::scope(&EngineConfig::default());

    let routes: Vec<FetchRoute> = serde_json::from_value(serde_json::json!([
        {"id": KAFKA_ID, "when": [{"service": "example.Feed"}], "with": {"topic": "events"}},
    ]))
    .unwrap();
    let binding = FetchBinding::new(BINDING_ID, Default::default(), routes);
    let overhead = binding.overhead();

    scope.dispatch(Task::Attach(Box::new(binding)));
    (scope, recorder, overhead)
}

fn frame(scope: &mut Scope<Extension>, frame: Frame) {
    scope.dispatch(Task::Frame(frame));
}

fn call(metadata: Vec<GrpcMetadata>) -> Frame {
    Frame::Begin(Begin {
        header: Header {
            routed_id: BINDING_ID,
            ..testing::header(CALL_ID, 0, 0, 1024)
        },
        affinity: 0,
        extension: Some(Extension::Grpc(GrpcEx::Begin {
            scheme: "http".to_string(),
            authority: "localhost:8080".to_string(),
            service: "example.Feed".to_string(),
            method: "Tail".to_string(),
            metadata,
        })),
    })
}

fn message(
    stream_id: u64,
    sequence: u64,
    reserved: u32,
    payload: &[u8],
    partition: PartitionOffset,
) -> Frame {
    Frame::Data(Data {
        header: testing::header(stream_id, sequence, 0, 0),
        budget_id: 0,
        flags: DataFlags::COMPLETE,
        reserved,
        payload: Some(Bytes::copy_from_slice(payload)),
        extension: Some(Extension::Kafka(KafkaEx::Data(KafkaDataEx {
            partition,
            ..Default::default()
        }))),
    })
}

#[test]
fn test_fetch_mirrors_windows_and_appends_progress() {
    let (mut scope, recorder, overhead) = setup();

    let resume = progress::encode(&[PartitionOffset::new(0, 5)]);
    frame(
        &mut scope,
        call(vec![GrpcMetadata {
            name: Bytes::from_static(b"last-message-id"),
            value: Bytes::from(resume),
        }]),
    );

    let frames = recorder.take();
    assert_eq!(frames.len(), 1);
    let Frame::Begin(fetch) = &frames[0] else {
        panic!("expected begin, not {frames:?}");
    };
    assert_eq!(fetch.header.routed_id, KAFKA_ID);
    assert_eq!((fetch.header.sequence, fetch.header.acknowledge), (0, 0));
    assert_eq!(
        fetch.extension,
        Some(Extension::Kafka(KafkaEx::Fetch {
            topic: "events".to_string(),
            partitions: vec![PartitionOffset::new(0, 5)],
            filters: Vec::new(),
        }))
    );
    let kafka_id = fetch.header.stream_id;

    // The upstream window mirrors the fetch's window, including its padding.
    frame(&mut scope, testing::window(kafka_id, 0, 0, 512, 8));
    let frames = recorder.take();
    let Frame::Window(window) = &frames[0] else {
        panic!("expected window, not {frames:?}");
    };
    assert_eq!(window.header.stream_id, CALL_ID);
    assert_eq!((window.header.acknowledge, window.header.maximum), (0, 512));
    assert_eq!(window.padding, 8);

    // A request which reserves its padding is consumed and acknowledged.
    frame(
        &mut scope,
        testing::data(CALL_ID, 0, DataFlags::COMPLETE, 5 + 8, b"hello", None),
    );
    let frames = recorder.take();
    let Frame::Window(window) = &frames[0] else {
        panic!("expected window, not {frames:?}");
    };
    assert_eq!((window.header.sequence, window.header.acknowledge), (13, 13));
    assert_eq!(window.header.maximum, 512);

    // Fetch reply begins the gRPC reply.
    frame(&mut scope, testing::begin(KAFKA_ID, kafka_id ^ 1, None));
    let frames = recorder.take();
    assert_eq!(frames.len(), 1);
    assert_eq!((frames[0].kind(), frames[0].stream_id()), ("begin", CALL_ID ^ 1));

    // The fetch's reply window accounts for the progress token.
    frame(&mut scope, testing::window(CALL_ID ^ 1, 0, 0, 1024, 8));
    let frames = recorder.take();
    let Frame::Window(window) = &frames[0] else {
        panic!("expected window, not {frames:?}");
    };
    assert_eq!(window.header.stream_id, kafka_id ^ 1);
    assert_eq!(window.header.maximum, 1024);
    assert_eq!(window.padding, 8 + overhead);

    let reserved = 5 + 8 + overhead;
    frame(
        &mut scope,
        message(kafka_id ^ 1, 0, reserved, b"world", PartitionOffset::new(0, 5)),
    );
    let frames = recorder.take();
    let Frame::Data(data) = &frames[0] else {
        panic!("expected data, not {frames:?}");
    };
    let trailer = progress_field(32767, &progress::encode(&[PartitionOffset::new(0, 6)]));
    let expect = [&b"world"[..], &trailer[..]].concat();

    assert_eq!(data.header.stream_id, CALL_ID ^ 1);
    assert_eq!(data.flags, DataFlags::COMPLETE);
    assert_eq!(data.payload.as_deref(), Some(&expect[..]));
    assert_eq!(data.reserved as usize, expect.len() + 8);
    assert!(data.reserved <= reserved);

    // Ends propagate, and release the proxy once both sides are closed.
    frame(&mut scope, testing::end(kafka_id ^ 1, reserved as u64, None));
    frame(&mut scope, testing::end(CALL_ID, 13, None));

    let kinds: Vec<_> = recorder
        .take()
        .iter()
        .map(|f| (f.kind(), f.stream_id()))
        .collect();
    assert_eq!(kinds, vec![("end", CALL_ID ^ 1), ("end", kafka_id)]);
    assert_eq!(scope.bound_streams(), 0);
}

#[test]
fn test_fetch_reset_aborts_call() {
    let (mut scope, recorder, _overhead) = setup();

    frame(&mut scope, call(Vec::new()));
    let frames = recorder.take();
    let Frame::Begin(fetch) = &frames[0] else {
        panic!("expected begin, not {frames:?}");
    };
    // Without a resume token, the fetch is from the earliest message.
    let Some(Extension::Kafka(KafkaEx::Fetch { partitions, .. })) = &fetch.extension else {
        panic!("expected fetch extension");
    };
    assert_eq!(partitions, &vec![PartitionOffset::SENTINEL]);
    let kafka_id = fetch.header.stream_id;

    frame(&mut scope, testing::begin(KAFKA_ID, kafka_id ^ 1, None));
    frame(&mut scope, testing::reset(kafka_id, None));

    let frames = recorder.take();
    let summary: Vec<_> = frames
        .iter()
        .map(|f| (f.kind(), f.stream_id()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("begin", CALL_ID ^ 1),
            ("abort", CALL_ID ^ 1),
            ("reset", CALL_ID),
            ("reset", kafka_id ^ 1),
        ]
    );

    let Frame::Abort(abort) = &frames[1] else {
        unreachable!()
    };
    assert_eq!(
        abort.extension.as_ref().and_then(Extension::grpc_status),
        Some("10")
    );
    let Frame::Reset(reset) = &frames[2] else {
        unreachable!()
    };
    assert_eq!(
        reset.extension.as_ref().and_then(Extension::grpc_status),
        Some("10")
    );
    assert_eq!(scope.bound_streams(), 0);
}

#[test]
fn test_unrouted_call_is_reset() {
    let (mut scope, recorder, _overhead) = setup();

    let Frame::Begin(mut begin) = call(Vec::new()) else {
        unreachable!()
    };
    begin.extension = Some(Extension::Grpc(GrpcEx::Begin {
        scheme: "http".to_string(),
        authority: "localhost:8080".to_string(),
        service: "example.Other".to_string(),
        method: "Tail".to_string(),
        metadata: Vec::new(),
    }));
    frame(&mut scope, Frame::Begin(begin));

    let frames = recorder.take();
    assert_eq!(frames.len(), 1);
    assert_eq!((frames[0].kind(), frames[0].stream_id()), ("reset", CALL_ID));
}

#[test]
fn test_progress_padding_grows_with_partitions() {
    let (mut scope, recorder, overhead) = setup();

    frame(&mut scope, call(Vec::new()));
    let frames = recorder.take();
    let Frame::Begin(fetch) = &frames[0] else {
        panic!("expected begin, not {frames:?}");
    };
    let kafka_id = fetch.header.stream_id;

    frame(&mut scope, testing::begin(KAFKA_ID, kafka_id ^ 1, None));
    frame(&mut scope, testing::window(CALL_ID ^ 1, 0, 0, 1 << 20, 0));
    let frames = recorder.take();
    let [Frame::Begin(_), Frame::Window(window)] = &frames[..] else {
        panic!("expected begin and window, not {frames:?}");
    };
    assert_eq!(window.padding, overhead);

    // Each message is of a new partition, reserving the padding last granted.
    let mut padding = overhead;
    let mut sequence = 0;

    for partition_id in 0..40 {
        let reserved = 1 + padding;
        frame(
            &mut scope,
            message(kafka_id ^ 1, sequence, reserved, b"m", PartitionOffset::new(partition_id, 0)),
        );
        sequence += reserved as u64;

        for frame in recorder.take() {
            match frame {
                Frame::Data(data) => {
                    assert_eq!(data.header.stream_id, CALL_ID ^ 1);
                    assert!(data.reserved <= reserved, "{} > {reserved}", data.reserved);
                }
                Frame::Window(window) => {
                    assert_eq!(window.header.stream_id, kafka_id ^ 1);
                    assert!(window.padding > padding);
                    padding = window.padding;
                }
                frame => panic!("unexpected {frame:?}"),
            }
        }
    }

    // The padding now covers a token of 80 partitions.
    let token = progress::encode(&vec![PartitionOffset::default(); 80]);
    assert_eq!(padding as usize, progress_field(32767, &token).len());
    assert_eq!(scope.bound_streams(), 4);
}

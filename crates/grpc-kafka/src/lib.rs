//! Bindings which bridge gRPC calls and Kafka topics:
//!
//! * `FetchBinding` serves a gRPC call by fetching messages of a topic.
//! * `ProduceBinding` serves a gRPC call by producing its requests to a
//!   topic, and fetching correlated replies of another topic.
//! * `RemoteServerBinding` serves requests fetched from a topic by calling
//!   gRPC servers, and produces their replies to a topic.
use bridge_core::Attributes;

pub mod ext;
pub mod fetch;
pub mod helper;
pub mod options;
pub mod produce;
pub mod remote;

pub use ext::{Extension, GrpcEx, KafkaDataEx, KafkaEx, KafkaFilter, KafkaHeader};
pub use fetch::FetchBinding;
pub use helper::HeaderHelper;
pub use options::{
    CorrelationHeaders, FetchRoute, FetchWith, GrpcKafkaOptions, ProduceRoute, ProduceWith,
    RemoteRoute, RemoteServerOptions, RemoteWith, Routed,
};
pub use produce::ProduceBinding;
pub use remote::{GrpcClient, RemoteServerBinding};

pub type Frame = bridge_core::Frame<Extension>;
pub type Context<'a> = bridge_core::Context<'a, Extension>;

/// gRPC status of a successful call.
pub const STATUS_OK: &str = "0";
/// gRPC status of an aborted call.
pub const STATUS_ABORTED: &str = "10";
/// gRPC status of an internal error.
pub const STATUS_INTERNAL: &str = "13";

fn grpc_reset(status: &str) -> Option<Extension> {
    Some(Extension::Grpc(GrpcEx::Reset {
        status: status.to_string(),
    }))
}

fn grpc_abort(status: &str) -> Option<Extension> {
    Some(Extension::Grpc(GrpcEx::Abort {
        status: status.to_string(),
    }))
}

/// Routing attributes of a gRPC call.
fn call_attributes(service: &str, method: &str) -> Attributes {
    bridge_core::route::attributes([("service", service), ("method", method)])
}

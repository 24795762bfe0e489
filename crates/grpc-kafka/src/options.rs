use crate::ext::KafkaFilter;
use bridge_core::{Attributes, Resolve, Route};
use std::time::Duration;

/// Options shared by the gRPC / Kafka bindings.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrpcKafkaOptions {
    pub reliability: ReliabilityOptions,
    pub correlation: CorrelationHeaders,
}

/// Resumption of gRPC fetches from the last message a client received.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReliabilityOptions {
    /// Protobuf field number of the progress token appended to each message.
    pub field: u32,
    /// gRPC metadata from which a client resumes a fetch.
    pub metadata: String,
}

/// Names of the Kafka headers which correlate requests and replies.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorrelationHeaders {
    pub correlation_id: String,
    pub service: String,
    pub method: String,
    pub reply_to: String,
    pub status: String,
}

impl Default for ReliabilityOptions {
    fn default() -> Self {
        Self {
            field: 32767,
            metadata: "last-message-id".to_string(),
        }
    }
}

impl Default for CorrelationHeaders {
    fn default() -> Self {
        Self {
            correlation_id: "bridge:correlation-id".to_string(),
            service: "bridge:service".to_string(),
            method: "bridge:method".to_string(),
            reply_to: "bridge:reply-to".to_string(),
            status: "bridge:status".to_string(),
        }
    }
}

/// Route of a binding, resolved on stream attributes,
/// and bearing binding-specific parameters `with`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Routed<W> {
    #[serde(flatten)]
    pub route: Route,
    pub with: W,
}

/// Routes resolve to the first of them which matches.
impl<W: Clone + Send + Sync> Resolve<Routed<W>> for Vec<Routed<W>> {
    fn resolve(&self, authorization: u64, attributes: &Attributes) -> Option<Routed<W>> {
        self.iter()
            .find(|routed| routed.route.matches(authorization, attributes))
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchWith {
    pub topic: String,
    #[serde(default)]
    pub filters: Vec<KafkaFilter>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceWith {
    pub topic: String,
    pub reply_to: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWith {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub authority: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

/// Route of a gRPC call to a Kafka fetch, by the Kafka exit `route.id`.
pub type FetchRoute = Routed<FetchWith>;
/// Route of a gRPC call to a Kafka produce and correlated fetch,
/// by the Kafka exit `route.id`.
pub type ProduceRoute = Routed<ProduceWith>;
/// Route of a Kafka request to a gRPC call, by the gRPC exit `route.id`.
pub type RemoteRoute = Routed<RemoteWith>;

/// Options of a binding which serves requests of a Kafka topic
/// by calling remote gRPC servers.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServerOptions {
    /// Kafka exit to which fetches and produces are routed.
    pub kafka_id: u64,
    /// Topic of requests.
    pub topic: String,
    /// Topic of replies to requests which can't be served.
    pub reply_to: String,
    /// Delay before re-initiating a failed fetch of requests.
    #[serde(default = "default_initiate_interval", with = "humantime_serde")]
    pub initiate_interval: Duration,
    #[serde(flatten)]
    pub options: GrpcKafkaOptions,
}

fn default_initiate_interval() -> Duration {
    Duration::from_secs(1)
}

use bridge_core::PartitionOffset;
use bytes::Bytes;

/// Extension carried by frames of gRPC and Kafka streams.
#[derive(Debug, Clone, PartialEq)]
pub enum Extension {
    Grpc(GrpcEx),
    Kafka(KafkaEx),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GrpcEx {
    Begin {
        scheme: String,
        authority: String,
        service: String,
        method: String,
        metadata: Vec<GrpcMetadata>,
    },
    Data {
        deferred: u32,
    },
    Reset {
        status: String,
    },
    Abort {
        status: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrpcMetadata {
    pub name: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KafkaEx {
    /// Begin of a fetch of `topic`, from the given partition offsets.
    Fetch {
        topic: String,
        partitions: Vec<PartitionOffset>,
        filters: Vec<KafkaFilter>,
    },
    /// Begin of a produce to `topic`.
    Produce { topic: String },
    /// Data of the first fragment of a message.
    Data(KafkaDataEx),
    /// Flush committing that fetched messages of a partition are processed:
    /// `partition.offset` is the next offset to fetch.
    Commit { partition: PartitionOffset },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KafkaDataEx {
    pub deferred: u32,
    pub timestamp: i64,
    /// Partition and offset of a fetched message.
    pub partition: PartitionOffset,
    pub key: Option<Bytes>,
    pub headers: Vec<KafkaHeader>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaHeader {
    pub name: Bytes,
    pub value: Option<Bytes>,
}

impl KafkaHeader {
    pub fn new(name: &str, value: impl Into<Bytes>) -> Self {
        Self {
            name: Bytes::copy_from_slice(name.as_bytes()),
            value: Some(value.into()),
        }
    }
}

/// Filter of fetched messages. All filters of a fetch must match.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KafkaFilter {
    Header { name: String, value: String },
    Key(String),
}

impl Extension {
    pub fn as_grpc(&self) -> Option<&GrpcEx> {
        match self {
            Self::Grpc(ex) => Some(ex),
            Self::Kafka(_) => None,
        }
    }

    pub fn as_kafka(&self) -> Option<&KafkaEx> {
        match self {
            Self::Kafka(ex) => Some(ex),
            Self::Grpc(_) => None,
        }
    }

    pub fn kafka_data(&self) -> Option<&KafkaDataEx> {
        match self.as_kafka()? {
            KafkaEx::Data(ex) => Some(ex),
            _ => None,
        }
    }

    /// Status of a gRPC reset or abort.
    pub fn grpc_status(&self) -> Option<&str> {
        match self.as_grpc()? {
            GrpcEx::Reset { status } | GrpcEx::Abort { status } => Some(status),
            _ => None,
        }
    }
}

impl KafkaDataEx {
    /// Value of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|header| header.name == name.as_bytes())
            .and_then(|header| header.value.as_ref())
    }
}

impl GrpcEx {
    /// Value of the first metadata entry named `name`.
    pub fn metadata(&self, name: &str) -> Option<&Bytes> {
        match self {
            Self::Begin { metadata, .. } => metadata
                .iter()
                .find(|m| m.name == name.as_bytes())
                .map(|m| &m.value),
            _ => None,
        }
    }
}

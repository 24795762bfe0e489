use crate::ext::{KafkaDataEx, KafkaHeader};
use crate::options::CorrelationHeaders;
use bridge_core::Attributes;
use bytes::Bytes;

/// HeaderHelper extracts the correlation headers of a fetched message.
/// Headers which are absent, or aren't UTF-8 where a string is expected,
/// are None.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeaderHelper {
    pub correlation_id: Option<Bytes>,
    pub service: Option<String>,
    pub method: Option<String>,
    pub reply_to: Option<String>,
    pub status: Option<String>,
}

impl HeaderHelper {
    pub fn visit(ex: &KafkaDataEx, names: &CorrelationHeaders) -> Self {
        let string = |name: &str| {
            ex.header(name)
                .and_then(|value| std::str::from_utf8(value).ok())
                .map(str::to_string)
        };

        Self {
            correlation_id: ex.header(&names.correlation_id).cloned(),
            service: string(&names.service),
            method: string(&names.method),
            reply_to: string(&names.reply_to),
            status: string(&names.status),
        }
    }

    /// Does the message identify both its session and the call it's for?
    pub fn resolved(&self) -> bool {
        self.correlation_id.is_some() && self.service.is_some() && self.method.is_some()
    }

    pub fn attributes(&self) -> Attributes {
        crate::call_attributes(
            self.service.as_deref().unwrap_or_default(),
            self.method.as_deref().unwrap_or_default(),
        )
    }
}

/// Headers of a reply (or reply tombstone, if `status` is set) of a session.
pub fn reply_headers(
    names: &CorrelationHeaders,
    correlation_id: &Bytes,
    status: Option<&str>,
) -> Vec<KafkaHeader> {
    let mut headers = vec![KafkaHeader::new(&names.correlation_id, correlation_id.clone())];

    if let Some(status) = status {
        headers.push(KafkaHeader::new(
            &names.status,
            Bytes::copy_from_slice(status.as_bytes()),
        ));
    }
    headers
}

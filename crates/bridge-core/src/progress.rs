//! Progress tokens are opaque, resumable positions within a set of
//! Kafka partitions which are exchanged with peers as base64url strings.
//!
//! A token encodes a version-tagged binary record: a kind byte (V1),
//! a little-endian i32 count of entries, and that many entries of
//! little-endian (i32 partition id, i64 offset). The final entry is always
//! the sentinel `(-1, HISTORICAL)`, which is appended on encode and
//! stripped on decode.

/// Offset meaning "from the earliest retained message".
pub const HISTORICAL: i64 = -2;
/// Offset meaning "from the next message to be written".
pub const LIVE: i64 = -1;

const KIND_V1: u8 = 1;
const ENTRY_LEN: usize = 4 + 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    pub partition_id: i32,
    pub offset: i64,
}

impl PartitionOffset {
    pub const SENTINEL: Self = Self {
        partition_id: -1,
        offset: HISTORICAL,
    };

    pub fn new(partition_id: i32, offset: i64) -> Self {
        Self {
            partition_id,
            offset,
        }
    }
}

/// Encode progress into a token. Entries are written in the given order.
pub fn encode(progress: &[PartitionOffset]) -> String {
    let count = progress.len() + 1;
    let mut buf = Vec::with_capacity(1 + 4 + count * ENTRY_LEN);

    buf.push(KIND_V1);
    buf.extend_from_slice(&(count as i32).to_le_bytes());

    for entry in progress.iter().chain(std::iter::once(&PartitionOffset::SENTINEL)) {
        buf.extend_from_slice(&entry.partition_id.to_le_bytes());
        buf.extend_from_slice(&entry.offset.to_le_bytes());
    }
    base64::encode_config(buf, base64::URL_SAFE_NO_PAD)
}

/// Decode a token into progress. Decoding never fails: a malformed token
/// decodes as a single sentinel entry, meaning "from the earliest message".
pub fn decode(token: &str) -> Vec<PartitionOffset> {
    match try_decode(token) {
        Ok(progress) => progress,
        Err(reason) => {
            tracing::debug!(token, reason, "malformed progress token");
            vec![PartitionOffset::SENTINEL]
        }
    }
}

fn try_decode(token: &str) -> Result<Vec<PartitionOffset>, &'static str> {
    let unpadded = token.trim_end_matches('=');

    if !unpadded
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err("not base64url");
    }
    let buf =
        base64::decode_config(unpadded, base64::URL_SAFE_NO_PAD).map_err(|_| "invalid base64")?;

    let Some((&kind, rest)) = buf.split_first() else {
        return Err("empty");
    };
    if kind != KIND_V1 {
        return Err("unknown kind");
    }
    if rest.len() < 4 {
        return Err("truncated count");
    }
    let (count, entries) = rest.split_at(4);
    let count = i32::from_le_bytes([count[0], count[1], count[2], count[3]]);

    if count < 1 || entries.len() != count as usize * ENTRY_LEN {
        return Err("count doesn't match entries");
    }

    let mut progress: Vec<PartitionOffset> = entries
        .chunks_exact(ENTRY_LEN)
        .map(|entry| {
            let (partition_id, offset) = entry.split_at(4);
            let mut p = [0u8; 4];
            let mut o = [0u8; 8];
            p.copy_from_slice(partition_id);
            o.copy_from_slice(offset);
            PartitionOffset::new(i32::from_le_bytes(p), i64::from_le_bytes(o))
        })
        .collect();

    if progress.pop() != Some(PartitionOffset::SENTINEL) {
        return Err("missing trailing sentinel");
    }
    if progress.iter().any(|entry| entry.partition_id < 0) {
        return Err("negative partition");
    }
    Ok(progress)
}

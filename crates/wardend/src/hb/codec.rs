//! Datagram fragmentation.
//!
//! An encrypted payload is cut into chunks, each sent as one JSON datagram
//! `{msg_id, index, total, chunk}` with a 1-based index. The receiving side
//! reassembles by message id and forgets incomplete messages after an idle
//! period.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Datagram bytes reserved for the JSON header around a chunk
const HEADER_ALLOWANCE: usize = 128;

/// Incomplete messages buffered at once before the stalest is evicted
pub const MAX_PENDING_MESSAGES: usize = 256;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("max datagram size {0} too small")]
    DatagramTooSmall(usize),

    #[error("payload needs {needed} fragments, limit is {limit}")]
    TooManyFragments { needed: usize, limit: usize },

    #[error("invalid fragment {index}/{total}")]
    InvalidFragment { index: usize, total: usize },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// `#[serde(with)]` helper: bytes as a base64 string
pub(crate) mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// One datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub msg_id: String,
    /// 1-based
    pub index: usize,
    pub total: usize,
    #[serde(with = "b64")]
    pub chunk: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        let fragment: Fragment = serde_json::from_slice(datagram)?;
        if fragment.total == 0 || fragment.index == 0 || fragment.index > fragment.total {
            return Err(CodecError::InvalidFragment {
                index: fragment.index,
                total: fragment.total,
            });
        }
        Ok(fragment)
    }
}

/// Raw chunk size fitting `max_datagram_size` once base64 and JSON framing
/// are added
pub fn chunk_size(max_datagram_size: usize) -> Result<usize, CodecError> {
    let room = max_datagram_size.saturating_sub(HEADER_ALLOWANCE);
    let size = room / 4 * 3;
    if size == 0 {
        return Err(CodecError::DatagramTooSmall(max_datagram_size));
    }
    Ok(size)
}

/// Cut `payload` into fragments sharing a fresh message id
pub fn fragment(payload: &[u8], max_datagram_size: usize, max_fragments: usize) -> Result<Vec<Fragment>, CodecError> {
    let size = chunk_size(max_datagram_size)?;
    let total = payload.len().div_ceil(size).max(1);
    if total > max_fragments {
        return Err(CodecError::TooManyFragments {
            needed: total,
            limit: max_fragments,
        });
    }
    let msg_id = uuid::Uuid::new_v4().to_string();
    if payload.is_empty() {
        return Ok(vec![Fragment {
            msg_id,
            index: 1,
            total: 1,
            chunk: Vec::new(),
        }]);
    }
    Ok(payload
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            msg_id: msg_id.clone(),
            index: i + 1,
            total,
            chunk: chunk.to_vec(),
        })
        .collect())
}

struct Partial {
    total: usize,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    last_seen: Instant,
}

/// Per-message fragment buffers
pub struct Reassembler {
    partial: HashMap<String, Partial>,
    /// Recently completed ids, so late duplicates are not delivered twice
    completed: HashMap<String, Instant>,
    idle: Duration,
    max_fragments: usize,
    max_pending: usize,
}

impl Reassembler {
    pub fn new(idle: Duration, max_fragments: usize) -> Self {
        Self {
            partial: HashMap::new(),
            completed: HashMap::new(),
            idle,
            max_fragments,
            max_pending: MAX_PENDING_MESSAGES,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Make room for one more incomplete message
    fn evict_stalest(&mut self) {
        while self.partial.len() >= self.max_pending {
            let Some(stalest) = self
                .partial
                .iter()
                .min_by_key(|(_, p)| p.last_seen)
                .map(|(id, _)| id.clone())
            else {
                return;
            };
            tracing::debug!(msg_id = %stalest, "too many incomplete heartbeat messages, dropping the stalest");
            self.partial.remove(&stalest);
        }
    }

    /// Add a fragment; returns the payload once every fragment is in
    pub fn push(&mut self, fragment: Fragment, now: Instant) -> Option<Vec<u8>> {
        if fragment.total == 0 || fragment.total > self.max_fragments || fragment.index == 0 || fragment.index > fragment.total
        {
            tracing::debug!(msg_id = %fragment.msg_id, index = fragment.index, total = fragment.total, "drop invalid fragment");
            return None;
        }
        if self.completed.contains_key(&fragment.msg_id) {
            return None;
        }
        if fragment.total == 1 {
            self.completed.insert(fragment.msg_id, now);
            return Some(fragment.chunk);
        }

        if !self.partial.contains_key(&fragment.msg_id) {
            self.evict_stalest();
        }
        let partial = self.partial.entry(fragment.msg_id.clone()).or_insert_with(|| Partial {
            total: fragment.total,
            chunks: vec![None; fragment.total],
            received: 0,
            last_seen: now,
        });
        if partial.total != fragment.total {
            tracing::debug!(msg_id = %fragment.msg_id, "drop fragment with inconsistent total");
            return None;
        }
        partial.last_seen = now;
        let slot = &mut partial.chunks[fragment.index - 1];
        if slot.is_some() {
            return None;
        }
        *slot = Some(fragment.chunk);
        partial.received += 1;
        if partial.received < partial.total {
            return None;
        }

        let partial = self.partial.remove(&fragment.msg_id)?;
        self.completed.insert(fragment.msg_id, now);
        Some(partial.chunks.into_iter().flatten().flatten().collect())
    }

    /// Forget incomplete messages idle for longer than the window
    pub fn purge(&mut self, now: Instant) -> usize {
        let idle = self.idle;
        let before = self.partial.len();
        self.partial.retain(|_, p| now.saturating_duration_since(p.last_seen) < idle);
        self.completed.retain(|_, at| now.saturating_duration_since(*at) < idle);
        let purged = before - self.partial.len();
        if purged > 0 {
            tracing::debug!(purged, "dropped incomplete heartbeat messages");
        }
        purged
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

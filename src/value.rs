//! Wire payloads, transcoders and the hashed-key envelope.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Flag bit marking a UTF-8 string payload.
pub const FLAG_UTF8: u32 = 1 << 0;
/// Flag bit marking a sealed (enveloped) payload written under a hashed key.
pub const FLAG_SEALED: u32 = 1 << 4;

/// An encoded cache payload: transcoder flags plus raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedData {
    pub flags: u32,
    pub data: Bytes,
}

impl CachedData {
    pub fn new(flags: u32, data: impl Into<Bytes>) -> Self {
        Self {
            flags,
            data: data.into(),
        }
    }
}

/// Encodes and decodes application values to and from [`CachedData`].
///
/// Resolution order on writes: the caller's transcoder, then the client
/// default, then the replica's own.
pub trait Transcoder<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<CachedData>;
    fn decode(&self, data: &CachedData) -> Result<T>;
}

/// Identity transcoder for raw byte payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesTranscoder;

impl Transcoder<Bytes> for BytesTranscoder {
    fn encode(&self, value: &Bytes) -> Result<CachedData> {
        Ok(CachedData::new(0, value.clone()))
    }

    fn decode(&self, data: &CachedData) -> Result<Bytes> {
        Ok(data.data.clone())
    }
}

/// UTF-8 string transcoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringTranscoder;

impl Transcoder<String> for StringTranscoder {
    fn encode(&self, value: &String) -> Result<CachedData> {
        Ok(CachedData::new(FLAG_UTF8, Bytes::from(value.clone().into_bytes())))
    }

    fn decode(&self, data: &CachedData) -> Result<String> {
        String::from_utf8(data.data.to_vec())
            .map_err(|e| Error::Transcode(format!("invalid utf-8 payload: {e}")))
    }
}

/// Envelope written to the backend in place of the raw payload when the wire
/// key is a hash. Carries the canonical key so readers can detect hash
/// collisions, plus the original flags, TTL and write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedValue {
    pub canonical_key: String,
    pub flags: u32,
    pub payload: Vec<u8>,
    pub ttl: u64,
    pub write_time_ms: u64,
}

/// Codec for [`SealedValue`] envelopes. Compression is never applied to the
/// envelope; the inner payload keeps whatever encoding its transcoder chose.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeTranscoder;

impl EnvelopeTranscoder {
    /// Wrap an encoded payload in an envelope bound to its canonical key.
    pub fn seal(&self, canonical_key: &str, data: &CachedData, ttl: u64) -> Result<CachedData> {
        let write_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let sealed = SealedValue {
            canonical_key: canonical_key.to_string(),
            flags: data.flags,
            payload: data.data.to_vec(),
            ttl,
            write_time_ms,
        };
        let bytes = bincode::serialize(&sealed)?;
        Ok(CachedData::new(FLAG_SEALED, bytes))
    }

    /// Unwrap an envelope read from the backend.
    pub fn open(&self, data: &CachedData) -> Result<SealedValue> {
        Ok(bincode::deserialize(&data.data)?)
    }
}

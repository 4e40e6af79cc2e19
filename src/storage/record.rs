//! WAL record payloads
//!
//! Every payload starts with a one-byte discriminant followed by the bincode
//! body of that variant:
//!
//! ```text
//! 0x01 | SeriesRecord      (tenant, fingerprint, labels)
//! 0x02 | ChunkMetasRecord  (tenant, fingerprint, chunk metas)
//! ```
//!
//! The discriminant is read before the body, so a payload written by a newer
//! format is reported as an unknown type rather than as garbage.

use crate::storage::error::{DecodeError, HeadResult};
use crate::storage::types::{ChunkMeta, Fingerprint, LabelSet};
use serde::{Deserialize, Serialize};

const RECORD_SERIES: u8 = 0x01;
const RECORD_CHUNK_METAS: u8 = 0x02;

/// Defines a series' label set for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub tenant: String,
    pub fingerprint: Fingerprint,
    pub labels: LabelSet,
}

/// Chunk metas appended to a previously defined series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetasRecord {
    pub tenant: String,
    pub fingerprint: Fingerprint,
    pub chunks: Vec<ChunkMeta>,
}

/// One logical WAL entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Series(SeriesRecord),
    ChunkMetas(ChunkMetasRecord),
}

impl WalRecord {
    pub fn series(tenant: &str, fingerprint: Fingerprint, labels: &LabelSet) -> Self {
        WalRecord::Series(SeriesRecord {
            tenant: tenant.to_string(),
            fingerprint,
            labels: labels.clone(),
        })
    }

    pub fn chunk_metas(tenant: &str, fingerprint: Fingerprint, chunks: &[ChunkMeta]) -> Self {
        WalRecord::ChunkMetas(ChunkMetasRecord {
            tenant: tenant.to_string(),
            fingerprint,
            chunks: chunks.to_vec(),
        })
    }

    pub fn tenant(&self) -> &str {
        match self {
            WalRecord::Series(r) => &r.tenant,
            WalRecord::ChunkMetas(r) => &r.tenant,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            WalRecord::Series(r) => r.fingerprint,
            WalRecord::ChunkMetas(r) => r.fingerprint,
        }
    }

    /// Append the encoded payload to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) -> HeadResult<()> {
        match self {
            WalRecord::Series(r) => {
                buf.push(RECORD_SERIES);
                bincode::serialize_into(&mut *buf, r)?;
            }
            WalRecord::ChunkMetas(r) => {
                buf.push(RECORD_CHUNK_METAS);
                bincode::serialize_into(&mut *buf, r)?;
            }
        }
        Ok(())
    }

    /// Decode a payload that already passed envelope validation
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (&kind, body) = payload.split_first().ok_or(DecodeError::Empty)?;
        match kind {
            RECORD_SERIES => Ok(WalRecord::Series(bincode::deserialize(body)?)),
            RECORD_CHUNK_METAS => Ok(WalRecord::ChunkMetas(bincode::deserialize(body)?)),
            other => Err(DecodeError::UnknownRecordType(other)),
        }
    }
}

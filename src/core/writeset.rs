//! Replicated write-set unit carried by the ordered group stream.

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;
use uuid::Uuid;

use crate::core::Seqno;

/// A serialized transaction payload with its ordering metadata.
///
/// `depends_seqno == UNDEFINED` marks a write-set with no apply side-effect;
/// such write-sets only occupy their monitor slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteSet {
    pub source_id: Uuid,
    pub seqno: Seqno,
    pub depends_seqno: Seqno,
    pub checksum: u32,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
#[error("write-set {seqno} checksum mismatch: expected {expected} got {got}")]
pub struct ChecksumMismatch {
    pub seqno: Seqno,
    pub expected: u32,
    pub got: u32,
}

impl WriteSet {
    pub fn new(source_id: Uuid, seqno: Seqno, depends_seqno: Seqno, payload: Bytes) -> Self {
        let checksum = crc32c(&payload);
        WriteSet {
            source_id,
            seqno,
            depends_seqno,
            checksum,
            payload,
        }
    }

    /// Verify the payload against the recorded checksum before apply.
    pub fn verify_checksum(&self) -> Result<(), ChecksumMismatch> {
        let got = crc32c(&self.payload);
        if got != self.checksum {
            return Err(ChecksumMismatch {
                seqno: self.seqno,
                expected: self.checksum,
                got,
            });
        }
        Ok(())
    }
}

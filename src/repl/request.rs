//! State-transfer request envelope framing (v0/v1).
//!
//! Byte layout is fixed for interoperability with peers running older code:
//! v0 is an opaque snapshot request, v1 is
//! `"STRv1\0" || u32_be(sst_len) || sst || u32_be(ist_len) || ist`.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Version marker, including the trailing NUL. Version detection checks all
/// six bytes so a v0 payload that merely starts with "STRv1" is not
/// misclassified.
pub const MAGIC: &[u8; 6] = b"STRv1\0";

const LEN_FIELD: usize = 4;
const MIN_V1_LEN: usize = MAGIC.len() + 2 * LEN_FIELD;
const MAX_SUB_LEN: usize = i32::MAX as usize;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{side} request length unrepresentable: max {max} got {got}")]
    MsgTooLarge {
        side: &'static str,
        max: usize,
        got: usize,
    },
    #[error("malformed state-transfer request: {reason}")]
    Malformed { reason: String },
}

fn malformed(reason: impl Into<String>) -> RequestError {
    RequestError::Malformed {
        reason: reason.into(),
    }
}

/// Decoded state-transfer request envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateRequest {
    V0 { sst: Bytes },
    V1 { sst: Bytes, ist: Bytes },
}

impl StateRequest {
    pub fn v0(sst: Bytes) -> Self {
        StateRequest::V0 { sst }
    }

    /// Build a v1 envelope. Either sub-payload may be empty but not both,
    /// and each must fit a signed 32-bit length.
    pub fn v1(sst: Bytes, ist: Bytes) -> Result<Self, RequestError> {
        if sst.len() > MAX_SUB_LEN {
            return Err(RequestError::MsgTooLarge {
                side: "snapshot",
                max: MAX_SUB_LEN,
                got: sst.len(),
            });
        }
        if ist.len() > MAX_SUB_LEN {
            return Err(RequestError::MsgTooLarge {
                side: "incremental",
                max: MAX_SUB_LEN,
                got: ist.len(),
            });
        }
        if sst.is_empty() && ist.is_empty() {
            return Err(malformed("v1 envelope with both sub-payloads empty"));
        }
        Ok(StateRequest::V1 { sst, ist })
    }

    pub fn sst(&self) -> &[u8] {
        match self {
            StateRequest::V0 { sst } | StateRequest::V1 { sst, .. } => sst,
        }
    }

    pub fn ist(&self) -> &[u8] {
        match self {
            StateRequest::V0 { .. } => &[],
            StateRequest::V1 { ist, .. } => ist,
        }
    }

    pub fn has_ist(&self) -> bool {
        !self.ist().is_empty()
    }

    pub fn encode(&self) -> Bytes {
        match self {
            StateRequest::V0 { sst } => sst.clone(),
            StateRequest::V1 { sst, ist } => {
                let mut buf = BytesMut::with_capacity(MIN_V1_LEN + sst.len() + ist.len());
                buf.put_slice(MAGIC);
                buf.put_u32(sst.len() as u32);
                buf.put_slice(sst);
                buf.put_u32(ist.len() as u32);
                buf.put_slice(ist);
                buf.freeze()
            }
        }
    }

    pub fn decode(bytes: Bytes) -> Result<Self, RequestError> {
        if !bytes.starts_with(MAGIC) {
            return Ok(StateRequest::V0 { sst: bytes });
        }
        if bytes.len() < MIN_V1_LEN {
            return Err(malformed(format!(
                "v1 request too short: {} bytes, need at least {MIN_V1_LEN}",
                bytes.len()
            )));
        }

        let sst_len = read_len(&bytes, MAGIC.len())?;
        let ist_offset = MAGIC.len() + LEN_FIELD + sst_len;
        if ist_offset + LEN_FIELD > bytes.len() {
            return Err(malformed(format!(
                "sst length {sst_len} exceeds request length {}",
                bytes.len()
            )));
        }

        let ist_len = read_len(&bytes, ist_offset)?;
        if ist_offset + LEN_FIELD + ist_len != bytes.len() {
            return Err(malformed(format!(
                "parsed field lengths {sst_len}+{ist_len} do not cover request length {}",
                bytes.len()
            )));
        }

        if sst_len == 0 && ist_len == 0 {
            return Err(malformed("v1 envelope with both sub-payloads empty"));
        }

        let sst = bytes.slice(MAGIC.len() + LEN_FIELD..ist_offset);
        let ist = bytes.slice(ist_offset + LEN_FIELD..);
        Ok(StateRequest::V1 { sst, ist })
    }
}

fn read_len(bytes: &[u8], offset: usize) -> Result<usize, RequestError> {
    let raw = u32::from_be_bytes(
        bytes[offset..offset + LEN_FIELD]
            .try_into()
            .expect("length field slice"),
    );
    let len = raw as usize;
    if len > MAX_SUB_LEN {
        return Err(malformed(format!(
            "sub-payload length {len} outside signed 32-bit range"
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1(sst: &'static [u8], ist: &'static [u8]) -> StateRequest {
        StateRequest::v1(Bytes::from_static(sst), Bytes::from_static(ist)).unwrap()
    }

    #[test]
    fn v1_roundtrip_both_payloads() {
        let req = v1(b"xtrabackup", b"uuid:0-5|tcp://joiner:4568");
        let decoded = StateRequest::decode(req.encode()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.sst(), b"xtrabackup");
        assert_eq!(decoded.ist(), b"uuid:0-5|tcp://joiner:4568");
    }

    #[test]
    fn v1_roundtrip_empty_sst() {
        let req = v1(b"", b"ist-req");
        let decoded = StateRequest::decode(req.encode()).unwrap();
        assert!(decoded.sst().is_empty());
        assert!(decoded.has_ist());
    }

    #[test]
    fn v1_roundtrip_empty_ist() {
        let req = v1(b"rsync", b"");
        let decoded = StateRequest::decode(req.encode()).unwrap();
        assert_eq!(decoded.sst(), b"rsync");
        assert!(!decoded.has_ist());
    }

    #[test]
    fn v1_rejects_both_empty() {
        let err = StateRequest::v1(Bytes::new(), Bytes::new()).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));

        let mut wire = BytesMut::new();
        wire.put_slice(MAGIC);
        wire.put_u32(0);
        wire.put_u32(0);
        let err = StateRequest::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }

    #[test]
    fn short_v1_buffer_is_malformed() {
        let mut wire = BytesMut::new();
        wire.put_slice(MAGIC);
        wire.put_u32(0);
        // second length prefix missing
        let err = StateRequest::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }

    #[test]
    fn sst_length_beyond_buffer_is_malformed() {
        let mut wire = BytesMut::new();
        wire.put_slice(MAGIC);
        wire.put_u32(100);
        wire.put_slice(b"short");
        wire.put_u32(0);
        let err = StateRequest::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }

    #[test]
    fn trailing_bytes_after_ist_are_malformed() {
        let mut wire = BytesMut::new();
        wire.put_slice(MAGIC);
        wire.put_u32(1);
        wire.put_slice(b"s");
        wire.put_u32(1);
        wire.put_slice(b"i");
        wire.put_slice(b"junk");
        let err = StateRequest::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }

    #[test]
    fn magic_without_nul_decodes_as_v0() {
        // A v0 payload that happens to start with the five magic letters must
        // stay v0: the version check covers the trailing NUL as well.
        let raw = Bytes::from_static(b"STRv1-lookalike");
        let decoded = StateRequest::decode(raw.clone()).unwrap();
        assert_eq!(decoded, StateRequest::V0 { sst: raw });
    }

    #[test]
    fn v0_passthrough_is_opaque() {
        let raw = Bytes::from_static(b"mysqldump");
        let decoded = StateRequest::decode(raw.clone()).unwrap();
        assert_eq!(decoded.sst(), b"mysqldump");
        assert!(!decoded.has_ist());
        assert_eq!(decoded.encode(), raw);
    }

    #[test]
    fn sub_length_outside_signed_range_is_malformed() {
        let mut wire = BytesMut::new();
        wire.put_slice(MAGIC);
        wire.put_u32(0x8000_0000);
        wire.put_u32(0);
        let err = StateRequest::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }
}

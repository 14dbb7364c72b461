//! Joiner-to-donor incremental-transfer descriptor.
//!
//! Text form: `<uuid>:<last_applied>-<group_seqno>|<peer>`, carried verbatim
//! as the IST sub-payload of a v1 request envelope (NUL-terminated on the
//! wire, matching the C-string framing of older peers).

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::Seqno;

/// Canonical hyphenated uuid length.
const UUID_LEN: usize = 36;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("malformed descriptor field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("empty seqno interval: last applied {last_applied} >= group seqno {group_seqno}")]
    EmptyInterval {
        last_applied: Seqno,
        group_seqno: Seqno,
    },
}

fn malformed(field: &'static str, reason: impl Into<String>) -> DescriptorError {
    DescriptorError::Malformed {
        field,
        reason: reason.into(),
    }
}

/// Parsed IST descriptor: receive address, history uuid and seqno interval.
///
/// The donor streams `last_applied + 1 ..= group_seqno` to `peer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IstRequest {
    pub uuid: Uuid,
    pub last_applied: Seqno,
    pub group_seqno: Seqno,
    pub peer: String,
}

impl IstRequest {
    pub fn new(
        uuid: Uuid,
        last_applied: Seqno,
        group_seqno: Seqno,
        peer: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        if last_applied >= group_seqno {
            return Err(DescriptorError::EmptyInterval {
                last_applied,
                group_seqno,
            });
        }
        let peer = peer.into();
        if peer.is_empty() {
            return Err(malformed("peer", "empty receive address"));
        }
        Ok(IstRequest {
            uuid,
            last_applied,
            group_seqno,
            peer,
        })
    }

    /// Wire form of the descriptor, NUL terminator included.
    pub fn to_payload(&self) -> Bytes {
        let mut text = self.to_string().into_bytes();
        text.push(0);
        Bytes::from(text)
    }

    /// Parse the IST sub-payload of a request envelope. A single trailing
    /// NUL from the C-string framing is tolerated.
    pub fn parse_payload(payload: &[u8]) -> Result<Self, DescriptorError> {
        let trimmed = payload.strip_suffix(&[0]).unwrap_or(payload);
        let text = std::str::from_utf8(trimmed)
            .map_err(|err| malformed("descriptor", format!("not utf-8: {err}")))?;
        text.parse()
    }
}

impl fmt::Display for IstRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}|{}",
            self.uuid, self.last_applied, self.group_seqno, self.peer
        )
    }
}

impl FromStr for IstRequest {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < UUID_LEN + 1 || s.as_bytes()[UUID_LEN] != b':' {
            return Err(malformed("uuid", "expected 36-character uuid followed by ':'"));
        }
        let uuid = Uuid::try_parse(&s[..UUID_LEN])
            .map_err(|err| malformed("uuid", err.to_string()))?;

        let rest = &s[UUID_LEN + 1..];
        let (interval, peer) = rest
            .split_once('|')
            .ok_or_else(|| malformed("peer", "missing '|' separator"))?;

        let (last_applied, group_seqno) = split_interval(interval)?;
        IstRequest::new(uuid, last_applied, group_seqno, peer)
    }
}

/// Split `<last_applied>-<group_seqno>`. The first seqno may itself carry a
/// leading '-' (the undefined sentinel), so the separator search starts past
/// any sign character.
fn split_interval(interval: &str) -> Result<(Seqno, Seqno), DescriptorError> {
    let start = usize::from(interval.starts_with('-'));
    let sep = interval[start..]
        .find('-')
        .map(|idx| idx + start)
        .ok_or_else(|| malformed("interval", "missing '-' separator"))?;

    let last_applied = parse_seqno("last_applied", &interval[..sep])?;
    let group_seqno = parse_seqno("group_seqno", &interval[sep + 1..])?;
    Ok((last_applied, group_seqno))
}

fn parse_seqno(field: &'static str, raw: &str) -> Result<Seqno, DescriptorError> {
    raw.parse::<i64>()
        .map(Seqno::new)
        .map_err(|err| malformed(field, format!("{err}: {raw:?}")))
}

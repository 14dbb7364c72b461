//! Global transaction identity: history uuid plus group-assigned ordinal.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordinal assigned by the group to every replicated write-set.
///
/// Seqnos are signed so that `UNDEFINED` (-1) can denote "no position".
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Seqno(i64);

impl Seqno {
    pub const UNDEFINED: Seqno = Seqno(-1);

    pub const fn new(value: i64) -> Self {
        Seqno(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_defined(self) -> bool {
        self.0 >= 0
    }

    pub const fn next(self) -> Seqno {
        Seqno(self.0 + 1)
    }

    /// Number of write-sets in the half-open gap `self..other`.
    pub const fn gap_to(self, other: Seqno) -> i64 {
        other.0 - self.0
    }
}

impl From<i64> for Seqno {
    fn from(value: i64) -> Self {
        Seqno(value)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point in replication history: `(uuid, seqno)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gtid {
    pub uuid: Uuid,
    pub seqno: Seqno,
}

impl Gtid {
    pub const fn new(uuid: Uuid, seqno: Seqno) -> Self {
        Gtid { uuid, seqno }
    }

    pub fn undefined() -> Self {
        Gtid::new(Uuid::nil(), Seqno::UNDEFINED)
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.seqno)
    }
}

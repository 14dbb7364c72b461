//! Core replication types shared by the coordinator modules.

mod gtid;
mod writeset;

pub use gtid::{Gtid, Seqno};
pub use writeset::{ChecksumMismatch, WriteSet};

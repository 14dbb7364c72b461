#![forbid(unsafe_code)]

//! # replicore
//!
//! State-transfer coordinator for a synchronous multi-master replication
//! engine. When a node joins a primary component whose transaction stream
//! is ahead of its local state, the coordinator negotiates, frames and
//! drives either a full State Snapshot Transfer (SST) from a donor or an
//! Incremental State Transfer (IST) replayed from the donor's write-set
//! cache, persisting recovery markers along the way so that any crash
//! leaves the node recoverable.
//!
//! The crate is a library: group communication, the snapshot script pair,
//! the write-set applier and the certification engine are collaborators
//! wired in through the traits in [`repl::coordinator`].

pub mod config;
pub mod core;
pub mod error;
pub mod repl;
pub mod telemetry;

pub use config::{CommitOrder, Config, FatalAction};
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience.
pub use crate::core::{Gtid, Seqno, WriteSet};
pub use crate::repl::{
    ApplyError, Coordinator, GroupComm, IstReceiver, IstRequest, IstSenderPool, Marker,
    MarkerStore, Monitor, NodeState, RequestOutcome, SeqnoLockGuard, SnapshotHandler, SstState,
    StateRequest, TransferError, TransferKind, ViewInfo, WriteSetApplier, WriteSetCache,
};

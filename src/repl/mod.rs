//! State-transfer coordinator modules.

pub mod cache;
pub mod coordinator;
pub mod descriptor;
mod donor;
pub mod ist;
mod joiner;
pub mod marker;
pub mod monitor;
pub mod request;

pub use cache::{CacheError, SeqnoLockGuard, WriteSetCache};
pub use coordinator::{
    ApplyError, Coordinator, GroupComm, LEGACY_SKIP_SST, NodeState, RequestOutcome,
    SnapshotHandler, SstState, TRIVIAL_SST, TransferError, TransferKind, ViewInfo,
    WriteSetApplier,
};
pub use descriptor::{DescriptorError, IstRequest};
pub use ist::{FrameError, IstError, IstReceiver, IstSenderPool};
pub use marker::{Marker, MarkerError, MarkerStore};
pub use monitor::Monitor;
pub use request::{MAGIC, RequestError, StateRequest};

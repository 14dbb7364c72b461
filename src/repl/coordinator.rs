//! Coordinator state, collaborator seams and boundary errors.
//!
//! The coordinator is a single owner per group connection: all joiner and
//! donor entry points borrow it, and callbacks from the snapshot wrapper and
//! the group layer reach it through `Arc`.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;

use crate::config::{Config, FatalAction};
use crate::core::{Gtid, Seqno, WriteSet};
use crate::repl::cache::WriteSetCache;
use crate::repl::ist::{IstReceiver, IstSenderPool};
use crate::repl::marker::{MarkerError, MarkerStore};
use crate::repl::monitor::Monitor;

/// Snapshot request sentinel: the joiner needs no data copied, only the
/// position notification.
pub const TRIVIAL_SST: &str = "trivial";

/// Legacy skip sentinel still emitted by older peers; accepted on decode,
/// never emitted.
pub const LEGACY_SKIP_SST: &str = "none";

/// Errors crossing the coordinator's system boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("operation canceled")]
    Canceled,
    #[error("requested data no longer available")]
    NoData,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("resource deadlock avoided")]
    Deadlock,
    #[error("resource temporarily unavailable")]
    TryAgain,
    #[error("transport not connected")]
    NotConnected,
    #[error("message too large")]
    MessageTooLarge,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("connection failed")]
    ConnectionFailed,
}

impl TransferError {
    /// Whether retrying the request may succeed without operator action.
    pub fn is_transient(self) -> bool {
        matches!(self, TransferError::TryAgain | TransferError::NotConnected)
    }
}

/// Coordinator lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Connected,
    Joining,
    Joined,
    Synced,
    Donor,
    Closing,
    Closed,
}

impl NodeState {
    /// Whether the connection is still live (send failures unexpected).
    pub fn is_live(self) -> bool {
        !matches!(self, NodeState::Closing | NodeState::Closed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Connected => "CONNECTED",
            NodeState::Joining => "JOINING",
            NodeState::Joined => "JOINED",
            NodeState::Synced => "SYNCED",
            NodeState::Donor => "DONOR",
            NodeState::Closing => "CLOSING",
            NodeState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Snapshot-transfer result state, ordered so that `< ReqFailed` selects the
/// states in which a prepared incremental transfer may still run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SstState {
    Idle,
    Wait,
    Canceled,
    ReqFailed,
    Failed,
}

/// Which transfer mechanism completed last.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    None,
    Snapshot,
    Incremental,
}

/// Primary-component view summary delivered by the group layer.
#[derive(Clone, Copy, Debug)]
pub struct ViewInfo {
    /// The group reported the local state as behind the component's.
    pub state_gap: bool,
    /// The component's position.
    pub state_id: Gtid,
}

/// Outcome of emitting a state-transfer request through the group layer.
#[derive(Clone, Copy, Debug)]
pub struct RequestOutcome {
    /// Donor index on success, negative boundary error otherwise.
    pub order: Result<i64, TransferError>,
    /// Local sequence allocated for the request action, when delivery got
    /// far enough to order it.
    pub local_seqno: Option<Seqno>,
}

/// Group-communication contract.
pub trait GroupComm: Send + Sync {
    fn request_state_transfer(
        &self,
        proto_ver: u8,
        request: &[u8],
        donor_hint: &str,
        ist_uuid: Uuid,
        ist_seqno: Seqno,
    ) -> RequestOutcome;

    /// Announce transfer completion: donor seqno on success, the failure
    /// code otherwise.
    fn join(&self, result: Result<Seqno, TransferError>);

    /// Close the group connection.
    fn close(&self) {}
}

/// Snapshot donation callback, invoked on the donor. In bypass mode it must
/// return as soon as the joiner has been notified.
pub trait SnapshotHandler: Send + Sync {
    fn donate(&self, request: &[u8], gtid: Gtid, bypass: bool) -> Result<(), TransferError>;
}

#[derive(Debug, Error)]
#[error("apply failed at {seqno}: {reason}")]
pub struct ApplyError {
    pub seqno: Seqno,
    pub reason: String,
}

/// Write-set applier used while draining the incremental stream.
pub trait WriteSetApplier: Send + Sync {
    fn apply(&self, ws: &WriteSet) -> Result<(), ApplyError>;
}

#[derive(Debug)]
pub(crate) struct SstTracker {
    pub(crate) state: SstState,
    pub(crate) uuid: Uuid,
    pub(crate) seqno: Seqno,
    /// Failure code reported by the completion callback, if any.
    pub(crate) error: Option<TransferError>,
    /// Completion flag paired with `sst_cond`; set after the result fields
    /// are stored so the waiter observes a consistent view.
    pub(crate) received: bool,
}

/// State-transfer coordinator for one group connection.
pub struct Coordinator {
    pub(crate) config: Config,
    pub(crate) group: Arc<dyn GroupComm>,
    pub(crate) snapshot: Arc<dyn SnapshotHandler>,
    pub(crate) applier: Arc<dyn WriteSetApplier>,
    pub(crate) cache: Arc<WriteSetCache>,
    pub(crate) marker: Mutex<MarkerStore>,
    state: Mutex<NodeState>,
    position: Mutex<Gtid>,
    pub(crate) sst: Mutex<SstTracker>,
    pub(crate) sst_cond: Condvar,
    pub(crate) local_monitor: Monitor,
    pub(crate) apply_monitor: Monitor,
    pub(crate) commit_monitor: Monitor,
    pub(crate) ist_receiver: Mutex<Option<IstReceiver>>,
    pub(crate) ist_senders: IstSenderPool,
    /// Seqno of the last delivered view change; upper bound of outgoing
    /// incremental streams.
    view_seqno: AtomicI64,
    last_transfer: Mutex<TransferKind>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        initial_position: Gtid,
        group: Arc<dyn GroupComm>,
        snapshot: Arc<dyn SnapshotHandler>,
        applier: Arc<dyn WriteSetApplier>,
        cache: Arc<WriteSetCache>,
    ) -> Result<Self, MarkerError> {
        let marker = MarkerStore::open(&config.marker_path)?;
        let window = config.monitor_window;
        let coordinator = Coordinator {
            group,
            snapshot,
            applier,
            cache,
            marker: Mutex::new(marker),
            state: Mutex::new(NodeState::Connected),
            position: Mutex::new(initial_position),
            sst: Mutex::new(SstTracker {
                state: SstState::Idle,
                uuid: Uuid::nil(),
                seqno: Seqno::UNDEFINED,
                error: None,
                received: false,
            }),
            sst_cond: Condvar::new(),
            local_monitor: Monitor::new("local-order", window),
            apply_monitor: Monitor::new("apply-order", window),
            commit_monitor: Monitor::new("commit-order", window),
            ist_receiver: Mutex::new(None),
            ist_senders: IstSenderPool::new(),
            view_seqno: AtomicI64::new(initial_position.seqno.get()),
            last_transfer: Mutex::new(TransferKind::None),
            config,
        };
        coordinator
            .apply_monitor
            .set_initial_position(initial_position.seqno);
        coordinator
            .commit_monitor
            .set_initial_position(initial_position.seqno);
        Ok(coordinator)
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn shift_to(&self, next: NodeState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != next {
            tracing::info!("shifting {} -> {next}", *state);
            *state = next;
        }
    }

    /// Local position: history uuid and the highest durably applied seqno.
    pub fn position(&self) -> Gtid {
        *self.position.lock().expect("position lock poisoned")
    }

    pub(crate) fn set_position(&self, gtid: Gtid) {
        *self.position.lock().expect("position lock poisoned") = gtid;
    }

    pub fn last_transfer(&self) -> TransferKind {
        *self
            .last_transfer
            .lock()
            .expect("last transfer lock poisoned")
    }

    pub(crate) fn record_transfer(&self, kind: TransferKind) {
        *self
            .last_transfer
            .lock()
            .expect("last transfer lock poisoned") = kind;
    }

    /// Record a delivered view change; outgoing incremental streams extend
    /// through this seqno.
    pub fn set_view_seqno(&self, seqno: Seqno) {
        self.view_seqno.store(seqno.get(), Ordering::Release);
    }

    pub fn view_seqno(&self) -> Seqno {
        Seqno::new(self.view_seqno.load(Ordering::Acquire))
    }

    /// Whether joining the delivered primary component requires a state
    /// transfer at all.
    pub fn state_transfer_required(&self, view: &ViewInfo) -> bool {
        if !view.state_gap {
            return false;
        }
        let position = self.position();
        if position.uuid == view.state_id.uuid {
            // Common history: only a seqno gap matters.
            return position.seqno < view.state_id.seqno;
        }
        true
    }

    /// Snapshot completion callback, invoked by the snapshot script wrapper
    /// on the joiner.
    ///
    /// Accepted while JOINING, and also while still CONNECTED: the donor can
    /// finish a bypass snapshot before the joiner's send loop has returned
    /// and shifted state. Any other state is a protocol violation.
    pub fn sst_received(
        &self,
        state_id: Gtid,
        result: Result<(), TransferError>,
    ) -> Result<(), TransferError> {
        match result {
            Ok(()) => tracing::info!("snapshot received: {state_id}"),
            Err(TransferError::Canceled) => tracing::info!("snapshot request was cancelled"),
            Err(err) => tracing::warn!("snapshot failed: {err}"),
        }

        {
            let mut sst = self.sst.lock().expect("sst lock poisoned");
            if result == Err(TransferError::Canceled) {
                sst.state = SstState::Canceled;
            }
            sst.uuid = state_id.uuid;
            sst.seqno = if result.is_ok() {
                state_id.seqno
            } else {
                Seqno::UNDEFINED
            };
            sst.error = result.err();
            sst.received = true;
            self.sst_cond.notify_all();
        }

        // State is checked only after the waiter has been signalled;
        // otherwise a failed request would leave it blocked forever.
        let state = self.state();
        if matches!(state, NodeState::Joining | NodeState::Connected) {
            Ok(())
        } else {
            tracing::error!("not JOINING when snapshot completion arrived, state: {state}");
            Err(TransferError::ConnectionFailed)
        }
    }

    pub(crate) fn lock_sst(&self) -> MutexGuard<'_, SstTracker> {
        self.sst.lock().expect("sst lock poisoned")
    }

    pub(crate) fn close(&self) {
        self.shift_to(NodeState::Closing);
        self.group.close();
    }

    /// Stop the transfer machinery: close any prepared incremental receiver
    /// and wait for outstanding incremental senders to release their cache
    /// locks.
    pub fn shutdown(&self) {
        self.teardown_ist_receiver();
        self.ist_senders.join_all();
        self.shift_to(NodeState::Closed);
    }

    /// Fail-stop chokepoint: anything that could leave the local database
    /// inconsistent with the group ends the process here.
    pub(crate) fn fatal(&self, msg: &str) -> ! {
        tracing::error!("{msg}");
        match self.config.fatal_action {
            FatalAction::Abort => std::process::abort(),
            FatalAction::Panic => panic!("{msg}"),
        }
    }

    /// Marker persistence failures void every recovery guarantee, so they
    /// are fail-stop as well.
    pub(crate) fn marker_op(&self, op: impl FnOnce(&mut MarkerStore) -> Result<(), MarkerError>) {
        let result = {
            let mut marker = self.marker.lock().expect("marker lock poisoned");
            op(&mut marker)
        };
        if let Err(err) = result {
            self.fatal(&format!("recovery marker update failed: {err}"));
        }
    }

    /// Extract the NUL-terminated method string from a snapshot sub-payload.
    pub(crate) fn sst_str(payload: &[u8]) -> &[u8] {
        match payload.iter().position(|b| *b == 0) {
            Some(nul) => &payload[..nul],
            None => payload,
        }
    }

    pub(crate) fn sst_is_trivial(payload: &[u8]) -> bool {
        Self::sst_str(payload) == TRIVIAL_SST.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_the_retryable_set() {
        assert!(TransferError::TryAgain.is_transient());
        assert!(TransferError::NotConnected.is_transient());
        assert!(!TransferError::NoData.is_transient());
        assert!(!TransferError::Canceled.is_transient());
        assert!(!TransferError::Deadlock.is_transient());
    }

    #[test]
    fn sst_state_orders_runnable_before_failed() {
        assert!(SstState::Idle < SstState::ReqFailed);
        assert!(SstState::Wait < SstState::ReqFailed);
        assert!(SstState::Canceled < SstState::ReqFailed);
        assert!(SstState::ReqFailed < SstState::Failed);
    }

    #[test]
    fn sst_str_stops_at_nul() {
        assert_eq!(Coordinator::sst_str(b"trivial\0garbage"), b"trivial");
        assert_eq!(Coordinator::sst_str(b"xtrabackup"), b"xtrabackup");
        assert!(Coordinator::sst_is_trivial(b"trivial"));
        assert!(Coordinator::sst_is_trivial(b"trivial\0"));
        assert!(!Coordinator::sst_is_trivial(b"trivially"));
    }

    #[test]
    fn closing_states_are_not_live() {
        assert!(NodeState::Connected.is_live());
        assert!(NodeState::Joining.is_live());
        assert!(!NodeState::Closing.is_live());
        assert!(!NodeState::Closed.is_live());
    }
}

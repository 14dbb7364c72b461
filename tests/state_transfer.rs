//! End-to-end state-transfer scenarios.
//!
//! A joiner and a donor coordinator live in the same process (as they do in
//! production: the joiner receives its own request action) and are wired
//! through scripted collaborator doubles: the group layer delivers the
//! request to the donor synchronously, the snapshot handler plays the
//! donor/joiner script pair, and the applier records the replayed
//! write-sets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use bytes::Bytes;
use tempfile::TempDir;
use uuid::Uuid;

use replicore::repl::{MarkerStore, TRIVIAL_SST};
use replicore::{
    ApplyError, CommitOrder, Config, Coordinator, FatalAction, GroupComm, Gtid, NodeState,
    RequestOutcome, Seqno, SnapshotHandler, TransferError, TransferKind, ViewInfo, WriteSet,
    WriteSetApplier, WriteSetCache,
};

fn group_uuid() -> Uuid {
    Uuid::try_parse("8c16fb77-4b1a-4a03-9d5e-6f2a90c31d44").unwrap()
}

fn seq(value: i64) -> Seqno {
    Seqno::new(value)
}

fn writeset(seqno: i64) -> WriteSet {
    WriteSet::new(
        group_uuid(),
        seq(seqno),
        seq(seqno - 1),
        Bytes::from(format!("trx-{seqno}")),
    )
}

// ---------------------------------------------------------------------------
// Collaborator doubles

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SnapshotScript {
    /// Copy "completes" immediately: joiner gets the donated position.
    Deliver,
    /// User cancels on the joiner side after the copy starts.
    Cancel,
    /// Script ships a database from a different history.
    WrongHistory(Uuid),
}

#[derive(Debug)]
struct DonateCall {
    request: Vec<u8>,
    gtid: Gtid,
    bypass: bool,
}

struct TestSnapshot {
    script: Mutex<SnapshotScript>,
    joiner: OnceLock<Arc<Coordinator>>,
    donor: OnceLock<Arc<Coordinator>>,
    calls: Mutex<Vec<DonateCall>>,
}

impl TestSnapshot {
    fn new() -> Self {
        TestSnapshot {
            script: Mutex::new(SnapshotScript::Deliver),
            joiner: OnceLock::new(),
            donor: OnceLock::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn set_script(&self, script: SnapshotScript) {
        *self.script.lock().unwrap() = script;
    }

    fn invocations(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl SnapshotHandler for TestSnapshot {
    fn donate(&self, request: &[u8], gtid: Gtid, bypass: bool) -> Result<(), TransferError> {
        self.calls.lock().unwrap().push(DonateCall {
            request: request.to_vec(),
            gtid,
            bypass,
        });
        let joiner = self.joiner.get().expect("joiner wired").clone();
        let donor = self.donor.get().expect("donor wired").clone();

        match *self.script.lock().unwrap() {
            SnapshotScript::Deliver => {
                joiner.sst_received(gtid, Ok(())).unwrap();
                donor.sst_sent(gtid, Ok(()));
            }
            SnapshotScript::Cancel => {
                joiner
                    .sst_received(Gtid::undefined(), Err(TransferError::Canceled))
                    .unwrap();
            }
            SnapshotScript::WrongHistory(uuid) => {
                joiner
                    .sst_received(Gtid::new(uuid, gtid.seqno), Ok(()))
                    .unwrap();
                donor.sst_sent(gtid, Ok(()));
            }
        }
        Ok(())
    }
}

struct TestApplier {
    applied: Mutex<Vec<i64>>,
    fail_at: Mutex<Option<i64>>,
}

impl TestApplier {
    fn new() -> Self {
        TestApplier {
            applied: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
        }
    }

    fn applied(&self) -> Vec<i64> {
        self.applied.lock().unwrap().clone()
    }
}

impl WriteSetApplier for TestApplier {
    fn apply(&self, ws: &WriteSet) -> Result<(), ApplyError> {
        if *self.fail_at.lock().unwrap() == Some(ws.seqno.get()) {
            return Err(ApplyError {
                seqno: ws.seqno,
                reason: "duplicate key".to_string(),
            });
        }
        self.applied.lock().unwrap().push(ws.seqno.get());
        Ok(())
    }
}

/// In-process group layer: delivers the request action to the donor on the
/// caller's stack and routes the donor's decision-phase failures back as
/// the request result, the way the transport reports them to the joiner.
struct TestGroup {
    donor: OnceLock<Arc<Coordinator>>,
    snapshot: OnceLock<Arc<TestSnapshot>>,
    donor_seq: Seqno,
    scripted_errors: Mutex<VecDeque<TransferError>>,
    joins: Mutex<Vec<Result<Seqno, TransferError>>>,
    requests: Mutex<Vec<Vec<u8>>>,
    joiner_local_seq: AtomicI64,
    donor_local_seq: AtomicI64,
    closed: AtomicBool,
}

impl TestGroup {
    fn new(donor_seq: Seqno) -> Self {
        TestGroup {
            donor: OnceLock::new(),
            snapshot: OnceLock::new(),
            donor_seq,
            scripted_errors: Mutex::new(VecDeque::new()),
            joins: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            joiner_local_seq: AtomicI64::new(0),
            donor_local_seq: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn script_error(&self, err: TransferError) {
        self.scripted_errors.lock().unwrap().push_back(err);
    }

    fn joins(&self) -> Vec<Result<Seqno, TransferError>> {
        self.joins.lock().unwrap().clone()
    }

    fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    fn was_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl GroupComm for TestGroup {
    fn request_state_transfer(
        &self,
        _proto_ver: u8,
        request: &[u8],
        _donor_hint: &str,
        _ist_uuid: Uuid,
        _ist_seqno: Seqno,
    ) -> RequestOutcome {
        let local_seqno = seq(self.joiner_local_seq.fetch_add(1, Ordering::SeqCst));

        if let Some(err) = self.scripted_errors.lock().unwrap().pop_front() {
            return RequestOutcome {
                order: Err(err),
                local_seqno: Some(local_seqno),
            };
        }

        self.requests.lock().unwrap().push(request.to_vec());

        let donor = self.donor.get().expect("donor wired").clone();
        let snapshot = self.snapshot.get().expect("snapshot wired");
        let donates_before = snapshot.invocations();
        let joins_before = self.joins.lock().unwrap().len();

        let donor_local = seq(self.donor_local_seq.fetch_add(1, Ordering::SeqCst));
        donor.process_state_req(request, donor_local, self.donor_seq, "joiner-0");

        // A failure decided before any snapshot callback ran never started
        // a transfer; the transport reports it as the request result.
        if snapshot.invocations() == donates_before {
            let first_error = self.joins.lock().unwrap()[joins_before..]
                .iter()
                .find_map(|join| join.err());
            if let Some(err) = first_error {
                return RequestOutcome {
                    order: Err(err),
                    local_seqno: Some(local_seqno),
                };
            }
        }

        RequestOutcome {
            order: Ok(1),
            local_seqno: Some(local_seqno),
        }
    }

    fn join(&self, result: Result<Seqno, TransferError>) {
        self.joins.lock().unwrap().push(result);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Fixture

struct Cluster {
    group: Arc<TestGroup>,
    snapshot: Arc<TestSnapshot>,
    applier: Arc<TestApplier>,
    joiner: Arc<Coordinator>,
    donor: Arc<Coordinator>,
    donor_cache: Arc<WriteSetCache>,
    joiner_marker_path: std::path::PathBuf,
    _dir: TempDir,
}

fn config(dir: &TempDir, name: &str) -> Config {
    Config {
        retry_interval_ms: 10,
        marker_path: dir.path().join(format!("{name}-marker.json")),
        fatal_action: FatalAction::Panic,
        commit_order: CommitOrder::Strict,
        ..Config::default()
    }
}

/// Wire a joiner at `joiner_pos` against a donor at `(group_uuid, donor_seq)`
/// whose cache retains `cached` write-sets.
fn cluster(joiner_pos: Gtid, donor_seq: Seqno, cached: std::ops::RangeInclusive<i64>) -> Cluster {
    let dir = TempDir::new().unwrap();
    let group = Arc::new(TestGroup::new(donor_seq));
    let snapshot = Arc::new(TestSnapshot::new());
    let applier = Arc::new(TestApplier::new());

    let joiner_cache = Arc::new(WriteSetCache::new(joiner_pos.uuid, 1024));
    let donor_cache = Arc::new(WriteSetCache::new(group_uuid(), 1024));
    for s in cached {
        donor_cache.append(writeset(s));
    }

    let joiner_marker_path = dir.path().join("joiner-marker.json");
    let joiner_config = Config {
        marker_path: joiner_marker_path.clone(),
        ..config(&dir, "joiner")
    };
    let joiner = Arc::new(
        Coordinator::new(
            joiner_config,
            joiner_pos,
            group.clone(),
            snapshot.clone(),
            applier.clone(),
            joiner_cache,
        )
        .unwrap(),
    );

    let donor_applier: Arc<dyn WriteSetApplier> = Arc::new(TestApplier::new());
    let donor = Arc::new(
        Coordinator::new(
            config(&dir, "donor"),
            Gtid::new(group_uuid(), donor_seq),
            group.clone(),
            snapshot.clone(),
            donor_applier,
            donor_cache.clone(),
        )
        .unwrap(),
    );

    group.donor.set(donor.clone()).ok().unwrap();
    group.snapshot.set(snapshot.clone()).ok().unwrap();
    snapshot.joiner.set(joiner.clone()).ok().unwrap();
    snapshot.donor.set(donor.clone()).ok().unwrap();

    Cluster {
        group,
        snapshot,
        applier,
        joiner,
        donor,
        donor_cache,
        joiner_marker_path,
        _dir: dir,
    }
}

fn reopen_marker(cluster: &Cluster) -> MarkerStore {
    MarkerStore::open(&cluster.joiner_marker_path).unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios

#[test]
fn pure_snapshot_for_fresh_joiner() {
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);

    cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), b"xb")
        .unwrap();

    assert_eq!(cluster.joiner.position(), Gtid::new(group_uuid(), seq(100)));
    assert_eq!(cluster.joiner.last_transfer(), TransferKind::Snapshot);

    let calls = cluster.snapshot.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].bypass);
    assert_eq!(calls[0].gtid, Gtid::new(group_uuid(), seq(100)));
    assert_eq!(calls[0].request, b"xb");
    drop(calls);

    // Persisted marker: position cleared back to undefined, safe again.
    let marker = reopen_marker(&cluster);
    assert_eq!(marker.get().uuid, group_uuid());
    assert_eq!(marker.get().seqno, Seqno::UNDEFINED);
    assert!(!marker.requires_full_snapshot());

    // Nothing to replay: no write-sets went through the applier.
    assert!(cluster.applier.applied().is_empty());
}

#[test]
fn pure_incremental_for_small_gap() {
    let cluster = cluster(Gtid::new(group_uuid(), seq(95)), seq(100), 90..=100);

    cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), b"")
        .unwrap();
    cluster.donor.shutdown();

    assert_eq!(cluster.applier.applied(), vec![96, 97, 98, 99, 100]);
    assert_eq!(cluster.joiner.position(), Gtid::new(group_uuid(), seq(100)));
    assert_eq!(cluster.joiner.last_transfer(), TransferKind::Incremental);

    // No snapshot was involved.
    assert_eq!(cluster.snapshot.invocations(), 0);

    // The sender released the cache lock exactly once.
    assert_eq!(cluster.donor_cache.locked_at(), None);

    // The donor joined with its own seqno right after launching the stream.
    assert_eq!(cluster.group.joins(), vec![Ok(seq(100))]);

    let marker = reopen_marker(&cluster);
    assert_eq!(marker.get().seqno, Seqno::UNDEFINED);
    assert!(!marker.requires_full_snapshot());
}

#[test]
fn incremental_with_snapshot_fallback_uses_bypass() {
    let cluster = cluster(Gtid::new(group_uuid(), seq(95)), seq(100), 90..=100);

    cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), b"xb")
        .unwrap();
    cluster.donor.shutdown();

    // The donor acknowledged the waiting joiner in bypass mode with the
    // incremental base position, then streamed the write-sets.
    let calls = cluster.snapshot.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].bypass);
    assert_eq!(calls[0].gtid, Gtid::new(group_uuid(), seq(95)));
    drop(calls);

    assert_eq!(cluster.applier.applied(), vec![96, 97, 98, 99, 100]);
    assert_eq!(cluster.joiner.position(), Gtid::new(group_uuid(), seq(100)));
    assert_eq!(cluster.joiner.last_transfer(), TransferKind::Incremental);
    assert_eq!(cluster.donor_cache.locked_at(), None);
}

#[test]
fn donor_drift_falls_back_to_full_snapshot() {
    // The joiner resumes from 50 but the donor's cache starts at 80.
    let cluster = cluster(Gtid::new(group_uuid(), seq(50)), seq(100), 80..=100);

    cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), b"xb")
        .unwrap();

    let calls = cluster.snapshot.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].bypass, "drift must force a full copy");
    assert_eq!(calls[0].gtid, Gtid::new(group_uuid(), seq(100)));
    drop(calls);

    assert_eq!(cluster.joiner.position(), Gtid::new(group_uuid(), seq(100)));
    assert_eq!(cluster.joiner.last_transfer(), TransferKind::Snapshot);
    assert!(cluster.applier.applied().is_empty());

    // The failed lock attempt left nothing pinned.
    assert_eq!(cluster.donor_cache.locked_at(), None);
}

#[test]
fn donor_drift_without_fallback_is_fatal() {
    let cluster = cluster(Gtid::new(group_uuid(), seq(50)), seq(100), 80..=100);

    let joiner = cluster.joiner.clone();
    let result = thread::spawn(move || joiner.request_state_transfer(group_uuid(), seq(100), b""))
        .join();
    assert!(result.is_err(), "joiner must fail-stop on ENODATA");

    // The donor surfaced the drift as a negative action result.
    assert_eq!(cluster.group.joins(), vec![Err(TransferError::NoData)]);
    assert_eq!(cluster.snapshot.invocations(), 0);
    assert_eq!(cluster.donor_cache.locked_at(), None);

    // No snapshot was in flight, so the marker never went unsafe.
    let marker = reopen_marker(&cluster);
    assert!(!marker.requires_full_snapshot());
}

#[test]
fn canceled_snapshot_closes_the_connection() {
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);
    cluster.snapshot.set_script(SnapshotScript::Cancel);

    let result = cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), b"xb");
    assert_eq!(result, Err(TransferError::Canceled));

    assert!(cluster.group.was_closed());
    assert_eq!(cluster.joiner.state(), NodeState::Closing);

    // Restart must demand a full snapshot.
    let marker = reopen_marker(&cluster);
    assert!(marker.requires_full_snapshot());

    // With the connection closing, a late completion is a protocol
    // violation.
    let late = cluster
        .joiner
        .sst_received(Gtid::new(group_uuid(), seq(100)), Ok(()));
    assert_eq!(late, Err(TransferError::ConnectionFailed));
}

#[test]
fn trivial_sentinel_skips_snapshot_and_runs_incremental() {
    let cluster = cluster(Gtid::new(group_uuid(), seq(95)), seq(100), 90..=100);

    cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), TRIVIAL_SST.as_bytes())
        .unwrap();
    cluster.donor.shutdown();

    // Neither side invoked the snapshot callback.
    assert_eq!(cluster.snapshot.invocations(), 0);

    assert_eq!(cluster.applier.applied(), vec![96, 97, 98, 99, 100]);
    assert_eq!(cluster.joiner.position(), Gtid::new(group_uuid(), seq(100)));
    assert_eq!(cluster.joiner.last_transfer(), TransferKind::Incremental);

    let marker = reopen_marker(&cluster);
    assert!(!marker.requires_full_snapshot());
}

#[test]
fn trivial_sentinel_without_incremental_adopts_group_position() {
    // Fresh history: no incremental descriptor can be prepared, and the
    // trivial sentinel means nothing needs copying either.
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);

    cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), TRIVIAL_SST.as_bytes())
        .unwrap();

    assert_eq!(cluster.snapshot.invocations(), 0);
    assert_eq!(cluster.joiner.position(), Gtid::new(group_uuid(), seq(100)));
    assert_eq!(cluster.group.joins(), vec![Ok(seq(100))]);
}

#[test]
fn transient_send_errors_are_retried() {
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);
    cluster.group.script_error(TransferError::TryAgain);
    cluster.group.script_error(TransferError::NotConnected);

    cluster
        .joiner
        .request_state_transfer(group_uuid(), seq(100), b"xb")
        .unwrap();

    // Only the third attempt reached the donor.
    assert_eq!(cluster.group.requests().len(), 1);
    assert_eq!(cluster.joiner.position(), Gtid::new(group_uuid(), seq(100)));
}

#[test]
fn wrong_history_snapshot_is_fatal() {
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);
    let other = Uuid::try_parse("0e34b1f6-7a52-4f19-8e0d-2b9c4d7a6e11").unwrap();
    cluster.snapshot.set_script(SnapshotScript::WrongHistory(other));

    let joiner = cluster.joiner.clone();
    let result =
        thread::spawn(move || joiner.request_state_transfer(group_uuid(), seq(100), b"xb")).join();
    assert!(result.is_err(), "wrong history must fail-stop");

    // The received (wrong) position was persisted and marked safe: the
    // database on disk is consistent, just from the wrong history.
    let marker = reopen_marker(&cluster);
    assert_eq!(marker.get().uuid, other);
    assert!(marker.is_safe());
}

#[test]
fn apply_failure_during_incremental_marks_corrupt() {
    let cluster = cluster(Gtid::new(group_uuid(), seq(95)), seq(100), 90..=100);
    *cluster.applier.fail_at.lock().unwrap() = Some(98);

    let joiner = cluster.joiner.clone();
    let result = thread::spawn(move || joiner.request_state_transfer(group_uuid(), seq(100), b""))
        .join();
    assert!(result.is_err(), "apply failure must fail-stop");
    cluster.donor.shutdown();

    assert_eq!(cluster.applier.applied(), vec![96, 97]);

    // Restart must demand a full snapshot.
    let marker = reopen_marker(&cluster);
    assert!(marker.is_corrupt());
    assert!(marker.requires_full_snapshot());
}

#[test]
fn state_transfer_required_only_for_real_gaps() {
    let cluster = cluster(Gtid::new(group_uuid(), seq(95)), seq(100), 90..=100);

    let behind = ViewInfo {
        state_gap: true,
        state_id: Gtid::new(group_uuid(), seq(100)),
    };
    assert!(cluster.joiner.state_transfer_required(&behind));

    let caught_up = ViewInfo {
        state_gap: true,
        state_id: Gtid::new(group_uuid(), seq(95)),
    };
    assert!(!cluster.joiner.state_transfer_required(&caught_up));

    let no_gap = ViewInfo {
        state_gap: false,
        state_id: Gtid::new(group_uuid(), seq(100)),
    };
    assert!(!cluster.joiner.state_transfer_required(&no_gap));

    let foreign = ViewInfo {
        state_gap: true,
        state_id: Gtid::new(Uuid::from_bytes([1; 16]), seq(10)),
    };
    assert!(cluster.joiner.state_transfer_required(&foreign));
}

#[test]
fn donor_cancels_empty_request() {
    // A legacy v0 action with an empty payload offers the donor nothing to
    // transfer: protocol error, reported as canceled.
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);

    cluster
        .donor
        .process_state_req(b"", seq(0), seq(100), "joiner-0");

    assert_eq!(cluster.group.joins(), vec![Err(TransferError::Canceled)]);
    assert_eq!(cluster.snapshot.invocations(), 0);
}

#[test]
fn donor_accepts_legacy_skip_sentinel() {
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);

    cluster
        .donor
        .process_state_req(b"none", seq(0), seq(100), "joiner-0");

    // Skipped transfer: the donor succeeds with no action.
    assert_eq!(cluster.group.joins(), vec![Ok(seq(100))]);
    assert_eq!(cluster.snapshot.invocations(), 0);
}

#[test]
fn donor_skips_malformed_envelope() {
    let cluster = cluster(Gtid::undefined(), seq(100), 1..=100);

    // v1 magic with a length that overruns the buffer.
    let mut raw = b"STRv1\0".to_vec();
    raw.extend_from_slice(&100u32.to_be_bytes());
    raw.extend_from_slice(b"short");
    cluster
        .donor
        .process_state_req(&raw, seq(0), seq(100), "joiner-0");

    assert_eq!(cluster.group.joins(), vec![Ok(seq(100))]);
    assert_eq!(cluster.snapshot.invocations(), 0);
}

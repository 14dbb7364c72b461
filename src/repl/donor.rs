//! Donor side of the state-transfer protocol.
//!
//! A STATE_REQ action admitted by the local-order monitor is decided under
//! the monitor (drain, decode, cache lock attempt) and executed after
//! leaving it, so a snapshot callback that blocks for the whole copy never
//! holds up the ordered stream.

use bytes::Bytes;

use crate::core::{Gtid, Seqno};
use crate::repl::cache::{CacheError, SeqnoLockGuard};
use crate::repl::coordinator::{
    Coordinator, LEGACY_SKIP_SST, NodeState, TRIVIAL_SST, TransferError,
};
use crate::repl::descriptor::IstRequest;
use crate::repl::ist::IstError;
use crate::repl::request::StateRequest;
use crate::config::CommitOrder;

/// Transfer decision carried from the ordered phase to the execution phase.
/// The seqno lock travels inside and is released exactly once: by the
/// sender at end-of-stream, or by dropping the plan on an earlier error.
enum TransferPlan {
    /// Sentinel request or undecodable action: nothing to transfer.
    Skip,
    /// Decided failure, announced to the group.
    Fail(TransferError),
    Incremental {
        /// Snapshot sub-payload to acknowledge in bypass mode, when the
        /// joiner prepared one alongside the descriptor.
        notify: Option<(Bytes, Gtid)>,
        peer: String,
        first: Seqno,
        last: Seqno,
        guard: SeqnoLockGuard,
    },
    FullSnapshot {
        request: Bytes,
        gtid: Gtid,
    },
}

impl Coordinator {
    /// Serve a STATE_REQ action delivered with local seqno `local_seqno`;
    /// `donor_seq` is the donor's position in the group stream at delivery.
    pub fn process_state_req(
        &self,
        request: &[u8],
        local_seqno: Seqno,
        donor_seq: Seqno,
        requestor_id: &str,
    ) {
        self.local_monitor.enter(local_seqno);
        self.apply_monitor.drain(donor_seq);
        if self.config.commit_order != CommitOrder::Bypass {
            self.commit_monitor.drain(donor_seq);
        }

        self.shift_to(NodeState::Donor);

        let plan = self.plan_transfer(request, donor_seq);

        self.local_monitor.leave(local_seqno);

        self.execute_plan(plan, donor_seq, requestor_id);
    }

    fn plan_transfer(&self, request: &[u8], donor_seq: Seqno) -> TransferPlan {
        let request = match StateRequest::decode(Bytes::copy_from_slice(request)) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("malformed state-transfer request, skipping: {err}");
                return TransferPlan::Skip;
            }
        };

        let sst_str = Self::sst_str(request.sst());
        let skip_snapshot =
            sst_str == TRIVIAL_SST.as_bytes() || sst_str == LEGACY_SKIP_SST.as_bytes();
        // A sentinel payload cannot serve as a snapshot fallback.
        let has_fallback = !request.sst().is_empty() && !skip_snapshot;

        if request.has_ist() {
            let istr = match IstRequest::parse_payload(request.ist()) {
                Ok(istr) => istr,
                Err(err) => {
                    tracing::warn!("malformed incremental-transfer descriptor, skipping: {err}");
                    return TransferPlan::Skip;
                }
            };

            if istr.uuid == self.position().uuid {
                tracing::info!("incremental transfer request: {istr}");

                match self.cache.seqno_lock(istr.last_applied.next()) {
                    Ok(guard) => {
                        let notify = has_fallback.then(|| {
                            (
                                Bytes::copy_from_slice(request.sst()),
                                Gtid::new(istr.uuid, istr.last_applied),
                            )
                        });
                        // The stream runs through the latest delivered view
                        // change, which may be past the descriptor's group
                        // seqno if views changed while the request was in
                        // flight.
                        return TransferPlan::Incremental {
                            notify,
                            peer: istr.peer,
                            first: istr.last_applied.next(),
                            last: self.view_seqno(),
                            guard,
                        };
                    }
                    Err(err @ CacheError::NotFound { .. }) => {
                        tracing::info!(
                            "incremental transfer unavailable, {err}; falling back to snapshot"
                        );
                        if !has_fallback {
                            tracing::info!(
                                "incremental transfer canceled: donor seqno moved past the \
                                 requested range and the joiner prepared no snapshot request"
                            );
                            return TransferPlan::Fail(TransferError::NoData);
                        }
                        // fall through to the full snapshot below
                    }
                    Err(err) => {
                        tracing::error!("cache seqno lock failed: {err}");
                        return TransferPlan::Fail(TransferError::InvalidArgument);
                    }
                }
            }
        }

        if skip_snapshot {
            tracing::info!("state transfer skipped by request");
            TransferPlan::Skip
        } else if !request.sst().is_empty() {
            TransferPlan::FullSnapshot {
                request: Bytes::copy_from_slice(request.sst()),
                gtid: Gtid::new(self.position().uuid, donor_seq),
            }
        } else {
            tracing::warn!("snapshot request is empty, state transfer canceled");
            TransferPlan::Fail(TransferError::Canceled)
        }
    }

    fn execute_plan(&self, plan: TransferPlan, donor_seq: Seqno, requestor_id: &str) {
        match plan {
            TransferPlan::Skip => self.group.join(Ok(donor_seq)),
            TransferPlan::Fail(err) => self.group.join(Err(err)),
            TransferPlan::FullSnapshot { request, gtid } => {
                match self.donate(&request, gtid, false) {
                    // Completion (and the join) is announced by sst_sent.
                    Ok(()) => {}
                    Err(err) => self.group.join(Err(err)),
                }
            }
            TransferPlan::Incremental {
                notify,
                peer,
                first,
                last,
                guard,
            } => {
                let mut deferred = false;
                let mut result = Ok(());

                if let Some((sst_request, gtid)) = notify {
                    // Bypass mode: tell the waiting joiner that the
                    // incremental stream will deliver the data.
                    match self.donate(&sst_request, gtid, true) {
                        Ok(()) => deferred = true,
                        Err(err) => {
                            tracing::error!("failed to bypass snapshot transfer: {err}");
                            result = Err(err);
                        }
                    }
                }

                if result.is_ok() {
                    match self.ist_senders.run(
                        &peer,
                        first,
                        last,
                        self.config.proto_ver,
                        requestor_id,
                        guard,
                        self.config.max_frame_bytes,
                    ) {
                        Ok(()) => {}
                        Err(err) => {
                            tracing::error!("incremental transfer failed: {err}");
                            result = Err(ist_error_code(&err));
                        }
                    }
                } else {
                    // Bypass failed before the sender could take the lock.
                    guard.release();
                }

                if !deferred || result.is_err() {
                    self.group.join(result.map(|()| donor_seq));
                }
            }
        }
    }

    fn donate(&self, request: &[u8], gtid: Gtid, bypass: bool) -> Result<(), TransferError> {
        match self.snapshot.donate(request, gtid, bypass) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(
                    "snapshot transfer {}failed: {err}",
                    if bypass { "bypass " } else { "" }
                );
                Err(TransferError::Canceled)
            }
        }
    }

    /// Snapshot completion callback on the donor: announce the deferred
    /// join with the donated position or the failure code.
    pub fn sst_sent(&self, state_id: Gtid, result: Result<(), TransferError>) {
        match result {
            Ok(()) => {
                tracing::info!("snapshot transfer to joiner complete: {state_id}");
                self.group.join(Ok(state_id.seqno));
            }
            Err(err) => {
                tracing::error!("snapshot transfer to joiner failed: {err}");
                self.group.join(Err(err));
            }
        }
    }
}

fn ist_error_code(err: &IstError) -> TransferError {
    match err {
        IstError::Io(_) | IstError::Frame(_) => TransferError::NotConnected,
        IstError::PeerAddr { .. } => TransferError::InvalidArgument,
        _ => TransferError::InvalidArgument,
    }
}

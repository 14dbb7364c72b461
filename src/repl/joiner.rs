//! Joiner side of the state-transfer protocol.
//!
//! `request_state_transfer` drives the whole joiner lifecycle: envelope
//! preparation (with incremental transfer when the local history allows
//! it), the retrying send loop, the snapshot wait, the incremental apply
//! loop and the final recovery-marker bookkeeping.

use std::thread;

use bytes::Bytes;
use uuid::Uuid;

use crate::config::CommitOrder;
use crate::core::{Gtid, Seqno};
use crate::repl::coordinator::{
    Coordinator, NodeState, SstState, TransferError, TransferKind,
};
use crate::repl::descriptor::IstRequest;
use crate::repl::ist::IstReceiver;
use crate::repl::request::StateRequest;

impl Coordinator {
    /// Bring the local state up to `(group_uuid, group_seqno)`.
    ///
    /// `sst_request` is the application-supplied snapshot request payload:
    /// empty when no snapshot fallback exists, the `"trivial"` sentinel when
    /// no data copy is needed, and an opaque method string otherwise.
    pub fn request_state_transfer(
        &self,
        group_uuid: Uuid,
        group_seqno: Seqno,
        sst_request: &[u8],
    ) -> Result<(), TransferError> {
        let request = self.prepare_state_request(sst_request, group_uuid, group_seqno);
        let trivial = Self::sst_is_trivial(sst_request);

        // The snapshot may start changing data long before it advances the
        // persisted seqno, so the marker goes unsafe before the request is
        // even sent: a crash anywhere in the window demands a full snapshot.
        let unsafe_marked = !sst_request.is_empty() && !trivial;
        if unsafe_marked {
            self.marker_op(|m| m.mark_unsafe());
        }

        {
            // Arm the completion tracker before sending: the completion can
            // race the send loop's return.
            let mut sst = self.lock_sst();
            sst.state = SstState::Wait;
            sst.uuid = Uuid::nil();
            sst.seqno = Seqno::UNDEFINED;
            sst.error = None;
            sst.received = false;
        }

        if let Err(err) = self.send_state_request(&request, unsafe_marked) {
            self.teardown_ist_receiver();
            return Err(err);
        }

        self.shift_to(NodeState::Joining);

        // Waiting for the transfer is a good point to rebase the write-set
        // cache on the group position, since that may involve IO of its own.
        self.cache.seqno_reset(group_uuid, group_seqno);

        if !sst_request.is_empty() {
            if trivial {
                if !request.has_ist() {
                    // Nothing to copy and nothing to replay: adopt the group
                    // position outright.
                    {
                        let mut sst = self.lock_sst();
                        sst.uuid = group_uuid;
                        sst.seqno = group_seqno;
                    }
                    self.install_position(Gtid::new(group_uuid, group_seqno));
                    self.record_transfer(TransferKind::Snapshot);
                }
                // With a descriptor in flight the incremental stream below
                // delivers the data; there is no snapshot to wait for.
            } else {
                {
                    let mut sst = self.lock_sst();
                    while !sst.received {
                        sst = self
                            .sst_cond
                            .wait(sst)
                            .expect("sst condvar wait poisoned");
                    }
                }
                let (sst_state, sst_uuid, sst_seqno, sst_error) = {
                    let sst = self.lock_sst();
                    (sst.state, sst.uuid, sst.seqno, sst.error)
                };

                if let Some(err) = sst_error {
                    // Canceled by the user or failed by the script: either
                    // way the marker stays unsafe so a restart demands a
                    // full snapshot, and the connection goes down.
                    if !unsafe_marked {
                        self.marker_op(|m| m.mark_unsafe());
                    }
                    debug_assert!(
                        err != TransferError::Canceled || sst_state == SstState::Canceled
                    );
                    self.close();
                    self.teardown_ist_receiver();
                    return Err(err);
                } else if sst_uuid != group_uuid {
                    tracing::error!(
                        "application received wrong state: received {sst_uuid}, required {group_uuid}"
                    );
                    self.lock_sst().state = SstState::Failed;
                    self.marker_op(|m| {
                        let stb = m.get().safe_to_bootstrap;
                        m.set(sst_uuid, sst_seqno, stb)
                    });
                    if unsafe_marked {
                        self.marker_op(|m| m.mark_safe());
                    }
                    self.fatal(
                        "application state transfer failed: this is an unrecoverable \
                         condition, restart required",
                    );
                } else {
                    self.install_position(Gtid::new(sst_uuid, sst_seqno));
                    self.record_transfer(TransferKind::Snapshot);
                }
            }
        } else {
            debug_assert_eq!(self.position().uuid, group_uuid);
        }

        // Clear the persisted seqno: a crash during normal operation must
        // not recover to a position that predates the group stream.
        {
            let position = self.position();
            self.marker_op(|m| {
                let stb = m.get().safe_to_bootstrap;
                m.set(position.uuid, Seqno::UNDEFINED, stb)
            });
        }
        if unsafe_marked {
            // Snapshot is complete (or was never needed); the incremental
            // stream decides for itself when the state goes unsafe again.
            self.marker_op(|m| m.mark_safe());
        }

        if request.has_ist() {
            self.run_ist(group_uuid, group_seqno);
        }

        // Defensive re-check: whatever path was taken above, normal
        // operation starts with an undefined persisted seqno.
        self.clear_marker_seqno();

        Ok(())
    }

    fn prepare_state_request(
        &self,
        sst_request: &[u8],
        group_uuid: Uuid,
        group_seqno: Seqno,
    ) -> StateRequest {
        match self.config.proto_ver {
            0 => StateRequest::v0(Bytes::copy_from_slice(sst_request)),
            1 | 2 => {
                let ist = match self.prepare_for_ist(group_uuid, group_seqno) {
                    Ok(payload) => {
                        tracing::info!(
                            "state gap can likely be serviced incrementally; any snapshot \
                             request rides along as fallback"
                        );
                        payload
                    }
                    Err(err) => {
                        tracing::info!(
                            "state gap cannot be serviced incrementally, snapshot only: {err}"
                        );
                        Bytes::new()
                    }
                };
                match StateRequest::v1(Bytes::copy_from_slice(sst_request), ist) {
                    Ok(request) => request,
                    Err(err) => {
                        self.fatal(&format!("state request preparation failed, aborting: {err}"))
                    }
                }
            }
            ver => self.fatal(&format!("unsupported state transfer protocol: {ver}")),
        }
    }

    /// Start the incremental-transfer listener and build the descriptor
    /// payload. Any failure here silently downgrades the request to
    /// snapshot-only.
    fn prepare_for_ist(
        &self,
        group_uuid: Uuid,
        group_seqno: Seqno,
    ) -> Result<Bytes, TransferError> {
        let position = self.position();
        if position.uuid != group_uuid {
            tracing::info!(
                "local uuid {} does not match group uuid {group_uuid}",
                position.uuid
            );
            return Err(TransferError::NotPermitted);
        }
        if !position.seqno.is_defined() {
            tracing::info!("local state seqno is undefined");
            return Err(TransferError::NotPermitted);
        }
        debug_assert!(position.seqno < group_seqno);

        let (receiver, addr) = IstReceiver::prepare(
            &self.config.ist_bind_addr,
            position.seqno.next(),
            group_seqno,
            self.config.proto_ver,
            self.config.max_frame_bytes,
        )
        .map_err(|err| {
            tracing::warn!("failed to prepare the incremental receiver: {err}");
            TransferError::InvalidArgument
        })?;

        let descriptor = IstRequest::new(group_uuid, position.seqno, group_seqno, addr)
            .map_err(|_| TransferError::InvalidArgument)?;

        *self
            .ist_receiver
            .lock()
            .expect("ist receiver lock poisoned") = Some(receiver);

        Ok(descriptor.to_payload())
    }

    /// Emit the request through the group layer, retrying transient
    /// failures at a fixed interval. Terminal failures either return (when
    /// the connection is already closing) or end the process.
    fn send_state_request(
        &self,
        request: &StateRequest,
        unsafe_marked: bool,
    ) -> Result<i64, TransferError> {
        let encoded = request.encode();
        let (ist_uuid, ist_seqno) = match IstRequest::parse_payload(request.ist()) {
            Ok(istr) => (istr.uuid, istr.last_applied),
            Err(_) => (Uuid::nil(), Seqno::UNDEFINED),
        };

        let mut tries = 0u64;
        loop {
            tries += 1;

            let outcome = self.group.request_state_transfer(
                self.config.proto_ver,
                &encoded,
                &self.config.donor_hint,
                ist_uuid,
                ist_seqno,
            );
            let mut order = outcome.order;

            if let Err(err) = order {
                if err == TransferError::NoData {
                    // The current state is still usable for the next join
                    // attempt, so it must not be left marked unsafe.
                    if unsafe_marked {
                        self.marker_op(|m| m.mark_safe());
                    }
                    self.fatal(
                        "state transfer request failed unrecoverably: the donor seqno \
                         moved forward during the incremental window and no snapshot \
                         request was prepared on our side; restart required",
                    );
                } else if err.is_transient() {
                    if tries == 1 {
                        tracing::info!(
                            "requesting state transfer failed: {err}; will keep retrying \
                             every {}ms",
                            self.config.retry_interval_ms
                        );
                    }
                } else {
                    tracing::error!("requesting state transfer failed: {err}");
                }
            }

            if let Some(local_seqno) = outcome.local_seqno {
                if self.local_monitor.would_block(local_seqno) {
                    tracing::error!(
                        "slave queue grew too long while trying to request state transfer \
                         {tries} time(s); make sure at least one fully synced member is \
                         present in the group; restart required"
                    );
                    order = Err(TransferError::Deadlock);
                } else {
                    // Our own copy of the request is not processed locally;
                    // the slot must not leak.
                    self.local_monitor.self_cancel(local_seqno);
                }
            }

            match order {
                Ok(donor) => {
                    if tries == 1 {
                        tracing::info!("requesting state transfer: success, donor: {donor}");
                    } else {
                        tracing::info!(
                            "requesting state transfer: success after {tries} tries, \
                             donor: {donor}"
                        );
                    }
                    return Ok(donor);
                }
                Err(err) if err.is_transient() => {
                    thread::sleep(self.config.retry_interval());
                }
                Err(err) => {
                    self.lock_sst().state = SstState::ReqFailed;
                    let position = self.position();
                    self.marker_op(|m| {
                        let stb = m.get().safe_to_bootstrap;
                        m.set(position.uuid, position.seqno, stb)
                    });

                    if self.state().is_live() {
                        if !unsafe_marked {
                            self.marker_op(|m| m.mark_unsafe());
                        }
                        self.fatal(&format!(
                            "state transfer request failed unrecoverably: {err}; most \
                             likely it is due to inability to communicate with the \
                             cluster primary component; restart required"
                        ));
                    }

                    // Connection is going down, send failure is expected.
                    if unsafe_marked {
                        self.marker_op(|m| m.mark_safe());
                    }
                    return Err(err);
                }
            }
        }
    }

    fn install_position(&self, gtid: Gtid) {
        self.set_position(gtid);
        self.apply_monitor.set_initial_position(gtid.seqno);
        if self.config.commit_order != CommitOrder::Bypass {
            self.commit_monitor.set_initial_position(gtid.seqno);
        }
        tracing::debug!("installed new state: {gtid}");
    }

    fn run_ist(&self, group_uuid: Uuid, group_seqno: Seqno) {
        let Some(receiver) = self
            .ist_receiver
            .lock()
            .expect("ist receiver lock poisoned")
            .take()
        else {
            return;
        };

        let sst_state = self.lock_sst().state;
        let position = self.position();

        // Skip the replay when the node left JOINING (connection lost,
        // eviction) or the snapshot phase failed underneath us.
        if !(sst_state < SstState::ReqFailed
            && self.state() == NodeState::Joining
            && position.seqno < group_seqno)
        {
            receiver.finished();
            return;
        }

        tracing::info!(
            "receiving incremental transfer: {} write-sets, seqnos {}-{group_seqno}",
            position.seqno.gap_to(group_seqno),
            position.seqno.next(),
        );
        receiver.ready();
        self.recv_ist(&receiver, group_uuid);

        let last = receiver.finished();
        self.lock_sst().seqno = last;

        if last.is_defined() {
            // Drain before returning: the group layer may already be
            // delivering write-sets that the incremental stream also
            // carried, and those appliers must not overtake this one.
            self.apply_monitor.drain(last);
            self.set_position(Gtid::new(group_uuid, last));
            self.record_transfer(TransferKind::Incremental);
            tracing::info!("incremental transfer received: {group_uuid}:{last}");
        }
    }

    fn recv_ist(&self, receiver: &IstReceiver, group_uuid: Uuid) {
        let mut first = true;
        loop {
            match receiver.recv() {
                Ok(Some(ws)) => {
                    if first {
                        first = false;
                        // If no snapshot preceded this stream the persisted
                        // position may still be defined; it must go before
                        // the first apply can fail halfway.
                        self.clear_marker_seqno();
                    }

                    if let Err(err) = ws.verify_checksum() {
                        self.fatal(&format!(
                            "receiving incremental transfer failed, node restart \
                             required: {err}"
                        ));
                    }

                    if !ws.depends_seqno.is_defined() {
                        // Ordered no-op: occupy and release the slots.
                        self.apply_monitor.self_cancel(ws.seqno);
                        if self.config.commit_order != CommitOrder::Bypass {
                            self.commit_monitor.self_cancel(ws.seqno);
                        }
                    } else {
                        self.apply_monitor.enter(ws.seqno);
                        match self.applier.apply(&ws) {
                            Ok(()) => {
                                if self.config.commit_order != CommitOrder::Bypass {
                                    self.commit_monitor.enter(ws.seqno);
                                    self.commit_monitor.leave(ws.seqno);
                                }
                                self.apply_monitor.leave(ws.seqno);
                                self.set_position(Gtid::new(group_uuid, ws.seqno));
                            }
                            Err(err) => {
                                // A half-applied write-set leaves the data
                                // dir unusable as an incremental base.
                                self.marker_op(|m| m.mark_corrupt());
                                self.fatal(&format!(
                                    "failed to apply write-set {}: {err}; node restart \
                                     required",
                                    ws.seqno
                                ));
                            }
                        }
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!("incremental transfer stream ended: {err}");
                    return;
                }
            }
        }
    }

    fn clear_marker_seqno(&self) {
        let current = self
            .marker
            .lock()
            .expect("marker lock poisoned")
            .get();
        if current.seqno.is_defined() {
            self.marker_op(|m| {
                m.set(current.uuid, Seqno::UNDEFINED, current.safe_to_bootstrap)
            });
        }
    }

    pub(crate) fn teardown_ist_receiver(&self) {
        if let Some(receiver) = self
            .ist_receiver
            .lock()
            .expect("ist receiver lock poisoned")
            .take()
        {
            receiver.finished();
        }
    }
}

//! The built-in data engine.
//!
//! Executes validated send work requests synchronously on the posting
//! thread: SEND consumes a receive posted on the destination QP, RDMA
//! WRITE/READ move bytes directly between registered ranges. Destination
//! QPs are resolved by QP number within the local device. Failures here
//! are protocol violations: they complete with an error status on the
//! affected CQ and drive the QP to the error state, they never return
//! through the posting call.

use std::sync::Arc;

use crate::mr::AccessFlags;
use crate::qp::QpShared;
use crate::wc::{WcFlags, WcOpcode, WcStatus, WorkCompletion};
use crate::wr::{QpState, SendFlags, SendWr, Sge, WrOpcode};
use crate::lock;

/// Execute one validated send WR posted on `qp`.
pub(crate) fn execute_send(qp: &Arc<QpShared>, wr: &SendWr) {
    let (_, attr) = qp.snapshot();
    let dev = Arc::clone(qp.device());

    let dest = match dev.lookup_qp(attr.dest_qp_num) {
        Some(dest) => dest,
        None => {
            tracing::debug!(qpn = qp.qpn, dqpn = attr.dest_qp_num, "no responder");
            return complete_send(qp, wr, 0, WcStatus::RetryExcErr);
        }
    };
    let dest_state = lock(&dest.inner).state;
    if !matches!(dest_state, QpState::Rtr | QpState::Rts) {
        tracing::debug!(qpn = qp.qpn, dqpn = dest.qpn, ?dest_state, "responder not ready");
        return complete_send(qp, wr, 0, WcStatus::RetryExcErr);
    }

    // Stage the gather list through one contiguous buffer; this also makes
    // overlapping source and destination ranges safe.
    //
    // Safety: every sge was validated against a registered MR, and the MR
    // contract requires registered ranges to stay valid application memory.
    let data = unsafe { gather(&wr.sges) };

    match wr.opcode {
        WrOpcode::Send | WrOpcode::SendWithImm(_) => {
            let recv = match lock(&dest.recv_queue).pop_front() {
                Some(recv) => recv,
                None => {
                    tracing::debug!(qpn = qp.qpn, dqpn = dest.qpn, "receiver not ready");
                    return complete_send(qp, wr, 0, WcStatus::RnrRetryExcErr);
                }
            };
            let capacity: usize = recv.sges.iter().map(|s| s.length as usize).sum();
            if data.len() > capacity {
                complete_recv(&dest, recv.wr_id, WcOpcode::Recv, 0, WcStatus::LocLenErr, WcFlags::empty(), 0);
                return complete_send(qp, wr, 0, WcStatus::RemInvReqErr);
            }
            // Safety: receive sges were validated at post time with
            // local-write access.
            unsafe { scatter(&recv.sges, &data) };
            dev.netdev().record_tx(data.len() as u64);
            let mut flags = recv_flags(wr.send_flags);
            let mut imm = 0;
            if let WrOpcode::SendWithImm(value) = wr.opcode {
                flags |= WcFlags::WITH_IMM;
                imm = value;
            }
            complete_recv(&dest, recv.wr_id, WcOpcode::Recv, data.len() as u32, WcStatus::Success, flags, imm);
            complete_send(qp, wr, data.len() as u32, WcStatus::Success);
        }
        WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm(_) => {
            if let Err(status) = lock(&dest.pd.mrs).check_remote(
                wr.rkey,
                wr.remote_addr,
                data.len(),
                AccessFlags::REMOTE_WRITE,
            ) {
                return complete_send(qp, wr, 0, status);
            }
            // A write with immediate consumes a receive; reserve it before
            // placing any data.
            let consumed = if let WrOpcode::RdmaWriteWithImm(_) = wr.opcode {
                match lock(&dest.recv_queue).pop_front() {
                    Some(recv) => Some(recv),
                    None => {
                        tracing::debug!(qpn = qp.qpn, dqpn = dest.qpn, "receiver not ready");
                        return complete_send(qp, wr, 0, WcStatus::RnrRetryExcErr);
                    }
                }
            } else {
                None
            };
            // Safety: the remote range was just validated against the
            // destination PD's registrations.
            unsafe { write_range(wr.remote_addr, &data) };
            dev.netdev().record_tx(data.len() as u64);
            if let (Some(recv), WrOpcode::RdmaWriteWithImm(imm)) = (consumed, wr.opcode) {
                complete_recv(
                    &dest,
                    recv.wr_id,
                    WcOpcode::RecvRdmaWithImm,
                    data.len() as u32,
                    WcStatus::Success,
                    recv_flags(wr.send_flags) | WcFlags::WITH_IMM,
                    imm,
                );
            }
            complete_send(qp, wr, data.len() as u32, WcStatus::Success);
        }
        WrOpcode::RdmaRead => {
            let len: usize = wr.sges.iter().map(|s| s.length as usize).sum();
            if let Err(status) = lock(&dest.pd.mrs).check_remote(
                wr.rkey,
                wr.remote_addr,
                len,
                AccessFlags::REMOTE_READ,
            ) {
                return complete_send(qp, wr, 0, status);
            }
            // Safety: remote range validated above; local sges validated
            // with local-write access at post time.
            let data = unsafe { read_range(wr.remote_addr, len) };
            unsafe { scatter(&wr.sges, &data) };
            dev.netdev().record_tx(len as u64);
            complete_send(qp, wr, len as u32, WcStatus::Success);
        }
    }
}

/// Push the initiator-side completion, honoring selective signaling; an
/// error status always surfaces and errors the QP.
fn complete_send(qp: &Arc<QpShared>, wr: &SendWr, byte_len: u32, status: WcStatus) {
    let opcode = match wr.opcode {
        WrOpcode::Send | WrOpcode::SendWithImm(_) => WcOpcode::Send,
        WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm(_) => WcOpcode::RdmaWrite,
        WrOpcode::RdmaRead => WcOpcode::RdmaRead,
    };
    let signaled = qp.init.sq_sig_all || wr.send_flags.contains(SendFlags::SIGNALED);
    if status != WcStatus::Success {
        qp.send_cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode,
            byte_len: 0,
            qp_num: qp.qpn,
            ..Default::default()
        });
        qp.enter_error();
        return;
    }
    if signaled {
        qp.send_cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode,
            byte_len,
            qp_num: qp.qpn,
            ..Default::default()
        });
    }
}

fn complete_recv(
    dest: &Arc<QpShared>,
    wr_id: u64,
    opcode: WcOpcode,
    byte_len: u32,
    status: WcStatus,
    flags: WcFlags,
    imm_data: u32,
) {
    dest.recv_cq.push(WorkCompletion {
        wr_id,
        status,
        opcode,
        byte_len,
        qp_num: dest.qpn,
        flags,
        imm_data,
    });
    if status != WcStatus::Success {
        dest.enter_error();
    }
}

fn recv_flags(send_flags: SendFlags) -> WcFlags {
    if send_flags.contains(SendFlags::SOLICITED) {
        WcFlags::SOLICITED
    } else {
        WcFlags::empty()
    }
}

/// Copy the gather list into one contiguous buffer.
///
/// Safety: each sge must describe readable memory (validated against the
/// posting PD's registrations).
unsafe fn gather(sges: &[Sge]) -> Vec<u8> {
    let total: usize = sges.iter().map(|s| s.length as usize).sum();
    let mut out = Vec::with_capacity(total);
    for sge in sges {
        let src = std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize);
        out.extend_from_slice(src);
    }
    out
}

/// Scatter `data` across the sge list in order.
///
/// Safety: each sge must describe writable memory (validated with
/// local-write access).
unsafe fn scatter(sges: &[Sge], data: &[u8]) {
    let mut offset = 0;
    for sge in sges {
        if offset >= data.len() {
            break;
        }
        let n = (sge.length as usize).min(data.len() - offset);
        std::ptr::copy(data[offset..].as_ptr(), sge.addr as *mut u8, n);
        offset += n;
    }
}

/// Safety: the range must lie inside a registration with remote-write
/// access.
unsafe fn write_range(addr: u64, data: &[u8]) {
    std::ptr::copy(data.as_ptr(), addr as *mut u8, data.len());
}

/// Safety: the range must lie inside a registration with remote-read
/// access.
unsafe fn read_range(addr: u64, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(addr as *const u8, len).to_vec()
}

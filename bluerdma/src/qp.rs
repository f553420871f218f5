//! Queue pairs: creation, the connection state machine and work-request
//! posting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::cq::CompletionQueue;
use crate::device::{DeviceState, Mtu, PORT_NUM};
use crate::gid::Gid;
use crate::mr::AccessFlags;
use crate::ops::{Resolved, Verb};
use crate::pd::ProtectionDomain;
use crate::soft;
use crate::wc::{WcOpcode, WcStatus, WorkCompletion};
use crate::wr::{QpState, QpType, RecvWr, SendWr, Sge};
use crate::{lock, Error, Result};

bitflags::bitflags! {
    /// Which fields of a [`QpAttr`] a modify call supplies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QpAttrMask: u32 {
        const STATE = 1 << 0;
        const PKEY_INDEX = 1 << 1;
        const PORT = 1 << 2;
        const ACCESS_FLAGS = 1 << 3;
        const AV = 1 << 4;
        const PATH_MTU = 1 << 5;
        const DEST_QPN = 1 << 6;
        const RQ_PSN = 1 << 7;
        const MAX_DEST_RD_ATOMIC = 1 << 8;
        const MIN_RNR_TIMER = 1 << 9;
        const TIMEOUT = 1 << 10;
        const RETRY_CNT = 1 << 11;
        const RNR_RETRY = 1 << 12;
        const SQ_PSN = 1 << 13;
        const MAX_QP_RD_ATOMIC = 1 << 14;
    }
}

/// Destination address vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressVector {
    /// Destination GID.
    pub dgid: Gid,
    /// Local port to send from.
    pub port_num: u8,
}

/// Modifiable QP attributes.
///
/// Only the fields named by the accompanying [`QpAttrMask`] are read.
#[derive(Debug, Clone, Default)]
pub struct QpAttr {
    /// Target state (mask bit `STATE`).
    pub qp_state: QpState,
    /// Partition key index (`PKEY_INDEX`).
    pub pkey_index: u16,
    /// Local port (`PORT`).
    pub port_num: u8,
    /// Access rights granted to the remote peer (`ACCESS_FLAGS`).
    pub qp_access_flags: AccessFlags,
    /// Destination address (`AV`).
    pub ah_attr: AddressVector,
    /// Path MTU (`PATH_MTU`).
    pub path_mtu: Mtu,
    /// Destination QP number (`DEST_QPN`).
    pub dest_qp_num: u32,
    /// Starting receive packet sequence number (`RQ_PSN`).
    pub rq_psn: u32,
    /// Responder RDMA-read/atomic budget (`MAX_DEST_RD_ATOMIC`).
    pub max_dest_rd_atomic: u8,
    /// Minimum RNR NAK timer code (`MIN_RNR_TIMER`).
    pub min_rnr_timer: u8,
    /// Transport retransmission timeout code (`TIMEOUT`).
    pub timeout: u8,
    /// General retry count (`RETRY_CNT`).
    pub retry_cnt: u8,
    /// RNR retry count (`RNR_RETRY`).
    pub rnr_retry: u8,
    /// Starting send packet sequence number (`SQ_PSN`).
    pub sq_psn: u32,
    /// Initiator RDMA-read/atomic budget (`MAX_QP_RD_ATOMIC`).
    pub max_rd_atomic: u8,
}

/// Initialization attributes for a queue pair.
#[derive(Debug, Clone)]
pub struct QpInitAttr {
    /// QP transport type.
    pub qp_type: QpType,
    /// Maximum outstanding send work requests.
    pub max_send_wr: u32,
    /// Maximum outstanding recv work requests.
    pub max_recv_wr: u32,
    /// Maximum scatter-gather entries per send WR.
    pub max_send_sge: u32,
    /// Maximum scatter-gather entries per recv WR.
    pub max_recv_sge: u32,
    /// If true, every send WR generates a completion.
    pub sq_sig_all: bool,
}

impl Default for QpInitAttr {
    fn default() -> Self {
        Self {
            qp_type: QpType::Rc,
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            sq_sig_all: true,
        }
    }
}

pub(crate) struct PostedRecv {
    pub(crate) wr_id: u64,
    pub(crate) sges: Vec<Sge>,
}

pub(crate) struct QpInner {
    pub(crate) state: QpState,
    pub(crate) attr: QpAttr,
}

/// QP state shared between the owning handle and the device's QP
/// directory (which holds a `Weak` for peer routing).
pub(crate) struct QpShared {
    pub(crate) qpn: u32,
    pub(crate) init: QpInitAttr,
    pub(crate) pd: Arc<ProtectionDomain>,
    pub(crate) send_cq: Arc<CompletionQueue>,
    pub(crate) recv_cq: Arc<CompletionQueue>,
    pub(crate) inner: Mutex<QpInner>,
    pub(crate) recv_queue: Mutex<VecDeque<PostedRecv>>,
}

impl QpShared {
    pub(crate) fn device(&self) -> &Arc<DeviceState> {
        &self.pd.context().device
    }

    pub(crate) fn snapshot(&self) -> (QpState, QpAttr) {
        let inner = lock(&self.inner);
        (inner.state, inner.attr.clone())
    }

    /// Move to ERROR and flush outstanding receives.
    pub(crate) fn enter_error(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == QpState::Error {
            return;
        }
        tracing::debug!(qpn = self.qpn, from = ?inner.state, "QP enters error state");
        inner.state = QpState::Error;
        drop(inner);
        self.flush_recvs();
    }

    /// Complete every queued receive with flush status.
    pub(crate) fn flush_recvs(&self) {
        let drained: Vec<PostedRecv> = lock(&self.recv_queue).drain(..).collect();
        for recv in drained {
            self.recv_cq.push(WorkCompletion {
                wr_id: recv.wr_id,
                status: WcStatus::WrFlushErr,
                opcode: WcOpcode::Recv,
                qp_num: self.qpn,
                ..Default::default()
            });
        }
    }
}

/// A queue pair.
///
/// Created in RESET via [`ProtectionDomain::create_qp`]; connected by
/// driving RESET→INIT→RTR→RTS through [`modify`](Self::modify) or the
/// [`to_init`](Self::to_init)/[`to_rtr`](Self::to_rtr)/
/// [`to_rts`](Self::to_rts) helpers. Destroying the QP is permitted from
/// any state and flushes queued receives.
pub struct QueuePair {
    shared: Arc<QpShared>,
}

impl QueuePair {
    pub(crate) fn create(
        pd: &Arc<ProtectionDomain>,
        send_cq: &Arc<CompletionQueue>,
        recv_cq: &Arc<CompletionQueue>,
        init_attr: &QpInitAttr,
    ) -> Result<Self> {
        let ctx = pd.context();
        let dev = &ctx.device;
        tracing::debug!(device = %ctx.device().name(), "create qp");
        validate_init_attr(init_attr, dev)?;
        dev.take(&dev.qp_count, dev.config().max_qp, "queue pairs")?;
        let qpn = match dev.ops().resolve(Verb::CreateQp) {
            Ok(Resolved::Default) => dev.alloc_qpn(),
            Ok(Resolved::Backend(p)) => match p.create_qp(&ctx.device(), init_attr) {
                Ok(qpn) => qpn,
                Err(e) => {
                    dev.put(&dev.qp_count);
                    return Err(e);
                }
            },
            Err(e) => {
                dev.put(&dev.qp_count);
                return Err(e);
            }
        };
        let shared = Arc::new(QpShared {
            qpn,
            init: init_attr.clone(),
            pd: Arc::clone(pd),
            send_cq: Arc::clone(send_cq),
            recv_cq: Arc::clone(recv_cq),
            inner: Mutex::new(QpInner {
                state: QpState::Reset,
                attr: QpAttr::default(),
            }),
            recv_queue: Mutex::new(VecDeque::new()),
        });
        dev.register_qp(qpn, Arc::downgrade(&shared));
        tracing::info!(qpn, "created QP");
        Ok(Self { shared })
    }

    /// The QP number.
    pub fn qp_num(&self) -> u32 {
        self.shared.qpn
    }

    /// The current connection state.
    pub fn state(&self) -> QpState {
        lock(&self.shared.inner).state
    }

    /// Modify the QP with the given attribute mask.
    ///
    /// Transitions follow RESET→INIT→RTR→RTS, with ERROR reachable from
    /// any state. A transition with a wrong source state is a
    /// state-conflict; one missing required fields is invalid-argument.
    /// Either way the QP is left in its prior state.
    pub fn modify(&self, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        let shared = &self.shared;
        let dev = shared.device();
        let resolved = dev.ops().resolve(Verb::ModifyQp)?;

        let mut inner = lock(&shared.inner);
        if !mask.contains(QpAttrMask::STATE) {
            return Err(Error::invalid_arg("modify_qp requires a target state"));
        }
        let current = inner.state;
        let target = attr.qp_state;
        match (current, target) {
            (QpState::Reset, QpState::Init) => {
                require(
                    mask,
                    QpAttrMask::PORT | QpAttrMask::PKEY_INDEX | QpAttrMask::ACCESS_FLAGS,
                    "RESET->INIT",
                )?;
                if attr.port_num != PORT_NUM {
                    return Err(Error::invalid_arg(format!(
                        "bad port number {}",
                        attr.port_num
                    )));
                }
                if attr.pkey_index != 0 {
                    return Err(Error::invalid_arg(format!(
                        "bad pkey index {}",
                        attr.pkey_index
                    )));
                }
            }
            (QpState::Init, QpState::Rtr) => {
                require(
                    mask,
                    QpAttrMask::AV
                        | QpAttrMask::PATH_MTU
                        | QpAttrMask::DEST_QPN
                        | QpAttrMask::RQ_PSN
                        | QpAttrMask::MAX_DEST_RD_ATOMIC
                        | QpAttrMask::MIN_RNR_TIMER,
                    "INIT->RTR",
                )?;
                if attr.ah_attr.dgid.is_zero() {
                    return Err(Error::invalid_arg("destination gid required"));
                }
            }
            (QpState::Rtr, QpState::Rts) => {
                require(
                    mask,
                    QpAttrMask::TIMEOUT
                        | QpAttrMask::RETRY_CNT
                        | QpAttrMask::RNR_RETRY
                        | QpAttrMask::SQ_PSN
                        | QpAttrMask::MAX_QP_RD_ATOMIC,
                    "RTR->RTS",
                )?;
            }
            (_, QpState::Error) => {}
            (_, QpState::Reset) => {
                return Err(Error::invalid_arg("transition to RESET is not supported"));
            }
            (state, _) => {
                return Err(Error::State {
                    op: "modify_qp",
                    state,
                });
            }
        }

        // Validation passed; let an attached backend veto before commit.
        if let Resolved::Backend(p) = resolved {
            p.modify_qp(&shared.pd.context().device(), shared.qpn, attr, mask)?;
        }

        apply(&mut inner.attr, attr, mask);
        inner.state = target;
        tracing::info!(qpn = shared.qpn, from = ?current, to = ?target, "QP transition");
        drop(inner);
        if target == QpState::Error {
            shared.flush_recvs();
        }
        Ok(())
    }

    /// Transition to INIT.
    pub fn to_init(&self, port_num: u8, pkey_index: u16, access_flags: AccessFlags) -> Result<()> {
        let attr = QpAttr {
            qp_state: QpState::Init,
            pkey_index,
            port_num,
            qp_access_flags: access_flags,
            ..Default::default()
        };
        let mask = QpAttrMask::STATE
            | QpAttrMask::PKEY_INDEX
            | QpAttrMask::PORT
            | QpAttrMask::ACCESS_FLAGS;
        self.modify(&attr, mask)
    }

    /// Transition to RTR.
    ///
    /// `dest_qp_num` and `dgid` name the peer; `rq_psn` is the first
    /// packet sequence number expected from it.
    pub fn to_rtr(&self, dest_qp_num: u32, rq_psn: u32, dgid: Gid, path_mtu: Mtu) -> Result<()> {
        let attr = QpAttr {
            qp_state: QpState::Rtr,
            path_mtu,
            dest_qp_num,
            rq_psn,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
            ah_attr: AddressVector {
                dgid,
                port_num: PORT_NUM,
            },
            ..Default::default()
        };
        let mask = QpAttrMask::STATE
            | QpAttrMask::AV
            | QpAttrMask::PATH_MTU
            | QpAttrMask::DEST_QPN
            | QpAttrMask::RQ_PSN
            | QpAttrMask::MAX_DEST_RD_ATOMIC
            | QpAttrMask::MIN_RNR_TIMER;
        self.modify(&attr, mask)
    }

    /// Transition to RTS.
    pub fn to_rts(&self, sq_psn: u32) -> Result<()> {
        let attr = QpAttr {
            qp_state: QpState::Rts,
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            sq_psn,
            max_rd_atomic: 1,
            ..Default::default()
        };
        let mask = QpAttrMask::STATE
            | QpAttrMask::TIMEOUT
            | QpAttrMask::RETRY_CNT
            | QpAttrMask::RNR_RETRY
            | QpAttrMask::SQ_PSN
            | QpAttrMask::MAX_QP_RD_ATOMIC;
        self.modify(&attr, mask)
    }

    /// Query the QP's committed attributes and creation attributes.
    pub fn query(&self) -> Result<(QpAttr, QpInitAttr)> {
        // The model is authoritative; the slot is resolved for support only.
        self.shared.device().ops().resolve(Verb::QueryQp)?;
        let (state, mut attr) = self.shared.snapshot();
        attr.qp_state = state;
        Ok((attr, self.shared.init.clone()))
    }

    /// Post a batch of send work requests.
    ///
    /// Valid only in RTS. Each WR is validated independently; on the first
    /// invalid WR posting stops and the error reports its index and how
    /// many earlier requests were accepted.
    pub fn post_send(&self, wrs: &[SendWr]) -> Result<()> {
        let shared = &self.shared;
        let dev = shared.device();
        let resolved = dev.ops().resolve(Verb::PostSend)?;
        for (index, wr) in wrs.iter().enumerate() {
            tracing::trace!(qpn = shared.qpn, wr_id = wr.wr_id, "post send");
            let state = lock(&shared.inner).state;
            if state != QpState::Rts {
                return Err(Error::post(
                    index,
                    Error::State {
                        op: "post_send",
                        state,
                    },
                ));
            }
            self.validate_send(wr).map_err(|e| Error::post(index, e))?;
            match &resolved {
                Resolved::Default => soft::execute_send(shared, wr),
                Resolved::Backend(p) => p
                    .post_send(&shared.pd.context().device(), shared.qpn, wr)
                    .map_err(|e| Error::post(index, e))?,
            }
        }
        Ok(())
    }

    /// Post a batch of receive work requests.
    ///
    /// Valid from INIT onward, so buffers can be pre-posted before the
    /// connection is fully established. Same partial-batch contract as
    /// [`post_send`](Self::post_send).
    pub fn post_recv(&self, wrs: &[RecvWr]) -> Result<()> {
        let shared = &self.shared;
        let dev = shared.device();
        let resolved = dev.ops().resolve(Verb::PostRecv)?;
        for (index, wr) in wrs.iter().enumerate() {
            tracing::trace!(qpn = shared.qpn, wr_id = wr.wr_id, "post recv");
            let state = lock(&shared.inner).state;
            if !matches!(state, QpState::Init | QpState::Rtr | QpState::Rts) {
                return Err(Error::post(
                    index,
                    Error::State {
                        op: "post_recv",
                        state,
                    },
                ));
            }
            self.validate_recv(wr).map_err(|e| Error::post(index, e))?;
            match &resolved {
                Resolved::Default => {
                    let mut queue = lock(&shared.recv_queue);
                    if queue.len() >= shared.init.max_recv_wr as usize {
                        return Err(Error::post(index, Error::Exhausted("receive queue full")));
                    }
                    queue.push_back(PostedRecv {
                        wr_id: wr.wr_id,
                        sges: wr.sges.clone(),
                    });
                }
                Resolved::Backend(p) => p
                    .post_recv(&shared.pd.context().device(), shared.qpn, wr)
                    .map_err(|e| Error::post(index, e))?,
            }
        }
        Ok(())
    }

    fn validate_send(&self, wr: &SendWr) -> Result<()> {
        let shared = &self.shared;
        if wr.sges.len() > shared.init.max_send_sge as usize {
            return Err(Error::invalid_arg(format!(
                "{} sges exceed QP maximum {}",
                wr.sges.len(),
                shared.init.max_send_sge
            )));
        }
        if wr.opcode.is_rdma() && wr.rkey == 0 {
            return Err(Error::invalid_arg("RDMA opcode requires remote_addr/rkey"));
        }
        // An RDMA READ lands data in the local buffers.
        let needs_write = matches!(wr.opcode, crate::wr::WrOpcode::RdmaRead);
        let mrs = lock(&shared.pd.mrs);
        for sge in &wr.sges {
            mrs.check_local(sge, needs_write)?;
        }
        Ok(())
    }

    fn validate_recv(&self, wr: &RecvWr) -> Result<()> {
        let shared = &self.shared;
        if wr.sges.len() > shared.init.max_recv_sge as usize {
            return Err(Error::invalid_arg(format!(
                "{} sges exceed QP maximum {}",
                wr.sges.len(),
                shared.init.max_recv_sge
            )));
        }
        let mrs = lock(&shared.pd.mrs);
        for sge in &wr.sges {
            mrs.check_local(sge, true)?;
        }
        Ok(())
    }

    /// The PD this QP belongs to.
    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.shared.pd
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        let shared = &self.shared;
        let dev = shared.device();
        tracing::debug!(qpn = shared.qpn, "destroy qp");
        dev.unregister_qp(shared.qpn);
        // Queued-but-unprocessed receives drain with flush completions.
        shared.flush_recvs();
        if let Ok(Resolved::Backend(p)) = dev.ops().resolve(Verb::DestroyQp) {
            if let Err(e) = p.destroy_qp(&shared.pd.context().device(), shared.qpn) {
                tracing::error!("backend destroy_qp failed: {e}");
            }
        }
        dev.put(&dev.qp_count);
    }
}

fn validate_init_attr(init: &QpInitAttr, dev: &DeviceState) -> Result<()> {
    let cfg = dev.config();
    let checks = [
        (init.max_send_wr, cfg.max_qp_wr, "max_send_wr"),
        (init.max_recv_wr, cfg.max_qp_wr, "max_recv_wr"),
        (init.max_send_sge, cfg.max_sge, "max_send_sge"),
        (init.max_recv_sge, cfg.max_sge, "max_recv_sge"),
    ];
    for (value, max, what) in checks {
        if value == 0 {
            return Err(Error::invalid_arg(format!("{what} must be > 0")));
        }
        if value > max {
            return Err(Error::invalid_arg(format!(
                "{what} {value} exceeds device maximum {max}"
            )));
        }
    }
    Ok(())
}

fn require(mask: QpAttrMask, needed: QpAttrMask, transition: &str) -> Result<()> {
    let missing = needed - mask;
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid_arg(format!(
            "{transition} requires attribute mask bits {missing:?}"
        )))
    }
}

fn apply(dst: &mut QpAttr, src: &QpAttr, mask: QpAttrMask) {
    if mask.contains(QpAttrMask::PKEY_INDEX) {
        dst.pkey_index = src.pkey_index;
    }
    if mask.contains(QpAttrMask::PORT) {
        dst.port_num = src.port_num;
    }
    if mask.contains(QpAttrMask::ACCESS_FLAGS) {
        dst.qp_access_flags = src.qp_access_flags;
    }
    if mask.contains(QpAttrMask::AV) {
        dst.ah_attr = src.ah_attr;
    }
    if mask.contains(QpAttrMask::PATH_MTU) {
        dst.path_mtu = src.path_mtu;
    }
    if mask.contains(QpAttrMask::DEST_QPN) {
        dst.dest_qp_num = src.dest_qp_num;
    }
    if mask.contains(QpAttrMask::RQ_PSN) {
        dst.rq_psn = src.rq_psn;
    }
    if mask.contains(QpAttrMask::MAX_DEST_RD_ATOMIC) {
        dst.max_dest_rd_atomic = src.max_dest_rd_atomic;
    }
    if mask.contains(QpAttrMask::MIN_RNR_TIMER) {
        dst.min_rnr_timer = src.min_rnr_timer;
    }
    if mask.contains(QpAttrMask::TIMEOUT) {
        dst.timeout = src.timeout;
    }
    if mask.contains(QpAttrMask::RETRY_CNT) {
        dst.retry_cnt = src.retry_cnt;
    }
    if mask.contains(QpAttrMask::RNR_RETRY) {
        dst.rnr_retry = src.rnr_retry;
    }
    if mask.contains(QpAttrMask::SQ_PSN) {
        dst.sq_psn = src.sq_psn;
    }
    if mask.contains(QpAttrMask::MAX_QP_RD_ATOMIC) {
        dst.max_rd_atomic = src.max_rd_atomic;
    }
}

//! Work completion types.

use crate::{Error, Result};

bitflags::bitflags! {
    /// Flags carried on a work completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WcFlags: u32 {
        /// The completion carries immediate data.
        const WITH_IMM = 1 << 0;
        /// The peer marked the message solicited.
        const SOLICITED = 1 << 1;
    }
}

/// Work completion status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WcStatus {
    /// The work request completed successfully.
    #[default]
    Success,
    /// A local scatter buffer was too short for the incoming message.
    LocLenErr,
    /// A local key failed protection checks.
    LocProtErr,
    /// A local buffer violated its MR's access rights.
    LocAccessErr,
    /// The work request was flushed because the QP was destroyed or moved
    /// to the error state.
    WrFlushErr,
    /// The remote side rejected the request as malformed (for example, a
    /// message longer than the posted receive).
    RemInvReqErr,
    /// The remote key or address failed the peer's protection checks.
    RemAccessErr,
    /// The remote side failed while executing the request.
    RemOpErr,
    /// The transport gave up retrying; the peer did not respond.
    RetryExcErr,
    /// The peer had no receive posted and RNR retries were exhausted.
    RnrRetryExcErr,
    /// Unclassified failure.
    GeneralErr,
}

/// Opcode recorded on a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WcOpcode {
    /// Completed send.
    #[default]
    Send,
    /// Completed RDMA write.
    RdmaWrite,
    /// Completed RDMA read.
    RdmaRead,
    /// Completed receive.
    Recv,
    /// Receive consumed by an RDMA write with immediate data.
    RecvRdmaWithImm,
}

/// A work completion entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkCompletion {
    pub(crate) wr_id: u64,
    pub(crate) status: WcStatus,
    pub(crate) opcode: WcOpcode,
    pub(crate) byte_len: u32,
    pub(crate) qp_num: u32,
    pub(crate) flags: WcFlags,
    pub(crate) imm_data: u32,
}

impl WorkCompletion {
    /// The WR id that was completed.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Completion status.
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Whether this completion is successful.
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }

    /// Completion opcode.
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Number of bytes transferred.
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// QP number that generated this completion.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Completion flags.
    pub fn wc_flags(&self) -> WcFlags {
        self.flags
    }

    /// Immediate data, if the peer sent any.
    pub fn imm_data(&self) -> Option<u32> {
        self.flags
            .contains(WcFlags::WITH_IMM)
            .then_some(self.imm_data)
    }

    /// Whether the peer marked this message solicited.
    pub fn is_solicited(&self) -> bool {
        self.flags.contains(WcFlags::SOLICITED)
    }

    /// Convert an error-status completion into an [`Error`].
    pub fn ok(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::WorkCompletion {
                qpn: self.qp_num,
                status: self.status,
            })
        }
    }
}

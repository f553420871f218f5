//! Work request builders and related types.

/// QP transport type.
///
/// Only reliable-connected QPs are implemented by the soft engine; the
/// other variants exist so a backend module can accept them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// Reliable connected.
    Rc,
    /// Unreliable connected.
    Uc,
    /// Unreliable datagram.
    Ud,
}

/// QP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QpState {
    /// Initial state after creation.
    #[default]
    Reset,
    /// Initialized: port, pkey and access flags are set; receives may be
    /// pre-posted.
    Init,
    /// Ready to receive: destination is known.
    Rtr,
    /// Ready to send.
    Rts,
    /// Terminal error state; all posts fail and outstanding work is
    /// flushed.
    Error,
}

bitflags::bitflags! {
    /// Per-request flags for send work requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u32 {
        /// Generate a completion for this request even when the QP was
        /// created without `sq_sig_all`.
        const SIGNALED = 1 << 0;
        /// Mark the resulting remote completion as solicited, waking
        /// solicited-only notification waiters.
        const SOLICITED = 1 << 1;
        /// Fence: do not start before prior RDMA READs complete.
        const FENCE = 1 << 2;
    }
}

/// Scatter-gather entry: one registered buffer slice of a work request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sge {
    /// Virtual address of the buffer.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the MR covering the buffer.
    pub lkey: u32,
}

impl Sge {
    /// Create a new SGE.
    pub fn new(addr: u64, length: u32, lkey: u32) -> Self {
        Self { addr, length, lkey }
    }
}

/// Opcode for send work requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    /// Two-sided send, consumed by a posted receive on the peer.
    Send,
    /// Send carrying 32 bits of immediate data.
    SendWithImm(u32),
    /// One-sided write into remote memory; invisible to the peer's CQ.
    RdmaWrite,
    /// One-sided write that additionally consumes a posted receive and
    /// delivers immediate data.
    RdmaWriteWithImm(u32),
    /// One-sided read from remote memory.
    RdmaRead,
}

impl WrOpcode {
    /// Whether this opcode addresses remote memory directly.
    pub fn is_rdma(self) -> bool {
        !matches!(self, Self::Send | Self::SendWithImm(_))
    }
}

/// Builder for a send work request.
///
/// Consumed by posting; never mutated by the device afterwards.
#[derive(Debug, Clone)]
pub struct SendWr {
    pub(crate) wr_id: u64,
    pub(crate) opcode: WrOpcode,
    pub(crate) send_flags: SendFlags,
    pub(crate) sges: Vec<Sge>,
    pub(crate) remote_addr: u64,
    pub(crate) rkey: u32,
}

impl SendWr {
    /// Create a new send WR with the given correlation id.
    pub fn new(wr_id: u64, opcode: WrOpcode) -> Self {
        Self {
            wr_id,
            opcode,
            send_flags: SendFlags::empty(),
            sges: Vec::new(),
            remote_addr: 0,
            rkey: 0,
        }
    }

    /// Set send flags.
    pub fn flags(mut self, flags: SendFlags) -> Self {
        self.send_flags = flags;
        self
    }

    /// Add a scatter-gather entry.
    pub fn sg(mut self, sge: Sge) -> Self {
        self.sges.push(sge);
        self
    }

    /// Set the remote address and rkey (required for RDMA opcodes).
    pub fn rdma(mut self, remote_addr: u64, rkey: u32) -> Self {
        self.remote_addr = remote_addr;
        self.rkey = rkey;
        self
    }

    /// The correlation id.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Total gather length in bytes.
    pub fn byte_len(&self) -> u32 {
        self.sges.iter().map(|s| s.length).sum()
    }
}

/// Builder for a receive work request.
#[derive(Debug, Clone)]
pub struct RecvWr {
    pub(crate) wr_id: u64,
    pub(crate) sges: Vec<Sge>,
}

impl RecvWr {
    /// Create a new receive WR with the given correlation id.
    pub fn new(wr_id: u64) -> Self {
        Self {
            wr_id,
            sges: Vec::new(),
        }
    }

    /// Add a scatter-gather entry.
    pub fn sg(mut self, sge: Sge) -> Self {
        self.sges.push(sge);
        self
    }

    /// The correlation id.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }
}

//! The per-device operation dispatch table and the backend module contract.
//!
//! Every verbs operation has a named slot. At device-allocation time the
//! table starts empty, the core marks the slots it implements itself, and
//! an attached backend module then overrides every slot its provider
//! reports. Invoking a slot resolved by neither source fails with
//! [`Error::Unsupported`] instead of crashing.

use strum::EnumCount as _;

use crate::device::{Device, DeviceAttr, PortAttr};
use crate::gid::{Gid, GidAttr};
use crate::mr::{AccessFlags, MrKeys};
use crate::qp::{QpAttr, QpAttrMask, QpInitAttr};
use crate::wr::{RecvWr, SendWr};
use crate::{Error, Result};

/// The verbs operation slots, one per named entry point.
///
/// Slot names follow the `<prefix>_<opname>` symbol convention; see
/// [`Verb::symbol`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
    strum_macros::EnumCount,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[allow(missing_docs)]
pub enum Verb {
    AdviseMr,
    AllocDm,
    AllocMw,
    AllocNullMr,
    AllocParentDomain,
    AllocPd,
    AllocTd,
    AllocUcontext,
    AddGid,
    AsyncEvent,
    AttachMcast,
    BindMw,
    CloseXrcd,
    CqEvent,
    CreateAh,
    CreateCounters,
    CreateCq,
    CreateCqEx,
    CreateFlow,
    CreateQp,
    CreateQpEx,
    CreateRwqIndTable,
    CreateSrq,
    CreateSrqEx,
    CreateWq,
    DeallocMw,
    DeallocPd,
    DeallocTd,
    DeallocUcontext,
    DelGid,
    DeregMr,
    DestroyAh,
    DestroyCounters,
    DestroyCq,
    DestroyFlow,
    DestroyQp,
    DestroyRwqIndTable,
    DestroySrq,
    DestroyWq,
    DetachMcast,
    FreeDm,
    GetPortImmutable,
    GetSrqNum,
    ImportDm,
    ImportMr,
    ImportPd,
    ModifyCq,
    ModifyQp,
    ModifyQpRateLimit,
    ModifySrq,
    ModifyWq,
    OpenQp,
    OpenXrcd,
    PollCq,
    PostRecv,
    PostSend,
    PostSrqOps,
    PostSrqRecv,
    QueryDevice,
    QueryDeviceEx,
    QueryEce,
    QueryGid,
    QueryPkey,
    QueryPort,
    QueryQp,
    QueryQpDataInOrder,
    QueryRtValues,
    QuerySrq,
    ReadCounters,
    RegDmMr,
    RegDmabufMr,
    RegMr,
    ReqNotifyCq,
    ReregMr,
    ResizeCq,
    SetEce,
}

impl Verb {
    /// The exported symbol name a native backend would use for this slot.
    pub fn symbol(&self) -> String {
        format!("bluerdma_{self}")
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Slots the core guarantees to implement itself.
const CORE_DEFAULTS: &[Verb] = &[
    Verb::QueryDevice,
    Verb::QueryPort,
    Verb::QueryGid,
    Verb::QueryPkey,
    Verb::GetPortImmutable,
    Verb::AllocUcontext,
    Verb::DeallocUcontext,
    Verb::AllocPd,
    Verb::DeallocPd,
    Verb::RegMr,
    Verb::DeregMr,
    Verb::CreateCq,
    Verb::PollCq,
    Verb::ReqNotifyCq,
    Verb::DestroyCq,
    Verb::CreateQp,
    Verb::QueryQp,
    Verb::ModifyQp,
    Verb::DestroyQp,
    Verb::PostSend,
    Verb::PostRecv,
    Verb::AddGid,
    Verb::DelGid,
];

/// A loadable backend module.
///
/// The module's one mandatory constructor takes the device name and
/// returns the opaque per-device driver state; the state's `Drop` is the
/// mandatory destructor. Exactly one provider instance is opened per
/// allocated device and dropped at device teardown.
pub trait BackendModule: Send + Sync {
    /// Construct the driver state for the named device.
    ///
    /// An error here fails device allocation entirely; no partial device
    /// is registered.
    fn open(&self, device_name: &str) -> Result<Box<dyn VerbsProvider>>;
}

/// Per-device driver state with optional operation overrides.
///
/// A provider implements any subset of the operations and reports the
/// corresponding slots from [`provided`](Self::provided); every reported
/// slot overrides the core default in the dispatch table. Unimplemented
/// methods keep the default body and fail with the not-supported
/// condition if reached.
#[allow(unused_variables)]
pub trait VerbsProvider: Send + Sync {
    /// The slots this provider overrides.
    fn provided(&self) -> &[Verb] {
        &[]
    }

    /// Override for the device-attribute query.
    fn query_device(&self, dev: &Device) -> Result<DeviceAttr> {
        Err(Error::Unsupported(Verb::QueryDevice))
    }

    /// Override for the port-attribute query.
    fn query_port(&self, dev: &Device, port: u8) -> Result<PortAttr> {
        Err(Error::Unsupported(Verb::QueryPort))
    }

    /// Override for GID table reads.
    fn query_gid(&self, dev: &Device, port: u8, index: usize) -> Result<Gid> {
        Err(Error::Unsupported(Verb::QueryGid))
    }

    /// Override for partition key reads.
    fn query_pkey(&self, dev: &Device, port: u8, index: usize) -> Result<u16> {
        Err(Error::Unsupported(Verb::QueryPkey))
    }

    /// Override for GID table installs.
    fn add_gid(&self, dev: &Device, attr: &GidAttr) -> Result<()> {
        Err(Error::Unsupported(Verb::AddGid))
    }

    /// Override for GID table invalidation.
    fn del_gid(&self, dev: &Device, attr: &GidAttr) -> Result<()> {
        Err(Error::Unsupported(Verb::DelGid))
    }

    /// Hook invoked when a context is opened on the device.
    fn alloc_ucontext(&self, dev: &Device) -> Result<()> {
        Err(Error::Unsupported(Verb::AllocUcontext))
    }

    /// Hook invoked when a context is released.
    fn dealloc_ucontext(&self, dev: &Device) -> Result<()> {
        Err(Error::Unsupported(Verb::DeallocUcontext))
    }

    /// Hook invoked when a PD is allocated.
    fn alloc_pd(&self, dev: &Device) -> Result<()> {
        Err(Error::Unsupported(Verb::AllocPd))
    }

    /// Hook invoked when a PD is released.
    fn dealloc_pd(&self, dev: &Device) -> Result<()> {
        Err(Error::Unsupported(Verb::DeallocPd))
    }

    /// Override for MR key derivation.
    fn reg_mr(&self, dev: &Device, addr: u64, length: usize, access: AccessFlags) -> Result<MrKeys> {
        Err(Error::Unsupported(Verb::RegMr))
    }

    /// Hook invoked when an MR is deregistered.
    fn dereg_mr(&self, dev: &Device, lkey: u32) -> Result<()> {
        Err(Error::Unsupported(Verb::DeregMr))
    }

    /// Hook invoked when a CQ is created.
    fn create_cq(&self, dev: &Device, depth: usize) -> Result<()> {
        Err(Error::Unsupported(Verb::CreateCq))
    }

    /// Hook invoked when a CQ is destroyed.
    fn destroy_cq(&self, dev: &Device) -> Result<()> {
        Err(Error::Unsupported(Verb::DestroyCq))
    }

    /// Override for CQ resizing. The core never implements this slot.
    fn resize_cq(&self, dev: &Device, depth: usize) -> Result<()> {
        Err(Error::Unsupported(Verb::ResizeCq))
    }

    /// Override for QP number assignment.
    fn create_qp(&self, dev: &Device, init: &QpInitAttr) -> Result<u32> {
        Err(Error::Unsupported(Verb::CreateQp))
    }

    /// Hook invoked after a QP transition is validated, before it commits.
    /// An error vetoes the transition.
    fn modify_qp(&self, dev: &Device, qpn: u32, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        Err(Error::Unsupported(Verb::ModifyQp))
    }

    /// Hook invoked when a QP is destroyed.
    fn destroy_qp(&self, dev: &Device, qpn: u32) -> Result<()> {
        Err(Error::Unsupported(Verb::DestroyQp))
    }

    /// Override for send work-request execution.
    fn post_send(&self, dev: &Device, qpn: u32, wr: &SendWr) -> Result<()> {
        Err(Error::Unsupported(Verb::PostSend))
    }

    /// Override for receive work-request admission.
    fn post_recv(&self, dev: &Device, qpn: u32, wr: &RecvWr) -> Result<()> {
        Err(Error::Unsupported(Verb::PostRecv))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    CoreDefault,
    Backend,
}

/// Who implements a resolved slot.
pub(crate) enum Resolved<'a> {
    /// The core default implementation.
    Default,
    /// The device's backend provider.
    Backend(&'a dyn VerbsProvider),
}

/// The per-device dispatch table.
pub(crate) struct OpTable {
    slots: [Slot; Verb::COUNT],
    provider: Option<Box<dyn VerbsProvider>>,
}

impl OpTable {
    /// Build the table: all slots empty, core defaults applied, then the
    /// provider's slots layered on top.
    pub(crate) fn build(provider: Option<Box<dyn VerbsProvider>>) -> Self {
        let mut slots = [Slot::Empty; Verb::COUNT];
        for verb in CORE_DEFAULTS {
            slots[verb.index()] = Slot::CoreDefault;
        }
        if let Some(p) = &provider {
            for verb in p.provided() {
                tracing::debug!(slot = %verb, "backend overrides op slot");
                slots[verb.index()] = Slot::Backend;
            }
        }
        Self { slots, provider }
    }

    /// Resolve a slot, failing with the not-supported condition when it
    /// was populated by neither source.
    pub(crate) fn resolve(&self, verb: Verb) -> Result<Resolved<'_>> {
        match self.slots[verb.index()] {
            Slot::Empty => Err(Error::Unsupported(verb)),
            Slot::CoreDefault => Ok(Resolved::Default),
            Slot::Backend => {
                // A Backend slot can only have been marked with a provider
                // present.
                match self.provider.as_deref() {
                    Some(p) => Ok(Resolved::Backend(p)),
                    None => Err(Error::Unsupported(verb)),
                }
            }
        }
    }

    /// Whether the slot is implemented by either source.
    pub(crate) fn supports(&self, verb: Verb) -> bool {
        self.slots[verb.index()] != Slot::Empty
    }
}

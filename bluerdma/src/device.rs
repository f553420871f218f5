//! Device enumeration, the device registry and opened contexts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::gid::{Gid, GidAttr, GidTable};
use crate::netdev::{MacAddr, NetDevice, DEFAULT_MTU};
use crate::ops::{BackendModule, OpTable, Resolved, Verb};
use crate::qp::QpShared;
use crate::{lock, Error, Result};

/// The single supported port number.
pub const PORT_NUM: u8 = 1;

/// Userspace ABI version reported by every device.
pub const ABI_VERSION: u32 = 1;

/// The default partition key at pkey index 0.
pub const DEFAULT_PKEY: u16 = 1;

/// Path MTU, as negotiated on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Mtu {
    /// 256 bytes.
    Mtu256,
    /// 512 bytes.
    Mtu512,
    /// 1024 bytes.
    #[default]
    Mtu1024,
    /// 2048 bytes.
    Mtu2048,
    /// 4096 bytes.
    Mtu4096,
}

impl Mtu {
    /// The MTU in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
            Self::Mtu2048 => 2048,
            Self::Mtu4096 => 4096,
        }
    }
}

/// Creation-time limits and sizing for a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Number of GID table slots per port.
    pub gid_table_len: usize,
    /// Maximum live QPs.
    pub max_qp: u32,
    /// Maximum live CQs.
    pub max_cq: u32,
    /// Maximum live MRs.
    pub max_mr: u32,
    /// Maximum live PDs.
    pub max_pd: u32,
    /// Maximum outstanding work requests per queue.
    pub max_qp_wr: u32,
    /// Maximum scatter-gather entries per work request.
    pub max_sge: u32,
    /// Maximum CQ depth.
    pub max_cqe: u32,
    /// Netdevice MTU.
    pub mtu: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gid_table_len: 16,
            max_qp: 256,
            max_cq: 512,
            max_mr: 1024,
            max_pd: 256,
            max_qp_wr: 1024,
            max_sge: 32,
            max_cqe: 4096,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Device attributes, as returned by `query_device`.
#[derive(Debug, Clone)]
pub struct DeviceAttr {
    /// Human-readable node description.
    pub node_desc: String,
    /// Node GUID, derived from the link-layer address.
    pub node_guid: u64,
    /// Maximum live QPs.
    pub max_qp: u32,
    /// Maximum live CQs.
    pub max_cq: u32,
    /// Maximum live MRs.
    pub max_mr: u32,
    /// Maximum live PDs.
    pub max_pd: u32,
    /// Maximum outstanding work requests per queue.
    pub max_qp_wr: u32,
    /// Maximum scatter-gather entries per work request.
    pub max_sge: u32,
    /// Maximum CQ depth.
    pub max_cqe: u32,
    /// Number of physical ports.
    pub phys_port_cnt: u8,
    /// Userspace ABI version.
    pub abi_version: u32,
}

/// Port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Link down.
    Down,
    /// Link up and usable.
    Active,
}

/// Port attributes, as returned by `query_port`.
#[derive(Debug, Clone)]
pub struct PortAttr {
    /// Current port state.
    pub state: PortState,
    /// Largest supported path MTU.
    pub max_mtu: Mtu,
    /// Currently active path MTU.
    pub active_mtu: Mtu,
    /// Number of GID table slots.
    pub gid_tbl_len: usize,
    /// Number of pkey table slots.
    pub pkey_tbl_len: usize,
}

/// Immutable per-port data, fixed at registration time.
#[derive(Debug, Clone, Copy)]
pub struct PortImmutable {
    /// Number of GID table slots.
    pub gid_tbl_len: usize,
    /// Number of pkey table slots.
    pub pkey_tbl_len: usize,
}

pub(crate) struct DeviceState {
    id: usize,
    name: String,
    config: DeviceConfig,
    netdev: NetDevice,
    gid_table: GidTable,
    ops: OpTable,
    /// Keeps the backend module loaded until after the provider state in
    /// `ops` has been dropped (fields drop in declaration order).
    _backend_module: Option<Arc<dyn BackendModule>>,
    qpn_counter: AtomicU32,
    key_counter: AtomicU32,
    qp_directory: Mutex<HashMap<u32, Weak<QpShared>>>,
    pub(crate) pd_count: AtomicU32,
    pub(crate) cq_count: AtomicU32,
    pub(crate) qp_count: AtomicU32,
    pub(crate) mr_count: AtomicU32,
}

impl DeviceState {
    pub(crate) fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub(crate) fn ops(&self) -> &OpTable {
        &self.ops
    }

    pub(crate) fn netdev(&self) -> &NetDevice {
        &self.netdev
    }

    pub(crate) fn alloc_qpn(&self) -> u32 {
        self.qpn_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate an (lkey, rkey) pair. Keys are distinct and nonzero.
    pub(crate) fn alloc_keys(&self) -> (u32, u32) {
        let base = self.key_counter.fetch_add(2, Ordering::Relaxed);
        (base, base + 1)
    }

    pub(crate) fn register_qp(&self, qpn: u32, qp: Weak<QpShared>) {
        lock(&self.qp_directory).insert(qpn, qp);
    }

    pub(crate) fn unregister_qp(&self, qpn: u32) {
        lock(&self.qp_directory).remove(&qpn);
    }

    pub(crate) fn lookup_qp(&self, qpn: u32) -> Option<Arc<QpShared>> {
        lock(&self.qp_directory).get(&qpn).and_then(Weak::upgrade)
    }

    pub(crate) fn take(&self, count: &AtomicU32, max: u32, what: &'static str) -> Result<()> {
        count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c < max).then_some(c + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::Exhausted(what))
    }

    pub(crate) fn put(&self, count: &AtomicU32) {
        count.fetch_sub(1, Ordering::SeqCst);
    }

    fn device_attr(&self) -> DeviceAttr {
        DeviceAttr {
            node_desc: "bluerdma".to_owned(),
            node_guid: self.node_guid(),
            max_qp: self.config.max_qp,
            max_cq: self.config.max_cq,
            max_mr: self.config.max_mr,
            max_pd: self.config.max_pd,
            max_qp_wr: self.config.max_qp_wr,
            max_sge: self.config.max_sge,
            max_cqe: self.config.max_cqe,
            phys_port_cnt: 1,
            abi_version: ABI_VERSION,
        }
    }

    fn port_attr(&self) -> PortAttr {
        let state = if self.netdev.is_up() {
            PortState::Active
        } else {
            PortState::Down
        };
        PortAttr {
            state,
            max_mtu: Mtu::Mtu4096,
            active_mtu: Mtu::Mtu4096,
            gid_tbl_len: self.gid_table.len(),
            pkey_tbl_len: 1,
        }
    }

    fn node_guid(&self) -> u64 {
        let raw = Gid::from_mac(self.netdev.mac()).raw();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[8..]);
        u64::from_be_bytes(bytes)
    }

    fn check_port(&self, port: u8) -> Result<()> {
        if port == PORT_NUM {
            Ok(())
        } else {
            Err(Error::invalid_arg(format!("bad port number {port}")))
        }
    }
}

/// A registered adapter device.
///
/// Cheap to clone; all clones refer to the same device. Obtained from a
/// [`DeviceRegistry`].
#[derive(Clone)]
pub struct Device {
    pub(crate) state: Arc<DeviceState>,
}

impl Device {
    /// The device name (`bluerdma<N>`).
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The numeric device id.
    pub fn id(&self) -> usize {
        self.state.id
    }

    /// The node GUID, derived from the link-layer address.
    pub fn guid(&self) -> u64 {
        self.state.node_guid()
    }

    /// The paired Ethernet netdevice.
    pub fn netdev(&self) -> &NetDevice {
        &self.state.netdev
    }

    /// The device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.state.config
    }

    /// Open the device and return a [`Context`].
    pub fn open(&self) -> Result<Arc<Context>> {
        tracing::debug!(device = %self.name(), "alloc ucontext");
        if let Resolved::Backend(p) = self.state.ops.resolve(Verb::AllocUcontext)? {
            p.alloc_ucontext(self)?;
        }
        Ok(Arc::new(Context {
            device: Arc::clone(&self.state),
        }))
    }

    /// Install a GID table entry.
    pub fn add_gid(&self, attr: &GidAttr) -> Result<()> {
        tracing::debug!(device = %self.name(), index = attr.index, gid = %attr.gid, "add gid");
        self.state.check_port(attr.port)?;
        match self.state.ops.resolve(Verb::AddGid)? {
            Resolved::Default => self.state.gid_table.add(attr),
            Resolved::Backend(p) => p.add_gid(self, attr),
        }
    }

    /// Invalidate a GID table entry.
    pub fn del_gid(&self, attr: &GidAttr) -> Result<()> {
        tracing::debug!(device = %self.name(), index = attr.index, "del gid");
        self.state.check_port(attr.port)?;
        match self.state.ops.resolve(Verb::DelGid)? {
            Resolved::Default => self.state.gid_table.del(attr),
            Resolved::Backend(p) => p.del_gid(self, attr),
        }
    }

    /// Render the valid GID table entries, one textual address per line
    /// (the read-only `gids` attribute).
    pub fn gids_attr(&self) -> String {
        self.state.gid_table.render()
    }

    /// Render the link-layer address in canonical textual form (the
    /// read-only `mac` attribute).
    pub fn mac_attr(&self) -> String {
        format!("{}\n", self.state.netdev.mac())
    }

    /// The link-layer address.
    pub fn mac(&self) -> MacAddr {
        self.state.netdev.mac()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.state.name)
            .field("id", &self.state.id)
            .finish()
    }
}

/// The set of registered devices.
///
/// Constructing the registry is the module-load analog: it creates `count`
/// devices named `bluerdma0..` with paired netdevices `blue0..`, builds
/// each device's dispatch table and, when a backend module is given, opens
/// one provider instance per device. Dropping the registry tears all
/// devices down.
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Create `count` devices using only the core default operations.
    pub fn new(count: usize, config: DeviceConfig) -> Result<Self> {
        Self::build(count, config, None)
    }

    /// Create `count` devices with a backend module attached.
    ///
    /// If the module fails to open for any device, the whole registry
    /// build fails and every already-built device is torn down.
    pub fn with_backend(
        count: usize,
        config: DeviceConfig,
        module: Arc<dyn BackendModule>,
    ) -> Result<Self> {
        Self::build(count, config, Some(module))
    }

    fn build(
        count: usize,
        config: DeviceConfig,
        module: Option<Arc<dyn BackendModule>>,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::invalid_arg("device count must be > 0"));
        }
        if config.gid_table_len == 0 {
            return Err(Error::invalid_arg("gid table length must be > 0"));
        }
        let mut devices = Vec::with_capacity(count);
        for id in 0..count {
            let name = format!("bluerdma{id}");
            let provider = match &module {
                Some(m) => Some(
                    m.open(&name)
                        .map_err(|e| Error::Backend(format!("open({name}): {e}")))?,
                ),
                None => None,
            };
            let netdev = NetDevice::new(id, config.mtu);
            netdev.open();
            let gid_table = GidTable::new(config.gid_table_len, Gid::from_mac(netdev.mac()));
            let state = Arc::new(DeviceState {
                id,
                name: name.clone(),
                config: config.clone(),
                netdev,
                gid_table,
                ops: OpTable::build(provider),
                _backend_module: module.clone(),
                qpn_counter: AtomicU32::new(1),
                key_counter: AtomicU32::new(2),
                qp_directory: Mutex::new(HashMap::new()),
                pd_count: AtomicU32::new(0),
                cq_count: AtomicU32::new(0),
                qp_count: AtomicU32::new(0),
                mr_count: AtomicU32::new(0),
            });
            tracing::info!(device = %name, netdev = %state.netdev.name(), "registered device");
            devices.push(Device { state });
        }
        Ok(Self { devices })
    }

    /// All registered devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Look up a device by index.
    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices
            .get(index)
            .ok_or_else(|| Error::invalid_arg(format!("device index {index} out of range")))
    }

    /// Look up a device by name.
    pub fn device_by_name(&self, name: &str) -> Result<&Device> {
        if self.devices.is_empty() {
            return Err(Error::NoDevices);
        }
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| Error::DeviceNotFound(name.to_owned()))
    }

    /// The first registered device.
    pub fn first(&self) -> Result<&Device> {
        self.devices.first().ok_or(Error::NoDevices)
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for dev in &self.devices {
            dev.state.netdev.stop();
            tracing::info!(device = %dev.name(), "unregistered device");
        }
    }
}

/// An opened device context.
///
/// All other resources are created through a context and hold an `Arc` to
/// it, so a context outlives everything created from it.
pub struct Context {
    pub(crate) device: Arc<DeviceState>,
}

impl Context {
    /// The owning device.
    pub fn device(&self) -> Device {
        Device {
            state: Arc::clone(&self.device),
        }
    }

    /// Query device attributes.
    pub fn query_device(&self) -> Result<DeviceAttr> {
        tracing::trace!(device = %self.device.name, "query device");
        match self.device.ops.resolve(Verb::QueryDevice)? {
            Resolved::Default => Ok(self.device.device_attr()),
            Resolved::Backend(p) => p.query_device(&self.device()),
        }
    }

    /// Query port attributes.
    pub fn query_port(&self, port: u8) -> Result<PortAttr> {
        tracing::trace!(device = %self.device.name, port, "query port");
        self.device.check_port(port)?;
        match self.device.ops.resolve(Verb::QueryPort)? {
            Resolved::Default => Ok(self.device.port_attr()),
            Resolved::Backend(p) => p.query_port(&self.device(), port),
        }
    }

    /// Immutable port data.
    pub fn port_immutable(&self, port: u8) -> Result<PortImmutable> {
        self.device.check_port(port)?;
        Ok(PortImmutable {
            gid_tbl_len: self.device.gid_table.len(),
            pkey_tbl_len: 1,
        })
    }

    /// Query a GID table entry.
    pub fn query_gid(&self, port: u8, index: usize) -> Result<Gid> {
        tracing::trace!(device = %self.device.name, port, index, "query gid");
        self.device.check_port(port)?;
        match self.device.ops.resolve(Verb::QueryGid)? {
            Resolved::Default => self.device.gid_table.query(port, index),
            Resolved::Backend(p) => p.query_gid(&self.device(), port, index),
        }
    }

    /// Query a partition key.
    pub fn query_pkey(&self, port: u8, index: usize) -> Result<u16> {
        self.device.check_port(port)?;
        match self.device.ops.resolve(Verb::QueryPkey)? {
            Resolved::Default => {
                if index == 0 {
                    Ok(DEFAULT_PKEY)
                } else {
                    Err(Error::invalid_arg(format!("bad pkey index {index}")))
                }
            }
            Resolved::Backend(p) => p.query_pkey(&self.device(), port, index),
        }
    }

    /// Whether the device implements the given operation slot.
    pub fn supports(&self, verb: Verb) -> bool {
        self.device.ops.supports(verb)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device.name, "dealloc ucontext");
        if let Ok(Resolved::Backend(p)) = self.device.ops.resolve(Verb::DeallocUcontext) {
            let dev = Device {
                state: Arc::clone(&self.device),
            };
            if let Err(e) = p.dealloc_ucontext(&dev) {
                tracing::error!("backend dealloc_ucontext failed: {e}");
            }
        }
    }
}

//! The Ethernet identity paired with each RDMA device.
//!
//! Models the netdevice side of the adapter: MAC address, MTU, carrier
//! state and transmit counters. The packet path itself is out of scope;
//! the soft engine only accounts traffic here.

use std::sync::Mutex;

use crate::{Error, Result, lock};

/// Default netdevice MTU.
pub const DEFAULT_MTU: u32 = 1500;

const MIN_MTU: u32 = 68;
const MAX_MTU: u32 = 9216;

/// Locally-administered MAC prefix for adapter devices; the last octet is
/// the device id.
const MAC_PREFIX: [u8; 5] = [0x02, 0xbd, 0xbd, 0x00, 0x00];

/// An Ethernet link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Build from raw octets.
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Transmit counters, as reported by [`NetDevice::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetdevStats {
    /// Messages handed to the engine.
    pub tx_packets: u64,
    /// Payload bytes handed to the engine.
    pub tx_bytes: u64,
}

struct NetdevInner {
    mtu: u32,
    up: bool,
    stats: NetdevStats,
}

/// The Ethernet netdevice paired with an RDMA device.
pub struct NetDevice {
    name: String,
    mac: MacAddr,
    inner: Mutex<NetdevInner>,
}

impl NetDevice {
    /// Create the netdevice for device `id`, initially down.
    pub(crate) fn new(id: usize, mtu: u32) -> Self {
        let mut octets = [0u8; 6];
        octets[..5].copy_from_slice(&MAC_PREFIX);
        octets[5] = id as u8;
        Self {
            name: format!("blue{id}"),
            mac: MacAddr::new(octets),
            inner: Mutex::new(NetdevInner {
                mtu,
                up: false,
                stats: NetdevStats::default(),
            }),
        }
    }

    /// Interface name (`blue<N>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link-layer address.
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    /// Bring the interface up.
    pub fn open(&self) {
        tracing::info!(ifname = %self.name, "bringing up interface");
        lock(&self.inner).up = true;
    }

    /// Shut the interface down.
    pub fn stop(&self) {
        tracing::info!(ifname = %self.name, "shutting down interface");
        lock(&self.inner).up = false;
    }

    /// Whether the interface is administratively up.
    pub fn is_up(&self) -> bool {
        lock(&self.inner).up
    }

    /// Current MTU.
    pub fn mtu(&self) -> u32 {
        lock(&self.inner).mtu
    }

    /// Change the MTU.
    pub fn set_mtu(&self, new_mtu: u32) -> Result<()> {
        if !(MIN_MTU..=MAX_MTU).contains(&new_mtu) {
            return Err(Error::invalid_arg(format!(
                "mtu {new_mtu} outside [{MIN_MTU}, {MAX_MTU}]"
            )));
        }
        let mut inner = lock(&self.inner);
        tracing::info!(ifname = %self.name, old = inner.mtu, new = new_mtu, "changing MTU");
        inner.mtu = new_mtu;
        Ok(())
    }

    /// Transmit counters.
    pub fn stats(&self) -> NetdevStats {
        lock(&self.inner).stats
    }

    /// Account one transmitted message of `len` payload bytes.
    pub(crate) fn record_tx(&self, len: u64) {
        let mut inner = lock(&self.inner);
        inner.stats.tx_packets += 1;
        inner.stats.tx_bytes += len;
        tracing::trace!(ifname = %self.name, len, "tx");
    }
}

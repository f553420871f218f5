//! GID (global identifier) addresses and the per-device GID table.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use crate::netdev::MacAddr;
use crate::{Error, Result, lock};

/// A 128-bit network address identifying a port for RDMA addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    /// Build a GID from raw bytes.
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    /// The raw bytes.
    pub fn raw(&self) -> [u8; 16] {
        self.raw
    }

    /// Whether this is the all-zero (unspecified) address.
    pub fn is_zero(&self) -> bool {
        self.raw == [0u8; 16]
    }

    /// Derive the link-local default GID from a MAC address.
    ///
    /// EUI-64 mapping: `fe80::` prefix, the MAC split around `ff:fe`, and
    /// the universal/local bit of the first octet flipped.
    pub fn from_mac(mac: MacAddr) -> Self {
        let m = mac.octets();
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[8] = m[0] ^ 0x02;
        raw[9] = m[1];
        raw[10] = m[2];
        raw[11] = 0xff;
        raw[12] = 0xfe;
        raw[13] = m[3];
        raw[14] = m[4];
        raw[15] = m[5];
        Self { raw }
    }

    /// Build an IPv4-mapped GID (`::ffff:a.b.c.d`), the RoCEv2 form used
    /// when addressing peers by IPv4.
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        let o = addr.octets();
        let mut raw = [0u8; 16];
        raw[10] = 0xff;
        raw[11] = 0xff;
        raw[12..].copy_from_slice(&o);
        Self { raw }
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Ipv6Addr::from(self.raw).fmt(f)
    }
}

/// Attributes naming a GID table slot for add/delete operations.
#[derive(Debug, Clone, Copy)]
pub struct GidAttr {
    /// Port the slot belongs to.
    pub port: u8,
    /// Table index of the slot.
    pub index: usize,
    /// The address to install (ignored by delete).
    pub gid: Gid,
}

#[derive(Clone, Copy, Default)]
struct GidEntry {
    gid: Gid,
    valid: bool,
}

/// Fixed-size table of per-port addresses with validity flags.
///
/// All access goes through a single table-wide lock, held only for the
/// duration of each read-modify-write and never across calls back into the
/// caller. Index 0 holds the device's default address.
pub(crate) struct GidTable {
    slots: Mutex<Box<[GidEntry]>>,
}

impl GidTable {
    /// Create a table of `len` slots with `default_gid` valid at index 0.
    pub(crate) fn new(len: usize, default_gid: Gid) -> Self {
        let mut slots = vec![GidEntry::default(); len].into_boxed_slice();
        if let Some(first) = slots.first_mut() {
            first.gid = default_gid;
            first.valid = true;
        }
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Read the address at `index`, if the slot is valid.
    pub(crate) fn query(&self, port: u8, index: usize) -> Result<Gid> {
        let slots = lock(&self.slots);
        let entry = slots
            .get(index)
            .ok_or_else(|| Error::invalid_arg(format!("gid index {index} out of range")))?;
        if entry.valid {
            Ok(entry.gid)
        } else {
            Err(Error::AddrUnavailable { port, index })
        }
    }

    /// Install an address at the slot named by `attr` and mark it valid.
    pub(crate) fn add(&self, attr: &GidAttr) -> Result<()> {
        let mut slots = lock(&self.slots);
        let entry = slots.get_mut(attr.index).ok_or_else(|| {
            Error::invalid_arg(format!("gid index {} out of range", attr.index))
        })?;
        entry.gid = attr.gid;
        entry.valid = true;
        Ok(())
    }

    /// Mark the slot named by `attr` invalid. The stored bytes are left in
    /// place; they are meaningless once the flag is cleared.
    pub(crate) fn del(&self, attr: &GidAttr) -> Result<()> {
        let mut slots = lock(&self.slots);
        let entry = slots.get_mut(attr.index).ok_or_else(|| {
            Error::invalid_arg(format!("gid index {} out of range", attr.index))
        })?;
        entry.valid = false;
        Ok(())
    }

    /// Render the valid entries, one canonical textual address per line.
    pub(crate) fn render(&self) -> String {
        let slots = lock(&self.slots);
        let mut out = String::new();
        for entry in slots.iter().filter(|e| e.valid) {
            out.push_str(&entry.gid.to_string());
            out.push('\n');
        }
        out
    }
}

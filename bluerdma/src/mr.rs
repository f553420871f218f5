//! Memory regions and the per-PD key directory.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::pd::ProtectionDomain;
use crate::wc::WcStatus;
use crate::wr::Sge;
use crate::{Error, Result};

bitflags::bitflags! {
    /// Memory access rights for a registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessFlags: u32 {
        /// The device may write to the range locally (receives, RDMA READ
        /// responses landing here).
        const LOCAL_WRITE = 1 << 0;
        /// Remote peers may write to the range through the rkey.
        const REMOTE_WRITE = 1 << 1;
        /// Remote peers may read the range through the rkey.
        const REMOTE_READ = 1 << 2;
        /// Remote peers may perform atomics on the range.
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// The key pair derived for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    /// Key authorizing local access.
    pub lkey: u32,
    /// Key authorizing remote access.
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MrMeta {
    pub(crate) addr: u64,
    pub(crate) len: usize,
    pub(crate) access: AccessFlags,
}

impl MrMeta {
    fn contains(&self, addr: u64, len: usize) -> bool {
        let end = addr.checked_add(len as u64);
        match end {
            Some(end) => addr >= self.addr && end <= self.addr + self.len as u64,
            None => false,
        }
    }
}

/// Registered ranges of one PD, keyed by lkey and rkey.
#[derive(Default)]
pub(crate) struct MrDirectory {
    by_lkey: HashMap<u32, MrMeta>,
    by_rkey: HashMap<u32, MrMeta>,
}

impl MrDirectory {
    pub(crate) fn insert(&mut self, keys: MrKeys, meta: MrMeta) {
        self.by_lkey.insert(keys.lkey, meta);
        self.by_rkey.insert(keys.rkey, meta);
    }

    pub(crate) fn remove(&mut self, keys: MrKeys) {
        self.by_lkey.remove(&keys.lkey);
        self.by_rkey.remove(&keys.rkey);
    }

    /// Validate one local scatter-gather entry against this PD's
    /// registrations: the lkey must exist, the range must fall inside the
    /// registration, and receives additionally need local-write rights.
    pub(crate) fn check_local(&self, sge: &Sge, needs_write: bool) -> Result<()> {
        let meta = self
            .by_lkey
            .get(&sge.lkey)
            .ok_or_else(|| Error::invalid_arg(format!("lkey {:#x} not registered in PD", sge.lkey)))?;
        if !meta.contains(sge.addr, sge.length as usize) {
            return Err(Error::invalid_arg(format!(
                "sge [{:#x}, +{}) outside MR bounds",
                sge.addr, sge.length
            )));
        }
        if needs_write && !meta.access.contains(AccessFlags::LOCAL_WRITE) {
            return Err(Error::invalid_arg(format!(
                "lkey {:#x} lacks local-write access",
                sge.lkey
            )));
        }
        Ok(())
    }

    /// Validate a remote access through an rkey. Failures are protocol
    /// violations reported on the wire, not synchronous errors.
    pub(crate) fn check_remote(
        &self,
        rkey: u32,
        addr: u64,
        len: usize,
        needs: AccessFlags,
    ) -> std::result::Result<(), WcStatus> {
        let meta = self.by_rkey.get(&rkey).ok_or(WcStatus::RemAccessErr)?;
        if !meta.contains(addr, len) || !meta.access.contains(needs) {
            return Err(WcStatus::RemAccessErr);
        }
        Ok(())
    }
}

/// A borrowed memory region.
///
/// Borrows the user buffer for `'a` and keeps the PD alive via `Arc`. The
/// registered range must stay valid application memory for the MR's whole
/// lifetime; deregistering while a QP still references the key in an
/// outstanding work request is a usage error, not a checked condition.
pub struct MemoryRegion<'a> {
    keys: MrKeys,
    addr: u64,
    len: usize,
    pd: Arc<ProtectionDomain>,
    _lifetime: PhantomData<&'a mut [u8]>,
}

impl<'a> MemoryRegion<'a> {
    pub(crate) fn new(keys: MrKeys, addr: u64, len: usize, pd: Arc<ProtectionDomain>) -> Self {
        Self {
            keys,
            addr,
            len,
            pd,
            _lifetime: PhantomData,
        }
    }

    /// The local key.
    pub fn lkey(&self) -> u32 {
        self.keys.lkey
    }

    /// The remote key.
    pub fn rkey(&self) -> u32 {
        self.keys.rkey
    }

    /// The registered virtual address.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The registered length.
    pub fn length(&self) -> usize {
        self.len
    }

    /// A scatter-gather entry covering `len` bytes at `offset` into the
    /// registration.
    pub fn sge(&self, offset: u64, len: u32) -> Sge {
        Sge::new(self.addr + offset, len, self.keys.lkey)
    }
}

impl Drop for MemoryRegion<'_> {
    fn drop(&mut self) {
        self.pd.release_mr(self.keys);
    }
}

/// An owned memory region.
///
/// The buffer is owned by this struct and freed after deregistration.
pub struct OwnedMemoryRegion {
    keys: MrKeys,
    pd: Arc<ProtectionDomain>,
    buf: Box<[u8]>,
}

impl OwnedMemoryRegion {
    pub(crate) fn new(keys: MrKeys, pd: Arc<ProtectionDomain>, buf: Box<[u8]>) -> Self {
        Self { keys, pd, buf }
    }

    /// The local key.
    pub fn lkey(&self) -> u32 {
        self.keys.lkey
    }

    /// The remote key.
    pub fn rkey(&self) -> u32 {
        self.keys.rkey
    }

    /// The registered virtual address.
    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    /// Access the registered buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutably access the registered buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// A scatter-gather entry covering `len` bytes at `offset` into the
    /// registration.
    pub fn sge(&self, offset: u64, len: u32) -> Sge {
        Sge::new(self.addr() + offset, len, self.keys.lkey)
    }
}

impl Drop for OwnedMemoryRegion {
    fn drop(&mut self) {
        // Deregister first; the buffer is freed when `buf` drops after.
        self.pd.release_mr(self.keys);
    }
}

//! Protection domains.

use std::sync::{Arc, Mutex};

use crate::cq::CompletionQueue;
use crate::device::Context;
use crate::mr::{AccessFlags, MemoryRegion, MrDirectory, MrKeys, MrMeta, OwnedMemoryRegion};
use crate::ops::{Resolved, Verb};
use crate::qp::{QpInitAttr, QueuePair};
use crate::{lock, Error, Result};

/// A protection domain.
///
/// A pure authorization scope: every MR and QP belongs to exactly one PD,
/// and a QP may only reference keys registered in its own PD.
pub struct ProtectionDomain {
    ctx: Arc<Context>,
    pub(crate) mrs: Mutex<MrDirectory>,
}

impl ProtectionDomain {
    /// Allocate a new PD on the given context.
    pub fn new(ctx: Arc<Context>) -> Result<Arc<Self>> {
        tracing::debug!(device = %ctx.device().name(), "alloc pd");
        let dev = &ctx.device;
        dev.take(&dev.pd_count, dev.config().max_pd, "protection domains")?;
        if let Resolved::Backend(p) = dev.ops().resolve(Verb::AllocPd)? {
            if let Err(e) = p.alloc_pd(&ctx.device()) {
                dev.put(&dev.pd_count);
                return Err(e);
            }
        }
        Ok(Arc::new(Self {
            ctx,
            mrs: Mutex::new(MrDirectory::default()),
        }))
    }

    /// Register a borrowed memory region.
    ///
    /// The returned MR borrows `buf` and keeps this PD alive via `Arc`.
    pub fn reg_mr<'a>(
        self: &Arc<Self>,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> Result<MemoryRegion<'a>> {
        let addr = buf.as_mut_ptr() as u64;
        let keys = self.register(addr, buf.len(), access)?;
        Ok(MemoryRegion::new(keys, addr, buf.len(), Arc::clone(self)))
    }

    /// Register an owned memory region.
    ///
    /// The buffer is moved into the returned MR and freed when it drops.
    pub fn reg_mr_owned(
        self: &Arc<Self>,
        buf: Vec<u8>,
        access: AccessFlags,
    ) -> Result<OwnedMemoryRegion> {
        let buf = buf.into_boxed_slice();
        let keys = self.register(buf.as_ptr() as u64, buf.len(), access)?;
        Ok(OwnedMemoryRegion::new(keys, Arc::clone(self), buf))
    }

    fn register(&self, addr: u64, length: usize, access: AccessFlags) -> Result<MrKeys> {
        tracing::debug!(device = %self.ctx.device().name(), addr, length, "reg mr");
        if length == 0 {
            return Err(Error::invalid_arg("MR length must be > 0"));
        }
        if addr == 0 {
            return Err(Error::invalid_arg("MR address must not be null"));
        }
        let dev = &self.ctx.device;
        dev.take(&dev.mr_count, dev.config().max_mr, "memory regions")?;
        let keys = match dev.ops().resolve(Verb::RegMr) {
            Ok(Resolved::Default) => {
                let (lkey, rkey) = dev.alloc_keys();
                MrKeys { lkey, rkey }
            }
            Ok(Resolved::Backend(p)) => {
                match p.reg_mr(&self.ctx.device(), addr, length, access) {
                    Ok(keys) => keys,
                    Err(e) => {
                        dev.put(&dev.mr_count);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                dev.put(&dev.mr_count);
                return Err(e);
            }
        };
        lock(&self.mrs).insert(keys, MrMeta { addr, len: length, access });
        Ok(keys)
    }

    pub(crate) fn release_mr(&self, keys: MrKeys) {
        tracing::debug!(lkey = keys.lkey, "dereg mr");
        lock(&self.mrs).remove(keys);
        let dev = &self.ctx.device;
        if let Ok(Resolved::Backend(p)) = dev.ops().resolve(Verb::DeregMr) {
            if let Err(e) = p.dereg_mr(&self.ctx.device(), keys.lkey) {
                tracing::error!("backend dereg_mr failed: {e}");
            }
        }
        dev.put(&dev.mr_count);
    }

    /// Create a queue pair on this PD.
    pub fn create_qp(
        self: &Arc<Self>,
        send_cq: &Arc<CompletionQueue>,
        recv_cq: &Arc<CompletionQueue>,
        init_attr: &QpInitAttr,
    ) -> Result<QueuePair> {
        QueuePair::create(self, send_cq, recv_cq, init_attr)
    }

    /// The parent context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        tracing::debug!(device = %self.ctx.device().name(), "dealloc pd");
        let dev = &self.ctx.device;
        if let Ok(Resolved::Backend(p)) = dev.ops().resolve(Verb::DeallocPd) {
            if let Err(e) = p.dealloc_pd(&self.ctx.device()) {
                tracing::error!("backend dealloc_pd failed: {e}");
            }
        }
        dev.put(&dev.pd_count);
    }
}

impl Context {
    /// Allocate a protection domain.
    pub fn alloc_pd(self: &Arc<Self>) -> Result<Arc<ProtectionDomain>> {
        ProtectionDomain::new(Arc::clone(self))
    }
}

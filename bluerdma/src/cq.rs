//! Completion queues.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::comp_channel::CompletionChannel;
use crate::device::Context;
use crate::ops::{Resolved, Verb};
use crate::wc::WorkCompletion;
use crate::{lock, Error, Result};

struct CqInner {
    queue: VecDeque<WorkCompletion>,
    capacity: usize,
    overrun: bool,
    /// One-shot notification arming: `Some(solicited_only)` when armed.
    armed: Option<bool>,
}

/// A bounded, ordered queue of work completions.
///
/// Completions for requests posted to the same queue retire in submission
/// order. Inserting into a full CQ drops the completion and latches the
/// queue into an overrun state; every later poll reports the overrun.
pub struct CompletionQueue {
    ctx: Arc<Context>,
    inner: Mutex<CqInner>,
    channel: Option<Arc<CompletionChannel>>,
}

impl CompletionQueue {
    /// Create a new CQ with at least `cqe` entries of depth.
    pub fn new(ctx: Arc<Context>, cqe: i32) -> Result<Arc<Self>> {
        Self::build(ctx, cqe, None)
    }

    /// Create a CQ whose notifications fire the given channel.
    pub fn with_channel(
        ctx: Arc<Context>,
        cqe: i32,
        channel: Arc<CompletionChannel>,
    ) -> Result<Arc<Self>> {
        Self::build(ctx, cqe, Some(channel))
    }

    fn build(
        ctx: Arc<Context>,
        cqe: i32,
        channel: Option<Arc<CompletionChannel>>,
    ) -> Result<Arc<Self>> {
        tracing::debug!(device = %ctx.device().name(), cqe, "create cq");
        if cqe <= 0 {
            return Err(Error::invalid_arg(format!("cq depth {cqe} must be > 0")));
        }
        let depth = cqe as usize;
        let dev = &ctx.device;
        if depth > dev.config().max_cqe as usize {
            return Err(Error::invalid_arg(format!(
                "cq depth {depth} exceeds device maximum {}",
                dev.config().max_cqe
            )));
        }
        dev.take(&dev.cq_count, dev.config().max_cq, "completion queues")?;
        if let Resolved::Backend(p) = dev.ops().resolve(Verb::CreateCq)? {
            if let Err(e) = p.create_cq(&ctx.device(), depth) {
                dev.put(&dev.cq_count);
                return Err(e);
            }
        }
        Ok(Arc::new(Self {
            ctx,
            inner: Mutex::new(CqInner {
                queue: VecDeque::with_capacity(depth),
                capacity: depth,
                overrun: false,
                armed: None,
            }),
            channel,
        }))
    }

    /// Poll up to `wc_buf.len()` completions, draining them from the CQ.
    ///
    /// Returns the number of completions written to `wc_buf`; zero, with
    /// no error, when the CQ is empty. Never blocks.
    pub fn poll(&self, wc_buf: &mut [WorkCompletion]) -> Result<usize> {
        self.ctx.device.ops().resolve(Verb::PollCq)?;
        let mut inner = lock(&self.inner);
        if inner.overrun {
            return Err(Error::CqOverrun);
        }
        let n = wc_buf.len().min(inner.queue.len());
        for slot in wc_buf.iter_mut().take(n) {
            // Length was just checked under the same lock.
            if let Some(wc) = inner.queue.pop_front() {
                *slot = wc;
            }
        }
        Ok(n)
    }

    /// Arm a one-shot notification for the next completion.
    ///
    /// With `solicited_only`, only a completion for a solicited-flagged
    /// message (or an error completion) fires the channel.
    pub fn req_notify(&self, solicited_only: bool) -> Result<()> {
        self.ctx.device.ops().resolve(Verb::ReqNotifyCq)?;
        lock(&self.inner).armed = Some(solicited_only);
        Ok(())
    }

    /// Grow the CQ. Unsupported unless a backend module provides it.
    pub fn resize(&self, cqe: i32) -> Result<()> {
        if cqe <= 0 {
            return Err(Error::invalid_arg(format!("cq depth {cqe} must be > 0")));
        }
        match self.ctx.device.ops().resolve(Verb::ResizeCq)? {
            Resolved::Default => Err(Error::Unsupported(Verb::ResizeCq)),
            Resolved::Backend(p) => {
                p.resize_cq(&self.ctx.device(), cqe as usize)?;
                lock(&self.inner).capacity = cqe as usize;
                Ok(())
            }
        }
    }

    /// The creation-time depth.
    pub fn capacity(&self) -> usize {
        lock(&self.inner).capacity
    }

    /// The parent context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Insert a completion, honoring the overrun policy and the one-shot
    /// notification arming.
    pub(crate) fn push(&self, wc: WorkCompletion) {
        let mut inner = lock(&self.inner);
        if inner.queue.len() >= inner.capacity {
            inner.overrun = true;
            tracing::error!(
                qpn = wc.qp_num(),
                wr_id = wc.wr_id(),
                "cq overrun, completion dropped"
            );
        } else {
            inner.queue.push_back(wc);
        }
        let wake = match inner.armed {
            Some(solicited_only) => {
                !solicited_only || wc.is_solicited() || !wc.is_success() || inner.overrun
            }
            None => false,
        };
        if wake {
            inner.armed = None;
            drop(inner);
            if let Some(channel) = &self.channel {
                channel.fire();
            }
        }
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        tracing::debug!(device = %self.ctx.device().name(), "destroy cq");
        let dev = &self.ctx.device;
        if let Ok(Resolved::Backend(p)) = dev.ops().resolve(Verb::DestroyCq) {
            if let Err(e) = p.destroy_cq(&self.ctx.device()) {
                tracing::error!("backend destroy_cq failed: {e}");
            }
        }
        dev.put(&dev.cq_count);
    }
}

impl Context {
    /// Create a completion queue.
    pub fn create_cq(self: &Arc<Self>, cqe: i32) -> Result<Arc<CompletionQueue>> {
        CompletionQueue::new(Arc::clone(self), cqe)
    }

    /// Create a completion queue wired to a notification channel.
    pub fn create_cq_with_channel(
        self: &Arc<Self>,
        cqe: i32,
        channel: Arc<CompletionChannel>,
    ) -> Result<Arc<CompletionQueue>> {
        CompletionQueue::with_channel(Arc::clone(self), cqe, channel)
    }
}

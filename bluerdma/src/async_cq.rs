//! Async completion queue poller (feature `tokio`).
//!
//! Wraps a CQ and its notification channel to await completions without
//! spin loops, using the standard drain-after-arm pattern to avoid the
//! race between arming and waiting.

use std::sync::Arc;

use crate::comp_channel::CompletionChannel;
use crate::cq::CompletionQueue;
use crate::wc::WorkCompletion;
use crate::Result;

/// Async completion queue poller.
///
/// 1. `req_notify` — arm the one-shot notification
/// 2. `poll` — drain any completions (catches the arm/await race)
/// 3. If completions were found, return them
/// 4. Otherwise await the channel and loop
pub struct AsyncCq {
    cq: Arc<CompletionQueue>,
    channel: Arc<CompletionChannel>,
}

impl AsyncCq {
    /// Create a poller over a CQ created with
    /// [`CompletionQueue::with_channel`] using the same `channel`.
    pub fn new(cq: Arc<CompletionQueue>, channel: Arc<CompletionChannel>) -> Self {
        Self { cq, channel }
    }

    /// Poll for up to `wc_buf.len()` completions asynchronously.
    ///
    /// Returns when at least one completion is available.
    pub async fn poll(&self, wc_buf: &mut [WorkCompletion]) -> Result<usize> {
        loop {
            self.cq.req_notify(false)?;
            let n = self.cq.poll(wc_buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.channel.notified().await;
        }
    }

    /// Wait for the completion carrying a specific WR id, discarding any
    /// others encountered.
    pub async fn poll_wr_id(&self, expected: u64) -> Result<WorkCompletion> {
        let mut wc = [WorkCompletion::default(); 4];
        loop {
            let n = self.poll(&mut wc).await?;
            for item in &wc[..n] {
                if item.wr_id() == expected {
                    return Ok(*item);
                }
            }
        }
    }

    /// Access the underlying CQ.
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }
}

//! Software RDMA (RoCE-style) adapter with a verbs-like API.
//!
//! Provides the full verbs object model — devices, contexts, protection
//! domains, completion queues, queue pairs and memory regions — with
//! `Arc`-based ownership to enforce correct destruction order, a per-device
//! operation dispatch table with pluggable backends, and a built-in soft
//! data engine that executes SEND/RECV and RDMA READ/WRITE between queue
//! pairs on the same device.

pub mod comp_channel;
pub mod cq;
pub mod device;
pub mod error;
pub mod gid;
pub mod mr;
pub mod netdev;
pub mod ops;
pub mod pd;
pub mod qp;
pub mod wc;
pub mod wr;

#[cfg(feature = "tokio")]
pub mod async_cq;

pub(crate) mod soft;

pub use error::{Error, Result};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

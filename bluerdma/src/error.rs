//! Error types for the verbs API.

use crate::ops::Verb;
use crate::wc::WcStatus;
use crate::wr::QpState;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by verbs operations.
///
/// Every variant is reported synchronously from the call that triggered it.
/// Protocol violations on the wire are never `Error` values; they surface as
/// error-status work completions on the affected completion queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-range caller input, detected before any state
    /// change. Safe to retry with corrected input.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A per-device resource limit was hit. May be retried after freeing
    /// resources.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// The operation is not valid for the resource's current state.
    #[error("{op} invalid in QP state {state:?}")]
    State {
        /// The operation that was attempted.
        op: &'static str,
        /// The QP state it was attempted in.
        state: QpState,
    },

    /// The dispatch slot for this operation was resolved by neither the
    /// core defaults nor the backend module. Permanent for this device.
    #[error("operation {0} not supported by this device")]
    Unsupported(Verb),

    /// A completion was dropped because the CQ was full. The CQ stays in
    /// the overrun state; recreate it to recover.
    #[error("completion queue overrun")]
    CqOverrun,

    /// The GID table slot exists but holds no valid address.
    #[error("no address at gid index {index} on port {port}")]
    AddrUnavailable {
        /// Queried port number.
        port: u8,
        /// Queried table index.
        index: usize,
    },

    /// The registry holds no devices.
    #[error("no RDMA devices registered")]
    NoDevices,

    /// The requested device was not found.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The backend module failed to load or initialize.
    #[error("backend module error: {0}")]
    Backend(String),

    /// A work request in a posted batch was rejected. All `accepted`
    /// requests before `index` were queued; the failing request and
    /// everything after it were not.
    #[error("work request {index} rejected after {accepted} accepted: {reason}")]
    Post {
        /// Zero-based index of the failing work request in the batch.
        index: usize,
        /// Number of earlier requests in the batch that were accepted.
        accepted: usize,
        /// Why the request was rejected.
        reason: Box<Error>,
    },

    /// A work completion carried an error status.
    #[error("work completion error on QP {qpn}: {status:?}")]
    WorkCompletion {
        /// The QP the completion belongs to.
        qpn: u32,
        /// The error status.
        status: WcStatus,
    },
}

impl Error {
    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    pub(crate) fn post(index: usize, reason: Error) -> Self {
        Self::Post {
            index,
            accepted: index,
            reason: Box::new(reason),
        }
    }
}

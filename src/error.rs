// Error kinds for the platform abstraction layer.
//
// Every fallible operation in this crate returns `Result<T>` = `Result<T, PalError>`.
// There are no implicit retries and no panics on data-path errors; callers decide
// how to react to an out-of-band error the same way they would a C-style return code.

use thiserror::Error;

/// Crate-wide result alias, re-exported at the library root.
pub type Result<T> = core::result::Result<T, PalError>;

#[derive(Error, Debug)]
pub enum PalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("host allocation failed: {reason}")]
    HostAllocFailed { reason: String },

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted { requested: usize, available: usize },

    #[error("buddy allocator exhausted: no free block for size {size}")]
    AllocatorExhausted { size: usize },

    #[error("dynamic buffer exhausted: {requested} elements exceeds maximum {max}")]
    BufferExhausted { requested: usize, max: usize },

    #[error("handle space exhausted: namespace {namespace} has no free slots")]
    HandleSpaceExhausted { namespace: u8 },

    #[error("handle invalid: {0}")]
    HandleInvalid(#[from] HandleInvalidReason),

    #[error("worker initialization failed: {0}")]
    WorkerInitFailed(String),

    #[error("scheduler is shutting down")]
    SchedulerShutdown,
}

/// Finer-grained reason a handle failed validation. A C ABI surface would
/// only need a nonzero/zero result from validation; this in-process API keeps
/// the detail because it costs nothing here and helps callers log something
/// useful.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleInvalidReason {
    #[error("generation mismatch")]
    Expired,

    #[error("state index out of range")]
    BadStateIndex,

    #[error("namespace mismatch")]
    NamespaceMismatch,
}

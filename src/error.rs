//! Error kinds shared by every subsystem.
//!
//! The original driver returns raw `KResult<T> = Result<T, u32>` errno
//! values; we generalize that into a proper enum so callers can match on
//! meaning instead of magic numbers, while keeping the same propagation
//! policy: I/O errors on the source device are non-fatal to the filter,
//! CoW I/O errors are fatal to the owning diff area only.

use thiserror::Error;

pub type KResult<T> = Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no such device, snapshot, or tracker")]
    NotFound,

    #[error("resource is still referenced")]
    Busy,

    #[error("allocation failed")]
    NoMemory,

    #[error("operation would block, resubmit without nowait")]
    Retryable,

    #[error("underlying device I/O failed")]
    IoFailure,

    #[error("diff storage is exhausted")]
    NoSpace,

    #[error("CBT generation overflow or diff area poisoned")]
    Corrupted,

    #[error("device has never been snapshotted")]
    NotSnapshotted,

    #[error("snapshot detected corrupted state during take")]
    DeadLock,

    #[error("malformed argument")]
    Invalid,
}

impl Error {
    /// Hot-path allocation failures downgrade to `Retryable`.
    pub fn downgrade_on_hot_path(self) -> Error {
        match self {
            Error::NoMemory => Error::Retryable,
            other => other,
        }
    }
}

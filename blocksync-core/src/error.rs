//! Crate-wide error type.
//!
//! Every fallible public operation returns [`Result<T, Error>`]. The
//! variants map 1:1 onto the error kinds a metadata-I/O or activity-log
//! operation can produce; callers distinguish recoverable conditions
//! (`WouldBlock`, `Busy`, `Interrupted`) from terminal ones (`Io`,
//! `NoDevice`, `Invariant`) by matching on the variant.

use std::fmt;

/// The crate's error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A metadata or bitmap write/read failed at the I/O layer.
    #[error("metadata I/O error: {0}")]
    Io(#[from] blocksync_device::StoreError),

    /// The device is not attached, or its disk state is below
    /// `D_INCONSISTENT`, so the operation is refused outright.
    #[error("no device")]
    NoDevice,

    /// A non-blocking acquirer found no slot available; the caller should
    /// retry after arranging to be woken, or simply retry later.
    #[error("would block")]
    WouldBlock,

    /// A non-blocking acquirer was refused because of contention with an
    /// overlapping resync extent; the caller should retry once priority
    /// has had a chance to take effect.
    #[error("busy")]
    Busy,

    /// An interruptible wait was cancelled before it could complete.
    #[error("interrupted")]
    Interrupted,

    /// An internal invariant was violated. This indicates a bug in the
    /// caller (e.g. completing I/O on a slot with no matching `begin_io`)
    /// rather than an environmental failure; it is still returned as an
    /// `Err` rather than panicking, since this is a library and must not
    /// abort its host process.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Construct an [`Error::Invariant`] from a `Display`-able detail.
    pub fn invariant(detail: impl fmt::Display) -> Self {
        Error::Invariant(detail.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

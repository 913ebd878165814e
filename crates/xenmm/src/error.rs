//! Recoverable failures.
//!
//! Only the construction of an offline tree can fail without the kernel being corrupt:
//! the caller may abort the process it was creating. Everything else is a contract
//! violation and panics.

use thiserror::Error;

/// Errors returned while building an address space that is not yet active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The frame allocator has no free frame for a table page.
    #[error("out of frames for page table pages")]
    OutOfFrames,
    /// The tree needs more table pages than can be tracked until it is completed.
    #[error("offline page table needs more than {limit} table pages")]
    OfflineTrackingFull { limit: usize },
}

/// Result type for offline construction.
pub type Result<T> = core::result::Result<T, Error>;

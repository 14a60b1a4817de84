// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

/// Errors reported by allocators and containers in this crate.
///
/// Every fallible operation in the crate returns one of these kinds; internal
/// code propagates them unchanged up to the caller. The C shim
/// ([`capi`](crate::capi)) is the only place where they are converted into
/// something else (the two failure hooks).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Pop, front or back on an empty container.
    #[error("container is empty")]
    Empty,
    /// Push into a full ring buffer or free list.
    #[error("container is full")]
    Full,
    /// All segment slots are occupied, or the manager cap of a pool has been
    /// reached.
    #[error("allocator exhausted")]
    Exhausted,
    /// Deallocation with a pointer the allocator cannot locate.
    #[error("pointer not owned by this allocator")]
    NotOwned,
    /// A decoded compact pointer refers to a manager or segment that is not
    /// present.
    #[error("invalid manager or segment id")]
    InvalidId,
    /// Attempt to register two pools for the same tag.
    #[error("a pool is already registered for this tag")]
    RegistrationConflict,
    /// The upstream arena failed to vend a block.
    #[error("out of memory")]
    OutOfMemory,
}

/// Short alias used by every fallible operation in the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

/// Memory usage information for a [`SlotArena`](crate::SlotArena).
///
/// This structure is returned by [`SlotArena::usage`](crate::SlotArena::usage).
/// All quantities are in blocks, the arena's allocation unit.
#[derive(Default, Copy, Clone, PartialEq, Eq, Debug)]
pub struct Usage {
    /// Total number of blocks in the arena.
    pub total: usize,
    /// Blocks currently handed out.
    pub used: usize,
    /// Blocks currently on the free list.
    ///
    /// `used + free` always equals `total`.
    pub free: usize,
}

/// Memory usage information for a [`GrowingPool`](crate::GrowingPool).
///
/// This structure is returned by
/// [`GrowingPool::usage`](crate::GrowingPool::usage). Note that computing it
/// walks every manager in the pool, so it is `O(managers × segments)` rather
/// than constant-time.
#[derive(Default, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PoolUsage {
    /// Managers currently in the pool's chain.
    pub managers: usize,
    /// Segments currently backed by an arena block, across all managers.
    pub segments: usize,
    /// Sub-blocks currently free, across all segments.
    pub free: usize,
    /// Upper bound on live sub-blocks if the pool grew to its caps.
    pub capacity: usize,
}

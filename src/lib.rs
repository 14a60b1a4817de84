// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Thimble: byte queues for when all you have is a thimble of memory.
//!
//! Thimble is a FIFO byte-queue service for embedded and freestanding
//! environments with a hard, fixed memory budget: think "a couple of
//! kilobytes for a few dozen queues". The queue API is deliberately tiny
//! (create, destroy, enqueue one byte, dequeue one byte); the substance of
//! the crate is the tiered block allocator with compact addressing that
//! makes many independent queues livable inside such a budget.
//!
//! This is a no-`std` and no-`alloc` crate. There is no heap anywhere: all
//! storage (queue control blocks, list nodes, and the ring buffers holding
//! the bytes) is carved out of one contiguous region that you hand to the
//! root allocator up front.
//!
//! # The allocator stack
//!
//! * [`SlotArena`]: the root allocator. It divides your region into
//!   uniform blocks (16 bytes in the canonical configuration) and vends
//!   them from a free list threaded through the blocks themselves.
//! * [`GrowingPool`]: the small-object workhorse. It takes arena blocks on
//!   demand, subdivides each into finer uniform sub-blocks, and chains its
//!   bookkeeping (segment managers) through the arena as well, growing up
//!   to a compile-time cap.
//! * [`PoolPtr`]: a compact pointer into a pool, a bit-packed
//!   `(manager, segment, offset)` triple using exactly as many bits as the
//!   pool geometry requires, with the all-ones manager id reserved as null.
//!   Data structures stored inside the arena link to each other through
//!   these one-or-two-byte handles instead of native pointers, which is
//!   where the 4–8× metadata saving comes from.
//! * [`OffsetList`] and [`RingBuffer`]: the two intrusive containers that
//!   compose a [`Queue`]: a singly linked list of nodes, each node carrying
//!   a fixed-capacity ring buffer backed by one arena block.
//!
//! Every configuration knob is a compile-time parameter (const generics and
//! [`pool_tag!`] markers); the bit widths of compact pointers and the
//! capacity limits all fall out of those choices at compile time.
//!
//! # Quick start
//!
//! ```
//! use thimble::max_segments_for;
//! use thimble::pool_tag;
//! use thimble::GrowingPool;
//! use thimble::Queue;
//! use thimble::SlotArena;
//!
//! pool_tag! {
//!     /// Pool of queue nodes.
//!     pub struct Nodes {
//!         sub_block_size: 8,
//!         sub_block_count: 2,
//!         max_segments: max_segments_for(16),
//!         max_managers: 32,
//!     }
//! }
//!
//! // 2 KiB arena of 16-byte blocks.
//! #[repr(align(16))]
//! struct Memory([u8; 2048]);
//! let mut memory = Memory([0; 2048]);
//! let arena = SlotArena::<16, 128>::from_slice(&mut memory.0);
//!
//! // A pool of 8-byte sub-blocks on top of it, registered so that its
//! // compact pointers can resolve.
//! let pool = GrowingPool::<_, Nodes, { max_segments_for(16) }>::new(&arena);
//! let registration = pool.register().unwrap();
//!
//! // A byte queue whose nodes live in the pool and whose ring buffers are
//! // arena blocks.
//! let mut queue = Queue::<u8, _, Nodes, 16>::new();
//! for byte in 0..40 {
//!     queue.push(&arena, &pool, byte).unwrap();
//! }
//! for byte in 0..40 {
//!     assert_eq!(queue.pop(&arena, &pool).unwrap(), byte);
//! }
//!
//! queue.clear(&arena, &pool).unwrap();
//! drop(registration);
//! ```
//!
//! # The C interface
//!
//! With the `c-api` feature (on by default), the [`capi`] module exports
//! `create_queue` / `destroy_queue` / `enqueue_byte` / `dequeue_byte` with C
//! linkage over a process-wide 2 KiB instance of the stack, with
//! abort-on-error semantics delivered through two installable diverging
//! hooks. See the module documentation for the exact contract.
//!
//! # Threading
//!
//! Thimble is strictly single-threaded by design: no operation suspends,
//! nothing is cancellable, and the hint caches and registration slots are
//! plain process-wide state. The spin locks inside the allocators exist to
//! give them `&self` entry points, not to make concurrent mutation of one
//! queue meaningful.
//!
//! # Cargo feature flags
//!
//! * `c-api` *(default)*: enables the [`capi`] module and its global
//!   service instance.

#![no_std]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stderr)]
#![warn(clippy::print_stdout)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(unused_crate_dependencies)]
#![warn(unused_macro_rules)]
#![warn(unused_qualifications)]
#![doc(test(attr(deny(warnings))))]

#[cfg(test)]
extern crate std;

mod alloc;
mod arena;
mod error;
mod freelist;
mod list;
mod manager;
mod pool;
mod ptr;
mod queue;
mod registry;
mod ring;
mod segment;
mod usage;

#[cfg(test)]
mod tests;

#[cfg(feature = "c-api")]
pub mod capi;

pub use crate::alloc::BlockAllocator;
pub use crate::alloc::BlockHandle;
pub use crate::alloc::Handle;
pub use crate::arena::SlotArena;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::list::Iter as ListIter;
pub use crate::list::ListNode;
pub use crate::list::OffsetList;
pub use crate::manager::max_segments_for;
pub use crate::pool::GrowingPool;
pub use crate::ptr::PoolPtr;
pub use crate::queue::ByteQueue;
pub use crate::queue::Queue;
pub use crate::registry::PoolRegistration;
pub use crate::registry::PoolRegistry;
pub use crate::registry::PoolResolver;
pub use crate::registry::PoolTag;
pub use crate::ring::Iter as RingIter;
pub use crate::ring::RingBuffer;
pub use crate::usage::PoolUsage;
pub use crate::usage::Usage;

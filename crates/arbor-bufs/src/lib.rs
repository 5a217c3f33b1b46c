//! DMA buffer pool and freelists for the arbor device-arbitration engine.
//!
//! Buffers are created in per-order pools at DMA-init time and recycled
//! forever after; see [`buffer::BufState`] for the lifecycle and
//! [`pool::BufferPool::reclaim_for_owner`] for what happens when a client
//! exits with buffers still in flight.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod pool;

pub use buffer::{BufRef, BufState, Buffer};
pub use pool::{
    AllocError, BufferPool, Census, OrderInfo, OrderPool, PoolError, ReclaimSummary, MAX_ORDER,
    MIN_ORDER,
};

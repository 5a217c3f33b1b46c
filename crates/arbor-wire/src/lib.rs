//! Fixed-layout request/response structures for the ioctl-shaped command
//! surface.
//!
//! These structs cross an address-space (or client/server) boundary and are
//! copied verbatim, so their layouts must stay byte-for-byte stable: every
//! struct is `#[repr(C)]`, padding is explicit, and `bytemuck::Pod` makes
//! the byte view available without any serialization step. No byte-order
//! conversion is performed; both sides are assumed native-endian, as in the
//! original.

#![forbid(unsafe_code)]

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    /// Flags accepted by the LOCK command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        /// Wait until the hardware is ready for DMA.
        const READY = 0x01;
        /// Wait until the hardware is quiescent.
        const QUIESCENT = 0x02;
        /// Flush this context's DMA queue first.
        const FLUSH = 0x04;
        /// Flush every DMA queue first.
        const FLUSH_ALL = 0x08;
    }
}

bitflags! {
    /// Flags accepted by the DMA submission command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaFlags: u32 {
        /// Block until the buffer is dispatched (and space exists to queue
        /// it).
        const BLOCK = 0x01;
        /// The caller already holds the hardware lock.
        const WHILE_LOCKED = 0x02;
        /// Privileged dispatch bypassing the per-context ring.
        const PRIORITY = 0x04;
    }
}

bitflags! {
    /// Flags accepted by WAIT_VBLANK.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VblankFlags: u32 {
        /// `sequence` is relative to the current counter (absolute when
        /// clear).
        const RELATIVE = 0x0000_0001;
        /// Register an asynchronous signal instead of blocking.
        const SIGNAL = 0x4000_0000;
    }
}

/// LOCK / UNLOCK request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LockRequest {
    pub context: u32,
    /// [`LockFlags`] bits.
    pub flags: u32,
}

/// ADD_BUFS / MARK_BUFS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferDesc {
    /// Aperture offset for AGP-backed pools (0 for system memory).
    pub agp_start: u64,
    pub count: u32,
    /// Bytes per buffer; rounded up to the containing power-of-two order.
    pub size: u32,
    pub low_mark: u32,
    pub high_mark: u32,
    pub flags: u32,
    pub _pad: u32,
}

/// One per-order record in the INFO_BUFS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferInfo {
    pub count: u32,
    pub size: u32,
    pub low_mark: u32,
    pub high_mark: u32,
}

/// Largest number of buffers one FREE_BUFS request can name.
pub const FREE_BATCH: usize = 32;

/// FREE_BUFS request: returns client-held buffers to their freelists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferFree {
    pub count: u32,
    pub indices: [u32; FREE_BATCH],
    pub _pad: u32,
}

/// One entry in the MAP_BUFS response: enough for a client to mmap the
/// buffer through whatever VFS glue hosts the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferMapEntry {
    /// Opaque map token (the mmap-offset analogue).
    pub token: u64,
    pub index: u32,
    pub size: u32,
}

/// DMA submission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DmaRequest {
    pub context: u32,
    pub buf_index: u32,
    /// Bytes of the buffer actually filled; 0 means "discard".
    pub used: u32,
    /// [`DmaFlags`] bits.
    pub flags: u32,
}

/// AGP ENABLE request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AgpModeReq {
    pub mode: u32,
    pub _pad: u32,
}

/// AGP ALLOC request/response (handle is filled in on reply) and FREE
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AgpBufferReq {
    /// Allocation size in bytes.
    pub size: u64,
    /// Region handle; 0 is never a valid handle.
    pub handle: u64,
    pub mem_type: u32,
    pub _pad: u32,
}

/// AGP BIND / UNBIND request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AgpBindingReq {
    pub handle: u64,
    /// Page-aligned offset into the aperture.
    pub offset: u64,
}

/// AGP INFO response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AgpInfoReply {
    pub aperture_base: u64,
    pub aperture_size: u64,
    pub memory_allowed: u64,
    pub memory_used: u64,
    pub id_vendor: u16,
    pub id_device: u16,
    pub version_major: u16,
    pub version_minor: u16,
}

/// WAIT_VBLANK request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct VblankRequest {
    pub sequence: u32,
    /// [`VblankFlags`] bits.
    pub flags: u32,
    /// Signal number to deliver when [`VblankFlags::SIGNAL`] is set.
    pub signal: u32,
    pub _pad: u32,
}

/// WAIT_VBLANK response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct VblankWireReply {
    pub sequence: u32,
    pub _pad: u32,
    pub tval_sec: u64,
    pub tval_usec: u64,
}

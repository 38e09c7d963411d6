//! Buffer management for paneflow.
//!
//! This module is the heart of the pipeline: a pool of fixed-size pixel
//! buffers cycled between producers and a display consumer through a strict
//! free/filled two-queue handshake.
//!
//! - [`Buffer`]: one pixel-buffer slot (id, virtual/physical address, size,
//!   ownership, state, refcount). Slots have stable addresses: they live
//!   behind `Arc` for their whole life and are never moved, so the atomic
//!   state and refcount fields never need to survive a move.
//! - [`BufferHandle`]: externally-supplied memory bound to a reclaim hook
//!   and a liveness token observable after destruction.
//! - [`Allocator`]: strategy for obtaining backing memory (heap, dma-heap
//!   contiguous, or external no-op).
//! - [`BufferPool`]: the scheduler that owns the slots and the queues.
//! - [`PoolRegistry`]: process-wide index of live pools for observability.
//!
//! # Example
//!
//! ```rust,ignore
//! use paneflow::buffer::BufferPool;
//!
//! // 4 buffers of one 1080p RGBA frame each
//! let pool = BufferPool::new_owned(4, 1920 * 1080 * 4, false, "decode", "video")?;
//!
//! // Producer side
//! let buf = pool.acquire_free().expect("pool has free buffers");
//! buf.as_mut_slice()[..4].copy_from_slice(&[0, 0, 0, 0xff]);
//! pool.submit_filled(&buf);
//!
//! // Consumer side
//! let buf = pool.acquire_filled().expect("a frame is ready");
//! // ... present it ...
//! pool.release_filled(&buf);
//! ```

mod allocator;
mod handle;
mod pool;
mod registry;

pub use allocator::{
    physical_address, Allocation, Allocator, CmaAllocator, ExternalAllocator, HeapAllocator,
};
pub use handle::{BufferHandle, Deleter, LivenessRevoker, LivenessWatch};
pub use pool::{BufferPool, BufferValidator, ExternalRegion, PoolStats};
pub use registry::{registry, GlobalStats, PoolRegistry};

use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

/// Integrity constant stamped into every live buffer.
///
/// A slot whose magic does not match is treated as corrupted and refused by
/// [`BufferPool::validate_buffer`].
const BUFFER_MAGIC: u32 = 0xB0F0_F10E;

/// Who releases the backing memory when the buffer's pool is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The pool allocated the memory and deallocates it on destruction.
    Owned,
    /// The memory belongs to someone else; the pool only schedules it.
    External,
}

/// Scheduling state of a buffer.
///
/// Transitions form a cycle:
///
/// ```text
/// Idle ──acquire_free──▶ LockedByProducer ──submit_filled──▶ ReadyForConsume
///   ▲                                                              │
///   │                                                       acquire_filled
///   │                                                              ▼
///   └──────────── release_filled ──────────────── LockedByConsumer
/// ```
///
/// Permanent buffers start in `Idle`; injected transient buffers start in
/// `ReadyForConsume`. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// In the free queue, available to producers.
    Idle = 0,
    /// Held by a producer that is filling it.
    LockedByProducer = 1,
    /// In the filled queue, waiting for the consumer.
    ReadyForConsume = 2,
    /// Held by the consumer that is presenting it.
    LockedByConsumer = 3,
}

impl BufferState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BufferState::Idle,
            1 => BufferState::LockedByProducer,
            2 => BufferState::ReadyForConsume,
            _ => BufferState::LockedByConsumer,
        }
    }
}

/// One pixel-buffer slot.
///
/// A `Buffer` describes a memory region but does not free it; that is the
/// job of the owning pool's allocator (for owned slots) or of the external
/// owner / `BufferHandle` deleter (for external slots).
///
/// Slots are handed out as `Arc<Buffer>` and identified across components by
/// their pool-local `id`, never by raw address, so the pool can grow its
/// internal storage without invalidating outstanding references.
///
/// `state` and `refcount` are atomics and may be read outside the pool lock.
pub struct Buffer {
    id: u32,
    virt: NonNull<u8>,
    phys: u64,
    size: usize,
    ownership: Ownership,
    state: AtomicU8,
    refcount: AtomicU32,
    /// Memoized shareable-export descriptor, -1 when unset.
    dma_fd: AtomicI32,
    magic: u32,
}

impl Buffer {
    /// Create a permanent slot in `Idle` state with refcount 0.
    pub(crate) fn new(
        id: u32,
        virt: NonNull<u8>,
        phys: u64,
        size: usize,
        ownership: Ownership,
    ) -> Self {
        Self {
            id,
            virt,
            phys,
            size,
            ownership,
            state: AtomicU8::new(BufferState::Idle as u8),
            refcount: AtomicU32::new(0),
            dma_fd: AtomicI32::new(-1),
            magic: BUFFER_MAGIC,
        }
    }

    /// Create a transient (injected) slot: external ownership, already
    /// filled, refcount 1 as if a producer had acquired and submitted it.
    pub(crate) fn new_transient(id: u32, virt: NonNull<u8>, phys: u64, size: usize) -> Self {
        Self {
            id,
            virt,
            phys,
            size,
            ownership: Ownership::External,
            state: AtomicU8::new(BufferState::ReadyForConsume as u8),
            refcount: AtomicU32::new(1),
            dma_fd: AtomicI32::new(-1),
            magic: BUFFER_MAGIC,
        }
    }

    /// Pool-local identifier, unique for the pool's lifetime.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bus address usable by a DMA engine, or 0 when unknown.
    #[inline]
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Byte length of the region.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the pool releases this memory at destruction.
    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Raw CPU pointer to the backing bytes.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// The buffer contents as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: virt is valid for size bytes for the life of the pool
        // (owned) or as long as validation says the external owner is alive.
        unsafe { std::slice::from_raw_parts(self.virt.as_ptr(), self.size) }
    }

    /// The buffer contents as a mutable byte slice.
    ///
    /// # Safety contract
    ///
    /// The pool's state machine is what makes this sound: only the producer
    /// that holds the buffer in `LockedByProducer` writes to it, and only
    /// the consumer reads it in `LockedByConsumer`.
    #[inline]
    #[allow(clippy::mut_from_ref)] // interior mutability via the state machine
    pub fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: see above; exclusivity is enforced by the queue handshake.
        unsafe { std::slice::from_raw_parts_mut(self.virt.as_ptr(), self.size) }
    }

    /// Fill the whole region with one byte value.
    pub fn fill(&self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// Copy `src` into the region, failing if it does not fit.
    pub fn copy_from(&self, src: &[u8]) -> crate::error::Result<()> {
        if src.len() > self.size {
            return Err(crate::error::Error::InvalidBuffer(format!(
                "copy of {} bytes into {}-byte buffer #{}",
                src.len(),
                self.size,
                self.id
            )));
        }
        self.as_mut_slice()[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Current scheduling state.
    #[inline]
    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: BufferState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Current reference count (0 when idle, 1 while in flight).
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub(crate) fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_ref(&self) {
        // Saturate at zero: a double release is a caller bug, not a reason
        // to wrap the counter.
        let result = self
            .refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if result.is_err() {
            tracing::warn!(id = self.id, "refcount release below zero");
        }
    }

    /// Memoized shareable-export descriptor, if one has been exported.
    #[inline]
    pub fn dma_fd(&self) -> Option<RawFd> {
        let fd = self.dma_fd.load(Ordering::SeqCst);
        (fd >= 0).then_some(fd)
    }

    pub(crate) fn set_dma_fd(&self, fd: RawFd) {
        self.dma_fd.store(fd, Ordering::SeqCst);
    }

    pub(crate) fn magic_ok(&self) -> bool {
        self.magic == BUFFER_MAGIC
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("virt", &self.virt.as_ptr())
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &self.size)
            .field("ownership", &self.ownership)
            .field("state", &self.state())
            .field("refcount", &self.refcount())
            .finish()
    }
}

// SAFETY: Buffer is Send + Sync because:
// - state and refcount are atomics
// - data access is exclusive by construction: the free/filled handshake
//   guarantees at most one producer or consumer holds the slot at a time
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

//! The buffer pool: ownership, lifecycle, queueing and validation.
//!
//! A [`BufferPool`] owns a set of [`Buffer`] slots and schedules them
//! between producers and a consumer through two FIFO queues:
//!
//! ```text
//!            acquire_free            submit_filled
//! [free] ───────────────▶ producer ───────────────▶ [filled]
//!    ▲                                                  │
//!    │      release_filled            acquire_filled    │
//!    └─────────────────── consumer ◀────────────────────┘
//! ```
//!
//! Four construction modes share this one operational contract:
//!
//! 1. **Owned** — the pool allocates `count * size` bytes itself.
//! 2. **External** — caller supplies raw regions; the pool only schedules.
//! 3. **Tracked external** — caller supplies [`BufferHandle`]s; the pool
//!    additionally watches their liveness tokens and refuses dead buffers.
//! 4. **Dynamic injection** — the pool starts empty and decoders push
//!    ready frames in at runtime via [`BufferPool::inject_filled`].

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::allocator::{physical_address, Allocation, Allocator, CmaAllocator, ExternalAllocator, HeapAllocator};
use super::handle::{BufferHandle, LivenessWatch};
use super::registry;
use super::{Buffer, BufferState, Ownership};
use crate::error::{Error, Result};
use crate::observability;

/// User-supplied integrity predicate, consulted by validation.
pub type BufferValidator = Arc<dyn Fn(&Buffer) -> bool + Send + Sync>;

/// Descriptor for one externally-allocated region (mode 2).
#[derive(Debug, Clone, Copy)]
pub struct ExternalRegion {
    /// CPU-addressable pointer to the region.
    pub virt: *mut u8,
    /// Bus address; 0 requests a best-effort pagemap lookup.
    pub phys: u64,
    /// Byte length.
    pub size: usize,
}

// SAFETY: a descriptor is an address triple; the caller owns the memory.
unsafe impl Send for ExternalRegion {}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Buffers currently owned or tracked by the pool.
    pub total: usize,
    /// Buffers in the free queue.
    pub free: usize,
    /// Buffers in the filled queue.
    pub filled: usize,
    /// Total successful producer acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait.
    pub waits: u64,
    /// Transient buffers injected over the pool's lifetime.
    pub injected: u64,
    /// Transient buffers ejected over the pool's lifetime.
    pub ejected: u64,
}

/// Everything guarded by the pool mutex.
struct PoolState {
    /// Permanent slots, in allocation order (kept for deallocation).
    permanent: Vec<Arc<Buffer>>,
    /// id -> slot, for permanent and transient buffers alike. Authoritative
    /// for ownership: if the id is here, the pool is responsible.
    index: HashMap<u32, Arc<Buffer>>,
    free: VecDeque<Arc<Buffer>>,
    filled: VecDeque<Arc<Buffer>>,
    /// Liveness observers for tracked-external slots, by buffer id.
    liveness: HashMap<u32, LivenessWatch>,
    next_id: u32,
    /// 0 until set (dynamic-injection mode starts unset).
    buffer_size: usize,
}

struct PoolCounters {
    acquisitions: AtomicU64,
    waits: AtomicU64,
    injected: AtomicU64,
    ejected: AtomicU64,
}

/// Core buffer scheduler. See the module docs for the construction modes.
///
/// One mutex protects the queues, the id index and the liveness map; a
/// second, finer mutex guards the transient handle map on the injection
/// path. The two are never held at the same time.
pub struct BufferPool {
    name: String,
    category: String,
    registry_id: AtomicU64,
    /// 0 means unbounded (only meaningful for dynamic injection).
    max_capacity: usize,
    allocator: Box<dyn Allocator>,
    state: Mutex<PoolState>,
    free_cv: Condvar,
    filled_cv: Condvar,
    /// Transient buffer id -> injected handle (owns the deleter).
    transient: Mutex<HashMap<u32, BufferHandle>>,
    /// Mode-3 handles, kept alive for the pool's lifetime.
    tracked_handles: Mutex<Vec<BufferHandle>>,
    validator: Mutex<Option<BufferValidator>>,
    counters: PoolCounters,
}

impl BufferPool {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Mode 1: the pool allocates its own buffers.
    ///
    /// With `use_cma` the pool asks the contiguous dma-heap allocator first
    /// and falls back to the plain heap once if that fails.
    pub fn new_owned(
        count: usize,
        size: usize,
        use_cma: bool,
        name: &str,
        category: &str,
    ) -> Result<Arc<Self>> {
        if count == 0 || size == 0 {
            return Err(Error::Config("owned pool needs count > 0 and size > 0".into()));
        }

        let mut allocator: Box<dyn Allocator> = if use_cma {
            Box::new(CmaAllocator::new())
        } else {
            Box::new(HeapAllocator)
        };

        let allocations = match allocate_all(allocator.as_ref(), count, size) {
            Ok(allocations) => allocations,
            Err(err) if use_cma => {
                // Contiguous heap unavailable or exhausted: retry the whole
                // pool on the plain heap, once.
                warn!(%err, "contiguous allocation failed, falling back to heap");
                allocator = Box::new(HeapAllocator);
                allocate_all(allocator.as_ref(), count, size)?
            }
            Err(err) => return Err(err),
        };

        let mut state = PoolState {
            permanent: Vec::with_capacity(count),
            index: HashMap::with_capacity(count),
            free: VecDeque::with_capacity(count),
            filled: VecDeque::new(),
            liveness: HashMap::new(),
            next_id: 0,
            buffer_size: size,
        };
        for alloc in &allocations {
            let id = state.next_id;
            state.next_id += 1;
            let buf = Arc::new(Buffer::new(id, alloc.virt, alloc.phys, size, Ownership::Owned));
            state.index.insert(id, Arc::clone(&buf));
            state.free.push_back(Arc::clone(&buf));
            state.permanent.push(buf);
        }

        info!(
            name,
            count,
            size,
            allocator = allocator.name(),
            "buffer pool created (owned)"
        );
        Ok(Self::finish(name, category, 0, allocator, state))
    }

    /// Mode 2: schedule caller-supplied regions without owning them.
    ///
    /// The first descriptor fixes the pool's buffer size; descriptors with a
    /// different size are accepted with a warning. A zero `phys` triggers a
    /// best-effort pagemap lookup.
    pub fn new_external(regions: &[ExternalRegion], name: &str, category: &str) -> Result<Arc<Self>> {
        if regions.is_empty() {
            return Err(Error::Config("external pool needs at least one region".into()));
        }

        let buffer_size = regions[0].size;
        let mut state = PoolState {
            permanent: Vec::with_capacity(regions.len()),
            index: HashMap::with_capacity(regions.len()),
            free: VecDeque::with_capacity(regions.len()),
            filled: VecDeque::new(),
            liveness: HashMap::new(),
            next_id: 0,
            buffer_size,
        };

        for region in regions {
            if region.size != buffer_size {
                warn!(
                    expected = buffer_size,
                    got = region.size,
                    "external buffer size mismatch"
                );
            }
            let virt = NonNull::new(region.virt)
                .ok_or_else(|| Error::InvalidBuffer("null external region".into()))?;
            let mut phys = region.phys;
            if phys == 0 {
                phys = physical_address(region.virt);
                if phys == 0 {
                    debug!(virt = ?region.virt, "no physical address for external region");
                }
            }

            let id = state.next_id;
            state.next_id += 1;
            let buf = Arc::new(Buffer::new(id, virt, phys, region.size, Ownership::External));
            state.index.insert(id, Arc::clone(&buf));
            state.free.push_back(Arc::clone(&buf));
            state.permanent.push(buf);
        }

        info!(name, count = regions.len(), buffer_size, "buffer pool created (external)");
        Ok(Self::finish(name, category, 0, Box::new(ExternalAllocator), state))
    }

    /// Mode 3: take ownership of [`BufferHandle`]s and watch their liveness.
    ///
    /// A buffer whose handle has died is refused by acquisition and eligible
    /// for eviction by [`BufferPool::sweep_dead`].
    pub fn new_tracked(
        handles: Vec<BufferHandle>,
        name: &str,
        category: &str,
    ) -> Result<Arc<Self>> {
        if handles.is_empty() {
            return Err(Error::Config("tracked pool needs at least one handle".into()));
        }

        let buffer_size = handles[0].size();
        let mut state = PoolState {
            permanent: Vec::with_capacity(handles.len()),
            index: HashMap::with_capacity(handles.len()),
            free: VecDeque::with_capacity(handles.len()),
            filled: VecDeque::new(),
            liveness: HashMap::with_capacity(handles.len()),
            next_id: 0,
            buffer_size,
        };

        for handle in &handles {
            if handle.size() != buffer_size {
                warn!(
                    expected = buffer_size,
                    got = handle.size(),
                    "tracked buffer size mismatch"
                );
            }
            let virt = NonNull::new(handle.virt())
                .ok_or_else(|| Error::InvalidBuffer("null tracked region".into()))?;
            let mut phys = handle.phys();
            if phys == 0 {
                phys = physical_address(handle.virt());
            }

            let id = state.next_id;
            state.next_id += 1;
            let buf = Arc::new(Buffer::new(id, virt, phys, handle.size(), Ownership::External));
            state.index.insert(id, Arc::clone(&buf));
            state.liveness.insert(id, handle.watch());
            state.free.push_back(Arc::clone(&buf));
            state.permanent.push(buf);
        }

        info!(name, count = handles.len(), buffer_size, "buffer pool created (tracked external)");
        let pool = Self::finish(name, category, 0, Box::new(ExternalAllocator), state);
        *pool.tracked_handles.lock().unwrap() = handles;
        Ok(pool)
    }

    /// Mode 4: start empty, fill at runtime via [`BufferPool::inject_filled`].
    ///
    /// `max_capacity` of 0 means unbounded.
    pub fn new_injected(name: &str, category: &str, max_capacity: usize) -> Result<Arc<Self>> {
        let state = PoolState {
            permanent: Vec::new(),
            index: HashMap::new(),
            free: VecDeque::new(),
            filled: VecDeque::new(),
            liveness: HashMap::new(),
            next_id: 0,
            buffer_size: 0,
        };
        info!(name, max_capacity, "buffer pool created (dynamic injection)");
        Ok(Self::finish(
            name,
            category,
            max_capacity,
            Box::new(ExternalAllocator),
            state,
        ))
    }

    fn finish(
        name: &str,
        category: &str,
        max_capacity: usize,
        allocator: Box<dyn Allocator>,
        state: PoolState,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            name: name.to_string(),
            category: category.to_string(),
            registry_id: AtomicU64::new(0),
            max_capacity,
            allocator,
            state: Mutex::new(state),
            free_cv: Condvar::new(),
            filled_cv: Condvar::new(),
            transient: Mutex::new(HashMap::new()),
            tracked_handles: Mutex::new(Vec::new()),
            validator: Mutex::new(None),
            counters: PoolCounters {
                acquisitions: AtomicU64::new(0),
                waits: AtomicU64::new(0),
                injected: AtomicU64::new(0),
                ejected: AtomicU64::new(0),
            },
        });
        let id = registry::registry().register(&pool);
        pool.registry_id.store(id, Ordering::SeqCst);
        pool
    }

    // ------------------------------------------------------------------
    // Producer interface
    // ------------------------------------------------------------------

    /// Pop the head of the free queue, waiting forever if it is empty.
    ///
    /// Returns `None` only when the popped buffer fails revalidation (it is
    /// re-queued at the tail so it is not lost).
    pub fn acquire_free(&self) -> Option<Arc<Buffer>> {
        let mut state = self.state.lock().unwrap();
        while state.free.is_empty() {
            self.counters.waits.fetch_add(1, Ordering::Relaxed);
            state = self.free_cv.wait(state).unwrap();
        }
        self.pop_free_locked(&mut state)
    }

    /// Non-blocking variant of [`BufferPool::acquire_free`].
    pub fn try_acquire_free(&self) -> Option<Arc<Buffer>> {
        let mut state = self.state.lock().unwrap();
        if state.free.is_empty() {
            return None;
        }
        self.pop_free_locked(&mut state)
    }

    /// Deadline variant of [`BufferPool::acquire_free`]. Returns `None` when
    /// the timeout elapses with the queue still empty.
    pub fn acquire_free_timeout(&self, timeout: Duration) -> Option<Arc<Buffer>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.free.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.counters.waits.fetch_add(1, Ordering::Relaxed);
            let (guard, wait) = self.free_cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if wait.timed_out() && state.free.is_empty() {
                return None;
            }
        }
        self.pop_free_locked(&mut state)
    }

    fn pop_free_locked(&self, state: &mut PoolState) -> Option<Arc<Buffer>> {
        let buf = state.free.pop_front()?;
        if !self.validate_locked(state, &buf) {
            warn!(id = buf.id(), pool = %self.name, "invalid buffer in free queue, re-queued");
            state.free.push_back(buf);
            return None;
        }
        buf.set_state(BufferState::LockedByProducer);
        buf.add_ref();
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(buf)
    }

    /// Hand a filled buffer to the consumer side.
    ///
    /// The caller must own `buf` (acquired and not yet submitted). A buffer
    /// that fails the membership check is logged and dropped; this is a
    /// producer bug, not a pool-state corruption.
    pub fn submit_filled(&self, buf: &Arc<Buffer>) {
        let mut state = self.state.lock().unwrap();
        if !membership_locked(&state, buf) {
            warn!(id = buf.id(), pool = %self.name, "submit of foreign buffer ignored");
            return;
        }
        buf.set_state(BufferState::ReadyForConsume);
        state.filled.push_back(Arc::clone(buf));
        drop(state);
        self.filled_cv.notify_one();
    }

    // ------------------------------------------------------------------
    // Consumer interface
    // ------------------------------------------------------------------

    /// Pop the head of the filled queue, waiting forever if it is empty.
    pub fn acquire_filled(&self) -> Option<Arc<Buffer>> {
        let mut state = self.state.lock().unwrap();
        while state.filled.is_empty() {
            state = self.filled_cv.wait(state).unwrap();
        }
        self.pop_filled_locked(&mut state)
    }

    /// Non-blocking variant of [`BufferPool::acquire_filled`].
    pub fn try_acquire_filled(&self) -> Option<Arc<Buffer>> {
        let mut state = self.state.lock().unwrap();
        if state.filled.is_empty() {
            return None;
        }
        self.pop_filled_locked(&mut state)
    }

    /// Deadline variant of [`BufferPool::acquire_filled`].
    pub fn acquire_filled_timeout(&self, timeout: Duration) -> Option<Arc<Buffer>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.filled.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, wait) = self.filled_cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if wait.timed_out() && state.filled.is_empty() {
                return None;
            }
        }
        self.pop_filled_locked(&mut state)
    }

    fn pop_filled_locked(&self, state: &mut PoolState) -> Option<Arc<Buffer>> {
        let buf = state.filled.pop_front()?;
        if !self.validate_locked(state, &buf) {
            warn!(id = buf.id(), pool = %self.name, "invalid buffer in filled queue");
            return None;
        }
        // Refcount unchanged: the producer's reference is transferred to the
        // consumer and dropped in release_filled.
        buf.set_state(BufferState::LockedByConsumer);
        Some(buf)
    }

    /// Return a consumed buffer.
    ///
    /// Permanent buffers go back to the free queue; transient (injected)
    /// buffers are ejected, which runs their reclaim hook.
    pub fn release_filled(&self, buf: &Arc<Buffer>) {
        let is_transient = self.transient.lock().unwrap().contains_key(&buf.id());
        if is_transient {
            self.eject_buffer(buf);
            return;
        }

        let mut state = self.state.lock().unwrap();
        if !membership_locked(&state, buf) {
            warn!(id = buf.id(), pool = %self.name, "release of foreign buffer ignored");
            return;
        }
        buf.release_ref();
        buf.set_state(BufferState::Idle);
        state.free.push_back(Arc::clone(buf));
        drop(state);
        self.free_cv.notify_one();
    }

    // ------------------------------------------------------------------
    // Dynamic injection
    // ------------------------------------------------------------------

    /// Inject an externally-filled buffer straight into the filled queue.
    ///
    /// The handle (and its deleter) moves into the pool; the matching
    /// [`BufferPool::release_filled`] ejects the buffer and runs the deleter
    /// exactly once, outside the pool locks.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when a capacity limit is set and reached.
    pub fn inject_filled(&self, handle: BufferHandle) -> Result<Arc<Buffer>> {
        let virt = NonNull::new(handle.virt())
            .ok_or_else(|| Error::InvalidBuffer("null handle injected".into()))?;

        // Claim an id and make the pool responsible (id map) first.
        let buf = {
            let mut state = self.state.lock().unwrap();
            if self.max_capacity > 0 && state.index.len() >= self.max_capacity {
                warn!(pool = %self.name, cap = self.max_capacity, "injection rejected: at capacity");
                return Err(Error::PoolExhausted);
            }
            let id = state.next_id;
            state.next_id += 1;
            let buf = Arc::new(Buffer::new_transient(id, virt, handle.phys(), handle.size()));
            state.index.insert(id, Arc::clone(&buf));
            buf
        };

        // The handle must be routable before any consumer can see the
        // buffer, or a fast release would treat it as permanent.
        self.transient.lock().unwrap().insert(buf.id(), handle);

        {
            let mut state = self.state.lock().unwrap();
            state.filled.push_back(Arc::clone(&buf));
        }
        self.filled_cv.notify_one();
        self.counters.injected.fetch_add(1, Ordering::Relaxed);
        observability::record_injected();
        Ok(buf)
    }

    /// Remove a transient buffer from the pool, running its reclaim hook.
    ///
    /// Returns `false` when `buf` is not a transient buffer of this pool.
    /// Used by [`BufferPool::release_filled`] and by sweeps that observe a
    /// dead liveness token.
    pub fn eject_buffer(&self, buf: &Arc<Buffer>) -> bool {
        let handle = self.transient.lock().unwrap().remove(&buf.id());
        let Some(handle) = handle else {
            return false;
        };

        {
            let mut state = self.state.lock().unwrap();
            state.index.remove(&buf.id());
            // Normally the consumer holds the buffer at this point, but a
            // sweep may eject one still parked in the filled queue.
            state.filled.retain(|b| !Arc::ptr_eq(b, buf));
        }

        buf.release_ref();
        self.counters.ejected.fetch_add(1, Ordering::Relaxed);
        observability::record_ejected();
        // The deleter runs here, outside both locks.
        drop(handle);
        true
    }

    // ------------------------------------------------------------------
    // Queries and validation
    // ------------------------------------------------------------------

    /// O(1) lookup by pool-local id.
    pub fn buffer_by_id(&self, id: u32) -> Option<Arc<Buffer>> {
        self.state.lock().unwrap().index.get(&id).cloned()
    }

    /// Number of buffers in the free queue.
    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Number of buffers in the filled queue.
    pub fn filled_count(&self) -> usize {
        self.state.lock().unwrap().filled.len()
    }

    /// Number of buffers the pool currently owns or tracks.
    pub fn total_count(&self) -> usize {
        self.state.lock().unwrap().index.len()
    }

    /// Per-buffer size in bytes; 0 for an injection pool not yet sized.
    pub fn buffer_size(&self) -> usize {
        self.state.lock().unwrap().buffer_size
    }

    /// One-shot buffer-size assignment for dynamic-injection pools.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::Config("buffer size must be > 0".into()));
        }
        let mut state = self.state.lock().unwrap();
        if state.buffer_size != 0 {
            return Err(Error::ContractViolation(format!(
                "buffer size already set to {}",
                state.buffer_size
            )));
        }
        state.buffer_size = size;
        Ok(())
    }

    /// Pool name used for registry lookup.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool category used for registry grouping.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Id assigned by the [`crate::buffer::PoolRegistry`].
    pub fn registry_id(&self) -> u64 {
        self.registry_id.load(Ordering::SeqCst)
    }

    /// Install a user validation predicate consulted on every acquire.
    pub fn set_validator(&self, validator: BufferValidator) {
        *self.validator.lock().unwrap() = Some(validator);
    }

    /// Full validity check: membership, liveness, integrity, user predicate.
    pub fn validate_buffer(&self, buf: &Arc<Buffer>) -> bool {
        let state = self.state.lock().unwrap();
        self.validate_locked(&state, buf)
    }

    fn validate_locked(&self, state: &PoolState, buf: &Arc<Buffer>) -> bool {
        if !buf.magic_ok() {
            return false;
        }
        if !membership_locked(state, buf) {
            return false;
        }
        if let Some(watch) = state.liveness.get(&buf.id()) {
            if !watch.is_alive() {
                warn!(id = buf.id(), pool = %self.name, "tracked buffer backing is dead");
                return false;
            }
        }
        if let Some(validator) = self.validator.lock().unwrap().as_ref() {
            if !validator(buf) {
                return false;
            }
        }
        true
    }

    /// Evict tracked-external buffers whose backing died while parked in a
    /// queue. Returns the number of buffers evicted.
    ///
    /// The acquire paths already refuse dead buffers; sweeping just stops
    /// them from clogging the queues.
    pub fn sweep_dead(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let dead: Vec<u32> = state
            .liveness
            .iter()
            .filter(|(_, watch)| !watch.is_alive())
            .map(|(&id, _)| id)
            .collect();
        for id in &dead {
            state.free.retain(|b| b.id() != *id);
            state.filled.retain(|b| b.id() != *id);
            state.index.remove(id);
            state.liveness.remove(id);
        }
        if !dead.is_empty() {
            debug!(pool = %self.name, count = dead.len(), "swept dead tracked buffers");
        }
        dead.len()
    }

    /// Export a buffer as a cross-process shareable descriptor.
    ///
    /// Only contiguous-backed (dma-heap) pools support this. The descriptor
    /// is memoized on the buffer; later calls return the same fd.
    pub fn export_shareable(&self, id: u32) -> Result<RawFd> {
        let buf = self
            .buffer_by_id(id)
            .ok_or_else(|| Error::InvalidBuffer(format!("no buffer #{id} in pool '{}'", self.name)))?;
        if let Some(fd) = buf.dma_fd() {
            return Ok(fd);
        }
        let fd = self.allocator.export_fd(buf.as_ptr()).ok_or_else(|| {
            Error::Unsupported(format!(
                "pool '{}' ({} allocator) cannot export shareable buffers",
                self.name,
                self.allocator.name()
            ))
        })?;
        buf.set_dma_fd(fd);
        Ok(fd)
    }

    /// Usage snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            total: state.index.len(),
            free: state.free.len(),
            filled: state.filled.len(),
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            injected: self.counters.injected.load(Ordering::Relaxed),
            ejected: self.counters.ejected.load(Ordering::Relaxed),
        }
    }

    /// Wake every waiter on both queues.
    ///
    /// Cancellation hook: a stopping producer sets its flag and calls this
    /// so workers parked in a blocking acquire observe the flag promptly.
    pub fn notify_all(&self) {
        self.free_cv.notify_all();
        self.filled_cv.notify_all();
    }
}

/// Allocate `count` regions or none: any failure unwinds the partial set.
fn allocate_all(allocator: &dyn Allocator, count: usize, size: usize) -> Result<Vec<Allocation>> {
    let mut allocations: Vec<Allocation> = Vec::with_capacity(count);
    for _ in 0..count {
        match allocator.allocate(size) {
            Ok(alloc) => allocations.push(alloc),
            Err(err) => {
                for a in allocations.drain(..) {
                    allocator.deallocate(&a);
                }
                return Err(err);
            }
        }
    }
    Ok(allocations)
}

fn membership_locked(state: &PoolState, buf: &Arc<Buffer>) -> bool {
    state
        .index
        .get(&buf.id())
        .is_some_and(|owned| Arc::ptr_eq(owned, buf))
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        registry::registry().deregister(self.registry_id.load(Ordering::SeqCst));

        // Transient handles first: their deleters must run outside the pool
        // lock, which &mut self guarantees.
        let transients: Vec<BufferHandle> = {
            let mut map = self.transient.lock().unwrap();
            map.drain().map(|(_, h)| h).collect()
        };
        drop(transients);

        // Owned memory goes back through the allocator that produced it.
        let state = self.state.get_mut().unwrap();
        for buf in &state.permanent {
            if buf.ownership() == Ownership::Owned {
                let alloc = Allocation {
                    virt: NonNull::new(buf.as_ptr()).expect("owned buffer has a valid pointer"),
                    phys: buf.phys_addr(),
                    size: buf.size(),
                };
                self.allocator.deallocate(&alloc);
            }
        }

        // Mode-3 handles drop here, after nothing references their memory.
        debug!(pool = %self.name, "buffer pool destroyed");
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("total", &stats.total)
            .field("free", &stats.free)
            .field("filled", &stats.filled)
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

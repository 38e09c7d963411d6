//! Allocation strategies for pool-owned buffer memory.
//!
//! Three backends, one trait:
//!
//! - [`HeapAllocator`]: page-aligned, zero-filled heap memory. Physical
//!   addresses are resolved best-effort through `/proc/self/pagemap`.
//! - [`CmaAllocator`]: physically contiguous memory from a Linux dma-heap
//!   (`/dev/dma_heap/linux,cma`, falling back to the system heap). The
//!   dma-buf fd is retained so buffers can later be exported for
//!   cross-process sharing.
//! - [`ExternalAllocator`]: placeholder for pools whose memory is
//!   user-supplied; allocating through it is a contract violation.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::Mutex;

use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Page alignment for heap allocations.
const PAGE_SIZE: usize = 4096;

/// Candidate dma-heap device nodes, in priority order.
const DMA_HEAP_PATHS: [&str; 2] = ["/dev/dma_heap/linux,cma", "/dev/dma_heap/system"];

/// One region handed out by an allocator.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// CPU-addressable pointer to the region.
    pub virt: NonNull<u8>,
    /// Bus address, 0 when unavailable.
    pub phys: u64,
    /// Byte length.
    pub size: usize,
}

// SAFETY: an Allocation is just an address triple; the memory it points to
// is owned by whoever holds it (the pool).
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Strategy for obtaining backing memory.
pub trait Allocator: Send + Sync {
    /// Allocate a region of `size` bytes.
    fn allocate(&self, size: usize) -> Result<Allocation>;

    /// Release a region previously returned by `allocate`.
    fn deallocate(&self, alloc: &Allocation);

    /// Export the region as a cross-process shareable descriptor.
    ///
    /// Only the contiguous backend supports this; others return `None`.
    fn export_fd(&self, _virt: *const u8) -> Option<RawFd> {
        None
    }

    /// Stable identifying name.
    fn name(&self) -> &'static str;
}

/// Best-effort virtual-to-physical translation via `/proc/self/pagemap`.
///
/// Returns 0 when the pagemap is unreadable (no privilege), the page is not
/// present, or the kernel hides the PFN. Callers must treat 0 as "unknown",
/// never as an error.
pub fn physical_address(virt: *const u8) -> u64 {
    let fd = match rustix::fs::open("/proc/self/pagemap", OFlags::RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(_) => return 0,
    };

    let addr = virt as usize;
    let page_offset = (addr % PAGE_SIZE) as u64;
    let entry_offset = (addr / PAGE_SIZE) as u64 * 8;

    let mut entry = [0u8; 8];
    match rustix::io::pread(&fd, &mut entry, entry_offset) {
        Ok(8) => {}
        _ => return 0,
    }
    let entry = u64::from_ne_bytes(entry);

    // Bit 63: page present. Bits 54..0: page frame number.
    if entry & (1 << 63) == 0 {
        return 0;
    }
    let pfn = entry & ((1 << 55) - 1);
    if pfn == 0 {
        return 0;
    }
    pfn * PAGE_SIZE as u64 + page_offset
}

// ============================================================================
// HeapAllocator
// ============================================================================

/// Page-aligned, zero-filled heap allocation.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be > 0".into()));
        }
        let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let virt = NonNull::new(ptr)
            .ok_or_else(|| Error::AllocationFailed(format!("heap allocation of {size} bytes")))?;

        // Zeroing touched every page, so the pagemap lookup sees them all.
        let phys = physical_address(virt.as_ptr());
        if phys == 0 {
            debug!(size, "no physical address for heap allocation");
        }

        Ok(Allocation { virt, phys, size })
    }

    fn deallocate(&self, alloc: &Allocation) {
        let layout = std::alloc::Layout::from_size_align(alloc.size, PAGE_SIZE)
            .expect("layout was valid at allocation time");
        // SAFETY: virt/size came from allocate() with the same layout.
        unsafe { std::alloc::dealloc(alloc.virt.as_ptr(), layout) };
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

// ============================================================================
// CmaAllocator
// ============================================================================

/// Ioctl argument for `DMA_HEAP_IOCTL_ALLOC` (linux/dma-heap.h).
#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

/// Physically contiguous allocation from a Linux dma-heap.
///
/// The allocator keeps the dma-buf fd of every live region so a buffer can
/// later be exported for cross-process sharing via
/// [`crate::buffer::BufferPool::export_shareable`].
#[derive(Default)]
pub struct CmaAllocator {
    /// virt address -> retained dma-buf fd.
    exports: Mutex<HashMap<usize, OwnedFd>>,
}

impl CmaAllocator {
    /// Create a contiguous allocator.
    pub fn new() -> Self {
        Self::default()
    }

    fn open_heap() -> Result<OwnedFd> {
        for path in DMA_HEAP_PATHS {
            match rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => {
                    debug!(path, "opened dma-heap device");
                    return Ok(fd);
                }
                Err(err) => debug!(path, %err, "dma-heap open failed"),
            }
        }
        Err(Error::AllocationFailed(format!(
            "no dma-heap device available (tried {} paths)",
            DMA_HEAP_PATHS.len()
        )))
    }

    fn alloc_dmabuf(heap_fd: &OwnedFd, size: usize) -> Result<OwnedFd> {
        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: (OFlags::RDWR | OFlags::CLOEXEC).bits(),
            heap_flags: 0,
        };
        // SAFETY: opcode and argument type match linux/dma-heap.h.
        unsafe {
            let ctl = rustix::ioctl::Updater::<
                rustix::ioctl::ReadWriteOpcode<b'H', 0, DmaHeapAllocationData>,
                DmaHeapAllocationData,
            >::new(&mut data);
            rustix::ioctl::ioctl(heap_fd, ctl)?;
        }
        // SAFETY: the kernel just handed us this fd.
        Ok(unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) })
    }
}

impl Allocator for CmaAllocator {
    fn allocate(&self, size: usize) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be > 0".into()));
        }
        let heap_fd = Self::open_heap()?;
        let dmabuf_fd = Self::alloc_dmabuf(&heap_fd, size)?;
        // The heap fd is only needed for the allocation call; the dma-buf fd
        // keeps the memory alive.
        drop(heap_fd);

        // SAFETY: mapping a freshly allocated dma-buf of `size` bytes.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &dmabuf_fd,
                0,
            )?
        };
        let virt = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        // Fault the first page in so the pagemap lookup has a PFN to report.
        // SAFETY: virt is valid for size >= 1 bytes.
        unsafe { std::ptr::write_volatile(virt.as_ptr(), 0) };
        let phys = physical_address(virt.as_ptr());
        if phys == 0 {
            warn!(size, "no physical address for contiguous allocation");
        }

        self.exports
            .lock()
            .unwrap()
            .insert(virt.as_ptr() as usize, dmabuf_fd);

        Ok(Allocation { virt, phys, size })
    }

    fn deallocate(&self, alloc: &Allocation) {
        // SAFETY: virt/size came from allocate()'s mmap.
        unsafe {
            let _ = rustix::mm::munmap(alloc.virt.as_ptr().cast(), alloc.size);
        }
        // Dropping the retained fd releases the dma-buf.
        self.exports
            .lock()
            .unwrap()
            .remove(&(alloc.virt.as_ptr() as usize));
    }

    fn export_fd(&self, virt: *const u8) -> Option<RawFd> {
        self.exports
            .lock()
            .unwrap()
            .get(&(virt as usize))
            .map(|fd| fd.as_raw_fd())
    }

    fn name(&self) -> &'static str {
        "cma"
    }
}

impl std::fmt::Debug for CmaAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmaAllocator")
            .field("live_regions", &self.exports.lock().unwrap().len())
            .finish()
    }
}

// ============================================================================
// ExternalAllocator
// ============================================================================

/// Placeholder allocator for pools over user-supplied memory.
#[derive(Debug, Default)]
pub struct ExternalAllocator;

impl Allocator for ExternalAllocator {
    fn allocate(&self, _size: usize) -> Result<Allocation> {
        Err(Error::ContractViolation(
            "external allocator never allocates".into(),
        ))
    }

    fn deallocate(&self, _alloc: &Allocation) {
        // External memory is released by its owner.
    }

    fn name(&self) -> &'static str {
        "external"
    }
}

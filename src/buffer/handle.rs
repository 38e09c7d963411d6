//! RAII handle for externally-owned buffer memory.
//!
//! A [`BufferHandle`] binds a memory region the pool did not allocate to an
//! explicit reclaim policy (the deleter) and publishes a liveness token that
//! observers can poll without dereferencing the memory. The token flips to
//! dead *before* the deleter runs, so a watcher that sees "alive" while the
//! owner is mid-destruction can only race towards the check, never towards a
//! dangling read.
//!
//! # Example
//!
//! ```rust,ignore
//! use paneflow::buffer::BufferHandle;
//!
//! let frame: Box<[u8]> = decoder.take_frame();
//! let handle = BufferHandle::from_boxed_slice(frame, 0);
//! let watch = handle.watch();
//!
//! pool.inject_filled(handle)?;
//! assert!(watch.is_alive()); // until the consumer releases the frame
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

use crate::error::{Error, Result};

/// Reclaim hook invoked with the virtual address when the handle is dropped.
pub type Deleter = Box<dyn FnOnce(*mut u8) + Send>;

/// Scoped ownership of an externally-supplied allocation.
///
/// Non-cloneable; ownership moves into the pool on injection or mode-3
/// construction. On drop the liveness flag is cleared first, then the
/// deleter runs. A panicking deleter is caught and logged; the flag
/// transition has already happened, so observers see a dead token even when
/// reclaim fails.
pub struct BufferHandle {
    virt: NonNull<u8>,
    phys: u64,
    size: usize,
    deleter: Option<Deleter>,
    alive: Arc<AtomicBool>,
}

impl BufferHandle {
    /// Wrap an external region.
    ///
    /// `deleter` may be `None` when the memory outlives every pool that will
    /// see it (e.g. hardware framebuffer panes).
    ///
    /// # Errors
    ///
    /// Fails when `virt` is null or `size` is 0.
    pub fn new(virt: *mut u8, phys: u64, size: usize, deleter: Option<Deleter>) -> Result<Self> {
        let virt = NonNull::new(virt)
            .ok_or_else(|| Error::InvalidBuffer("null address for buffer handle".into()))?;
        if size == 0 {
            return Err(Error::InvalidBuffer("zero-size buffer handle".into()));
        }
        Ok(Self {
            virt,
            phys,
            size,
            deleter,
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Take ownership of a heap-allocated frame.
    ///
    /// The deleter reconstitutes and drops the box. This is the path decoder
    /// frames take into [`crate::buffer::BufferPool::inject_filled`].
    pub fn from_boxed_slice(frame: Box<[u8]>, phys: u64) -> Self {
        let size = frame.len();
        let virt = Box::into_raw(frame) as *mut u8;
        let deleter: Deleter = Box::new(move |ptr| {
            // SAFETY: ptr/size came from Box::into_raw above; dropped once.
            drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, size)) });
        });
        Self {
            virt: NonNull::new(virt).expect("box pointer is never null"),
            phys,
            size,
            deleter: Some(deleter),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// CPU-visible address of the region.
    #[inline]
    pub fn virt(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Bus address, 0 when unknown.
    #[inline]
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Byte length of the region.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// A weak liveness observer that outlives the handle.
    pub fn watch(&self) -> LivenessWatch {
        LivenessWatch(Arc::downgrade(&self.alive))
    }

    /// A revocation grip on the liveness flag.
    ///
    /// The external memory owner keeps this when it hands the handle itself
    /// to a pool: revoking marks the backing as destroyed so every observer
    /// (and the pool's validation) refuses the buffer from then on, without
    /// anyone touching the memory.
    pub fn revoker(&self) -> LivenessRevoker {
        LivenessRevoker(Arc::clone(&self.alive))
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        // Order matters: observers must see death before reclamation starts.
        self.alive.store(false, Ordering::SeqCst);
        if let Some(deleter) = self.deleter.take() {
            let ptr = self.virt.as_ptr();
            if catch_unwind(AssertUnwindSafe(move || deleter(ptr))).is_err() {
                warn!("buffer handle deleter panicked; memory may leak");
            }
        }
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("virt", &self.virt.as_ptr())
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &self.size)
            .field("has_deleter", &self.deleter.is_some())
            .finish()
    }
}

// SAFETY: the handle owns its region exclusively and the deleter is Send.
unsafe impl Send for BufferHandle {}

/// Weak reference to a handle's liveness flag.
///
/// `is_alive` is the source of truth for external-buffer validity: it
/// returns `false` once the owning [`BufferHandle`] has been dropped (or is
/// mid-drop), without touching the buffer memory.
#[derive(Clone)]
pub struct LivenessWatch(Weak<AtomicBool>);

impl LivenessWatch {
    /// Whether the watched handle still owns live memory.
    pub fn is_alive(&self) -> bool {
        match self.0.upgrade() {
            Some(flag) => flag.load(Ordering::SeqCst),
            None => false,
        }
    }
}

impl std::fmt::Debug for LivenessWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessWatch")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Strong grip on a handle's liveness flag, held by the external owner.
///
/// Revocation is one-way: once the backing is declared dead it stays dead.
#[derive(Clone)]
pub struct LivenessRevoker(Arc<AtomicBool>);

impl LivenessRevoker {
    /// Declare the backing memory destroyed.
    pub fn revoke(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether the backing is still declared alive.
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LivenessRevoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessRevoker")
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handle_rejects_null_and_empty() {
        assert!(BufferHandle::new(std::ptr::null_mut(), 0, 16, None).is_err());

        let mut byte = 0u8;
        assert!(BufferHandle::new(&mut byte as *mut u8, 0, 0, None).is_err());
    }

    #[test]
    fn test_deleter_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);

        let mut mem = vec![0u8; 32].into_boxed_slice();
        let handle = BufferHandle::new(
            mem.as_mut_ptr(),
            0,
            32,
            Some(Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_liveness_flips_before_deleter() {
        let mut mem = vec![0u8; 8].into_boxed_slice();
        let alive = Arc::new(AtomicBool::new(true));
        let watch = LivenessWatch(Arc::downgrade(&alive));

        // The deleter itself must already observe a dead token.
        let watch_in_deleter = watch.clone();
        let seen_dead = Arc::new(AtomicBool::new(false));
        let seen_dead2 = Arc::clone(&seen_dead);
        let handle = BufferHandle {
            virt: NonNull::new(mem.as_mut_ptr()).unwrap(),
            phys: 0,
            size: 8,
            deleter: Some(Box::new(move |_| {
                seen_dead2.store(!watch_in_deleter.is_alive(), Ordering::SeqCst);
            })),
            alive,
        };

        assert!(watch.is_alive());
        drop(handle);
        assert!(!watch.is_alive());
        assert!(seen_dead.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_deleter_still_kills_token() {
        let mut mem = vec![0u8; 8].into_boxed_slice();
        let handle = BufferHandle::new(
            mem.as_mut_ptr(),
            0,
            8,
            Some(Box::new(|_| panic!("reclaim failed"))),
        )
        .unwrap();
        let watch = handle.watch();

        drop(handle); // must not propagate the panic
        assert!(!watch.is_alive());
    }

    #[test]
    fn test_revoker_kills_watch_without_drop() {
        let mut mem = vec![0u8; 8].into_boxed_slice();
        let handle = BufferHandle::new(mem.as_mut_ptr(), 0, 8, None).unwrap();
        let watch = handle.watch();
        let revoker = handle.revoker();

        assert!(watch.is_alive());
        revoker.revoke();
        assert!(!watch.is_alive());
        assert!(!revoker.is_alive());
        // The handle itself still exists; only the liveness is gone.
        assert_eq!(handle.size(), 8);
    }

    #[test]
    fn test_from_boxed_slice_roundtrip() {
        let frame = vec![0xAB_u8; 128].into_boxed_slice();
        let handle = BufferHandle::from_boxed_slice(frame, 0x2000);

        assert_eq!(handle.size(), 128);
        assert_eq!(handle.phys(), 0x2000);
        // SAFETY: handle owns the region.
        let first = unsafe { *handle.virt() };
        assert_eq!(first, 0xAB);

        let watch = handle.watch();
        drop(handle);
        assert!(!watch.is_alive());
    }
}

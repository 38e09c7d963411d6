//! Memory-mapped file frame source.
//!
//! The whole input file is mapped read-only at open; serving a frame is a
//! bounds check plus one copy out of the mapping. All accesses are reads of
//! disjoint regions, so the source is thread-safe without locks.

use std::ptr::NonNull;
use std::sync::Arc;

use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use tracing::{info, warn};

use super::{frame_size_bytes, refuse_containers, FrameSource};
use crate::buffer::BufferPool;
use crate::error::{Error, Result};

/// Read-only mapping of the whole input file.
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn open(path: &str) -> Result<Self> {
        let fd = rustix::fs::open(path, OFlags::RDONLY, Mode::empty())?;
        let stat = rustix::fs::fstat(&fd)?;
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(Error::Config(format!("'{path}' is empty")));
        }

        // SAFETY: mapping a regular file read-only for its full length.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::PRIVATE,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;
        // fd can close now; the mapping keeps the file data reachable.
        Ok(Self { base, len })
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // SAFETY: base is valid for len bytes for the life of the mapping.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len came from mmap.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is read-only shared memory.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// File-mapped frame source. See the module docs.
#[derive(Default)]
pub struct MmapFrameSource {
    mapping: Option<Mapping>,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    frame_size: usize,
    total_frames: u64,
}

impl MmapFrameSource {
    /// Create a closed source; call `open_raw` before reading.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameSource for MmapFrameSource {
    fn open(&mut self, path: &str) -> Result<()> {
        refuse_containers(path)
    }

    fn open_raw(&mut self, path: &str, width: u32, height: u32, bits_per_pixel: u32) -> Result<()> {
        if width == 0 || height == 0 || bits_per_pixel == 0 {
            return Err(Error::Config("pixel geometry must be non-zero".into()));
        }
        let frame_size = frame_size_bytes(width, height, bits_per_pixel);
        let mapping = Mapping::open(path)?;

        let total_frames = (mapping.len / frame_size) as u64;
        if total_frames == 0 {
            return Err(Error::Config(format!(
                "'{path}' ({} bytes) holds no complete {frame_size}-byte frame",
                mapping.len
            )));
        }
        let tail = mapping.len % frame_size;
        if tail != 0 {
            warn!(path, tail, "file tail is not a whole frame; ignored");
        }

        info!(path, total_frames, frame_size, "mapped raw video file");
        self.mapping = Some(mapping);
        self.width = width;
        self.height = height;
        self.bits_per_pixel = bits_per_pixel;
        self.frame_size = frame_size;
        self.total_frames = total_frames;
        Ok(())
    }

    fn close(&mut self) {
        self.mapping = None;
        self.total_frames = 0;
    }

    fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    fn read_frame_at(&self, index: u64, dest: &mut [u8]) -> Result<()> {
        let mapping = self
            .mapping
            .as_ref()
            .ok_or_else(|| Error::Config("source is not open".into()))?;
        if index >= self.total_frames {
            return Err(Error::OutOfRange {
                frame: index,
                total: self.total_frames,
            });
        }
        if dest.len() < self.frame_size {
            return Err(Error::InvalidBuffer(format!(
                "destination {} bytes, frame {} bytes",
                dest.len(),
                self.frame_size
            )));
        }

        let start = index as usize * self.frame_size;
        dest[..self.frame_size].copy_from_slice(&mapping.as_slice()[start..start + self.frame_size]);
        Ok(())
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.total_frames)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    fn attach_pool(&self, _pool: &Arc<BufferPool>) {
        // File reads copy into pool buffers directly; nothing to wire up.
    }
}

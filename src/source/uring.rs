//! io_uring frame source.
//!
//! Keeps one submission ring per source instance. A frame read submits a
//! single read SQE at `index * frame_size` and waits for its completion, so
//! the kernel does the positioned I/O without a seek-read pair. The ring is
//! serialized behind a mutex, which makes the instance thread-safe; workers
//! wanting parallel I/O create one instance each and partition the index
//! space through the shared producer cursor.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use io_uring::{opcode, types, IoUring};
use tracing::{info, warn};

use super::{frame_size_bytes, refuse_containers, FrameSource};
use crate::error::{Error, Result};

/// Default submission queue depth.
pub const DEFAULT_QUEUE_DEPTH: u32 = 16;

struct UringInner {
    file: File,
    ring: Mutex<IoUring>,
}

/// Async-I/O frame source backed by io_uring. See the module docs.
pub struct UringFrameSource {
    inner: Option<UringInner>,
    queue_depth: u32,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    frame_size: usize,
    total_frames: u64,
}

impl Default for UringFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl UringFrameSource {
    /// Create a closed source with the default queue depth.
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Create a closed source with an explicit queue depth.
    pub fn with_queue_depth(queue_depth: u32) -> Self {
        Self {
            inner: None,
            queue_depth: queue_depth.max(1),
            width: 0,
            height: 0,
            bits_per_pixel: 0,
            frame_size: 0,
            total_frames: 0,
        }
    }
}

impl FrameSource for UringFrameSource {
    fn open(&mut self, path: &str) -> Result<()> {
        refuse_containers(path)
    }

    fn open_raw(&mut self, path: &str, width: u32, height: u32, bits_per_pixel: u32) -> Result<()> {
        if width == 0 || height == 0 || bits_per_pixel == 0 {
            return Err(Error::Config("pixel geometry must be non-zero".into()));
        }
        let frame_size = frame_size_bytes(width, height, bits_per_pixel);

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let total_frames = file_len / frame_size as u64;
        if total_frames == 0 {
            return Err(Error::Config(format!(
                "'{path}' ({file_len} bytes) holds no complete {frame_size}-byte frame"
            )));
        }
        if file_len % frame_size as u64 != 0 {
            warn!(path, tail = file_len % frame_size as u64, "file tail is not a whole frame; ignored");
        }

        let ring = IoUring::new(self.queue_depth)
            .map_err(|e| Error::Unsupported(format!("io_uring setup failed: {e}")))?;

        info!(path, total_frames, frame_size, depth = self.queue_depth, "opened raw file via io_uring");
        self.inner = Some(UringInner {
            file,
            ring: Mutex::new(ring),
        });
        self.width = width;
        self.height = height;
        self.bits_per_pixel = bits_per_pixel;
        self.frame_size = frame_size;
        self.total_frames = total_frames;
        Ok(())
    }

    fn close(&mut self) {
        self.inner = None;
        self.total_frames = 0;
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn read_frame_at(&self, index: u64, dest: &mut [u8]) -> Result<()> {
        let inner = self
            .inner
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

        let offset = index * self.frame_size as u64;
        let sqe = opcode::Read::new(
            types::Fd(inner.file.as_raw_fd()),
            dest.as_mut_ptr(),
            self.frame_size as u32,
        )
        .offset(offset)
        .build()
        .user_data(index);

        let mut ring = inner.ring.lock().unwrap();
        // SAFETY: dest outlives the submit-and-wait below; the entry is
        // consumed before this call returns.
        unsafe {
            ring.submission()
                .push(&sqe)
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
        ring.submit_and_wait(1)?;

        let cqe = ring
            .completion()
            .next()
            .ok_or_else(|| Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "io_uring returned no completion",
            )))?;
        let res = cqe.result();
        if res < 0 {
            return Err(Error::Io(std::io::Error::from_raw_os_error(-res)));
        }
        if res as usize != self.frame_size {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read: {res} of {} bytes", self.frame_size),
            )));
        }
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
}

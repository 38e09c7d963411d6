//! Linux framebuffer device.
//!
//! Opens the display node discovered through `/proc/fb`, queries geometry
//! with `FBIOGET_VSCREENINFO`, maps all hardware panes in one mmap, and
//! wraps them in an external-mode [`BufferPool`] so producers can write
//! straight into scan-out memory.
//!
//! The pane layout follows the virtual-resolution convention: the driver
//! exposes `yres_virtual = yres * N` and pane `i` starts at y-offset
//! `yres * i`. Flipping is a `FBIOPAN_DISPLAY` with the pane's offset;
//! vsync is `FBIO_WAITFORVSYNC`; the zero-copy DMA path programs the
//! overlay's source address with a driver ioctl before panning.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::ioctl;
use rustix::mm::{MapFlags, ProtFlags};
use tracing::{debug, info, warn};

use crate::buffer::{physical_address, Buffer, BufferPool, ExternalRegion};
use crate::error::{Error, Result};
use crate::observability;
use crate::source::frame_size_bytes;

/// Framebuffer names probed in `/proc/fb`, indexed by display index.
const FB_NAMES: [&str; 2] = ["tpsfb0", "tpsfb1"];

// Legacy constant-opcode framebuffer ioctls (linux/fb.h).
const FBIOGET_VSCREENINFO: u32 = 0x4600;
const FBIOPAN_DISPLAY: u32 = 0x4606;

/// `fb_bitfield` from linux/fb.h.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

/// `fb_var_screeninfo` from linux/fb.h.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

/// Argument for the driver's overlay-DMA ioctl (`_IOW('F', 7, ...)`).
#[repr(C)]
struct FbDmaInfo {
    ovl_idx: u32,
    phys_addr: u64,
}

/// Pan y-offset presenting pane `pane_id` on a display of height `yres`.
#[inline]
pub fn pan_offset(yres: u32, pane_id: u32) -> u32 {
    yres * pane_id
}

/// Number of panes a virtual resolution exposes.
#[inline]
pub fn pane_count(yres_virtual: u32, yres: u32) -> u32 {
    if yres == 0 {
        0
    } else {
        yres_virtual / yres
    }
}

/// The hardware framebuffer and its pane pool. See the module docs.
pub struct Framebuffer {
    fd: OwnedFd,
    base: NonNull<u8>,
    total_size: usize,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    pane_size: usize,
    panes: u32,
    pool: Arc<BufferPool>,
    current_pane: AtomicU32,
}

impl Framebuffer {
    /// Open display `index`, map its panes, build the pane pool.
    pub fn open(index: u32) -> Result<Self> {
        let node = find_device_node(index)?;
        info!(index, node = %node, "opening framebuffer device");

        let fd = rustix::fs::open(node.as_str(), OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| Error::Device(format!("cannot open {node}: {e}")))?;

        let info = query_vscreeninfo(&fd)?;
        let width = info.xres;
        let height = info.yres;
        let bits_per_pixel = info.bits_per_pixel;
        let pane_size = frame_size_bytes(width, height, bits_per_pixel);
        let panes = pane_count(info.yres_virtual, info.yres);
        if panes == 0 || pane_size == 0 {
            return Err(Error::Device(format!(
                "degenerate framebuffer geometry: {width}x{height}x{bits_per_pixel}, virtual yres {}",
                info.yres_virtual
            )));
        }

        let total_size = pane_size * panes as usize;
        // SAFETY: mapping the device's pane memory, which the driver sized
        // as yres_virtual rows.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                total_size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| Error::Device(format!("framebuffer mmap failed: {e}")))?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::Device("framebuffer mmap returned null".into()))?;

        // One external-mode pool buffer per pane, ids 0..panes matching the
        // hardware pane index.
        let regions: Vec<ExternalRegion> = (0..panes as usize)
            .map(|i| {
                // SAFETY: i * pane_size < total_size.
                let virt = unsafe { base.as_ptr().add(i * pane_size) };
                ExternalRegion {
                    virt,
                    phys: physical_address(virt),
                    size: pane_size,
                }
            })
            .collect();
        let pool = BufferPool::new_external(
            &regions,
            &format!("framebuffer-{index}-panes"),
            "display",
        )?;

        info!(
            width,
            height,
            bits_per_pixel,
            panes,
            pane_size,
            "framebuffer initialized"
        );
        Ok(Self {
            fd,
            base,
            total_size,
            width,
            height,
            bits_per_pixel,
            pane_size,
            panes,
            pool,
            current_pane: AtomicU32::new(0),
        })
    }

    /// The pool whose buffers are this framebuffer's panes.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Display width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Display height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bits per pixel.
    pub fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    /// Number of hardware panes.
    pub fn panes(&self) -> u32 {
        self.panes
    }

    /// Byte size of one pane.
    pub fn pane_size(&self) -> usize {
        self.pane_size
    }

    /// The pane currently being scanned out (0 in DMA mode).
    pub fn current_pane(&self) -> u32 {
        self.current_pane.load(Ordering::SeqCst)
    }

    /// Zero-copy DMA presentation: program the overlay's source physical
    /// address, then pan to offset 0.
    ///
    /// Fails fast when `buf` carries no physical address, and leaves the
    /// current-pane state untouched on any failure so the caller can fall
    /// back to [`Framebuffer::display_copy`].
    pub fn display_dma(&self, buf: &Buffer) -> Result<()> {
        let phys_addr = buf.phys_addr();
        if phys_addr == 0 {
            return Err(Error::InvalidBuffer(format!(
                "buffer #{} has no physical address for DMA display",
                buf.id()
            )));
        }

        let dma_info = FbDmaInfo {
            ovl_idx: 0,
            phys_addr,
        };
        // SAFETY: opcode and argument type match the driver's contract.
        unsafe {
            let ctl = ioctl::Setter::<ioctl::WriteOpcode<b'F', 7, FbDmaInfo>, FbDmaInfo>::new(
                dma_info,
            );
            ioctl::ioctl(&self.fd, ctl)
                .map_err(|e| Error::Device(format!("overlay DMA address ioctl failed: {e}")))?;
        }

        // DMA scans straight from the programmed address; the pan is issued
        // at offset 0 to latch it.
        self.pan_to(0)?;
        self.current_pane.store(0, Ordering::SeqCst);
        observability::record_displayed();
        Ok(())
    }

    /// Zero-copy pane flip for frames written directly into one of this
    /// framebuffer's own panes.
    pub fn display_pane(&self, buf: &Arc<Buffer>) -> Result<()> {
        let pane_id = buf.id();
        if pane_id >= self.panes {
            return Err(Error::InvalidBuffer(format!(
                "buffer #{pane_id} is not a pane of this framebuffer (0..{})",
                self.panes
            )));
        }
        // Same-id identity check against our own pool.
        let owned = self.pool.buffer_by_id(pane_id);
        if !owned.is_some_and(|p| Arc::ptr_eq(&p, buf)) {
            return Err(Error::InvalidBuffer(format!(
                "buffer #{pane_id} does not belong to this framebuffer's pool"
            )));
        }

        self.pan_to(pan_offset(self.height, pane_id))?;
        self.current_pane.store(pane_id, Ordering::SeqCst);
        observability::record_displayed();
        Ok(())
    }

    /// Copy-then-flip for foreign buffers: grab a free pane (non-blocking),
    /// copy the frame in, flip to it, release the pane.
    ///
    /// Releasing immediately is safe because the hardware keeps scanning
    /// the chosen pane until the next flip.
    pub fn display_copy(&self, buf: &Buffer) -> Result<()> {
        let pane = self.pool.try_acquire_free().ok_or(Error::PoolExhausted)?;

        if buf.size() != pane.size() {
            warn!(
                src = buf.size(),
                pane = pane.size(),
                "size mismatch, copying the smaller length"
            );
        }
        let n = buf.size().min(pane.size());
        pane.as_mut_slice()[..n].copy_from_slice(&buf.as_slice()[..n]);

        let result = self.pan_to(pan_offset(self.height, pane.id()));
        match result {
            Ok(()) => {
                self.current_pane.store(pane.id(), Ordering::SeqCst);
                observability::record_displayed();
            }
            Err(_) => debug!(pane = pane.id(), "flip failed after copy"),
        }
        // Back to free either way: the hardware keeps scanning the pane
        // after the flip, and on failure nothing references it at all.
        self.pool.release_filled(&pane);
        result
    }

    /// Block until the next scan-out boundary.
    pub fn wait_vsync(&self) -> Result<()> {
        let arg: u32 = 0;
        // SAFETY: FBIO_WAITFORVSYNC is _IOW('F', 0x20, u32).
        unsafe {
            let ctl = ioctl::Setter::<ioctl::WriteOpcode<b'F', 0x20, u32>, u32>::new(arg);
            ioctl::ioctl(&self.fd, ctl)
                .map_err(|e| Error::Device(format!("wait-for-vsync ioctl failed: {e}")))?;
        }
        Ok(())
    }

    fn pan_to(&self, yoffset: u32) -> Result<()> {
        let mut info = query_vscreeninfo(&self.fd)?;
        info.yoffset = yoffset;
        // SAFETY: FBIOPAN_DISPLAY takes an fb_var_screeninfo.
        unsafe {
            let ctl = ioctl::Updater::<ioctl::BadOpcode<{ FBIOPAN_DISPLAY }>, FbVarScreeninfo>::new(
                &mut info,
            );
            ioctl::ioctl(&self.fd, ctl)
                .map_err(|e| Error::Device(format!("pan-display ioctl failed: {e}")))?;
        }
        observability::record_flip();
        Ok(())
    }
}

impl super::consumer::DisplaySink for Framebuffer {
    fn present_dma(&self, buf: &Buffer) -> Result<()> {
        self.display_dma(buf)
    }

    fn present_pane(&self, buf: &Arc<Buffer>) -> Result<()> {
        self.display_pane(buf)
    }

    fn present_copy(&self, buf: &Buffer) -> Result<()> {
        self.display_copy(buf)
    }

    fn wait_vsync(&self) -> Result<()> {
        Framebuffer::wait_vsync(self)
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        // SAFETY: base/total_size came from mmap in open().
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.total_size);
        }
    }
}

// SAFETY: the mapping is shared device memory; exclusivity of pane writes
// is enforced by the pane pool's state machine.
unsafe impl Send for Framebuffer {}
unsafe impl Sync for Framebuffer {}

fn query_vscreeninfo(fd: &OwnedFd) -> Result<FbVarScreeninfo> {
    let mut info = FbVarScreeninfo::default();
    // SAFETY: FBIOGET_VSCREENINFO fills an fb_var_screeninfo.
    unsafe {
        let ctl = ioctl::Updater::<ioctl::BadOpcode<{ FBIOGET_VSCREENINFO }>, FbVarScreeninfo>::new(
            &mut info,
        );
        ioctl::ioctl(fd, ctl)
            .map_err(|e| Error::Device(format!("read-screen-info ioctl failed: {e}")))?;
    }
    Ok(info)
}

/// Resolve display `index` to a `/dev/fb*` node by scanning `/proc/fb`.
///
/// Each `/proc/fb` line is `<minor> <driver name>`; the named entry's minor
/// selects the device node.
fn find_device_node(index: u32) -> Result<String> {
    let target = FB_NAMES
        .get(index as usize)
        .ok_or_else(|| Error::Device(format!("no framebuffer name for index {index}")))?;

    let contents = std::fs::read_to_string("/proc/fb")
        .map_err(|e| Error::Device(format!("cannot read /proc/fb: {e}")))?;
    parse_proc_fb(&contents, target)
        .ok_or_else(|| Error::Device(format!("'{target}' not found in /proc/fb")))
}

fn parse_proc_fb(contents: &str, target: &str) -> Option<String> {
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(minor), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(minor) = minor.parse::<u32>() else {
            continue;
        };
        if name == target {
            return Some(format!("/dev/fb{minor}"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_offset_per_pane() {
        assert_eq!(pan_offset(1080, 0), 0);
        assert_eq!(pan_offset(1080, 1), 1080);
        assert_eq!(pan_offset(1080, 3), 3240);
    }

    #[test]
    fn test_pane_count_from_virtual_resolution() {
        assert_eq!(pane_count(4320, 1080), 4);
        assert_eq!(pane_count(1080, 1080), 1);
        // Partial trailing pane does not count.
        assert_eq!(pane_count(2000, 1080), 1);
        assert_eq!(pane_count(4320, 0), 0);
    }

    #[test]
    fn test_parse_proc_fb() {
        let contents = "0 tpsfb0\n1 tpsfb1\n2 efifb\n";
        assert_eq!(parse_proc_fb(contents, "tpsfb0").as_deref(), Some("/dev/fb0"));
        assert_eq!(parse_proc_fb(contents, "tpsfb1").as_deref(), Some("/dev/fb1"));
        assert_eq!(parse_proc_fb(contents, "tpsfb2"), None);
    }

    #[test]
    fn test_parse_proc_fb_nonsequential_minors() {
        // Driver registered later: name maps to its own minor, not its rank.
        let contents = "0 efifb\n2 tpsfb0\n";
        assert_eq!(parse_proc_fb(contents, "tpsfb0").as_deref(), Some("/dev/fb2"));
    }

    #[test]
    fn test_vscreeninfo_layout_size() {
        // fb_var_screeninfo is 160 bytes on every Linux ABI we target; a
        // drift here corrupts the ioctl.
        assert_eq!(std::mem::size_of::<FbVarScreeninfo>(), 160);
        assert_eq!(std::mem::size_of::<FbBitfield>(), 12);
    }

    #[test]
    fn test_open_missing_device_fails_cleanly() {
        // Index 9 has no name table entry.
        assert!(matches!(Framebuffer::open(9), Err(Error::Device(_))));
    }
}

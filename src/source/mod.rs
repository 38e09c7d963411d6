//! Frame sources: strategies that supply fixed-size raw pixel frames.
//!
//! A [`FrameSource`] serves frames by absolute index so that multiple
//! producer workers can share one source and partition the index space
//! between them. Three strategies:
//!
//! - [`MmapFrameSource`]: the whole file mapped read-only; reads are plain
//!   copies of disjoint regions and need no locks.
//! - [`UringFrameSource`]: an io_uring submission ring of fixed depth; each
//!   read submits at the right offset and waits for its completion.
//! - [`RtspFrameSource`]: a network stream with an internal decoder thread;
//!   serves decoded frames from a small ring, or injects them zero-copy
//!   into an attached pool.
//!
//! The factory honors an explicit [`SourceKind`], then the
//! `PANEFLOW_READER` environment variable, then a well-known config file,
//! and finally probes system capability (io_uring if available, else mmap).

mod mmap;
mod rtsp;
mod uring;

pub use mmap::MmapFrameSource;
pub use rtsp::RtspFrameSource;
pub use uring::UringFrameSource;

use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer::BufferPool;
use crate::error::{Error, Result};

/// Environment variable overriding automatic reader selection.
pub const READER_ENV_VAR: &str = "PANEFLOW_READER";

/// Config file consulted when the environment does not decide.
pub const READER_CONF_PATH: &str = "/etc/paneflow/reader.conf";

/// Which read strategy to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Pick the best available backend.
    #[default]
    Auto,
    /// Memory-mapped file reads.
    Mmap,
    /// io_uring async file reads.
    Uring,
    /// RTSP network stream with internal decode.
    Rtsp,
}

impl SourceKind {
    /// Parse a reader name as used by the env var and config file.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(SourceKind::Auto),
            "mmap" => Some(SourceKind::Mmap),
            "iouring" | "io_uring" | "uring" => Some(SourceKind::Uring),
            "rtsp" => Some(SourceKind::Rtsp),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceKind::Auto => "auto",
            SourceKind::Mmap => "mmap",
            SourceKind::Uring => "iouring",
            SourceKind::Rtsp => "rtsp",
        };
        f.write_str(name)
    }
}

/// Byte length of one frame: `ceil(width * height * bits_per_pixel / 8)`.
///
/// The rounding matters for sub-byte pixel formats (12-bit, for instance).
pub fn frame_size_bytes(width: u32, height: u32, bits_per_pixel: u32) -> usize {
    let total_bits = width as u64 * height as u64 * bits_per_pixel as u64;
    ((total_bits + 7) / 8) as usize
}

/// Supplier of fixed-size raw pixel frames, addressed by frame index.
pub trait FrameSource: Send + Sync {
    /// Open an input with auto-detected container format.
    ///
    /// Only headerless raw input is readable; recognized containers produce
    /// a descriptive [`Error::Unsupported`].
    fn open(&mut self, path: &str) -> Result<()>;

    /// Open a headerless raw input with explicit pixel geometry.
    fn open_raw(&mut self, path: &str, width: u32, height: u32, bits_per_pixel: u32)
        -> Result<()>;

    /// Close the input. Further reads fail until reopened.
    fn close(&mut self);

    /// Whether an input is currently open.
    fn is_open(&self) -> bool;

    /// Read frame `index` into `dest`.
    ///
    /// `dest` must hold at least [`FrameSource::frame_size`] bytes. Stream
    /// sources ignore the index. Safe to call from multiple threads.
    fn read_frame_at(&self, index: u64, dest: &mut [u8]) -> Result<()>;

    /// Total frame count, or `None` for unbounded streams.
    ///
    /// Producers skip index bounds checks for unbounded sources.
    fn total_frames(&self) -> Option<u64>;

    /// Byte length of one frame.
    fn frame_size(&self) -> usize;

    /// Frame width in pixels.
    fn width(&self) -> u32;

    /// Frame height in pixels.
    fn height(&self) -> u32;

    /// Bits per pixel.
    fn bits_per_pixel(&self) -> u32;

    /// Offer the destination pool for zero-copy delivery.
    ///
    /// File sources ignore this. The RTSP source switches to injecting
    /// decoded frames directly into the pool, after which
    /// [`FrameSource::read_frame_at`] becomes a successful no-op.
    fn attach_pool(&self, _pool: &Arc<BufferPool>) {}
}

/// Build a frame source of the requested kind.
///
/// `Auto` resolution order: environment variable, config file, capability
/// probe (io_uring when the kernel supports it, else mmap).
pub fn create_source(kind: SourceKind) -> Box<dyn FrameSource> {
    let resolved = match kind {
        SourceKind::Auto => resolve_auto(),
        explicit => explicit,
    };
    info!(requested = %kind, resolved = %resolved, "frame source selected");
    match resolved {
        SourceKind::Mmap => Box::new(MmapFrameSource::new()),
        SourceKind::Uring => Box::new(UringFrameSource::new()),
        SourceKind::Rtsp => Box::new(RtspFrameSource::new()),
        SourceKind::Auto => unreachable!("auto resolves to a concrete kind"),
    }
}

fn resolve_auto() -> SourceKind {
    if let Some(kind) = kind_from_env() {
        debug!(%kind, "reader chosen by environment");
        return kind;
    }
    if let Some(kind) = kind_from_config() {
        debug!(%kind, "reader chosen by config file");
        return kind;
    }
    if uring_available() {
        SourceKind::Uring
    } else {
        SourceKind::Mmap
    }
}

fn kind_from_env() -> Option<SourceKind> {
    let value = std::env::var(READER_ENV_VAR).ok()?;
    let kind = SourceKind::from_name(&value);
    if kind.is_none() {
        tracing::warn!(value = %value, "unrecognized {READER_ENV_VAR} value ignored");
    }
    kind.filter(|k| *k != SourceKind::Auto)
}

fn kind_from_config() -> Option<SourceKind> {
    let contents = std::fs::read_to_string(READER_CONF_PATH).ok()?;
    let line = contents.lines().map(str::trim).find(|l| !l.is_empty() && !l.starts_with('#'))?;
    SourceKind::from_name(line).filter(|k| *k != SourceKind::Auto)
}

/// Probe whether this kernel accepts io_uring setup.
pub fn uring_available() -> bool {
    io_uring::IoUring::new(4).is_ok()
}

// ============================================================================
// Container sniffing
// ============================================================================

/// Container format recognized from the first bytes of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// No recognizable container: treated as headerless raw pixels.
    Raw,
    /// ISO BMFF / MP4 (`ftyp` box).
    Mp4,
    /// AVI (`RIFF....AVI `).
    Avi,
    /// H.264 Annex-B elementary stream.
    H264,
    /// H.265 Annex-B elementary stream.
    H265,
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerFormat::Raw => "raw",
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Avi => "avi",
            ContainerFormat::H264 => "h264",
            ContainerFormat::H265 => "h265",
        };
        f.write_str(name)
    }
}

/// Inspect the head of a file for a known container signature.
///
/// Needs at least 16 bytes for a confident answer; shorter inputs are
/// classified as raw.
pub fn sniff_container(head: &[u8]) -> ContainerFormat {
    if head.len() < 16 {
        return ContainerFormat::Raw;
    }

    // MP4: box size (4 bytes) then "ftyp".
    if &head[4..8] == b"ftyp" {
        return ContainerFormat::Mp4;
    }

    // AVI: "RIFF" <size> "AVI ".
    if &head[0..4] == b"RIFF" && &head[8..12] == b"AVI " {
        return ContainerFormat::Avi;
    }

    // Annex-B start code, 4-byte (00 00 00 01) or 3-byte (00 00 01) form,
    // followed by a NAL header in the codec's expected range.
    let nal = if head[0] == 0 && head[1] == 0 && head[2] == 0 && head[3] == 1 {
        Some(head[4])
    } else if head[0] == 0 && head[1] == 0 && head[2] == 1 {
        Some(head[3])
    } else {
        None
    };
    if let Some(nal) = nal {
        // H.264: forbidden_zero_bit clear, nal_unit_type 1..=23.
        let h264_type = nal & 0x1F;
        if nal & 0x80 == 0 && (1..=23).contains(&h264_type) {
            // H.265 headers use the same first byte shape but a 6-bit type
            // field; distinguish by the H.265 layer-id bit pattern.
            let h265_type = (nal >> 1) & 0x3F;
            if nal & 0x01 == 0 && (32..=40).contains(&h265_type) {
                return ContainerFormat::H265;
            }
            return ContainerFormat::H264;
        }
        let h265_type = (nal >> 1) & 0x3F;
        if nal & 0x80 == 0 && h265_type <= 40 {
            return ContainerFormat::H265;
        }
    }

    ContainerFormat::Raw
}

/// Shared `open()` behavior for file-backed sources: sniff the container
/// and refuse anything that is not raw.
pub(crate) fn refuse_containers(path: &str) -> Result<()> {
    let mut head = [0u8; 16];
    let n = std::fs::File::open(path)
        .and_then(|mut f| std::io::Read::read(&mut f, &mut head))
        .map_err(Error::Io)?;
    match sniff_container(&head[..n]) {
        ContainerFormat::Raw => Err(Error::Unsupported(format!(
            "'{path}' looks like raw pixels; open_raw() with explicit geometry is required"
        ))),
        other => Err(Error::Unsupported(format!(
            "'{path}' is a {other} input; only headerless raw files are readable"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_rounds_up() {
        assert_eq!(frame_size_bytes(1920, 1080, 32), 8_294_400);
        assert_eq!(frame_size_bytes(1920, 1080, 24), 6_220_800);
        // 12-bit pixels: 5 pixels = 60 bits = 7.5 bytes, rounded up.
        assert_eq!(frame_size_bytes(5, 1, 12), 8);
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(SourceKind::from_name("mmap"), Some(SourceKind::Mmap));
        assert_eq!(SourceKind::from_name("IOURING"), Some(SourceKind::Uring));
        assert_eq!(SourceKind::from_name("io_uring"), Some(SourceKind::Uring));
        assert_eq!(SourceKind::from_name("rtsp"), Some(SourceKind::Rtsp));
        assert_eq!(SourceKind::from_name(" auto "), Some(SourceKind::Auto));
        assert_eq!(SourceKind::from_name("bogus"), None);
    }

    #[test]
    fn test_sniff_mp4() {
        let mut head = [0u8; 16];
        head[0..4].copy_from_slice(&[0, 0, 0, 0x18]);
        head[4..8].copy_from_slice(b"ftyp");
        head[8..12].copy_from_slice(b"isom");
        assert_eq!(sniff_container(&head), ContainerFormat::Mp4);
    }

    #[test]
    fn test_sniff_avi() {
        let mut head = [0u8; 16];
        head[0..4].copy_from_slice(b"RIFF");
        head[8..12].copy_from_slice(b"AVI ");
        assert_eq!(sniff_container(&head), ContainerFormat::Avi);
    }

    #[test]
    fn test_sniff_h264() {
        // 00 00 00 01 followed by an SPS NAL (type 7).
        let mut head = [0u8; 16];
        head[3] = 1;
        head[4] = 0x67;
        assert_eq!(sniff_container(&head), ContainerFormat::H264);
    }

    #[test]
    fn test_sniff_h265() {
        // 00 00 00 01 followed by a VPS NAL (type 32, layer 0).
        let mut head = [0u8; 16];
        head[3] = 1;
        head[4] = 0x40;
        head[5] = 0x01;
        assert_eq!(sniff_container(&head), ContainerFormat::H265);
    }

    #[test]
    fn test_sniff_raw_and_short() {
        assert_eq!(sniff_container(&[0xAB; 16]), ContainerFormat::Raw);
        assert_eq!(sniff_container(&[0u8; 8]), ContainerFormat::Raw);
    }

    #[test]
    fn test_create_source_explicit_kinds() {
        let src = create_source(SourceKind::Mmap);
        assert!(!src.is_open());
        let src = create_source(SourceKind::Rtsp);
        assert!(!src.is_open());
    }
}

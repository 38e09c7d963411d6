//! RTSP network stream frame source.
//!
//! An internal decoder thread owns the whole network side: it drives a
//! retina RTSP session on a current-thread tokio runtime, feeds H.264
//! access units to an OpenH264 decoder, and converts decoded frames to
//! RGBA. Decoded frames are delivered one of two ways:
//!
//! - **Traditional**: frames land in a small internal ring and
//!   [`FrameSource::read_frame_at`] serves them from there (the index is
//!   ignored; streams have no random access).
//! - **Zero-copy**: once a destination pool is attached via
//!   [`FrameSource::attach_pool`], every decoded frame is wrapped in a
//!   [`BufferHandle`] whose deleter frees the decoder-side frame and is
//!   injected straight into the pool's filled queue; `read_frame_at` then
//!   becomes a successful no-op.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures::StreamExt;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use retina::client::{PlayOptions, Session, SessionOptions, SetupOptions, TcpTransportOptions, Transport};
use retina::codec::CodecItem;
use tracing::{debug, info, warn};
use url::Url;

use super::FrameSource;
use crate::buffer::{BufferHandle, BufferPool};
use crate::error::{Error, Result};

/// Decoded frames buffered in traditional mode.
const RING_SLOTS: usize = 30;

/// Bounded wait for a decoded frame in traditional mode.
const READ_WAIT: Duration = Duration::from_millis(100);

/// How long `open_raw` waits for the session to reach PLAY.
const CONNECT_WAIT: Duration = Duration::from_secs(10);

struct RtspShared {
    running: AtomicBool,
    connected: AtomicBool,
    /// Set once a pool is attached and the first frame was injected.
    zero_copy: AtomicBool,
    ring: Mutex<VecDeque<Box<[u8]>>>,
    ring_cv: Condvar,
    pool: Mutex<Option<Weak<BufferPool>>>,
    decoded: AtomicU64,
    dropped: AtomicU64,
    last_error: Mutex<String>,
}

impl RtspShared {
    fn set_error(&self, msg: String) {
        warn!(error = %msg, "rtsp source error");
        *self.last_error.lock().unwrap() = msg;
    }
}

/// Network stream source. See the module docs.
pub struct RtspFrameSource {
    shared: Arc<RtspShared>,
    thread: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
    frame_size: usize,
}

impl Default for RtspFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RtspFrameSource {
    /// Create a closed source; `open_raw` connects and starts decoding.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RtspShared {
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                zero_copy: AtomicBool::new(false),
                ring: Mutex::new(VecDeque::new()),
                ring_cv: Condvar::new(),
                pool: Mutex::new(None),
                decoded: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                last_error: Mutex::new(String::new()),
            }),
            thread: None,
            width: 0,
            height: 0,
            frame_size: 0,
        }
    }

    /// Frames decoded since open.
    pub fn decoded_frames(&self) -> u64 {
        self.shared.decoded.load(Ordering::Relaxed)
    }

    /// Frames dropped (ring overflow or rejected injection).
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Whether the session reached PLAY and is still alive.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Last error recorded by the decoder thread.
    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// Streams have no random access.
    pub fn seek(&self, _frame: u64) -> Result<()> {
        warn!("seek on an rtsp stream is unsupported");
        Err(Error::Unsupported("rtsp streams cannot seek".into()))
    }

    /// Streams have no random access.
    pub fn skip(&self, _frames: u64) -> Result<()> {
        warn!("skip on an rtsp stream is unsupported");
        Err(Error::Unsupported("rtsp streams cannot skip".into()))
    }
}

impl FrameSource for RtspFrameSource {
    fn open(&mut self, path: &str) -> Result<()> {
        // Streams carry their own geometry negotiation upstream; without an
        // explicit output geometry there is nothing to decode into.
        Err(Error::Unsupported(format!(
            "'{path}': rtsp sources need open_raw() with explicit output geometry"
        )))
    }

    fn open_raw(&mut self, path: &str, width: u32, height: u32, bits_per_pixel: u32) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::Config("rtsp source already open".into()));
        }
        if bits_per_pixel != 32 {
            return Err(Error::Config(format!(
                "rtsp source outputs 32-bit RGBA, not {bits_per_pixel} bpp"
            )));
        }
        let url = Url::parse(path).map_err(|e| Error::Stream(format!("invalid RTSP URL: {e}")))?;

        self.width = width;
        self.height = height;
        self.frame_size = super::frame_size_bytes(width, height, 32);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("paneflow-rtsp".into())
            .spawn(move || decode_thread(shared, url, width, height))
            .map_err(|e| Error::Stream(format!("cannot spawn decode thread: {e}")))?;
        self.thread = Some(thread);

        // Construction is terminal on failure: wait for PLAY or give up.
        let deadline = Instant::now() + CONNECT_WAIT;
        while Instant::now() < deadline {
            if self.shared.connected.load(Ordering::SeqCst) {
                info!(url = path, width, height, "rtsp session playing");
                return Ok(());
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let err = self.last_error();
        self.close();
        Err(Error::Stream(if err.is_empty() {
            format!("rtsp connect to '{path}' timed out")
        } else {
            err
        }))
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.ring.lock().unwrap().clear();
    }

    fn is_open(&self) -> bool {
        self.thread.is_some()
    }

    fn read_frame_at(&self, _index: u64, dest: &mut [u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Config("source is not open".into()));
        }
        // Zero-copy mode: frames bypass this path entirely.
        if self.shared.zero_copy.load(Ordering::SeqCst) {
            return Ok(());
        }

        let deadline = Instant::now() + READ_WAIT;
        let mut ring = self.shared.ring.lock().unwrap();
        loop {
            if let Some(frame) = ring.pop_front() {
                let n = frame.len().min(dest.len());
                if n < self.frame_size {
                    warn!(got = frame.len(), want = self.frame_size, "undersized decoded frame");
                }
                dest[..n].copy_from_slice(&frame[..n]);
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, wait) = self
                .shared
                .ring_cv
                .wait_timeout(ring, deadline - now)
                .unwrap();
            ring = guard;
            if wait.timed_out() && ring.is_empty() {
                return Err(Error::Timeout);
            }
        }
    }

    fn total_frames(&self) -> Option<u64> {
        None
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
        32
    }

    fn attach_pool(&self, pool: &Arc<BufferPool>) {
        *self.shared.pool.lock().unwrap() = Some(Arc::downgrade(pool));
        debug!(pool = pool.name(), "rtsp zero-copy injection enabled");
    }
}

impl Drop for RtspFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Decoder thread
// ============================================================================

fn decode_thread(shared: Arc<RtspShared>, url: Url, width: u32, height: u32) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            shared.set_error(format!("tokio runtime: {e}"));
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    if let Err(err) = runtime.block_on(run_session(&shared, url, width, height)) {
        shared.set_error(err.to_string());
    }
    shared.connected.store(false, Ordering::SeqCst);
    shared.running.store(false, Ordering::SeqCst);
}

async fn run_session(shared: &Arc<RtspShared>, url: Url, width: u32, height: u32) -> Result<()> {
    let options = SessionOptions::default().user_agent("paneflow".into());
    let mut session = Session::describe(url, options)
        .await
        .map_err(|e| Error::Stream(format!("RTSP DESCRIBE failed: {e}")))?;

    let video_index = session
        .streams()
        .iter()
        .position(|s| s.media() == "video" && s.encoding_name().eq_ignore_ascii_case("h264"))
        .ok_or_else(|| Error::Stream("no H.264 video stream in SDP".into()))?;

    session
        .setup(
            video_index,
            SetupOptions::default().transport(Transport::Tcp(TcpTransportOptions::default())),
        )
        .await
        .map_err(|e| Error::Stream(format!("RTSP SETUP failed: {e}")))?;

    // Out-of-band parameter sets (SPS/PPS) from the SDP, converted to
    // Annex B so the decoder sees them before the first slice.
    let parameter_sets = session.streams()[video_index]
        .parameters()
        .and_then(|p| match p {
            retina::codec::ParametersRef::Video(v) => {
                Some(avcc_parameter_sets(&v.extra_data()[..]))
            }
            _ => None,
        })
        .unwrap_or_default();

    let mut demuxed = session
        .play(PlayOptions::default())
        .await
        .map_err(|e| Error::Stream(format!("RTSP PLAY failed: {e}")))?
        .demuxed()
        .map_err(|e| Error::Stream(format!("RTSP demux failed: {e}")))?;

    let mut decoder =
        Decoder::new().map_err(|e| Error::Stream(format!("H.264 decoder init: {e:?}")))?;

    shared.connected.store(true, Ordering::SeqCst);

    let mut annexb: Vec<u8> = Vec::new();
    let mut geometry_warned = false;

    while shared.running.load(Ordering::SeqCst) {
        let item = match tokio::time::timeout(Duration::from_millis(500), demuxed.next()).await {
            Err(_) => continue, // idle tick, re-check the stop flag
            Ok(None) => {
                debug!("rtsp stream ended");
                break;
            }
            Ok(Some(Err(e))) => return Err(Error::Stream(format!("RTSP stream error: {e}"))),
            Ok(Some(Ok(item))) => item,
        };

        let frame = match item {
            CodecItem::VideoFrame(frame) => frame,
            _ => continue, // audio, RTCP, messages
        };

        annexb.clear();
        if frame.is_random_access_point() {
            annexb.extend_from_slice(&parameter_sets);
        }
        avc_to_annex_b(&frame.data()[..], &mut annexb);

        let yuv = match decoder.decode(&annexb) {
            Ok(Some(yuv)) => yuv,
            Ok(None) => continue, // decoder needs more data
            Err(e) => {
                debug!(error = ?e, "h264 decode error; frame dropped");
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let (dec_w, dec_h) = yuv.dimensions();
        if dec_w != width as usize || dec_h != height as usize {
            if !geometry_warned {
                warn!(dec_w, dec_h, width, height, "stream geometry mismatch; frames dropped");
                geometry_warned = true;
            }
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let mut rgba = vec![0u8; dec_w * dec_h * 4].into_boxed_slice();
        yuv.write_rgba8(&mut rgba);
        dispatch_frame(shared, rgba);
    }

    Ok(())
}

/// Hand a decoded frame to the consumer side: inject when a pool is
/// attached, otherwise park it in the internal ring.
fn dispatch_frame(shared: &Arc<RtspShared>, rgba: Box<[u8]>) {
    shared.decoded.fetch_add(1, Ordering::Relaxed);

    let pool = shared.pool.lock().unwrap().as_ref().and_then(Weak::upgrade);
    if let Some(pool) = pool {
        shared.zero_copy.store(true, Ordering::SeqCst);
        let handle = BufferHandle::from_boxed_slice(rgba, 0);
        if pool.inject_filled(handle).is_err() {
            // At capacity: the handle just dropped, freeing the frame.
            shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        return;
    }

    let mut ring = shared.ring.lock().unwrap();
    if ring.len() >= RING_SLOTS {
        ring.pop_front();
        shared.dropped.fetch_add(1, Ordering::Relaxed);
    }
    ring.push_back(rgba);
    drop(ring);
    shared.ring_cv.notify_one();
}

/// Convert an AVC-format access unit (4-byte length-prefixed NAL units)
/// into Annex B (start-code delimited).
fn avc_to_annex_b(data: &[u8], out: &mut Vec<u8>) {
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;
        if len == 0 || pos + len > data.len() {
            break;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&data[pos..pos + len]);
        pos += len;
    }
}

/// Extract SPS/PPS NAL units from an avcC configuration record and emit
/// them as an Annex B prefix.
fn avcc_parameter_sets(extra_data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if extra_data.len() < 7 {
        return out;
    }
    let mut pos = 5usize;
    let sps_count = (extra_data[pos] & 0x1F) as usize;
    pos += 1;
    for _ in 0..sps_count {
        if pos + 2 > extra_data.len() {
            return out;
        }
        let len = u16::from_be_bytes([extra_data[pos], extra_data[pos + 1]]) as usize;
        pos += 2;
        if pos + len > extra_data.len() {
            return out;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&extra_data[pos..pos + len]);
        pos += len;
    }
    if pos >= extra_data.len() {
        return out;
    }
    let pps_count = extra_data[pos] as usize;
    pos += 1;
    for _ in 0..pps_count {
        if pos + 2 > extra_data.len() {
            return out;
        }
        let len = u16::from_be_bytes([extra_data[pos], extra_data[pos + 1]]) as usize;
        pos += 2;
        if pos + len > extra_data.len() {
            return out;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&extra_data[pos..pos + len]);
        pos += len;
    }
    out
}

//! Multi-threaded frame producer.
//!
//! A [`VideoProducer`] drives N worker threads sharing one
//! [`FrameSource`](crate::source::FrameSource) and one destination
//! [`BufferPool`]. Workers coordinate through a single atomic frame cursor:
//! each fetch-and-increment claims a distinct frame index, so a frame is
//! read exactly once no matter how many workers run.
//!
//! # Example
//!
//! ```rust,ignore
//! use paneflow::producer::{ProducerConfig, VideoProducer};
//! use paneflow::source::SourceKind;
//!
//! let mut producer = VideoProducer::new(Arc::clone(&pool));
//! producer.start(ProducerConfig {
//!     path: "video.raw".into(),
//!     width: 1920,
//!     height: 1080,
//!     bits_per_pixel: 32,
//!     looping: true,
//!     workers: 2,
//!     kind: SourceKind::Auto,
//! })?;
//! // ... consume frames ...
//! producer.stop();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::observability;
use crate::source::{create_source, FrameSource, SourceKind};

/// Callback invoked when a producer escalates an error.
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Consecutive read failures a worker tolerates before escalating.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Timeout for one free-buffer acquisition attempt inside the worker loop.
const ACQUIRE_SLICE: Duration = Duration::from_millis(100);

/// Immutable producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Input path (raw pixel file) or stream URL.
    pub path: String,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub bits_per_pixel: u32,
    /// Restart from frame 0 at end of input.
    pub looping: bool,
    /// Worker thread count (>= 1).
    pub workers: usize,
    /// Which frame-source strategy to instantiate.
    pub kind: SourceKind,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            width: 0,
            height: 0,
            bits_per_pixel: 32,
            looping: false,
            workers: 1,
            kind: SourceKind::Auto,
        }
    }
}

struct ProducerShared {
    running: AtomicBool,
    /// Next frame index to claim. 32 bits with a loop-mode reset to stay
    /// bounded over very long runs.
    cursor: AtomicU32,
    produced: AtomicU64,
    skipped: AtomicU64,
    last_error: Mutex<String>,
    callback: Mutex<Option<ErrorCallback>>,
}

impl ProducerShared {
    fn publish_error(&self, msg: String) {
        warn!(error = %msg, "producer error");
        *self.last_error.lock().unwrap() = msg.clone();
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(&msg);
        }
    }
}

/// Drives worker threads that fill pool buffers from a frame source.
pub struct VideoProducer {
    pool: Arc<BufferPool>,
    shared: Arc<ProducerShared>,
    workers: Vec<JoinHandle<()>>,
    source: Option<Arc<dyn FrameSource>>,
    total_frames: Option<u64>,
    started_at: Option<Instant>,
}

impl VideoProducer {
    /// Create a stopped producer bound to its destination pool.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            shared: Arc::new(ProducerShared {
                running: AtomicBool::new(false),
                cursor: AtomicU32::new(0),
                produced: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                last_error: Mutex::new(String::new()),
                callback: Mutex::new(None),
            }),
            workers: Vec::new(),
            source: None,
            total_frames: None,
            started_at: None,
        }
    }

    /// Install the error callback invoked on escalated failures.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.shared.callback.lock().unwrap() = Some(callback);
    }

    /// Open the source and start the worker threads.
    ///
    /// Fails without side effects when the configuration is invalid, the
    /// source cannot open, or the source frame size does not match the
    /// pool's buffer size. A dynamic-injection pool (buffer size 0) is
    /// sized here with a one-shot `set_buffer_size`.
    pub fn start(&mut self, config: ProducerConfig) -> Result<()> {
        if self.is_running() {
            return Err(Error::ContractViolation("producer already running".into()));
        }
        if config.path.is_empty() {
            return Err(Error::Config("input path is empty".into()));
        }
        if config.workers == 0 {
            return Err(Error::Config("worker count must be >= 1".into()));
        }

        let mut source = create_source(config.kind);
        source.open_raw(&config.path, config.width, config.height, config.bits_per_pixel)?;
        let source: Arc<dyn FrameSource> = Arc::from(source);

        // All sources get the pool; file readers ignore it, the RTSP reader
        // uses it for zero-copy injection.
        source.attach_pool(&self.pool);

        let frame_size = source.frame_size();
        let pool_size = self.pool.buffer_size();
        if pool_size == 0 {
            debug!(frame_size, "sizing dynamic-injection pool");
            self.pool.set_buffer_size(frame_size)?;
        } else if pool_size != frame_size {
            return Err(Error::Config(format!(
                "frame size mismatch: source={frame_size}, pool={pool_size}"
            )));
        }

        let total_frames = source.total_frames();
        info!(
            path = %config.path,
            workers = config.workers,
            looping = config.looping,
            total_frames = ?total_frames,
            frame_size,
            "starting producer"
        );

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.cursor.store(0, Ordering::SeqCst);
        self.shared.produced.store(0, Ordering::SeqCst);
        self.shared.skipped.store(0, Ordering::SeqCst);
        self.total_frames = total_frames;
        self.started_at = Some(Instant::now());

        for worker_id in 0..config.workers {
            let pool = Arc::clone(&self.pool);
            let source = Arc::clone(&source);
            let shared = Arc::clone(&self.shared);
            let looping = config.looping;
            let handle = std::thread::Builder::new()
                .name(format!("paneflow-producer-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, &pool, source.as_ref(), &shared, total_frames, looping)
                })
                .map_err(|e| {
                    // Unwind already-started workers before failing.
                    self.shared.running.store(false, Ordering::SeqCst);
                    for w in self.workers.drain(..) {
                        let _ = w.join();
                    }
                    Error::Config(format!("cannot spawn worker: {e}"))
                })?;
            self.workers.push(handle);
        }

        self.source = Some(source);
        Ok(())
    }

    /// Stop the workers, close the source, keep the statistics.
    ///
    /// Sets the stop flag, wakes every waiter parked on the pool, joins all
    /// workers. Idempotent.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) && self.workers.is_empty() {
            return;
        }
        self.pool.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // Last reference closes the source (RAII).
        self.source = None;
        info!(
            produced = self.produced_frames(),
            skipped = self.skipped_frames(),
            fps = self.average_fps(),
            "producer stopped"
        );
    }

    /// Whether the stop flag is still clear.
    ///
    /// Workers may have exited on their own (end of a non-looping file); the
    /// flag only reflects cancellation.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && !self.workers.is_empty()
    }

    /// Frames successfully read and submitted.
    pub fn produced_frames(&self) -> u64 {
        self.shared.produced.load(Ordering::Relaxed)
    }

    /// Frames skipped after read failures.
    pub fn skipped_frames(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    /// Total frames of the source, `None` for unbounded streams.
    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    /// Produced frames per second since start.
    pub fn average_fps(&self) -> f64 {
        match self.started_at {
            Some(start) => {
                let secs = start.elapsed().as_secs_f64();
                if secs > 0.0 {
                    self.produced_frames() as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// Last escalated error message, empty when none.
    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// Wait until every worker has exited on its own (end of input), with a
    /// deadline. Returns `true` when all workers finished.
    pub fn wait_finished(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.workers.iter().all(|w| w.is_finished()) {
                for w in self.workers.drain(..) {
                    let _ = w.join();
                }
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for VideoProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    worker_id: usize,
    pool: &BufferPool,
    source: &dyn FrameSource,
    shared: &ProducerShared,
    total_frames: Option<u64>,
    looping: bool,
) {
    debug!(worker_id, "producer worker started");
    let mut consecutive_failures = 0u32;

    while shared.running.load(Ordering::SeqCst) {
        // 1. Claim a frame index.
        let claimed = shared.cursor.fetch_add(1, Ordering::SeqCst);
        let mut frame_index = claimed as u64;

        // 2. Bounds handling for bounded sources. Unbounded streams skip
        //    this entirely.
        if let Some(total) = total_frames {
            if frame_index >= total {
                if !looping {
                    break;
                }
                frame_index %= total;
                // Keep the 32-bit cursor bounded over long runs. A failed
                // exchange just means another worker raced us; the modulo
                // above keeps every claim valid either way.
                let current = shared.cursor.load(Ordering::SeqCst);
                if (current as u64) > total * 2 {
                    let _ = shared.cursor.compare_exchange(
                        current,
                        (frame_index + 1) as u32,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            }
        }

        // 3. Get a free buffer, polling the stop flag every slice.
        let buf = loop {
            if !shared.running.load(Ordering::SeqCst) {
                break None;
            }
            match pool.acquire_free_timeout(ACQUIRE_SLICE) {
                Some(buf) => break Some(buf),
                None => continue,
            }
        };
        let Some(buf) = buf else { break };

        // 4. Fill it.
        match source.read_frame_at(frame_index, buf.as_mut_slice()) {
            Ok(()) => {
                consecutive_failures = 0;
                pool.submit_filled(&buf);
                shared.produced.fetch_add(1, Ordering::Relaxed);
                observability::record_produced();
            }
            Err(err) => {
                shared.skipped.fetch_add(1, Ordering::Relaxed);
                observability::record_skipped();
                pool.release_filled(&buf);

                consecutive_failures += 1;
                if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                    shared.publish_error(format!(
                        "worker {worker_id}: {consecutive_failures} consecutive read failures, last: {err}"
                    ));
                    break;
                }
            }
        }
    }

    debug!(worker_id, "producer worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    fn raw_fixture(frames: usize, frame_size: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..frames {
            file.write_all(&vec![i as u8; frame_size]).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn config(path: &str, looping: bool, workers: usize) -> ProducerConfig {
        ProducerConfig {
            path: path.into(),
            width: 4,
            height: 4,
            bits_per_pixel: 32,
            looping,
            workers,
            kind: SourceKind::Mmap,
        }
    }

    #[test]
    fn test_start_validates_config() {
        let pool = BufferPool::new_owned(2, 64, false, "prod-validate", "test").unwrap();
        let mut producer = VideoProducer::new(pool);

        assert!(producer.start(ProducerConfig::default()).is_err());
        assert!(producer
            .start(ProducerConfig {
                path: "x".into(),
                workers: 0,
                ..config("x", false, 1)
            })
            .is_err());
    }

    #[test]
    fn test_frame_size_mismatch_fails_start() {
        let file = raw_fixture(4, 64);
        // Pool buffers are 128 bytes, frames are 64.
        let pool = BufferPool::new_owned(2, 128, false, "prod-mismatch", "test").unwrap();
        let mut producer = VideoProducer::new(pool);

        let err = producer
            .start(config(file.path().to_str().unwrap(), false, 1))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!producer.is_running());
    }

    #[test]
    fn test_sequential_exact_frame_count() {
        let file = raw_fixture(60, 64);
        let pool = BufferPool::new_owned(4, 64, false, "prod-sequential", "test").unwrap();
        let mut producer = VideoProducer::new(Arc::clone(&pool));
        producer
            .start(config(file.path().to_str().unwrap(), false, 1))
            .unwrap();

        // Consume everything the producer emits.
        let mut seen = 0u64;
        while seen < 60 {
            if let Some(buf) = pool.acquire_filled_timeout(Duration::from_millis(500)) {
                pool.release_filled(&buf);
                seen += 1;
            } else if producer.wait_finished(Duration::from_millis(1)) {
                break;
            }
        }
        assert!(producer.wait_finished(Duration::from_secs(5)));
        producer.stop();

        assert_eq!(seen, 60);
        assert_eq!(producer.produced_frames(), 60);
        assert_eq!(producer.skipped_frames(), 0);
        assert!(producer.last_error().is_empty());
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_multi_worker_looping_state_legality() {
        let file = raw_fixture(8, 64);
        let pool = BufferPool::new_owned(4, 64, false, "prod-loop", "test").unwrap();
        let mut producer = VideoProducer::new(Arc::clone(&pool));
        producer
            .start(config(file.path().to_str().unwrap(), true, 2))
            .unwrap();

        let mut displayed = 0u64;
        while displayed < 200 {
            let buf = pool
                .acquire_filled_timeout(Duration::from_secs(1))
                .expect("looping producer keeps frames coming");
            // Every consumed buffer is in the consumer-locked state with a
            // live reference: no illegal transition was observed.
            assert_eq!(buf.state(), crate::buffer::BufferState::LockedByConsumer);
            assert!(buf.refcount() >= 1);
            // Content is one of the 8 source frames.
            assert!(buf.as_slice()[0] < 8);
            pool.release_filled(&buf);
            displayed += 1;
        }

        producer.stop();
        assert!(producer.produced_frames() + producer.skipped_frames() >= 200);

        // Drain in-flight frames; everything must come home.
        while let Some(buf) = pool.try_acquire_filled() {
            pool.release_filled(&buf);
        }
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let file = raw_fixture(8, 64);
        let pool = BufferPool::new_owned(2, 64, false, "prod-stop", "test").unwrap();
        let mut producer = VideoProducer::new(Arc::clone(&pool));
        producer
            .start(config(file.path().to_str().unwrap(), true, 2))
            .unwrap();

        // Let it wedge on a full pool (no consumer), then stop.
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        producer.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
        producer.stop();
        assert!(!producer.is_running());
    }

    #[test]
    fn test_clean_end_of_input_does_not_escalate() {
        let file = raw_fixture(2, 64);
        let pool = BufferPool::new_owned(2, 64, false, "prod-callback", "test").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let mut producer = VideoProducer::new(Arc::clone(&pool));
        producer.set_error_callback(Box::new(move |_msg| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        producer
            .start(config(file.path().to_str().unwrap(), false, 1))
            .unwrap();
        assert!(producer.wait_finished(Duration::from_secs(5)));
        producer.stop();

        // Clean end of input: the callback must not have fired.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(producer.produced_frames(), 2);
    }

    /// Source stub whose reads always fail, for the escalation path.
    struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn open(&mut self, _path: &str) -> crate::error::Result<()> {
            Ok(())
        }
        fn open_raw(&mut self, _p: &str, _w: u32, _h: u32, _b: u32) -> crate::error::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn is_open(&self) -> bool {
            true
        }
        fn read_frame_at(&self, _index: u64, _dest: &mut [u8]) -> crate::error::Result<()> {
            Err(Error::Timeout)
        }
        fn total_frames(&self) -> Option<u64> {
            None
        }
        fn frame_size(&self) -> usize {
            64
        }
        fn width(&self) -> u32 {
            4
        }
        fn height(&self) -> u32 {
            4
        }
        fn bits_per_pixel(&self) -> u32 {
            32
        }
    }

    #[test]
    fn test_worker_escalates_after_consecutive_failures() {
        let pool = BufferPool::new_owned(2, 64, false, "prod-escalate", "test").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);

        let shared = ProducerShared {
            running: AtomicBool::new(true),
            cursor: AtomicU32::new(0),
            produced: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_error: Mutex::new(String::new()),
            callback: Mutex::new(Some(Box::new(move |_msg| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }))),
        };

        worker_loop(0, &pool, &BrokenSource, &shared, None, false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(shared.last_error.lock().unwrap().contains("consecutive"));
        assert_eq!(
            shared.skipped.load(Ordering::Relaxed),
            (MAX_CONSECUTIVE_FAILURES + 1) as u64
        );
        // Every buffer was released on failure.
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_dynamic_pool_gets_sized() {
        let file = raw_fixture(2, 64);
        let pool = BufferPool::new_injected("prod-dynamic", "test", 0).unwrap();
        assert_eq!(pool.buffer_size(), 0);

        let mut producer = VideoProducer::new(Arc::clone(&pool));
        producer
            .start(config(file.path().to_str().unwrap(), false, 1))
            .unwrap();
        assert_eq!(pool.buffer_size(), 64);
        producer.stop();
    }
}

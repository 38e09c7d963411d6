//! End-to-end pipeline tests over temp raw files: producer workers filling
//! a pool, a consumer draining it, and the display-strategy selection
//! logic that does not need real display hardware.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use paneflow::buffer::{BufferHandle, BufferPool, BufferState};
use paneflow::producer::{ProducerConfig, VideoProducer};
use paneflow::source::{
    create_source, frame_size_bytes, FrameSource, MmapFrameSource, SourceKind,
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 8;
const BPP: u32 = 32;
const FRAME_SIZE: usize = 256; // 8 * 8 * 4

/// A raw video whose frame n is filled with byte n.
fn raw_fixture(frames: usize) -> tempfile::NamedTempFile {
    assert_eq!(frame_size_bytes(WIDTH, HEIGHT, BPP), FRAME_SIZE);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..frames {
        file.write_all(&vec![i as u8; FRAME_SIZE]).unwrap();
    }
    file.flush().unwrap();
    file
}

fn producer_config(path: &str, looping: bool, workers: usize) -> ProducerConfig {
    ProducerConfig {
        path: path.into(),
        width: WIDTH,
        height: HEIGHT,
        bits_per_pixel: BPP,
        looping,
        workers,
        kind: SourceKind::Mmap,
    }
}

// ============================================================================
// Scenario: sequential playback
// ============================================================================

/// 600-frame file, non-looping: exactly 600 frames come through, in order,
/// and the pipeline ends clean.
#[test]
fn sequential_playback_reads_every_frame_once() {
    let file = raw_fixture(600);
    let pool = BufferPool::new_owned(4, FRAME_SIZE, false, "e2e-sequential", "e2e").unwrap();

    let mut producer = VideoProducer::new(Arc::clone(&pool));
    producer
        .start(producer_config(file.path().to_str().unwrap(), false, 1))
        .unwrap();

    let mut frames = Vec::with_capacity(600);
    loop {
        match pool.acquire_filled_timeout(Duration::from_millis(500)) {
            Some(buf) => {
                frames.push(buf.as_slice()[0]);
                pool.release_filled(&buf);
            }
            None => {
                if producer.wait_finished(Duration::from_millis(1)) && pool.filled_count() == 0 {
                    break;
                }
            }
        }
    }
    producer.stop();

    assert_eq!(frames.len(), 600);
    // Single worker: strict source order.
    for (i, &b) in frames.iter().enumerate() {
        assert_eq!(b, i as u8, "frame {i}");
    }
    assert_eq!(producer.produced_frames(), 600);
    assert_eq!(producer.skipped_frames(), 0);
    assert!(producer.last_error().is_empty());
    assert_eq!(pool.free_count(), 4);
}

// ============================================================================
// Scenario: multi-worker looping producer
// ============================================================================

/// Two workers over a looping 600-frame file until 600 frames displayed:
/// produced + skipped >= 600 and no state-machine violation is observed.
#[test]
fn two_workers_looping_until_600_displayed() {
    let file = raw_fixture(600);
    let pool = BufferPool::new_owned(4, FRAME_SIZE, false, "e2e-two-workers", "e2e").unwrap();

    let mut producer = VideoProducer::new(Arc::clone(&pool));
    producer
        .start(producer_config(file.path().to_str().unwrap(), true, 2))
        .unwrap();

    let mut displayed = 0u64;
    let deadline = Instant::now() + Duration::from_secs(30);
    while displayed < 600 {
        assert!(Instant::now() < deadline, "pipeline stalled");
        let Some(buf) = pool.acquire_filled_timeout(Duration::from_millis(200)) else {
            continue;
        };
        // State machine: a consumed buffer is always consumer-locked with
        // a live reference, and its content is a whole source frame.
        assert_eq!(buf.state(), BufferState::LockedByConsumer);
        assert!(buf.refcount() >= 1);
        let first = buf.as_slice()[0];
        assert!(buf.as_slice().iter().all(|&b| b == first), "torn frame");
        pool.release_filled(&buf);
        displayed += 1;
    }
    producer.stop();

    assert!(producer.produced_frames() + producer.skipped_frames() >= 600);

    while let Some(buf) = pool.try_acquire_filled() {
        pool.release_filled(&buf);
    }
    assert_eq!(pool.free_count(), 4);
    assert_eq!(pool.filled_count(), 0);
}

/// The loop wrap keeps running well past one file length per worker.
#[test]
fn loop_wraparound_stays_in_bounds() {
    let file = raw_fixture(5);
    let pool = BufferPool::new_owned(2, FRAME_SIZE, false, "e2e-wrap", "e2e").unwrap();

    let mut producer = VideoProducer::new(Arc::clone(&pool));
    producer
        .start(producer_config(file.path().to_str().unwrap(), true, 2))
        .unwrap();

    // 60 frames from a 5-frame file means the cursor wrapped many times;
    // every frame must still be one of the five source frames.
    for _ in 0..60 {
        let buf = pool
            .acquire_filled_timeout(Duration::from_secs(1))
            .expect("looping producer keeps producing");
        assert!(buf.as_slice()[0] < 5);
        pool.release_filled(&buf);
    }
    producer.stop();
}

// ============================================================================
// Zero-copy injection path (decoder-style producer)
// ============================================================================

/// A decoder-style producer injecting handles into an empty pool while a
/// consumer releases them: the deleter count tracks exactly.
#[test]
fn injected_pipeline_with_consumer_thread() {
    let pool = BufferPool::new_injected("e2e-injected", "e2e", 8).unwrap();
    let deletions = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            let mut released = 0;
            while released < 100 {
                if let Some(buf) = pool.acquire_filled_timeout(Duration::from_millis(200)) {
                    pool.release_filled(&buf);
                    released += 1;
                }
            }
        })
    };

    let mut injected = 0;
    while injected < 100 {
        let deletions2 = Arc::clone(&deletions);
        let mem = Box::into_raw(vec![0xCD_u8; FRAME_SIZE].into_boxed_slice()) as *mut u8;
        let handle = BufferHandle::new(
            mem,
            0,
            FRAME_SIZE,
            Some(Box::new(move |p| {
                deletions2.fetch_add(1, Ordering::SeqCst);
                // SAFETY: p came from Box::into_raw above.
                drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(p, FRAME_SIZE)) });
            })),
        )
        .unwrap();
        match pool.inject_filled(handle) {
            Ok(_) => injected += 1,
            Err(_) => std::thread::sleep(Duration::from_millis(1)),
        }
    }
    consumer.join().unwrap();

    assert_eq!(deletions.load(Ordering::SeqCst), 100);
    assert_eq!(pool.total_count(), 0);
}

// ============================================================================
// Display-strategy logic without hardware
// ============================================================================

/// Sink stand-in that "scans out" into a byte vector, refusing DMA.
#[derive(Default)]
struct CaptureSink {
    screen: std::sync::Mutex<Vec<u8>>,
    dma_attempts: AtomicUsize,
}

impl paneflow::display::DisplaySink for CaptureSink {
    fn present_dma(&self, buf: &paneflow::buffer::Buffer) -> paneflow::Result<()> {
        self.dma_attempts.fetch_add(1, Ordering::SeqCst);
        if buf.phys_addr() == 0 {
            return Err(paneflow::Error::InvalidBuffer("no physical address".into()));
        }
        Err(paneflow::Error::Device("no DMA support".into()))
    }
    fn present_pane(&self, _buf: &Arc<paneflow::buffer::Buffer>) -> paneflow::Result<()> {
        Ok(())
    }
    fn present_copy(&self, buf: &paneflow::buffer::Buffer) -> paneflow::Result<()> {
        *self.screen.lock().unwrap() = buf.as_slice().to_vec();
        Ok(())
    }
    fn wait_vsync(&self) -> paneflow::Result<()> {
        Ok(())
    }
}

/// Scenario: DMA handoff fallback. A frame without a physical address is
/// never sent down the DMA path; the copy path runs and the frame appears.
#[test]
fn dma_fallback_presents_the_frame_anyway() {
    use paneflow::display::{DisplayStrategy, FrameConsumer};

    let file = raw_fixture(3);
    let pool = BufferPool::new_owned(2, FRAME_SIZE, false, "e2e-dma-fallback", "e2e").unwrap();

    let mut producer = VideoProducer::new(Arc::clone(&pool));
    producer
        .start(producer_config(file.path().to_str().unwrap(), false, 1))
        .unwrap();

    let sink = Arc::new(CaptureSink::default());
    let consumer = FrameConsumer::new(Arc::clone(&pool), Arc::clone(&sink), DisplayStrategy::Dma);
    let stats = consumer.run_frames(3, Duration::from_secs(10));
    producer.stop();

    assert_eq!(stats.displayed, 3);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.fallbacks, 3);
    // Without pagemap privilege heap buffers carry phys 0 and the DMA path
    // is never attempted ("no device-control side effect"); with privilege
    // the sink refused it. Either way every frame fell back.
    let buf0 = pool.buffer_by_id(0).unwrap();
    if buf0.phys_addr() == 0 {
        assert_eq!(sink.dma_attempts.load(Ordering::SeqCst), 0);
    }
    // The last frame made it to the "glass" via the copy path.
    let screen = sink.screen.lock().unwrap();
    assert_eq!(screen.len(), FRAME_SIZE);
    assert_eq!(screen[0], 2);
}

// ============================================================================
// Factory and source selection
// ============================================================================

#[test]
fn factory_env_override_selects_mmap() {
    // Serialized with a dedicated var value; other tests do not set it.
    std::env::set_var("PANEFLOW_READER", "mmap");
    let mut src = create_source(SourceKind::Auto);
    std::env::remove_var("PANEFLOW_READER");

    let file = raw_fixture(2);
    src.open_raw(file.path().to_str().unwrap(), WIDTH, HEIGHT, BPP)
        .unwrap();
    assert_eq!(src.total_frames(), Some(2));
}

#[test]
fn uring_and_mmap_sources_agree() {
    if !paneflow::source::uring_available() {
        eprintln!("io_uring unavailable; skipping");
        return;
    }
    let file = raw_fixture(10);
    let path = file.path().to_str().unwrap();

    let mut mmap_src = MmapFrameSource::new();
    mmap_src.open_raw(path, WIDTH, HEIGHT, BPP).unwrap();
    let mut uring_src = paneflow::source::UringFrameSource::new();
    uring_src.open_raw(path, WIDTH, HEIGHT, BPP).unwrap();

    assert_eq!(mmap_src.total_frames(), uring_src.total_frames());

    let mut a = vec![0u8; FRAME_SIZE];
    let mut b = vec![0u8; FRAME_SIZE];
    for i in 0..10 {
        mmap_src.read_frame_at(i, &mut a).unwrap();
        uring_src.read_frame_at(i, &mut b).unwrap();
        assert_eq!(a, b, "frame {i}");
    }
}

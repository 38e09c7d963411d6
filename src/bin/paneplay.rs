//! Minimal test harness for the paneflow pipeline.
//!
//! ```text
//! paneplay <input> [-m MODE]
//!
//!   input               raw pixel file, or rtsp:// URL in rtsp mode
//!   -m, --mode MODE     loop | sequential | producer | iouring | rtsp
//!   -h, --help          print usage
//! ```
//!
//! Exit codes: 0 success, 1 argument error, 255 runtime failure.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use paneflow::buffer::BufferPool;
use paneflow::display::{DisplayStrategy, Framebuffer, FrameConsumer};
use paneflow::producer::{ProducerConfig, VideoProducer};
use paneflow::source::{create_source, FrameSource, SourceKind};
use paneflow::Result;

const USAGE: &str = "Usage: paneplay <input> [-m loop|sequential|producer|iouring|rtsp]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Loop,
    Sequential,
    Producer,
    IoUring,
    Rtsp,
}

struct Args {
    input: String,
    mode: Mode,
}

fn parse_args() -> std::result::Result<Args, String> {
    let mut input = None;
    let mut mode = Mode::Sequential;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            "-m" | "--mode" => {
                let value = args.next().ok_or("missing value for --mode")?;
                mode = match value.as_str() {
                    "loop" => Mode::Loop,
                    "sequential" => Mode::Sequential,
                    "producer" => Mode::Producer,
                    "iouring" => Mode::IoUring,
                    "rtsp" => Mode::Rtsp,
                    other => return Err(format!("unknown mode '{other}'")),
                };
            }
            other if other.starts_with('-') => return Err(format!("unknown option '{other}'")),
            other => {
                if input.replace(other.to_string()).is_some() {
                    return Err("more than one input given".into());
                }
            }
        }
    }

    Ok(Args {
        input: input.ok_or("missing input path")?,
        mode,
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    paneflow::observability::init_metrics();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let outcome = match args.mode {
        Mode::Loop => run_pane_loop(&args.input),
        Mode::Sequential => run_sequential(&args.input, SourceKind::Auto),
        Mode::IoUring => run_sequential(&args.input, SourceKind::Uring),
        Mode::Producer => run_producer(&args.input),
        Mode::Rtsp => run_rtsp(&args.input),
    };

    if let Err(err) = outcome {
        eprintln!("runtime failure: {err}");
        std::process::exit(255);
    }
}

/// Load one frame per pane, then flip through the panes 100 times.
fn run_pane_loop(input: &str) -> Result<()> {
    let fb = Framebuffer::open(0)?;
    let pool = fb.pool();

    let mut source = create_source(SourceKind::Auto);
    source.open_raw(input, fb.width(), fb.height(), fb.bits_per_pixel())?;

    // Load one frame into each pane, returning every pane to the free
    // queue: the loop below flips by pane id and never holds a buffer.
    for i in 0..fb.panes() as u64 {
        let pane = pool
            .try_acquire_free()
            .ok_or(paneflow::Error::PoolExhausted)?;
        source.read_frame_at(i, pane.as_mut_slice())?;
        pool.submit_filled(&pane);
        let loaded = pool.acquire_filled().ok_or(paneflow::Error::PoolExhausted)?;
        pool.release_filled(&loaded);
    }

    let mut flips = 0usize;
    for round in 0..100 {
        for id in 0..fb.panes() {
            let pane = pool
                .buffer_by_id(id)
                .ok_or(paneflow::Error::PoolExhausted)?;
            fb.display_pane(&pane)?;
            fb.wait_vsync()?;
            flips += 1;
        }
        if round % 25 == 24 {
            println!(
                "round {}: {} flips, pool {} total / {} free / {} filled",
                round + 1,
                flips,
                pool.total_count(),
                pool.free_count(),
                pool.filled_count()
            );
        }
    }
    println!("pane loop done: {flips} flips");
    Ok(())
}

/// Read-then-flip per frame, alternating panes, until end of input.
fn run_sequential(input: &str, kind: SourceKind) -> Result<()> {
    let fb = Framebuffer::open(0)?;
    let pool = fb.pool();

    let mut source = create_source(kind);
    source.open_raw(input, fb.width(), fb.height(), fb.bits_per_pixel())?;
    let total = source.total_frames().unwrap_or(0);

    let mut shown = 0u64;
    for index in 0..total {
        let pane = loop {
            match pool.acquire_free_timeout(Duration::from_millis(100)) {
                Some(p) => break p,
                None => continue,
            }
        };
        source.read_frame_at(index, pane.as_mut_slice())?;
        pool.submit_filled(&pane);

        let buf = pool.acquire_filled().ok_or(paneflow::Error::PoolExhausted)?;
        fb.display_pane(&buf)?;
        fb.wait_vsync()?;
        pool.release_filled(&buf);
        shown += 1;
    }
    println!("sequential playback done: {shown}/{total} frames");
    Ok(())
}

/// Two producer workers fill framebuffer panes; the consumer flips them.
fn run_producer(input: &str) -> Result<()> {
    let fb = Arc::new(Framebuffer::open(0)?);
    let pool = Arc::clone(fb.pool());

    let mut producer = VideoProducer::new(Arc::clone(&pool));
    producer.start(ProducerConfig {
        path: input.into(),
        width: fb.width(),
        height: fb.height(),
        bits_per_pixel: fb.bits_per_pixel(),
        looping: true,
        workers: 2,
        kind: SourceKind::Auto,
    })?;

    let consumer = FrameConsumer::new(pool, Arc::clone(&fb), DisplayStrategy::PaneFlip);
    let stats = consumer.run_frames(600, Duration::from_secs(60));
    producer.stop();

    println!(
        "producer run done: displayed={} fallbacks={} failures={} produced={} skipped={}",
        stats.displayed,
        stats.fallbacks,
        stats.failures,
        producer.produced_frames(),
        producer.skipped_frames()
    );
    Ok(())
}

/// RTSP stream decoded into an injection pool, presented via DMA with copy
/// fallback. Runs until stdin closes.
fn run_rtsp(url: &str) -> Result<()> {
    let fb = Arc::new(Framebuffer::open(0)?);
    let pool = BufferPool::new_injected("rtsp-decode", "video", 10)?;

    let mut producer = VideoProducer::new(Arc::clone(&pool));
    producer.start(ProducerConfig {
        path: url.into(),
        width: fb.width(),
        height: fb.height(),
        bits_per_pixel: 32,
        looping: false,
        workers: 1,
        kind: SourceKind::Rtsp,
    })?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);
    stop_on_stdin_close(move || stop2.store(true, std::sync::atomic::Ordering::SeqCst));

    let consumer = FrameConsumer::new(pool, fb, DisplayStrategy::Dma);
    let stats = consumer.run(&stop);
    producer.stop();

    println!(
        "rtsp run done: displayed={} fallbacks={} failures={}",
        stats.displayed, stats.fallbacks, stats.failures
    );
    Ok(())
}

/// Request a stop when stdin reaches end of input (enter or ^D). SIGINT
/// still terminates the process the usual way.
fn stop_on_stdin_close(on_close: impl FnOnce() + Send + 'static) {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = std::io::stdin().read_line(&mut buf);
        on_close();
    });
}

//! The display consumer loop.
//!
//! Pulls ready buffers from a pool, presents them through a
//! [`DisplaySink`], and releases them. One consumer per pool: the handoff
//! semantics with multiple consumers are nondeterministic, so run several
//! only if you do not care which one presents a given frame.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferPool};
use crate::error::Result;
use crate::observability;

/// A presentation target: the hardware framebuffer, or a stand-in.
///
/// [`super::Framebuffer`] is the production implementation; tests drive the
/// consumer with mock sinks.
pub trait DisplaySink: Send + Sync {
    /// Zero-copy DMA presentation from the buffer's physical address.
    fn present_dma(&self, buf: &Buffer) -> Result<()>;

    /// Pan to the pane the buffer occupies (fb-pool buffers only).
    fn present_pane(&self, buf: &Arc<Buffer>) -> Result<()>;

    /// Copy into a free pane and pan to it.
    fn present_copy(&self, buf: &Buffer) -> Result<()>;

    /// Block until the next scan-out boundary.
    fn wait_vsync(&self) -> Result<()>;
}

/// How a frame reaches the glass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStrategy {
    /// Program the overlay with the buffer's physical address (zero copy,
    /// zero flip). Falls back to `CopyFlip` per frame when the buffer has
    /// no physical address or the driver refuses.
    Dma,
    /// Pan to the pane the producer already wrote (zero copy; the buffer
    /// must belong to the framebuffer's own pane pool).
    PaneFlip,
    /// Copy into a free pane, then pan to it.
    CopyFlip,
}

/// Counters from one consumer run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerStats {
    /// Frames successfully presented.
    pub displayed: u64,
    /// DMA presentations that fell back to the copy path.
    pub fallbacks: u64,
    /// Frames that could not be presented at all.
    pub failures: u64,
}

/// Pulls filled buffers and hands them to a [`DisplaySink`].
pub struct FrameConsumer<S: DisplaySink> {
    pool: Arc<BufferPool>,
    sink: Arc<S>,
    strategy: DisplayStrategy,
    vsync: bool,
}

impl<S: DisplaySink> FrameConsumer<S> {
    /// Bind a consumer to its source pool and presentation target.
    pub fn new(pool: Arc<BufferPool>, sink: Arc<S>, strategy: DisplayStrategy) -> Self {
        Self {
            pool,
            sink,
            strategy,
            vsync: true,
        }
    }

    /// Whether to wait for the scan-out boundary after each present.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Present one buffer with the configured strategy.
    ///
    /// The DMA strategy degrades to copy-then-flip when the buffer carries
    /// no physical address or the driver call fails; `stats.fallbacks`
    /// reports how often that happened.
    pub fn present(&self, buf: &Arc<Buffer>, stats: &mut ConsumerStats) -> Result<()> {
        let result = match self.strategy {
            DisplayStrategy::PaneFlip => self.sink.present_pane(buf),
            DisplayStrategy::CopyFlip => self.sink.present_copy(buf),
            DisplayStrategy::Dma => {
                if buf.phys_addr() == 0 {
                    debug!(id = buf.id(), "no physical address, copy fallback");
                    stats.fallbacks += 1;
                    observability::record_fallback();
                    self.sink.present_copy(buf)
                } else {
                    self.sink.present_dma(buf).or_else(|err| {
                        warn!(id = buf.id(), %err, "DMA display failed, copy fallback");
                        stats.fallbacks += 1;
                        observability::record_fallback();
                        self.sink.present_copy(buf)
                    })
                }
            }
        };

        if result.is_ok() && self.vsync {
            self.sink.wait_vsync()?;
        }
        result
    }

    /// Consume until `stop` is set, presenting every ready buffer.
    ///
    /// Buffers are always released back to the pool, presented or not.
    pub fn run(&self, stop: &AtomicBool) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        while !stop.load(Ordering::SeqCst) {
            let Some(buf) = self.pool.acquire_filled_timeout(Duration::from_millis(100)) else {
                continue;
            };
            self.consume_one(&buf, &mut stats);
        }
        stats
    }

    /// Consume exactly `frames` frames, bounded by `timeout`.
    pub fn run_frames(&self, frames: u64, timeout: Duration) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let deadline = std::time::Instant::now() + timeout;
        while stats.displayed + stats.failures < frames {
            if std::time::Instant::now() >= deadline {
                break;
            }
            let Some(buf) = self.pool.acquire_filled_timeout(Duration::from_millis(100)) else {
                continue;
            };
            self.consume_one(&buf, &mut stats);
        }
        stats
    }

    fn consume_one(&self, buf: &Arc<Buffer>, stats: &mut ConsumerStats) {
        match self.present(buf, stats) {
            Ok(()) => stats.displayed += 1,
            Err(err) => {
                warn!(id = buf.id(), %err, "frame not presented");
                stats.failures += 1;
            }
        }
        self.pool.release_filled(buf);
        observability::record_pool_free(self.pool.name(), self.pool.free_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferHandle;
    use crate::error::Error;
    use std::sync::atomic::AtomicU64;

    /// Sink that records which paths ran and fails where instructed.
    #[derive(Default)]
    struct MockSink {
        dma_calls: AtomicU64,
        pane_calls: AtomicU64,
        copy_calls: AtomicU64,
        vsyncs: AtomicU64,
        fail_dma: bool,
        fail_copy: bool,
    }

    impl DisplaySink for MockSink {
        fn present_dma(&self, buf: &Buffer) -> Result<()> {
            self.dma_calls.fetch_add(1, Ordering::SeqCst);
            if buf.phys_addr() == 0 {
                return Err(Error::InvalidBuffer("no physical address".into()));
            }
            if self.fail_dma {
                return Err(Error::Device("driver refused".into()));
            }
            Ok(())
        }
        fn present_pane(&self, _buf: &Arc<Buffer>) -> Result<()> {
            self.pane_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn present_copy(&self, _buf: &Buffer) -> Result<()> {
            self.copy_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_copy {
                return Err(Error::PoolExhausted);
            }
            Ok(())
        }
        fn wait_vsync(&self) -> Result<()> {
            self.vsyncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool_with_filled(n: usize) -> Arc<BufferPool> {
        let pool = BufferPool::new_injected("consumer-test-pool", "display-test", 0).unwrap();
        for _ in 0..n {
            pool.inject_filled(BufferHandle::from_boxed_slice(
                vec![0u8; 64].into_boxed_slice(),
                0,
            ))
            .unwrap();
        }
        pool
    }

    #[test]
    fn test_dma_without_phys_falls_back_to_copy() {
        let pool = pool_with_filled(1);
        let sink = Arc::new(MockSink::default());
        let consumer = FrameConsumer::new(Arc::clone(&pool), Arc::clone(&sink), DisplayStrategy::Dma);

        let buf = pool.acquire_filled().unwrap();
        let mut stats = ConsumerStats::default();
        consumer.present(&buf, &mut stats).unwrap();
        pool.release_filled(&buf);

        // phys == 0: the DMA ioctl is never even attempted.
        assert_eq!(sink.dma_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.copy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(sink.vsyncs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dma_driver_failure_falls_back_to_copy() {
        let pool = BufferPool::new_injected("consumer-dma-fail", "display-test", 0).unwrap();
        // A handle with a (fake) physical address takes the DMA path.
        let mem = Box::into_raw(vec![0u8; 64].into_boxed_slice()) as *mut u8;
        let handle = BufferHandle::new(
            mem,
            0x1000_0000,
            64,
            Some(Box::new(move |p| {
                // SAFETY: p came from Box::into_raw of a 64-byte box.
                drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(p, 64)) });
            })),
        )
        .unwrap();
        pool.inject_filled(handle).unwrap();

        let sink = Arc::new(MockSink {
            fail_dma: true,
            ..MockSink::default()
        });
        let consumer = FrameConsumer::new(Arc::clone(&pool), Arc::clone(&sink), DisplayStrategy::Dma);

        let buf = pool.acquire_filled().unwrap();
        let mut stats = ConsumerStats::default();
        consumer.present(&buf, &mut stats).unwrap();
        pool.release_filled(&buf);

        assert_eq!(sink.dma_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.copy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.fallbacks, 1);
    }

    #[test]
    fn test_run_drains_and_releases() {
        let pool = pool_with_filled(5);
        let sink = Arc::new(MockSink::default());
        let consumer =
            FrameConsumer::new(Arc::clone(&pool), Arc::clone(&sink), DisplayStrategy::CopyFlip)
                .with_vsync(false);

        let stats = consumer.run_frames(5, Duration::from_secs(5));
        assert_eq!(stats.displayed, 5);
        assert_eq!(stats.failures, 0);
        assert_eq!(sink.copy_calls.load(Ordering::SeqCst), 5);
        // vsync disabled
        assert_eq!(sink.vsyncs.load(Ordering::SeqCst), 0);
        // Transient buffers were ejected on release.
        assert_eq!(pool.total_count(), 0);
    }

    #[test]
    fn test_present_failure_counts_and_releases() {
        let pool = pool_with_filled(2);
        let sink = Arc::new(MockSink {
            fail_copy: true,
            ..MockSink::default()
        });
        let consumer =
            FrameConsumer::new(Arc::clone(&pool), Arc::clone(&sink), DisplayStrategy::CopyFlip)
                .with_vsync(false);

        let stats = consumer.run_frames(2, Duration::from_secs(5));
        assert_eq!(stats.displayed, 0);
        assert_eq!(stats.failures, 2);
        // Failed frames are still released (ejected here).
        assert_eq!(pool.total_count(), 0);
    }
}

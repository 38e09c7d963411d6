//! Process-level metrics using metrics-rs.
//!
//! Counters are cheap no-ops until the application installs a recorder, so
//! every hot path records unconditionally.

use metrics::{counter, gauge, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metric descriptions have been registered.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_PRODUCED: &str = "paneflow_frames_produced";
const FRAMES_SKIPPED: &str = "paneflow_frames_skipped";
const FRAMES_DISPLAYED: &str = "paneflow_frames_displayed";
const DISPLAY_FALLBACKS: &str = "paneflow_display_fallbacks";
const BUFFERS_INJECTED: &str = "paneflow_buffers_injected";
const BUFFERS_EJECTED: &str = "paneflow_buffers_ejected";
const POOL_FREE_BUFFERS: &str = "paneflow_pool_free_buffers";
const PAN_FLIPS: &str = "paneflow_pan_flips";

/// Register metric descriptions.
///
/// Call once at application startup. Safe to call multiple times.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        FRAMES_PRODUCED,
        Unit::Count,
        "Frames read and submitted by producers"
    );
    metrics::describe_counter!(
        FRAMES_SKIPPED,
        Unit::Count,
        "Frames skipped after a failed read"
    );
    metrics::describe_counter!(
        FRAMES_DISPLAYED,
        Unit::Count,
        "Frames presented to the display"
    );
    metrics::describe_counter!(
        DISPLAY_FALLBACKS,
        Unit::Count,
        "DMA presentations that fell back to the copy path"
    );
    metrics::describe_counter!(
        BUFFERS_INJECTED,
        Unit::Count,
        "Transient buffers injected into pools"
    );
    metrics::describe_counter!(
        BUFFERS_EJECTED,
        Unit::Count,
        "Transient buffers ejected from pools"
    );
    metrics::describe_gauge!(
        POOL_FREE_BUFFERS,
        Unit::Count,
        "Free buffers in a pool, labeled by pool name"
    );
    metrics::describe_counter!(PAN_FLIPS, Unit::Count, "Pan-display control calls issued");
}

/// Record one produced frame.
#[inline]
pub fn record_produced() {
    counter!(FRAMES_PRODUCED).increment(1);
}

/// Record one skipped frame.
#[inline]
pub fn record_skipped() {
    counter!(FRAMES_SKIPPED).increment(1);
}

/// Record one displayed frame.
#[inline]
pub fn record_displayed() {
    counter!(FRAMES_DISPLAYED).increment(1);
}

/// Record one DMA-to-copy fallback.
#[inline]
pub fn record_fallback() {
    counter!(DISPLAY_FALLBACKS).increment(1);
}

/// Record one injected transient buffer.
#[inline]
pub fn record_injected() {
    counter!(BUFFERS_INJECTED).increment(1);
}

/// Record one ejected transient buffer.
#[inline]
pub fn record_ejected() {
    counter!(BUFFERS_EJECTED).increment(1);
}

/// Record a pool's free-buffer level.
#[inline]
pub fn record_pool_free(pool: &str, free: usize) {
    gauge!(POOL_FREE_BUFFERS, "pool" => pool.to_string()).set(free as f64);
}

/// Record one pan-display flip.
#[inline]
pub fn record_flip() {
    counter!(PAN_FLIPS).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_noops_without_recorder() {
        init_metrics();
        init_metrics(); // idempotent
        record_produced();
        record_skipped();
        record_displayed();
        record_fallback();
        record_injected();
        record_ejected();
        record_flip();
        record_pool_free("test-pool", 4);
    }
}

//! Display handoff: the hardware framebuffer and the consumer loop.
//!
//! [`Framebuffer`] owns the display device and a mode-2
//! [`crate::buffer::BufferPool`] whose buffers are the hardware panes.
//! Three presentation strategies cover the hardware spectrum:
//!
//! | Strategy | Requirement | Cost |
//! |----------|-------------|------|
//! | DMA address | `phys_addr != 0` and driver support | zero copy, zero flip |
//! | Pane flip | frame written into one of the fb's own panes | zero copy |
//! | Copy + flip | none | one memcpy per frame |
//!
//! [`FrameConsumer`] pulls ready buffers from a pool and presents them with
//! a chosen strategy, falling back from DMA to copy when a buffer has no
//! usable physical address.

mod consumer;
mod framebuffer;

pub use consumer::{ConsumerStats, DisplaySink, DisplayStrategy, FrameConsumer};
pub use framebuffer::{pan_offset, pane_count, Framebuffer};

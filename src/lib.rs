//! # paneflow
//!
//! A multi-producer/single-consumer video-frame pipeline for embedded
//! Linux display hardware.
//!
//! A decode or file-read producer places fully-rendered pixel frames into a
//! pool of fixed-size buffers; a display consumer pulls ready frames and
//! presents them to a framebuffer device, preferring a zero-copy hardware
//! path when the frame carries a valid physical address and falling back to
//! pan-flip or CPU copy otherwise.
//!
//! ```text
//! FrameSource → VideoProducer → BufferPool (filled) → FrameConsumer → Framebuffer
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use paneflow::prelude::*;
//!
//! let fb = Arc::new(Framebuffer::open(0)?);
//! let pool = Arc::clone(fb.pool());
//!
//! let mut producer = VideoProducer::new(Arc::clone(&pool));
//! producer.start(ProducerConfig {
//!     path: "video.raw".into(),
//!     width: fb.width(),
//!     height: fb.height(),
//!     bits_per_pixel: fb.bits_per_pixel(),
//!     looping: true,
//!     workers: 2,
//!     kind: SourceKind::Auto,
//! })?;
//!
//! let consumer = FrameConsumer::new(pool, fb, DisplayStrategy::PaneFlip);
//! let stats = consumer.run(&stop_flag);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod display;
pub mod error;
pub mod observability;
pub mod producer;
pub mod source;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferHandle, BufferPool, BufferState, Ownership};
    pub use crate::display::{DisplayStrategy, Framebuffer, FrameConsumer};
    pub use crate::error::{Error, Result};
    pub use crate::producer::{ProducerConfig, VideoProducer};
    pub use crate::source::{FrameSource, SourceKind};
}

pub use error::{Error, Result};

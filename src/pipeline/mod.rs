//! Audio pipeline components.
//!
//! Two independent pipelines share the same shape, a ring buffer plus a
//! dedicated worker thread bound 1:1 to the pipeline's active state:
//!
//! ```text
//! Microphone → Capture Worker → Capture Ring Buffer → read_audio()
//! write_audio() → Render Ring Buffer → Render Worker → Speaker
//! ```
//!
//! - **Ring Buffer**: fixed-capacity byte FIFO behind a single lock with bounded waits
//! - **Capture**: gain, silence detection and level snapshot per hardware chunk
//! - **Render**: amplifier lifecycle, silence fill and idle self-termination

mod capture;
mod render;
mod ring_buffer;

pub(crate) use capture::CapturePipeline;
pub(crate) use render::RenderPipeline;
pub use ring_buffer::RingBuffer;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::EngineStats;

/// Counters shared by both pipelines and their workers.
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub captured_bytes: AtomicU64,
    pub capture_dropped_bytes: AtomicU64,
    pub rendered_bytes: AtomicU64,
    pub render_dropped_bytes: AtomicU64,
    pub silence_frames: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            captured_bytes: self.captured_bytes.load(Ordering::Relaxed),
            capture_dropped_bytes: self.capture_dropped_bytes.load(Ordering::Relaxed),
            rendered_bytes: self.rendered_bytes.load(Ordering::Relaxed),
            render_dropped_bytes: self.render_dropped_bytes.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
        }
    }
}

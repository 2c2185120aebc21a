//! Engine facade over the capture and render pipelines.

use std::sync::Arc;
use std::time::Duration;

use crate::device::{Amplifier, AmplifierState, AudioDevice};
use crate::event::EventCallback;
use crate::pipeline::{CapturePipeline, EngineCounters, RenderPipeline};
use crate::transport::PlaybackSink;
use crate::{AudioChunk, EngineConfig, EngineError};

/// Counters accumulated since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Bytes published into the capture buffer.
    pub captured_bytes: u64,
    /// Captured bytes dropped because the capture buffer was full.
    pub capture_dropped_bytes: u64,
    /// Bytes written to the speaker (silence excluded).
    pub rendered_bytes: u64,
    /// Playback bytes dropped because the render buffer was full.
    pub render_dropped_bytes: u64,
    /// Silence frames written while the render buffer was empty.
    pub silence_frames: u64,
}

/// The object the rest of the device calls to record and play audio.
///
/// Capture and render are independent: each has its own ring buffer and
/// worker thread. Capture is started and stopped explicitly; render
/// activates on the first write and powers itself down after
/// [`render_idle_timeout`](EngineConfig::render_idle_timeout) without data.
///
/// All methods take `&self`; share the engine behind an `Arc`.
///
/// # Example
///
/// ```
/// use echo_link::{AudioEngine, EngineConfig, MockDevice};
/// use std::sync::Arc;
///
/// let device = MockDevice::new();
/// let engine = AudioEngine::new(
///     EngineConfig::default(),
///     Arc::new(device.clone()),
///     Arc::new(device.amplifier()),
///     None,
/// );
///
/// engine.start_capture().unwrap();
/// assert!(engine.is_capturing());
/// engine.stop_capture();
/// ```
pub struct AudioEngine {
    config: EngineConfig,
    capture: CapturePipeline,
    render: RenderPipeline,
    counters: Arc<EngineCounters>,
}

impl AudioEngine {
    /// Creates an idle engine. Nothing touches the hardware until capture
    /// starts or audio is written.
    pub fn new(
        config: EngineConfig,
        device: Arc<dyn AudioDevice>,
        amplifier: Arc<dyn Amplifier>,
        events: Option<EventCallback>,
    ) -> Self {
        let counters = Arc::new(EngineCounters::default());
        let capture = CapturePipeline::new(
            config.clone(),
            Arc::clone(&device),
            Arc::clone(&counters),
            events.clone(),
        );
        let render = RenderPipeline::new(
            config.clone(),
            device,
            amplifier,
            Arc::clone(&counters),
            events,
        );
        Self {
            config,
            capture,
            render,
            counters,
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts capturing. Succeeds without side effects if already capturing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Device`] if the capture channel cannot be
    /// initialized, or [`EngineError::SpawnFailed`] if the worker cannot be
    /// spawned. Nothing is left running in either case.
    pub fn start_capture(&self) -> Result<(), EngineError> {
        self.capture.start()
    }

    /// Stops capturing and waits for the worker to exit. No-op when idle.
    pub fn stop_capture(&self) {
        self.capture.stop();
    }

    /// Returns `true` while a capture worker is running.
    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    /// Copies up to `buf.len()` captured bytes into `buf`. Never waits for data.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LockTimeout`] if the buffer is contended; retry
    /// on the next cycle.
    pub fn read_audio(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.capture.read(buf, self.config.worker_lock_wait)
    }

    /// Bytes waiting in the capture buffer.
    pub fn available_audio(&self) -> usize {
        self.capture.available()
    }

    /// RMS level of the latest captured chunk, 0 when not capturing.
    pub fn current_audio_level(&self) -> u16 {
        self.capture.level()
    }

    /// Whether the silence detector currently considers the input silent.
    pub fn is_silent(&self) -> bool {
        self.capture.is_silent()
    }

    /// Queues PCM bytes for playback, powering the speaker up if needed.
    ///
    /// Returns the number of bytes stored. When the render buffer is full
    /// the newest bytes are dropped and the count is short.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] for an empty buffer,
    /// [`EngineError::LockTimeout`] if the render lock was not acquired in
    /// time, or an activation error.
    pub fn write_audio(&self, data: &[u8]) -> Result<usize, EngineError> {
        self.render.write(data)
    }

    /// Queues a chunk for playback. See [`write_audio`](Self::write_audio).
    pub fn play_chunk(&self, chunk: AudioChunk) -> Result<usize, EngineError> {
        self.render.write(chunk.as_bytes())
    }

    /// Stops playback immediately and discards queued audio.
    pub fn stop_playback(&self) {
        self.render.stop();
    }

    /// Waits until the render worker has exited. Returns `true` if idle.
    pub fn wait_for_playback_idle(&self, timeout: Duration) -> bool {
        self.render.wait_for_idle(timeout)
    }

    /// Bytes waiting in the render buffer.
    pub fn queued_playback(&self) -> usize {
        self.render.queued()
    }

    /// Returns `true` while a render worker is running.
    pub fn is_playing(&self) -> bool {
        self.render.is_playing()
    }

    /// Current amplifier power state.
    pub fn amplifier_state(&self) -> AmplifierState {
        self.render.amplifier_state()
    }

    /// Returns a snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Stops both pipelines and clears both buffers.
    pub fn reset(&self) {
        self.capture.stop();
        self.render.stop();
        self.capture.clear();
        tracing::debug!("engine reset");
    }
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("capturing", &self.is_capturing())
            .field("playing", &self.is_playing())
            .finish_non_exhaustive()
    }
}

impl PlaybackSink for AudioEngine {
    fn play(&self, data: &[u8]) -> Result<usize, EngineError> {
        self.write_audio(data)
    }
}

//! Capture pipeline - microphone worker feeding the capture ring buffer.
//!
//! The worker runs on a dedicated OS thread and owns the per-chunk
//! processing:
//! - Reading from the hardware with a short deadline
//! - Applying linear gain with hard clipping
//! - Tracking silence with a run-length hysteresis
//! - Publishing the chunk into the ring buffer (drop newest on full)
//! - Keeping the latest chunk for the level diagnostic

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::ring_buffer::SharedRingBuffer;
use super::EngineCounters;
use crate::chunk::{mean_magnitude, rms_level};
use crate::device::AudioDevice;
use crate::event::{emit, DeviceEvent, EventCallback};
use crate::{EngineConfig, EngineError};

/// Run-length silence detector.
///
/// A chunk is quiet when its mean absolute magnitude is below the threshold.
/// Silence is asserted once `hold` consecutive quiet chunks have been seen
/// and cleared by the first loud chunk.
#[derive(Debug)]
pub(crate) struct SilenceDetector {
    threshold: u32,
    hold: u32,
    quiet_run: u32,
    silent: bool,
}

impl SilenceDetector {
    pub fn new(threshold: u32, hold: u32) -> Self {
        Self {
            threshold,
            hold,
            quiet_run: 0,
            silent: false,
        }
    }

    /// Feeds one chunk's mean magnitude and returns the current verdict.
    pub fn update(&mut self, magnitude: u32) -> bool {
        if magnitude < self.threshold {
            self.quiet_run = self.quiet_run.saturating_add(1);
            if self.quiet_run >= self.hold {
                self.silent = true;
            }
        } else {
            self.quiet_run = 0;
            self.silent = false;
        }
        self.silent
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }
}

/// Multiplies every little-endian 16-bit sample by `gain`, clipping to the i16 range.
pub(crate) fn apply_gain(data: &mut [u8], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for pair in data.chunks_exact_mut(2) {
        let sample = f32::from(i16::from_le_bytes([pair[0], pair[1]]));
        let scaled = (sample * gain).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// State shared between the control path and the capture worker.
pub(crate) struct CaptureShared {
    pub buffer: SharedRingBuffer,
    active: AtomicBool,
    silent: AtomicBool,
    last_chunk: Mutex<Vec<u8>>,
    counters: Arc<EngineCounters>,
}

/// The capture worker's view of the pipeline.
struct CaptureWorker {
    shared: Arc<CaptureShared>,
    device: Arc<dyn AudioDevice>,
    config: EngineConfig,
    events: Option<EventCallback>,
}

impl CaptureWorker {
    /// Runs until the active flag clears.
    fn run(self) {
        let mut chunk = vec![0u8; self.config.hardware_chunk_bytes];
        let mut detector = SilenceDetector::new(
            self.config.silence_threshold,
            self.config.silence_hold_chunks,
        );
        let mut overflowing = false;

        tracing::debug!(
            chunk_bytes = chunk.len(),
            gain = self.config.gain,
            "capture worker started"
        );

        while self.shared.active.load(Ordering::Acquire) {
            let n = match self.device.read(&mut chunk, self.config.capture_read_deadline) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "capture read failed");
                    std::thread::sleep(self.config.capture_read_deadline);
                    continue;
                }
            };
            self.process(&mut chunk[..n], &mut detector, &mut overflowing);
        }

        tracing::debug!("capture worker exiting");
    }

    /// Processes one chunk. Overflow is reported once per episode:
    /// `overflowing` stays set until a chunk fits again.
    fn process(&self, data: &mut [u8], detector: &mut SilenceDetector, overflowing: &mut bool) {
        apply_gain(data, self.config.gain);

        let was_silent = detector.is_silent();
        let silent = detector.update(mean_magnitude(data));
        self.shared.silent.store(silent, Ordering::Release);
        if silent != was_silent {
            tracing::debug!(silent, "capture silence changed");
            emit(self.events.as_ref(), DeviceEvent::SilenceChanged { silent });
        }

        let wait = self.config.worker_lock_wait;
        match self.shared.buffer.write(data, wait) {
            Ok(stored) => {
                self.shared
                    .counters
                    .captured_bytes
                    .fetch_add(stored as u64, Ordering::Relaxed);
                if stored < data.len() {
                    let dropped = data.len() - stored;
                    self.shared
                        .counters
                        .capture_dropped_bytes
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    if !*overflowing {
                        *overflowing = true;
                        tracing::warn!(dropped, "capture buffer full, dropping newest audio");
                        emit(
                            self.events.as_ref(),
                            DeviceEvent::BufferOverflow {
                                buffer: "capture",
                                dropped_bytes: dropped,
                            },
                        );
                    }
                } else if *overflowing {
                    *overflowing = false;
                    tracing::debug!("capture buffer draining again");
                }
            }
            Err(e) => tracing::trace!(error = %e, "capture chunk skipped"),
        }

        if let Some(mut last) = self.shared.last_chunk.try_lock_for(wait) {
            last.clear();
            last.extend_from_slice(data);
        }
    }
}

/// Microphone pipeline: capture ring buffer plus its worker thread.
pub(crate) struct CapturePipeline {
    shared: Arc<CaptureShared>,
    device: Arc<dyn AudioDevice>,
    config: EngineConfig,
    events: Option<EventCallback>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CapturePipeline {
    pub fn new(
        config: EngineConfig,
        device: Arc<dyn AudioDevice>,
        counters: Arc<EngineCounters>,
        events: Option<EventCallback>,
    ) -> Self {
        let shared = Arc::new(CaptureShared {
            buffer: SharedRingBuffer::new("capture buffer", config.ring_buffer_capacity),
            active: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            last_chunk: Mutex::new(Vec::with_capacity(config.hardware_chunk_bytes)),
            counters,
        });
        Self {
            shared,
            device,
            config,
            events,
            worker: Mutex::new(None),
        }
    }

    /// Starts the capture worker. Succeeds without side effects if already running.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            tracing::debug!("capture already running");
            return Ok(());
        }

        self.shared.buffer.clear_blocking();
        self.shared.last_chunk.lock().clear();
        self.shared.silent.store(false, Ordering::Release);

        self.device.init_capture()?;
        self.shared.active.store(true, Ordering::Release);

        let ctx = CaptureWorker {
            shared: Arc::clone(&self.shared),
            device: Arc::clone(&self.device),
            config: self.config.clone(),
            events: self.events.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name("capture-worker".to_string())
            .spawn(move || ctx.run());

        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(source) => {
                self.shared.active.store(false, Ordering::Release);
                self.device.teardown_capture();
                tracing::error!(error = %source, "failed to spawn capture worker");
                return Err(EngineError::SpawnFailed {
                    worker: "capture",
                    source,
                });
            }
        }

        tracing::info!("capture started");
        emit(self.events.as_ref(), DeviceEvent::CaptureStarted);
        Ok(())
    }

    /// Stops the worker, waits for it to exit and releases the channel.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            return;
        };

        self.shared.active.store(false, Ordering::Release);
        // Bounded: every hardware read has a deadline
        if handle.join().is_err() {
            tracing::error!("capture worker panicked");
        }
        self.device.teardown_capture();

        tracing::info!("capture stopped");
        emit(self.events.as_ref(), DeviceEvent::CaptureStopped);
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn is_silent(&self) -> bool {
        self.shared.silent.load(Ordering::Acquire)
    }

    /// Copies up to `out.len()` captured bytes out of the buffer.
    pub fn read(&self, out: &mut [u8], wait: Duration) -> Result<usize, EngineError> {
        self.shared.buffer.read(out, wait)
    }

    pub fn available(&self) -> usize {
        self.shared
            .buffer
            .len(self.config.worker_lock_wait)
            .unwrap_or(0)
    }

    /// RMS of the latest chunk, 0 when idle or contended.
    pub fn level(&self) -> u16 {
        if !self.is_running() {
            return 0;
        }
        match self.shared.last_chunk.try_lock() {
            Some(last) => rms_level(&last, self.config.level_window_samples),
            None => 0,
        }
    }

    /// Discards buffered audio. Only valid while stopped.
    pub fn clear(&self) {
        self.shared.buffer.clear_blocking();
        self.shared.last_chunk.lock().clear();
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, MockDevice};
    use std::time::Instant;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn pipeline(device: &MockDevice, config: EngineConfig) -> CapturePipeline {
        CapturePipeline::new(
            config,
            Arc::new(device.clone()),
            Arc::new(EngineCounters::default()),
            None,
        )
    }

    #[test]
    fn test_silence_hysteresis() {
        let mut detector = SilenceDetector::new(100, 3);
        assert!(!detector.update(10));
        assert!(!detector.update(10));
        assert!(detector.update(10));
        assert!(detector.update(10));

        // One loud chunk clears immediately
        assert!(!detector.update(5000));

        // Re-asserting needs the full run again
        assert!(!detector.update(10));
        assert!(!detector.update(10));
        assert!(detector.update(10));
    }

    #[test]
    fn test_silence_threshold_is_exclusive() {
        let mut detector = SilenceDetector::new(100, 1);
        assert!(!detector.update(100));
        assert!(detector.update(99));
    }

    #[test]
    fn test_apply_gain_clips() {
        let mut data = pcm(&[1000, -1000, 20000, -20000, i16::MIN]);
        apply_gain(&mut data, 2.0);
        let out: Vec<i16> = crate::chunk::samples(&data).collect();
        assert_eq!(out, vec![2000, -2000, i16::MAX, i16::MIN, i16::MIN]);
    }

    #[test]
    fn test_apply_gain_unity_is_noop() {
        let original = pcm(&[1, 2, 3]);
        let mut data = original.clone();
        apply_gain(&mut data, 1.0);
        assert_eq!(data, original);
    }

    #[test]
    fn test_start_is_idempotent() {
        let device = MockDevice::new();
        let capture = pipeline(&device, EngineConfig::default());

        capture.start().unwrap();
        capture.start().unwrap();
        assert!(capture.is_running());
        assert_eq!(device.count(DeviceCall::InitCapture), 1);

        capture.stop();
        assert!(!capture.is_running());
        assert_eq!(device.count(DeviceCall::TeardownCapture), 1);
        assert!(!device.is_capture_initialized());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let device = MockDevice::new();
        let capture = pipeline(&device, EngineConfig::default());
        capture.stop();
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_init_failure_leaves_idle() {
        let device = MockDevice::new();
        device.fail_capture_init(true);
        let capture = pipeline(&device, EngineConfig::default());

        let err = capture.start().unwrap_err();
        assert!(matches!(err, EngineError::Device(_)));
        assert!(!capture.is_running());
    }

    #[test]
    fn test_captured_audio_reaches_buffer_with_gain() {
        let device = MockDevice::new();
        let config = EngineConfig {
            gain: 2.0,
            hardware_chunk_bytes: 8,
            ..Default::default()
        };
        let capture = pipeline(&device, config);
        device.push_samples(&[100, 200, 300, 400]);

        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || capture.available() == 8));

        let mut out = [0u8; 16];
        let n = capture.read(&mut out, Duration::from_millis(10)).unwrap();
        assert_eq!(n, 8);
        let samples: Vec<i16> = crate::chunk::samples(&out[..n]).collect();
        assert_eq!(samples, vec![200, 400, 600, 800]);
        capture.stop();
    }

    #[test]
    fn test_full_buffer_drops_newest() {
        let device = MockDevice::new();
        let config = EngineConfig {
            gain: 1.0,
            ring_buffer_capacity: 8,
            hardware_chunk_bytes: 4,
            ..Default::default()
        };
        let capture = pipeline(&device, config);
        device.push_samples(&[1, 2, 3, 4, 5, 6]);

        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || device.pending_capture() == 0));
        capture.stop();

        let mut out = [0u8; 16];
        let n = capture.read(&mut out, Duration::from_millis(10)).unwrap();
        let samples: Vec<i16> = crate::chunk::samples(&out[..n]).collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_reported_once_per_episode() {
        let device = MockDevice::new();
        let config = EngineConfig {
            gain: 1.0,
            ring_buffer_capacity: 8,
            hardware_chunk_bytes: 4,
            ..Default::default()
        };
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let capture = CapturePipeline::new(
            config,
            Arc::new(device.clone()),
            Arc::new(EngineCounters::default()),
            Some(crate::event_callback(move |e| sink.lock().push(e))),
        );
        let overflows = || {
            events
                .lock()
                .iter()
                .filter(|e| matches!(e, DeviceEvent::BufferOverflow { .. }))
                .count()
        };

        // Six chunks into room for two: four dropped, one report
        device.push_samples(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || device.pending_capture() == 0));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(overflows(), 1);

        // Draining ends the episode; the next overflow is reported again
        let mut out = [0u8; 16];
        capture.read(&mut out, Duration::from_millis(10)).unwrap();
        device.push_samples(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert!(wait_until(Duration::from_secs(2), || overflows() == 2));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(overflows(), 2);
        capture.stop();
    }

    #[test]
    fn test_level_zero_when_idle() {
        let device = MockDevice::new();
        let capture = pipeline(&device, EngineConfig::default());
        assert_eq!(capture.level(), 0);
    }

    #[test]
    fn test_level_reflects_latest_chunk() {
        let device = MockDevice::new();
        let config = EngineConfig {
            gain: 1.0,
            hardware_chunk_bytes: 8,
            ..Default::default()
        };
        let capture = pipeline(&device, config);
        device.push_samples(&[1000, -1000, 1000, -1000]);

        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || capture.level() == 1000));
        capture.stop();
        assert_eq!(capture.level(), 0);
    }
}

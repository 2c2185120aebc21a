//! Render pipeline - speaker worker draining the render ring buffer.
//!
//! Activation is implicit: the first write powers the amplifier, opens the
//! render channel and spawns the worker. The worker drains one hardware
//! frame per iteration, writes silence when there is nothing to play and
//! powers everything down after an idle timeout. All amplifier and channel
//! transitions happen under the render control lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::ring_buffer::SharedRingBuffer;
use super::EngineCounters;
use crate::device::{Amplifier, AmplifierState, AudioDevice};
use crate::event::{emit, DeviceEvent, EventCallback};
use crate::{EngineConfig, EngineError};

struct RenderWorkerHandle {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Lifecycle state guarded by the render control lock.
struct RenderControl {
    amplifier: AmplifierState,
    worker: Option<RenderWorkerHandle>,
}

/// State shared between the control path and the render worker.
struct RenderShared {
    buffer: SharedRingBuffer,
    control: Mutex<RenderControl>,
    idle: Condvar,
    device: Arc<dyn AudioDevice>,
    amplifier: Arc<dyn Amplifier>,
    config: EngineConfig,
    counters: Arc<EngineCounters>,
}

impl RenderShared {
    /// Reverse of activation: channel down, then amplifier down.
    fn power_down(&self, control: &mut RenderControl) {
        self.device.teardown_render();
        self.amplifier.power_off();
        control.amplifier = AmplifierState::Inactive;
        self.idle.notify_all();
    }
}

/// The render worker's view of the pipeline.
struct RenderWorker {
    shared: Arc<RenderShared>,
    running: Arc<AtomicBool>,
    events: Option<EventCallback>,
}

impl RenderWorker {
    fn run(self) {
        let config = &self.shared.config;
        let mut frame = vec![0u8; config.hardware_chunk_bytes];
        let silence = vec![0u8; config.hardware_chunk_bytes];
        let mut last_data = Instant::now();
        let mut failing = false;

        tracing::debug!(frame_bytes = frame.len(), "render worker started");

        loop {
            // An explicit stop owns deactivation
            if !self.running.load(Ordering::Acquire) {
                tracing::debug!("render worker stopped");
                return;
            }

            let n = self
                .shared
                .buffer
                .read(&mut frame, config.worker_lock_wait)
                .unwrap_or(0);

            if n > 0 {
                if let Some(written) = self.write_frame(&frame[..n], &mut failing) {
                    self.shared
                        .counters
                        .rendered_bytes
                        .fetch_add(written as u64, Ordering::Relaxed);
                }
                last_data = Instant::now();
                continue;
            }

            if self.write_frame(&silence, &mut failing).is_some() {
                self.shared
                    .counters
                    .silence_frames
                    .fetch_add(1, Ordering::Relaxed);
            }

            if last_data.elapsed() < config.render_idle_timeout {
                continue;
            }
            if self.try_deactivate() {
                return;
            }
        }
    }

    /// Writes one frame. A failure sleeps for the write deadline; only the
    /// first failure of a run is logged as a warning.
    fn write_frame(&self, data: &[u8], failing: &mut bool) -> Option<usize> {
        let deadline = self.shared.config.render_write_deadline;
        match self.shared.device.write(data, deadline) {
            Ok(written) => {
                if std::mem::take(failing) {
                    tracing::info!("render writes recovered");
                }
                Some(written)
            }
            Err(e) => {
                if *failing {
                    tracing::trace!(error = %e, "render write failed");
                } else {
                    tracing::warn!(error = %e, "render write failed");
                    *failing = true;
                }
                std::thread::sleep(deadline);
                None
            }
        }
    }

    /// Powers down unless a write raced in. Returns `true` if the worker should exit.
    fn try_deactivate(&self) -> bool {
        let wait = self.shared.config.worker_lock_wait;
        let Some(mut control) = self.shared.control.try_lock_for(wait) else {
            return false;
        };
        if !self.running.load(Ordering::Acquire) {
            return true;
        }
        // Re-check under the control lock so a concurrent write is never stranded
        if !matches!(self.shared.buffer.len(wait), Ok(0)) {
            return false;
        }

        // Detach our own handle; this thread is about to exit
        control.worker = None;
        self.shared.power_down(&mut control);
        drop(control);

        tracing::info!(
            idle_ms = self.shared.config.render_idle_timeout.as_millis() as u64,
            "playback idle, amplifier off"
        );
        emit(
            self.events.as_ref(),
            DeviceEvent::PlaybackStopped { idle_timeout: true },
        );
        true
    }
}

/// Speaker pipeline: render ring buffer, amplifier lifecycle and worker thread.
pub(crate) struct RenderPipeline {
    shared: Arc<RenderShared>,
    events: Option<EventCallback>,
}

impl RenderPipeline {
    pub fn new(
        config: EngineConfig,
        device: Arc<dyn AudioDevice>,
        amplifier: Arc<dyn Amplifier>,
        counters: Arc<EngineCounters>,
        events: Option<EventCallback>,
    ) -> Self {
        let shared = Arc::new(RenderShared {
            buffer: SharedRingBuffer::new("render buffer", config.ring_buffer_capacity),
            control: Mutex::new(RenderControl {
                amplifier: AmplifierState::Inactive,
                worker: None,
            }),
            idle: Condvar::new(),
            device,
            amplifier,
            config,
            counters,
        });
        Self { shared, events }
    }

    /// Queues PCM bytes for playback, activating the pipeline if needed.
    ///
    /// Returns the number of bytes stored; the rest did not fit and was dropped.
    pub fn write(&self, data: &[u8]) -> Result<usize, EngineError> {
        if data.is_empty() {
            return Err(EngineError::invalid_input("empty audio buffer"));
        }

        let wait = self.shared.config.control_lock_wait;
        let mut control = self
            .shared
            .control
            .try_lock_for(wait)
            .ok_or(EngineError::LockTimeout {
                resource: "render control",
                waited: wait,
            })?;

        let activated = if control.worker.is_none() {
            self.activate(&mut control)?;
            true
        } else {
            false
        };

        let stored = self.shared.buffer.write(data, wait);
        drop(control);

        if activated {
            emit(self.events.as_ref(), DeviceEvent::PlaybackStarted);
        }

        let stored = stored?;
        let counters = &self.shared.counters;
        if stored < data.len() {
            let dropped = data.len() - stored;
            counters
                .render_dropped_bytes
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::warn!(dropped, "render buffer full, dropping newest audio");
            emit(
                self.events.as_ref(),
                DeviceEvent::BufferOverflow {
                    buffer: "render",
                    dropped_bytes: dropped,
                },
            );
        }
        Ok(stored)
    }

    /// Amplifier on, channel up, worker spawned. Unwinds on any failure.
    fn activate(&self, control: &mut RenderControl) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.amplifier.power_on();

        if let Err(e) = shared.device.init_render() {
            shared.amplifier.power_off();
            tracing::error!(error = %e, "render channel init failed");
            return Err(e.into());
        }

        let running = Arc::new(AtomicBool::new(true));
        let worker = RenderWorker {
            shared: Arc::clone(shared),
            running: Arc::clone(&running),
            events: self.events.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name("render-worker".to_string())
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                control.worker = Some(RenderWorkerHandle { running, handle });
                control.amplifier = AmplifierState::Active;
                tracing::info!("playback started, amplifier on");
                Ok(())
            }
            Err(source) => {
                shared.device.teardown_render();
                shared.amplifier.power_off();
                tracing::error!(error = %source, "failed to spawn render worker");
                Err(EngineError::SpawnFailed {
                    worker: "render",
                    source,
                })
            }
        }
    }

    /// Stops the worker, powers down and discards queued audio.
    pub fn stop(&self) {
        let mut control = self.shared.control.lock();
        let stopped = match control.worker.take() {
            Some(worker) => {
                worker.running.store(false, Ordering::Release);
                // Bounded: the worker only blocks on deadline-bound calls
                if worker.handle.join().is_err() {
                    tracing::error!("render worker panicked");
                }
                self.shared.power_down(&mut control);
                true
            }
            None => false,
        };
        self.shared.buffer.clear_blocking();
        drop(control);

        if stopped {
            tracing::info!("playback stopped");
            emit(
                self.events.as_ref(),
                DeviceEvent::PlaybackStopped {
                    idle_timeout: false,
                },
            );
        }
    }

    /// Blocks until the worker has exited or `timeout` elapses.
    ///
    /// Returns `true` if the pipeline is idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut control = self.shared.control.lock();
        self.shared
            .idle
            .wait_while_for(&mut control, |c| c.worker.is_some(), timeout);
        control.worker.is_none()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.control.lock().worker.is_some()
    }

    pub fn amplifier_state(&self) -> AmplifierState {
        self.shared.control.lock().amplifier
    }

    pub fn queued(&self) -> usize {
        self.shared
            .buffer
            .len(self.shared.config.worker_lock_wait)
            .unwrap_or(0)
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

//! CPAL-backed audio device for running on a desktop host.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig as CpalStreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::AudioDevice;
use crate::DeviceError;

/// Symmetric i16 max for audio conversion (avoids asymmetric clipping).
const I16_MAX_SYMMETRIC: f32 = i16::MAX as f32;

/// Sleep between polls while a blocking read or write waits for the stream.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A running CPAL stream owned by its own thread.
///
/// CPAL streams are not `Send`, so each channel's stream is built, played
/// and dropped on a dedicated thread that parks until told to stop.
struct StreamThread {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<Stream, DeviceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| DeviceError::backend(e.to_string()))?;
                    Ok(stream)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until stop or until the device handle is gone
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::backend(format!("failed to spawn {name}: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop_tx, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DeviceError::backend(format!("{name} exited during setup")))
            }
        }
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::error!("audio stream thread panicked");
        }
    }
}

struct CaptureChannel {
    stream: StreamThread,
    consumer: HeapCons<u8>,
}

struct RenderChannel {
    stream: StreamThread,
    producer: HeapProd<u8>,
}

/// [`AudioDevice`] backed by the host's default (or named) CPAL devices.
///
/// Both channels open at the configured sample rate, mono. The backend
/// must accept that configuration; most desktop backends resample.
///
/// # Example
///
/// ```ignore
/// use echo_link::CpalDevice;
///
/// let device = CpalDevice::new(16000).with_input("USB Microphone");
/// ```
pub struct CpalDevice {
    sample_rate: u32,
    buffer_bytes: usize,
    input_name: Option<String>,
    output_name: Option<String>,
    capture: Mutex<Option<CaptureChannel>>,
    render: Mutex<Option<RenderChannel>>,
}

impl CpalDevice {
    /// Creates a device using the default input and output at `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            // 500ms of 16-bit mono
            buffer_bytes: sample_rate as usize,
            input_name: None,
            output_name: None,
            capture: Mutex::new(None),
            render: Mutex::new(None),
        }
    }

    /// Uses the input device with the given name instead of the default.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.input_name = Some(name.into());
        self
    }

    /// Uses the output device with the given name instead of the default.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    /// Lists all available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio host cannot be accessed.
    pub fn list_input_devices() -> Result<Vec<String>, DeviceError> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| DeviceError::backend(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn stream_config(&self) -> CpalStreamConfig {
        CpalStreamConfig {
            channels: 1,
            sample_rate: SampleRate(self.sample_rate),
            buffer_size: BufferSize::Default,
        }
    }
}

fn find_input(name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::backend("no default input device")),
        Some(name) => host
            .input_devices()
            .map_err(|e| DeviceError::backend(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| DeviceError::backend(format!("input device not found: {name}"))),
    }
}

fn find_output(name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| DeviceError::backend("no default output device")),
        Some(name) => host
            .output_devices()
            .map_err(|e| DeviceError::backend(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| DeviceError::backend(format!("output device not found: {name}"))),
    }
}

fn build_input(
    name: Option<&str>,
    config: &CpalStreamConfig,
    mut producer: HeapProd<u8>,
) -> Result<Stream, DeviceError> {
    let device = find_input(name)?;
    let format = device
        .default_input_config()
        .map_err(|e| DeviceError::backend(e.to_string()))?
        .sample_format();
    let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "capture stream error");

    let stream = match format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                // Non-blocking push - drops bytes if the engine falls behind
                for sample in data {
                    let _ = producer.push_slice(&sample.to_le_bytes());
                }
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    let converted = (sample * I16_MAX_SYMMETRIC)
                        .clamp(f32::from(i16::MIN), I16_MAX_SYMMETRIC)
                        as i16;
                    let _ = producer.push_slice(&converted.to_le_bytes());
                }
            },
            on_error,
            None,
        ),
        format => {
            return Err(DeviceError::backend(format!(
                "unsupported input sample format {format:?}"
            )))
        }
    };
    stream.map_err(|e| DeviceError::backend(e.to_string()))
}

fn pop_sample(consumer: &mut HeapCons<u8>) -> i16 {
    let mut pair = [0u8; 2];
    if consumer.pop_slice(&mut pair) == 2 {
        i16::from_le_bytes(pair)
    } else {
        0
    }
}

fn build_output(
    name: Option<&str>,
    config: &CpalStreamConfig,
    mut consumer: HeapCons<u8>,
) -> Result<Stream, DeviceError> {
    let device = find_output(name)?;
    let format = device
        .default_output_config()
        .map_err(|e| DeviceError::backend(e.to_string()))?
        .sample_format();
    let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "render stream error");

    let stream = match format {
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for slot in data.iter_mut() {
                    *slot = pop_sample(&mut consumer);
                }
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for slot in data.iter_mut() {
                    *slot = f32::from(pop_sample(&mut consumer)) / I16_MAX_SYMMETRIC;
                }
            },
            on_error,
            None,
        ),
        format => {
            return Err(DeviceError::backend(format!(
                "unsupported output sample format {format:?}"
            )))
        }
    };
    stream.map_err(|e| DeviceError::backend(e.to_string()))
}

impl AudioDevice for CpalDevice {
    fn init_capture(&self) -> Result<(), DeviceError> {
        let mut slot = self.capture.lock();
        if slot.is_some() {
            return Ok(());
        }
        let (producer, consumer) = HeapRb::<u8>::new(self.buffer_bytes).split();
        let name = self.input_name.clone();
        let config = self.stream_config();
        let stream = StreamThread::spawn("cpal-capture", move || {
            build_input(name.as_deref(), &config, producer)
        })?;
        tracing::debug!(sample_rate = self.sample_rate, "capture stream started");
        *slot = Some(CaptureChannel { stream, consumer });
        Ok(())
    }

    fn teardown_capture(&self) {
        if let Some(channel) = self.capture.lock().take() {
            channel.stream.stop();
            tracing::debug!("capture stream stopped");
        }
    }

    fn init_render(&self) -> Result<(), DeviceError> {
        let mut slot = self.render.lock();
        if slot.is_some() {
            return Ok(());
        }
        let (producer, consumer) = HeapRb::<u8>::new(self.buffer_bytes).split();
        let name = self.output_name.clone();
        let config = self.stream_config();
        let stream = StreamThread::spawn("cpal-render", move || {
            build_output(name.as_deref(), &config, consumer)
        })?;
        tracing::debug!(sample_rate = self.sample_rate, "render stream started");
        *slot = Some(RenderChannel { stream, producer });
        Ok(())
    }

    fn teardown_render(&self) {
        if let Some(channel) = self.render.lock().take() {
            channel.stream.stop();
            tracing::debug!("render stream stopped");
        }
    }

    fn read(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, DeviceError> {
        let until = Instant::now() + deadline;
        loop {
            {
                let mut slot = self.capture.lock();
                let channel = slot
                    .as_mut()
                    .ok_or(DeviceError::ChannelNotInitialized { channel: "capture" })?;
                let n = channel.consumer.pop_slice(buf);
                if n > 0 {
                    return Ok(n);
                }
            }
            if Instant::now() >= until {
                return Ok(0);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn write(&self, buf: &[u8], deadline: Duration) -> Result<usize, DeviceError> {
        let until = Instant::now() + deadline;
        let mut written = 0;
        loop {
            {
                let mut slot = self.render.lock();
                let channel = slot
                    .as_mut()
                    .ok_or(DeviceError::ChannelNotInitialized { channel: "render" })?;
                written += channel.producer.push_slice(&buf[written..]);
            }
            if written == buf.len() {
                return Ok(written);
            }
            if Instant::now() >= until {
                if written == 0 {
                    return Err(DeviceError::Timeout(deadline));
                }
                return Ok(written);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.teardown_capture();
        self.teardown_render();
    }
}

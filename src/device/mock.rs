//! Mock device and amplifier for testing without hardware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Amplifier, AudioDevice};
use crate::DeviceError;

/// 16 kHz mono 16-bit PCM is 32 bytes per millisecond.
const REALTIME_BYTES_PER_MS: usize = 32;

/// A hardware call recorded by [`MockDevice`] or [`MockAmplifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCall {
    /// `init_capture` succeeded.
    InitCapture,
    /// `teardown_capture` was called.
    TeardownCapture,
    /// `init_render` succeeded.
    InitRender,
    /// `teardown_render` was called.
    TeardownRender,
    /// The amplifier was powered on.
    PowerOn,
    /// The amplifier was powered off.
    PowerOff,
}

#[derive(Default)]
struct MockState {
    calls: Vec<DeviceCall>,
    capture_input: VecDeque<u8>,
    rendered: Vec<u8>,
    capture_ready: bool,
    render_ready: bool,
    fail_capture_init: bool,
    fail_render_init: bool,
    fail_render_writes: bool,
    failed_writes: usize,
}

/// An in-memory [`AudioDevice`] that records every call.
///
/// Captured audio is whatever the test pushed with
/// [`push_capture`](MockDevice::push_capture); once that runs out, reads wait
/// for their deadline and return 0 like a quiet driver. Rendered audio is
/// recorded and writes are paced at real time (16 kHz mono) so a render
/// worker writing silence does not spin.
///
/// Clones share state, so a test can keep one handle and give another to the
/// engine. [`amplifier()`](MockDevice::amplifier) returns an amplifier that
/// records into the same call log, which makes ordering assertions possible.
///
/// # Example
///
/// ```
/// use echo_link::{AudioDevice, DeviceCall, MockDevice};
/// use std::time::Duration;
///
/// let device = MockDevice::new();
/// device.push_samples(&[100, -100]);
///
/// device.init_capture().unwrap();
/// let mut buf = [0u8; 8];
/// let n = device.read(&mut buf, Duration::from_millis(5)).unwrap();
/// assert_eq!(n, 4);
/// assert_eq!(device.calls(), vec![DeviceCall::InitCapture]);
/// ```
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    bytes_per_ms: usize,
}

impl MockDevice {
    /// Creates a mock device with real-time write pacing.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            bytes_per_ms: REALTIME_BYTES_PER_MS,
        }
    }

    /// Sets the write pacing in bytes per millisecond (minimum 1).
    #[must_use]
    pub fn with_write_rate(mut self, bytes_per_ms: usize) -> Self {
        self.bytes_per_ms = bytes_per_ms.max(1);
        self
    }

    /// Returns an amplifier that records into this device's call log.
    pub fn amplifier(&self) -> MockAmplifier {
        MockAmplifier {
            state: Arc::clone(&self.state),
        }
    }

    /// Queues raw bytes to be returned by capture reads.
    pub fn push_capture(&self, data: &[u8]) {
        self.state.lock().capture_input.extend(data);
    }

    /// Queues 16-bit samples to be returned by capture reads.
    pub fn push_samples(&self, samples: &[i16]) {
        let mut state = self.state.lock();
        for s in samples {
            state.capture_input.extend(s.to_le_bytes());
        }
    }

    /// Returns captured bytes not yet read by the engine.
    pub fn pending_capture(&self) -> usize {
        self.state.lock().capture_input.len()
    }

    /// Makes subsequent `init_capture` calls fail.
    pub fn fail_capture_init(&self, fail: bool) {
        self.state.lock().fail_capture_init = fail;
    }

    /// Makes subsequent `init_render` calls fail.
    pub fn fail_render_init(&self, fail: bool) {
        self.state.lock().fail_render_init = fail;
    }

    /// Makes subsequent `write` calls fail at once.
    pub fn fail_render_writes(&self, fail: bool) {
        self.state.lock().fail_render_writes = fail;
    }

    /// Number of `write` calls that failed.
    pub fn failed_writes(&self) -> usize {
        self.state.lock().failed_writes
    }

    /// Returns the recorded call log.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Counts occurrences of `call` in the log.
    pub fn count(&self, call: DeviceCall) -> usize {
        self.state.lock().calls.iter().filter(|&&c| c == call).count()
    }

    /// Returns every byte written to the render channel, silence included.
    pub fn rendered(&self) -> Vec<u8> {
        self.state.lock().rendered.clone()
    }

    /// Returns `true` while the capture channel is initialized.
    pub fn is_capture_initialized(&self) -> bool {
        self.state.lock().capture_ready
    }

    /// Returns `true` while the render channel is initialized.
    pub fn is_render_initialized(&self) -> bool {
        self.state.lock().render_ready
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockDevice")
            .field("capture_ready", &state.capture_ready)
            .field("render_ready", &state.render_ready)
            .field("pending_capture", &state.capture_input.len())
            .field("rendered", &state.rendered.len())
            .finish()
    }
}

impl AudioDevice for MockDevice {
    fn init_capture(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.fail_capture_init {
            return Err(DeviceError::backend("mock capture init failure"));
        }
        state.capture_ready = true;
        state.calls.push(DeviceCall::InitCapture);
        Ok(())
    }

    fn teardown_capture(&self) {
        let mut state = self.state.lock();
        state.capture_ready = false;
        state.calls.push(DeviceCall::TeardownCapture);
    }

    fn init_render(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.fail_render_init {
            return Err(DeviceError::backend("mock render init failure"));
        }
        state.render_ready = true;
        state.calls.push(DeviceCall::InitRender);
        Ok(())
    }

    fn teardown_render(&self) {
        let mut state = self.state.lock();
        state.render_ready = false;
        state.calls.push(DeviceCall::TeardownRender);
    }

    fn read(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, DeviceError> {
        let n = {
            let mut state = self.state.lock();
            if !state.capture_ready {
                return Err(DeviceError::ChannelNotInitialized { channel: "capture" });
            }
            let n = buf.len().min(state.capture_input.len());
            for (slot, byte) in buf.iter_mut().zip(state.capture_input.drain(..n)) {
                *slot = byte;
            }
            n
        };
        if n == 0 {
            std::thread::sleep(deadline);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], deadline: Duration) -> Result<usize, DeviceError> {
        {
            let mut state = self.state.lock();
            if !state.render_ready {
                state.failed_writes += 1;
                return Err(DeviceError::ChannelNotInitialized { channel: "render" });
            }
            if state.fail_render_writes {
                state.failed_writes += 1;
                return Err(DeviceError::backend("mock render write failure"));
            }
            state.rendered.extend_from_slice(buf);
        }
        let micros = (buf.len() * 1000 / self.bytes_per_ms) as u64;
        std::thread::sleep(Duration::from_micros(micros).min(deadline));
        Ok(buf.len())
    }
}

/// An [`Amplifier`] that records power transitions.
///
/// Obtain one from [`MockDevice::amplifier`] to share the device's call log,
/// or create a standalone one with [`MockAmplifier::new`].
#[derive(Clone)]
pub struct MockAmplifier {
    state: Arc<Mutex<MockState>>,
}

impl MockAmplifier {
    /// Creates an amplifier with its own call log.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Number of `power_on` calls so far.
    pub fn power_on_count(&self) -> usize {
        self.count(DeviceCall::PowerOn)
    }

    /// Number of `power_off` calls so far.
    pub fn power_off_count(&self) -> usize {
        self.count(DeviceCall::PowerOff)
    }

    /// Returns `true` if the last transition was a power-on.
    pub fn is_powered(&self) -> bool {
        self.state
            .lock()
            .calls
            .iter()
            .rev()
            .find(|c| matches!(c, DeviceCall::PowerOn | DeviceCall::PowerOff))
            == Some(&DeviceCall::PowerOn)
    }

    fn count(&self, call: DeviceCall) -> usize {
        self.state.lock().calls.iter().filter(|&&c| c == call).count()
    }
}

impl Default for MockAmplifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockAmplifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAmplifier")
            .field("powered", &self.is_powered())
            .finish()
    }
}

impl Amplifier for MockAmplifier {
    fn power_on(&self) {
        self.state.lock().calls.push(DeviceCall::PowerOn);
    }

    fn power_off(&self) {
        self.state.lock().calls.push(DeviceCall::PowerOff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_requires_init() {
        let device = MockDevice::new();
        let mut buf = [0u8; 4];
        let err = device.read(&mut buf, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ChannelNotInitialized { channel: "capture" }
        ));
    }

    #[test]
    fn test_read_drains_queue_in_order() {
        let device = MockDevice::new();
        device.init_capture().unwrap();
        device.push_capture(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(device.read(&mut buf, Duration::ZERO).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(device.read(&mut buf, Duration::ZERO).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(device.read(&mut buf, Duration::from_millis(1)).unwrap(), 0);
    }

    #[test]
    fn test_write_records_and_paces() {
        let device = MockDevice::new();
        device.init_render().unwrap();

        let start = std::time::Instant::now();
        assert_eq!(device.write(&[7u8; 320], Duration::from_secs(1)).unwrap(), 320);
        // 320 bytes at 32 bytes/ms
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(device.rendered(), vec![7u8; 320]);
    }

    #[test]
    fn test_init_failure_not_logged() {
        let device = MockDevice::new();
        device.fail_render_init(true);
        assert!(device.init_render().is_err());
        assert!(!device.is_render_initialized());
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_shared_call_log_ordering() {
        let device = MockDevice::new();
        let amp = device.amplifier();

        amp.power_on();
        device.init_render().unwrap();
        device.teardown_render();
        amp.power_off();

        assert_eq!(
            device.calls(),
            vec![
                DeviceCall::PowerOn,
                DeviceCall::InitRender,
                DeviceCall::TeardownRender,
                DeviceCall::PowerOff,
            ]
        );
        assert!(!amp.is_powered());
        assert_eq!(amp.power_off_count(), 1);
    }
}

//! Hardware boundary: the audio device adapter and the amplifier switch.
//!
//! The engine never talks to hardware directly. It drives an [`AudioDevice`]
//! (capture and render channels with independent init/teardown and
//! deadline-bounded blocking I/O) and an [`Amplifier`] (speaker power).
//! [`MockDevice`] and [`MockAmplifier`] implement both without hardware;
//! `CpalDevice` (feature `host-audio`) runs on a desktop host.

#[cfg(feature = "host-audio")]
mod cpal_host;
mod mock;

#[cfg(feature = "host-audio")]
pub use cpal_host::CpalDevice;
pub use mock::{DeviceCall, MockAmplifier, MockDevice};

use std::time::Duration;

use crate::DeviceError;

/// Capture and render hardware for 16-bit mono PCM.
///
/// Implementations are shared between the control path and the worker
/// threads, so every method takes `&self`. `read` and `write` must return
/// within roughly `deadline`; the workers rely on that to stop promptly.
pub trait AudioDevice: Send + Sync {
    /// Prepares the capture channel. Called once per capture start.
    fn init_capture(&self) -> Result<(), DeviceError>;

    /// Releases the capture channel. Must tolerate being called when not initialized.
    fn teardown_capture(&self);

    /// Prepares the render channel. Called once per render activation.
    fn init_render(&self) -> Result<(), DeviceError>;

    /// Releases the render channel. Must tolerate being called when not initialized.
    fn teardown_render(&self);

    /// Reads captured PCM bytes into `buf`, blocking at most `deadline`.
    ///
    /// Returns the number of bytes read, which may be 0 on a quiet deadline.
    fn read(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, DeviceError>;

    /// Writes PCM bytes to the speaker, blocking at most `deadline`.
    ///
    /// Returns the number of bytes accepted.
    fn write(&self, buf: &[u8], deadline: Duration) -> Result<usize, DeviceError>;
}

/// Speaker amplifier power switch.
pub trait Amplifier: Send + Sync {
    /// Powers the amplifier up.
    fn power_on(&self);

    /// Powers the amplifier down.
    fn power_off(&self);
}

/// Whether the speaker amplifier is powered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmplifierState {
    /// Powered down.
    #[default]
    Inactive,
    /// Powered up with a render worker running.
    Active,
}

/// An [`Amplifier`] with no hardware that only logs transitions.
///
/// Used on hosts where the sound card has no separate power control.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAmplifier;

impl Amplifier for LoggingAmplifier {
    fn power_on(&self) {
        tracing::debug!("amplifier on");
    }

    fn power_off(&self) {
        tracing::debug!("amplifier off");
    }
}

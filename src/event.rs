//! Runtime events for driving the indicator and monitoring device health.
//!
//! Events are non-fatal notifications. The engine and the transport keep
//! running after an event is emitted; they're for the indicator, logging and
//! metrics, not error handling.

use std::sync::Arc;

use crate::transport::ConnectionStatus;

/// Runtime events emitted by the engine, the transport and the session.
///
/// # Example
///
/// ```
/// use echo_link::{DeviceEvent, IndicatorState};
///
/// fn handle_event(event: DeviceEvent) {
///     match event.indicator_state() {
///         Some(IndicatorState::Error) => eprintln!("device in error: {event:?}"),
///         Some(state) => eprintln!("indicator -> {state:?}"),
///         None => {}
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The capture worker started.
    CaptureStarted,

    /// The capture worker stopped.
    CaptureStopped,

    /// The render worker started and the amplifier is powered.
    PlaybackStarted,

    /// The render worker exited and the amplifier is powered down.
    PlaybackStopped {
        /// `true` if the worker ended on its own idle timeout.
        idle_timeout: bool,
    },

    /// The capture silence detector changed its verdict.
    SilenceChanged {
        /// Whether the input is now considered silent.
        silent: bool,
    },

    /// The transport session changed state.
    ConnectionChanged {
        /// New status.
        status: ConnectionStatus,
    },

    /// The transport gave up reconnecting until it is reset.
    ReconnectBudgetExhausted {
        /// Number of consecutive failed attempts.
        attempts: u32,
    },

    /// A ring buffer was full and the newest bytes were dropped.
    ///
    /// This happens when the consumer side (network uplink or speaker)
    /// falls behind real time.
    BufferOverflow {
        /// Which buffer (`capture` or `render`).
        buffer: &'static str,
        /// Number of bytes that did not fit.
        dropped_bytes: usize,
    },

    /// The server requested a firmware update.
    OtaRequested,
}

/// Visual state the indicator should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorState {
    /// Nothing in progress.
    Idle,
    /// Microphone is recording.
    Listening,
    /// Speaker is playing.
    Playing,
    /// Transport is connecting.
    Connecting,
    /// Transport is connected.
    Connected,
    /// Transport is in its terminal error state.
    Error,
    /// A firmware update is in progress.
    OtaInstalling,
}

impl DeviceEvent {
    /// Returns the indicator state this event maps to, if any.
    ///
    /// Overflow and silence events don't change the indicator.
    pub fn indicator_state(&self) -> Option<IndicatorState> {
        match self {
            Self::CaptureStarted => Some(IndicatorState::Listening),
            Self::PlaybackStarted => Some(IndicatorState::Playing),
            Self::CaptureStopped | Self::PlaybackStopped { .. } => Some(IndicatorState::Idle),
            Self::ConnectionChanged { status } => Some(match status {
                ConnectionStatus::Disconnected => IndicatorState::Idle,
                ConnectionStatus::Connecting => IndicatorState::Connecting,
                ConnectionStatus::Connected => IndicatorState::Connected,
                ConnectionStatus::Error => IndicatorState::Error,
            }),
            Self::ReconnectBudgetExhausted { .. } => Some(IndicatorState::Error),
            Self::OtaRequested => Some(IndicatorState::OtaInstalling),
            Self::SilenceChanged { .. } | Self::BufferOverflow { .. } => None,
        }
    }
}

/// Callback type for receiving runtime events.
///
/// Register one via [`EchoLinkBuilder::on_event()`](crate::EchoLinkBuilder::on_event)
/// or pass it to [`AudioEngine::new`](crate::AudioEngine::new) and
/// [`TransportClientBuilder::event_callback`](crate::TransportClientBuilder::event_callback)
/// directly. It is called from worker threads, so keep it short.
///
/// # Example
///
/// ```ignore
/// use echo_link::EchoLink;
///
/// let session = EchoLink::builder()
///     .device(device)
///     .on_event(|event| {
///         tracing::info!(?event, "device event");
///     })
///     .start()
///     .await?;
/// ```
pub type EventCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use echo_link::{event_callback, DeviceEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// callback(DeviceEvent::OtaRequested);
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(DeviceEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Invokes the callback if one is registered.
pub(crate) fn emit(callback: Option<&EventCallback>, event: DeviceEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_event_debug() {
        let event = DeviceEvent::BufferOverflow {
            buffer: "render",
            dropped_bytes: 100,
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("BufferOverflow"));
        assert!(debug.contains("100"));
    }

    #[test]
    fn test_indicator_mapping() {
        assert_eq!(
            DeviceEvent::CaptureStarted.indicator_state(),
            Some(IndicatorState::Listening)
        );
        assert_eq!(
            DeviceEvent::PlaybackStopped { idle_timeout: true }.indicator_state(),
            Some(IndicatorState::Idle)
        );
        assert_eq!(
            DeviceEvent::ConnectionChanged {
                status: ConnectionStatus::Connecting
            }
            .indicator_state(),
            Some(IndicatorState::Connecting)
        );
        assert_eq!(
            DeviceEvent::ReconnectBudgetExhausted { attempts: 5 }.indicator_state(),
            Some(IndicatorState::Error)
        );
        assert_eq!(
            DeviceEvent::OtaRequested.indicator_state(),
            Some(IndicatorState::OtaInstalling)
        );
        assert_eq!(
            DeviceEvent::SilenceChanged { silent: true }.indicator_state(),
            None
        );
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        emit(Some(&callback), DeviceEvent::OtaRequested);
        assert!(called.load(Ordering::SeqCst));
    }
}

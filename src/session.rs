//! Device session: the background tasks tying the engine to the transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::engine::{AudioEngine, EngineStats};
use crate::transport::TransportClient;
use crate::{MicMode, SessionConfig};

/// Statistics about a running session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Captured bytes sent to the server.
    pub uplink_bytes: u64,
    /// Binary frames sent to the server.
    pub uplink_frames: u64,
    /// Engine counters.
    pub engine: EngineStats,
}

/// Internal state shared between `Session` and its tasks.
pub(crate) struct SessionState {
    pub running: AtomicBool,
    pub mic_debug: AtomicBool,
    pub mic_mode: MicMode,
    pub uplink_bytes: AtomicU64,
    pub uplink_frames: AtomicU64,
}

impl SessionState {
    pub fn new(mic_mode: MicMode, mic_debug: bool) -> Self {
        Self {
            running: AtomicBool::new(true),
            mic_debug: AtomicBool::new(mic_debug),
            mic_mode,
            uplink_bytes: AtomicU64::new(0),
            uplink_frames: AtomicU64::new(0),
        }
    }
}

/// Whether the microphone should be recording.
///
/// Debug mode always records; `always_on` records while connected.
pub(crate) fn should_record(mic_mode: MicMode, mic_debug: bool, connected: bool) -> bool {
    mic_debug || (mic_mode == MicMode::AlwaysOn && connected)
}

/// Starts or stops capture to match the microphone policy.
///
/// Joins or spawns the capture worker, so async callers run it on the
/// blocking pool.
fn apply_policy(engine: &AudioEngine, state: &SessionState, connected: bool) {
    let mic_debug = state.mic_debug.load(Ordering::Relaxed);
    let record = should_record(state.mic_mode, mic_debug, connected);

    if record && !engine.is_capturing() {
        tracing::info!(mode = ?state.mic_mode, mic_debug, "mic policy: starting capture");
        if let Err(e) = engine.start_capture() {
            tracing::error!(error = %e, "mic policy: capture failed to start");
        }
    } else if !record && engine.is_capturing() {
        tracing::info!(mode = ?state.mic_mode, mic_debug, "mic policy: stopping capture");
        engine.stop_capture();
    }

    if mic_debug {
        tracing::info!(
            level = engine.current_audio_level(),
            silent = engine.is_silent(),
            buffered = engine.available_audio(),
            "mic debug"
        );
    }
}

/// Drains captured audio to the server. Returns when the buffer is empty
/// or a send fails.
async fn pump_uplink(
    engine: &AudioEngine,
    transport: &TransportClient,
    state: &SessionState,
    buf: &mut [u8],
) {
    loop {
        let n = match engine.read_audio(buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                tracing::trace!(error = %e, "uplink read skipped");
                return;
            }
        };
        if let Err(e) = transport.send_audio(&buf[..n]).await {
            tracing::debug!(error = %e, dropped = n, "uplink send failed");
            return;
        }
        state.uplink_bytes.fetch_add(n as u64, Ordering::Relaxed);
        state.uplink_frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running device session.
///
/// Returned by [`EchoLinkBuilder::start()`](crate::EchoLinkBuilder::start).
/// Three tasks run until [`stop()`](Session::stop):
///
/// - **maintenance**: drives reconnection and heartbeats
/// - **uplink**: drains captured audio to the server while connected
/// - **policy**: starts and stops capture per the [`MicMode`]
///
/// Dropping the `Session` also stops it, but the close frame is only sent
/// on a best-effort basis. Prefer an explicit `stop()`.
pub struct Session {
    state: Arc<SessionState>,
    engine: Arc<AudioEngine>,
    transport: TransportClient,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Spawns the session tasks.
    pub(crate) fn start(
        config: &SessionConfig,
        mic_mode: MicMode,
        mic_debug: bool,
        engine: Arc<AudioEngine>,
        transport: TransportClient,
    ) -> Self {
        let state = Arc::new(SessionState::new(mic_mode, mic_debug));
        let (shutdown, _) = watch::channel(false);

        let maintenance = {
            let transport = transport.clone();
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(config.maintenance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = ticker.tick() => transport.update().await,
                    }
                }
                tracing::debug!("maintenance task stopped");
            })
        };

        let uplink = {
            let transport = transport.clone();
            let engine = Arc::clone(&engine);
            let state = Arc::clone(&state);
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(config.uplink_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut buf = vec![0u8; engine.config().hardware_chunk_bytes.max(1)];
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = ticker.tick() => {
                            if transport.is_connected() && engine.is_capturing() {
                                pump_uplink(&engine, &transport, &state, &mut buf).await;
                            }
                        }
                    }
                }
                tracing::debug!("uplink task stopped");
            })
        };

        let policy = {
            let transport = transport.clone();
            let engine = Arc::clone(&engine);
            let state = Arc::clone(&state);
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(config.policy_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = ticker.tick() => {
                            let connected = transport.is_connected();
                            let engine = Arc::clone(&engine);
                            let state = Arc::clone(&state);
                            let applied = tokio::task::spawn_blocking(move || {
                                apply_policy(&engine, &state, connected);
                            })
                            .await;
                            if let Err(e) = applied {
                                tracing::error!(error = %e, "mic policy task failed");
                            }
                        }
                    }
                }
                tracing::debug!("policy task stopped");
            })
        };

        tracing::info!(?mic_mode, mic_debug, "session started");
        Self {
            state,
            engine,
            transport,
            shutdown,
            tasks: vec![maintenance, uplink, policy],
        }
    }

    /// Returns `true` until the session is stopped.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// The audio engine driven by this session.
    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    /// The transport client driven by this session.
    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    /// Enables or disables mic debug mode and re-applies the policy at once.
    ///
    /// Starting or stopping capture waits for the capture worker; from async
    /// code prefer calling this inside `spawn_blocking`.
    pub fn set_mic_debug(&self, enabled: bool) {
        self.state.mic_debug.store(enabled, Ordering::Relaxed);
        apply_policy(&self.engine, &self.state, self.transport.is_connected());
    }

    /// Returns `true` while mic debug mode is on.
    pub fn mic_debug(&self) -> bool {
        self.state.mic_debug.load(Ordering::Relaxed)
    }

    /// Returns current session statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            uplink_bytes: self.state.uplink_bytes.load(Ordering::Relaxed),
            uplink_frames: self.state.uplink_frames.load(Ordering::Relaxed),
            engine: self.engine.stats(),
        }
    }

    /// Stops the tasks, both pipelines and the connection.
    pub async fn stop(mut self) {
        self.stop_internal().await;
    }

    async fn stop_internal(&mut self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        for handle in self.tasks.drain(..) {
            let _ = handle.await;
        }

        let engine = Arc::clone(&self.engine);
        let stopped = tokio::task::spawn_blocking(move || {
            engine.stop_capture();
            engine.stop_playback();
        })
        .await;
        if let Err(e) = stopped {
            tracing::error!(error = %e, "engine shutdown task failed");
        }
        self.transport.disconnect().await;
        tracing::info!("session stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropped without stop(): tear down what can be torn down synchronously
        let _ = self.shutdown.send(true);
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
        let engine = Arc::clone(&self.engine);
        let teardown = move || {
            engine.stop_capture();
            engine.stop_playback();
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn_blocking(teardown);
            let transport = self.transport.clone();
            runtime.spawn(async move { transport.disconnect().await });
        } else {
            teardown();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("running", &self.is_running())
            .field("mic_mode", &self.state.mic_mode)
            .field("mic_debug", &self.mic_debug())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use crate::{EngineConfig, TransportConfig};

    fn engine(device: &MockDevice) -> AudioEngine {
        AudioEngine::new(
            EngineConfig::default(),
            Arc::new(device.clone()),
            Arc::new(device.amplifier()),
            None,
        )
    }

    #[test]
    fn test_should_record() {
        use MicMode::{AlwaysOn, OnButtonPress};
        assert!(should_record(AlwaysOn, false, true));
        assert!(!should_record(AlwaysOn, false, false));
        assert!(!should_record(OnButtonPress, false, true));
        assert!(should_record(OnButtonPress, true, false));
        assert!(should_record(AlwaysOn, true, false));
    }

    #[test]
    fn test_policy_starts_and_stops_capture() {
        let device = MockDevice::new();
        let engine = engine(&device);
        let state = SessionState::new(MicMode::AlwaysOn, false);

        apply_policy(&engine, &state, true);
        assert!(engine.is_capturing());

        apply_policy(&engine, &state, false);
        assert!(!engine.is_capturing());
    }

    #[test]
    fn test_policy_debug_mode_records_offline() {
        let device = MockDevice::new();
        let engine = engine(&device);
        let state = SessionState::new(MicMode::OnButtonPress, true);

        apply_policy(&engine, &state, false);
        assert!(engine.is_capturing());

        state.mic_debug.store(false, Ordering::Relaxed);
        apply_policy(&engine, &state, false);
        assert!(!engine.is_capturing());
    }

    #[tokio::test]
    async fn test_stop_tears_down_engine() {
        let device = MockDevice::new();
        let engine = Arc::new(engine(&device));
        let transport = TransportClient::builder(TransportConfig {
            auto_reconnect: false,
            ..Default::default()
        })
        .build();

        let session = Session::start(
            &SessionConfig::default(),
            MicMode::OnButtonPress,
            true,
            Arc::clone(&engine),
            transport,
        );
        session.set_mic_debug(true);
        assert!(engine.is_capturing());
        assert!(session.is_running());

        session.stop().await;
        assert!(!engine.is_capturing());
        assert!(!device.is_capture_initialized());
    }

    #[test]
    fn test_session_stats_default() {
        let stats = SessionStats::default();
        assert_eq!(stats.uplink_bytes, 0);
        assert_eq!(stats.uplink_frames, 0);
        assert_eq!(stats.engine, EngineStats::default());
    }
}

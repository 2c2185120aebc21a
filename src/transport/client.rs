//! Reconnecting transport client.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};

use super::dispatch::{ControlHandler, Dispatcher, LoggingHandler, PlaybackSink};
use super::frame::{FrameDecoder, FrameEncoder, Message, Opcode};
use super::handshake;
use super::message::{Capabilities, OutboundMessage};
use super::session::{ConnectionStatus, SessionState, TransportSession};
use crate::event::{emit, DeviceEvent, EventCallback};
use crate::{TransportConfig, TransportError};

/// Normal closure status code.
const CLOSE_NORMAL: u16 = 1000;

/// Read buffer size for the inbound stream.
const READ_CHUNK: usize = 4096;

/// A bidirectional byte stream the client can run the protocol over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed stream returned by a [`Connector`].
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens raw streams to the server.
///
/// The default is [`TcpConnector`]. Tests substitute in-memory streams.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a stream to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// [`Connector`] opening plain TCP connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

type Writer = WriteHalf<BoxedStream>;

/// Writes and flushes `frame`, giving up after `deadline`.
async fn write_within<W>(
    stream: &mut W,
    frame: &[u8],
    deadline: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(frame).await?;
        stream.flush().await
    };
    match timeout(deadline, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::SendTimeout(deadline)),
    }
}

struct ClientInner {
    config: Mutex<TransportConfig>,
    state: Mutex<SessionState>,
    /// Outbound half; `None` while not connected.
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    events: Option<EventCallback>,
    started: Instant,
}

impl ClientInner {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn encoder(&self) -> FrameEncoder {
        FrameEncoder::new(self.config.lock().mask_outbound)
    }

    /// Sets the status, emitting an event if it changed.
    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.status != status;
            state.status = status;
            changed
        };
        if changed {
            tracing::debug!(?status, "transport status changed");
            emit(self.events.as_ref(), DeviceEvent::ConnectionChanged { status });
        }
    }

    fn touch(&self) {
        self.state.lock().last_activity = Some(Instant::now());
    }

    fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    /// Marks the connection of `generation` as lost, if it is still current.
    ///
    /// The caller holds the writer lock, which orders this against a
    /// concurrent connect installing a new writer.
    fn lose_connection(
        &self,
        writer: &mut Option<Writer>,
        generation: u64,
        reason: &str,
        from_reader: bool,
    ) {
        {
            let state = self.state.lock();
            if state.generation != generation || state.status != ConnectionStatus::Connected {
                return;
            }
        }
        *writer = None;
        if from_reader {
            // Detach; the reader is exiting on its own
            self.reader.lock().take();
        } else {
            self.abort_reader();
        }
        tracing::warn!(reason, "connection lost");
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Writes one frame. Requires `Connected`; a failed or late write
    /// disconnects.
    async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), TransportError> {
        if self.state.lock().status != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let frame = self.encoder().encode(opcode, payload);
        let (lock_wait, send_timeout) = {
            let config = self.config.lock();
            (config.send_lock_wait, config.send_timeout)
        };

        let mut writer = timeout(lock_wait, self.writer.lock())
            .await
            .map_err(|_| TransportError::Busy)?;
        // Read under the writer lock so it names the installed stream
        let generation = self.state.lock().generation;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        match write_within(stream, &frame, send_timeout).await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    TransportError::SendTimeout(_) => "send timed out",
                    _ => "send failed",
                };
                self.lose_connection(&mut writer, generation, reason, false);
                // A partial frame leaves the stream unusable either way
                *writer = None;
                Err(e)
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

/// Reads frames until the stream ends, dispatching each message.
async fn read_loop(
    inner: Arc<ClientInner>,
    generation: u64,
    mut reader: ReadHalf<BoxedStream>,
    mut decoder: FrameDecoder,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let reason = 'outer: loop {
        loop {
            let message = match decoder.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "protocol violation");
                    break 'outer "protocol violation";
                }
            };
            inner.touch();
            match message {
                Message::Text(text) => {
                    inner.dispatcher.dispatch_text(&text).await;
                }
                Message::Binary(data) => inner.dispatcher.dispatch_binary(data).await,
                Message::Ping(payload) => {
                    if let Err(e) = inner.send_frame(Opcode::Pong, &payload).await {
                        tracing::debug!(error = %e, "pong not sent");
                    }
                }
                Message::Pong(_) => tracing::trace!("pong"),
                Message::Close(code) => {
                    tracing::info!(?code, "server closed connection");
                    let _ = inner
                        .send_frame(Opcode::Close, &CLOSE_NORMAL.to_be_bytes())
                        .await;
                    break 'outer "closed by server";
                }
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => break "end of stream",
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "read failed");
                break "read failed";
            }
        }
    };

    let mut writer = inner.writer.lock().await;
    inner.lose_connection(&mut writer, generation, reason, true);
}

/// Builder for [`TransportClient`].
#[must_use]
pub struct TransportClientBuilder {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    control: Arc<dyn ControlHandler>,
    playback: Option<Arc<dyn PlaybackSink>>,
    events: Option<EventCallback>,
}

impl TransportClientBuilder {
    /// Uses a custom connector instead of TCP.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Sets the receiver for `command`, `config` and `ota` messages.
    ///
    /// Default: [`LoggingHandler`].
    pub fn control_handler(mut self, handler: Arc<dyn ControlHandler>) -> Self {
        self.control = handler;
        self
    }

    /// Sets where inbound binary audio goes.
    pub fn playback(mut self, sink: Arc<dyn PlaybackSink>) -> Self {
        self.playback = Some(sink);
        self
    }

    /// Sets the event callback.
    pub fn event_callback(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self
    }

    /// Builds a disconnected client.
    pub fn build(self) -> TransportClient {
        let state = SessionState::new(
            self.config.host.clone(),
            self.config.port,
            self.config.client_id.clone(),
            self.config.auto_reconnect,
        );
        TransportClient {
            inner: Arc::new(ClientInner {
                config: Mutex::new(self.config),
                state: Mutex::new(state),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                connector: self.connector,
                dispatcher: Dispatcher::new(self.control, self.playback, self.events.clone()),
                events: self.events,
                started: Instant::now(),
            }),
        }
    }
}

/// Client for the framed, reconnecting server connection.
///
/// Cloning is cheap; clones share the connection. Automatic reconnection
/// and heartbeats are driven by calling [`update()`](Self::update)
/// periodically (the device [`Session`](crate::Session) does this).
///
/// # Example
///
/// ```no_run
/// use echo_link::{TransportClient, TransportConfig};
///
/// # async fn run() -> Result<(), echo_link::TransportError> {
/// let client = TransportClient::builder(TransportConfig::default()).build();
/// client.connect("192.168.1.100", 8080).await?;
/// client.send_event("button_pressed").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

impl TransportClient {
    /// Creates a builder with TCP and a logging control handler.
    pub fn builder(config: TransportConfig) -> TransportClientBuilder {
        TransportClientBuilder {
            config,
            connector: Arc::new(TcpConnector),
            control: Arc::new(LoggingHandler),
            playback: None,
            events: None,
        }
    }

    /// Connects to `host:port`, replacing any current connection.
    ///
    /// On success the identification message has been sent as the first
    /// frame and the status is `Connected`. On failure the status returns
    /// to `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns the I/O, timeout or handshake error that ended the attempt.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), TransportError> {
        if host.trim().is_empty() {
            return Err(TransportError::invalid_input("empty host"));
        }
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let generation = {
            let mut state = inner.state.lock();
            state.generation += 1;
            state.host = host.to_string();
            state.port = port;
            state.last_attempt = Some(Instant::now());
            state.generation
        };
        self.drop_stream().await;
        inner.set_status(ConnectionStatus::Connecting);
        tracing::info!(host, port, "connecting");

        match self.establish(host, port, generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(host, port, error = %e, "connection attempt failed");
                inner.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self, host: &str, port: u16, generation: u64) -> Result<(), TransportError> {
        let inner = &self.inner;
        let config = inner.config.lock().clone();

        let mut stream = timeout(config.handshake_timeout, inner.connector.connect(host, port))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(config.handshake_timeout))??;
        let leftover =
            handshake::perform(&mut stream, host, port, &config.path, config.handshake_timeout)
                .await?;

        let client_id = inner.state.lock().client_id.clone();
        let identification = OutboundMessage::Identification {
            client_id,
            capabilities: Capabilities::default(),
            version: config.version.clone(),
            timestamp: inner.elapsed_ms(),
        }
        .to_json()?;

        let (read_half, mut write_half) = tokio::io::split(stream);
        let frame = inner.encoder().encode(Opcode::Text, identification.as_bytes());
        write_within(&mut write_half, &frame, config.send_timeout).await?;

        let mut writer = inner.writer.lock().await;
        {
            let mut state = inner.state.lock();
            if state.generation != generation {
                // Superseded by a disconnect while handshaking
                return Err(TransportError::NotConnected);
            }
            let now = Instant::now();
            state.reconnect_attempts = 0;
            state.last_activity = Some(now);
            state.last_heartbeat = Some(now);
        }
        *writer = Some(write_half);
        inner.set_status(ConnectionStatus::Connected);

        let mut decoder = FrameDecoder::new(config.max_frame_payload);
        decoder.extend(&leftover);
        let handle = tokio::spawn(read_loop(
            Arc::clone(inner),
            generation,
            read_half,
            decoder,
        ));
        *inner.reader.lock() = Some(handle);
        drop(writer);

        tracing::info!(host, port, "connected");
        Ok(())
    }

    /// Drops the current stream and reader without touching the status.
    async fn drop_stream(&self) {
        self.inner.abort_reader();
        let deadline = self.inner.config.lock().send_timeout;
        let Ok(mut writer) = timeout(deadline, self.inner.writer.lock()).await else {
            // The sender holding it clears the stream when its write fails
            return;
        };
        if let Some(mut stream) = writer.take() {
            let _ = timeout(deadline, stream.shutdown()).await;
        }
    }

    /// Drives reconnection and heartbeats. Call periodically.
    ///
    /// While `Disconnected` with auto-reconnect on, starts an attempt at most
    /// once per reconnect interval. After the configured number of
    /// consecutive failures the status becomes `Error` and attempts stop
    /// until [`reset()`](Self::reset). While `Connected`, sends a heartbeat
    /// once per heartbeat interval.
    pub async fn update(&self) {
        let inner = &self.inner;
        let config = inner.config.lock().clone();
        let now = Instant::now();

        let reconnect = {
            let mut state = inner.state.lock();
            if state.reconnect_due(now, config.reconnect_interval) {
                state.reconnect_attempts += 1;
                Some((state.host.clone(), state.port, state.reconnect_attempts))
            } else {
                None
            }
        };

        if let Some((host, port, attempt)) = reconnect {
            tracing::info!(attempt, max = config.max_reconnect_attempts, "reconnecting");
            if self.connect(&host, port).await.is_err() && attempt >= config.max_reconnect_attempts
            {
                tracing::error!(attempts = attempt, "reconnect budget exhausted");
                inner.set_status(ConnectionStatus::Error);
                emit(
                    inner.events.as_ref(),
                    DeviceEvent::ReconnectBudgetExhausted { attempts: attempt },
                );
            }
            return;
        }

        let heartbeat_due = inner
            .state
            .lock()
            .heartbeat_due(now, config.heartbeat_interval);
        if heartbeat_due {
            match self.send_heartbeat().await {
                Ok(()) => inner.state.lock().last_heartbeat = Some(now),
                Err(e) => tracing::warn!(error = %e, "heartbeat not sent"),
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<(), TransportError> {
        let client_id = self.inner.state.lock().client_id.clone();
        let message = OutboundMessage::Heartbeat {
            client_id,
            timestamp: self.inner.elapsed_ms(),
        };
        self.send_message(&message.to_json()?).await
    }

    /// Sends raw PCM bytes as one binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidInput`] for empty data,
    /// [`TransportError::NotConnected`] unless connected,
    /// [`TransportError::Busy`] if another send holds the stream,
    /// [`TransportError::SendTimeout`] if the peer stops reading, or the
    /// I/O error. The last two also disconnect.
    pub async fn send_audio(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return Err(TransportError::invalid_input("empty audio payload"));
        }
        self.inner.send_frame(Opcode::Binary, data).await
    }

    /// Sends a text message as one text frame.
    ///
    /// # Errors
    ///
    /// Same as [`send_audio`](Self::send_audio).
    pub async fn send_message(&self, text: &str) -> Result<(), TransportError> {
        if text.is_empty() {
            return Err(TransportError::invalid_input("empty message"));
        }
        self.inner.send_frame(Opcode::Text, text.as_bytes()).await
    }

    /// Sends an `event` message with the given name.
    ///
    /// # Errors
    ///
    /// Same as [`send_audio`](Self::send_audio).
    pub async fn send_event(&self, event: &str) -> Result<(), TransportError> {
        if event.is_empty() {
            return Err(TransportError::invalid_input("empty event name"));
        }
        let client_id = self.inner.state.lock().client_id.clone();
        let message = OutboundMessage::Event {
            event: event.to_string(),
            client_id,
            timestamp: self.inner.elapsed_ms(),
        };
        self.send_message(&message.to_json()?).await
    }

    /// Closes the connection (best-effort close frame) and resets the attempt counter.
    ///
    /// Automatic reconnection stays enabled; the next [`update()`](Self::update)
    /// after the reconnect interval will try again.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let was_connected = {
            let mut state = inner.state.lock();
            state.generation += 1;
            state.reconnect_attempts = 0;
            state.status == ConnectionStatus::Connected
        };
        inner.abort_reader();

        let deadline = inner.config.lock().send_timeout;
        match timeout(deadline, inner.writer.lock()).await {
            Ok(mut writer) => {
                if let (Some(mut stream), true) = (writer.take(), was_connected) {
                    let frame = inner
                        .encoder()
                        .encode(Opcode::Close, &CLOSE_NORMAL.to_be_bytes());
                    let _ = timeout(deadline, async {
                        stream.write_all(&frame).await?;
                        stream.shutdown().await
                    })
                    .await;
                }
            }
            Err(_) => tracing::warn!("outbound stream busy, closing without close frame"),
        }

        if inner.state.lock().status != ConnectionStatus::Error {
            inner.set_status(ConnectionStatus::Disconnected);
        }
        if was_connected {
            tracing::info!("disconnected");
        }
    }

    /// Disconnects and leaves the `Error` state, making the next
    /// [`update()`](Self::update) attempt immediately.
    pub async fn reset(&self) {
        self.disconnect().await;
        {
            let mut state = self.inner.state.lock();
            state.reconnect_attempts = 0;
            state.last_attempt = None;
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
        tracing::debug!("transport reset");
    }

    /// Sets the server used by the next connection attempt.
    pub fn set_server(&self, host: impl Into<String>, port: u16) {
        let mut state = self.inner.state.lock();
        state.host = host.into();
        state.port = port;
    }

    /// Sets the identifier sent in outbound messages.
    pub fn set_client_id(&self, client_id: impl Into<String>) {
        self.inner.state.lock().client_id = client_id.into();
    }

    /// Enables or disables automatic reconnection.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.config.lock().auto_reconnect = enabled;
        self.inner.state.lock().auto_reconnect = enabled;
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Returns `true` while connected.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Returns a snapshot of the session record.
    pub fn session(&self) -> TransportSession {
        self.inner.state.lock().snapshot()
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("session", &self.session())
            .finish_non_exhaustive()
    }
}

//! OpenAI realtime transcription session.
//!
//! A long-lived WebSocket session against the Realtime API's transcription
//! intent. µ-law audio is pushed in as it arrives from the phone; the
//! server's VAD commits an utterance after the configured silence window
//! and the final transcript is handed to whichever caller is waiting.
//!
//! # Thread Safety
//!
//! All mutable state lives behind `Arc` so the session can be shared
//! between the media socket handler (pushing audio) and the call turn loop
//! (waiting for transcripts) while a spawned task owns the connection.
//!
//! # Automatic Reconnection
//!
//! If the connection drops before `close()` is called, the session
//! reconnects with exponential backoff (1 s base, doubling, five attempts)
//! and re-sends its configuration. An intentional close sets a flag that
//! suppresses reconnection so shutdown does not race the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, trace, warn};

use super::messages::{
    ClientEvent, InputAudioTranscription, ServerEvent, TranscriptionSessionConfig, TurnDetection,
};
use crate::core::stt::base::{
    PartialTranscriptCallback, ReconnectConfig, SttError, SttResult, SttSession,
    SttSessionFactory, VadConfig,
};

/// Realtime API endpoint for transcription sessions.
pub const OPENAI_REALTIME_STT_URL: &str = "wss://api.openai.com/v1/realtime?intent=transcription";

/// Channel capacity for outgoing WebSocket events.
const WS_CHANNEL_CAPACITY: usize = 256;

/// OpenAI transcription session configuration.
#[derive(Debug, Clone)]
pub struct OpenAiSttConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Transcription model.
    pub model: String,
    /// Server-side VAD tuning.
    pub vad: VadConfig,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// WebSocket URL override, primarily for tests.
    pub ws_url: String,
    /// Bound on the initial connect handshake.
    pub connect_timeout: Duration,
}

impl OpenAiSttConfig {
    pub fn new(api_key: String, vad: VadConfig) -> Self {
        Self {
            api_key,
            model: "gpt-4o-transcribe".to_string(),
            vad,
            reconnect: ReconnectConfig::default(),
            ws_url: OPENAI_REALTIME_STT_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// OpenAI realtime transcription session.
pub struct OpenAiSttSession {
    config: OpenAiSttConfig,
    /// Connected flag shared with the connection task.
    connected: Arc<AtomicBool>,
    /// Set by `close()` to suppress reconnection.
    intentional_close: Arc<AtomicBool>,
    /// Sender half of the outgoing event channel.
    ws_sender: Arc<Mutex<Option<mpsc::Sender<ClientEvent>>>>,
    /// Single-shot waiter for the next final transcript.
    waiter: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    /// Optional partial-transcript callback.
    partial_callback: Arc<Mutex<Option<PartialTranscriptCallback>>>,
    /// Connection task handle.
    connection_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl OpenAiSttSession {
    pub fn new(config: OpenAiSttConfig) -> Self {
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            intentional_close: Arc::new(AtomicBool::new(false)),
            ws_sender: Arc::new(Mutex::new(None)),
            waiter: Arc::new(Mutex::new(None)),
            partial_callback: Arc::new(Mutex::new(None)),
            connection_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Build the WebSocket upgrade request with auth headers.
    fn build_ws_request(config: &OpenAiSttConfig) -> SttResult<http::Request<()>> {
        let url = url::Url::parse(&config.ws_url)
            .map_err(|e| SttError::Configuration(format!("bad WebSocket URL: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| SttError::Configuration("WebSocket URL has no host".to_string()))?
            .to_string();

        http::Request::builder()
            .uri(config.ws_url.as_str())
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host)
            .body(())
            .map_err(|e| SttError::ConnectionFailed(e.to_string()))
    }

    /// Session configuration sent on connect and after every reconnect.
    fn session_config(config: &OpenAiSttConfig) -> TranscriptionSessionConfig {
        TranscriptionSessionConfig {
            input_audio_format: "g711_ulaw".to_string(),
            input_audio_transcription: InputAudioTranscription {
                model: config.model.clone(),
            },
            turn_detection: TurnDetection::ServerVad {
                threshold: config.vad.threshold,
                prefix_padding_ms: config.vad.prefix_padding_ms,
                silence_duration_ms: config.vad.silence_duration_ms,
            },
        }
    }

    /// Dispatch one server event to the waiter / partial callback.
    async fn handle_server_event(
        event: ServerEvent,
        waiter: &Arc<Mutex<Option<oneshot::Sender<String>>>>,
        partial_callback: &Arc<Mutex<Option<PartialTranscriptCallback>>>,
    ) {
        match event {
            ServerEvent::SessionCreated { session } => {
                info!(session_id = ?session.id, "transcription session created");
            }
            ServerEvent::SessionUpdated => {
                debug!("transcription session configuration acknowledged");
            }
            ServerEvent::SpeechStarted { audio_start_ms } => {
                debug!(audio_start_ms, "speech started");
            }
            ServerEvent::SpeechStopped { audio_end_ms } => {
                debug!(audio_end_ms, "speech stopped");
            }
            ServerEvent::TranscriptionDelta { delta, .. } => {
                if let Some(cb) = partial_callback.lock().await.as_ref() {
                    cb(delta);
                }
            }
            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                match waiter.lock().await.take() {
                    Some(tx) => {
                        if tx.send(transcript).is_err() {
                            debug!("transcript waiter gone before delivery");
                        }
                    }
                    None => {
                        debug!(%transcript, "final transcript arrived with no waiter");
                    }
                }
            }
            ServerEvent::Error { error } => {
                error!(
                    error_type = ?error.error_type,
                    message = ?error.message,
                    "transcription server error"
                );
            }
            ServerEvent::Unknown => {
                trace!("unhandled transcription server event");
            }
        }
    }
}

#[async_trait]
impl SttSession for OpenAiSttSession {
    async fn connect(&self) -> SttResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.intentional_close.store(false, Ordering::SeqCst);

        let request = Self::build_ws_request(&self.config)?;
        let (ws_stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, async {
                tokio_tungstenite::connect_async(request).await
            })
            .await
            .map_err(|_| SttError::ConnectionFailed("connect timed out".to_string()))?
            .map_err(|e| SttError::ConnectionFailed(e.to_string()))?;

        info!("connected to transcription service");

        let (ws_sink, ws_source) = ws_stream.split();

        let (tx, rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        *self.ws_sender.lock().await = Some(tx);

        let waiter = self.waiter.clone();
        let partial_callback = self.partial_callback.clone();
        let connected = self.connected.clone();
        let intentional_close = self.intentional_close.clone();
        let ws_sender = self.ws_sender.clone();
        let config = self.config.clone();

        self.connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(connection_task(
            ws_sink,
            ws_source,
            rx,
            waiter,
            partial_callback,
            connected,
            intentional_close,
            ws_sender,
            config,
        ));
        *self.connection_handle.lock().await = Some(handle);

        Ok(())
    }

    async fn send_audio(&self, mulaw: Bytes) {
        if !self.connected.load(Ordering::SeqCst) {
            trace!(bytes = mulaw.len(), "dropping audio, session not connected");
            return;
        }
        let event = ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(&mulaw),
        };
        if let Some(tx) = self.ws_sender.lock().await.as_ref()
            && tx.send(event).await.is_err()
        {
            debug!("dropping audio, connection task gone");
        }
    }

    async fn wait_for_transcript(&self, timeout: Duration) -> SttResult<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.waiter.lock().await;
            if slot.is_some() {
                warn!("replacing a pending transcript waiter");
            }
            *slot = Some(tx);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(transcript)) => Ok(transcript),
            // Sender dropped without a value: the session was closed.
            Ok(Err(_)) => Err(SttError::Closed),
            Err(_) => {
                self.waiter.lock().await.take();
                Err(SttError::Timeout)
            }
        }
    }

    async fn on_partial(&self, callback: PartialTranscriptCallback) {
        *self.partial_callback.lock().await = Some(callback);
    }

    async fn close(&self) {
        if self.intentional_close.swap(true, Ordering::SeqCst) {
            return;
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.ws_sender.lock().await = None;

        if let Some(handle) = self.connection_handle.lock().await.take() {
            handle.abort();
        }

        // Dropping the sender rejects any pending waiter with `Closed`.
        self.waiter.lock().await.take();

        info!("transcription session closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

/// Connection task: pumps events in both directions and reconnects with
/// backoff until the close is intentional or attempts are exhausted.
#[allow(clippy::too_many_arguments)]
async fn connection_task(
    mut ws_sink: WsSink,
    mut ws_source: WsSource,
    mut rx: mpsc::Receiver<ClientEvent>,
    waiter: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    partial_callback: Arc<Mutex<Option<PartialTranscriptCallback>>>,
    connected: Arc<AtomicBool>,
    intentional_close: Arc<AtomicBool>,
    ws_sender: Arc<Mutex<Option<mpsc::Sender<ClientEvent>>>>,
    config: OpenAiSttConfig,
) {
    let mut reconnect_attempt: u32 = 0;

    'outer: loop {
        // (Re)configure the session on every fresh connection.
        let session_update = ClientEvent::SessionUpdate {
            session: OpenAiSttSession::session_config(&config),
        };
        match serde_json::to_string(&session_update) {
            Ok(json) => {
                if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                    warn!("failed to send session configuration: {e}");
                }
            }
            Err(e) => error!("failed to serialize session configuration: {e}"),
        }

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            error!("failed to serialize client event: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                        warn!("failed to send WebSocket message: {e}");
                        break;
                    }
                }

                Some(msg) = ws_source.next() => {
                    match msg {
                        Ok(Message::Text(text)) => {
                            reconnect_attempt = 0;
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    OpenAiSttSession::handle_server_event(
                                        event,
                                        &waiter,
                                        &partial_callback,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    warn!("unparseable server event: {e}");
                                }
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!("transcription WebSocket closed by server");
                            break;
                        }
                        Ok(Message::Ping(data)) => {
                            if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                warn!("failed to send pong: {e}");
                            }
                        }
                        Err(e) => {
                            warn!("transcription WebSocket error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                else => break,
            }
        }

        connected.store(false, Ordering::SeqCst);

        if intentional_close.load(Ordering::SeqCst) {
            debug!("intentional close, not reconnecting");
            break 'outer;
        }

        // Reconnect with exponential backoff.
        loop {
            if !config.reconnect.should_retry(reconnect_attempt) {
                error!(
                    attempts = reconnect_attempt,
                    "transcription reconnect attempts exhausted"
                );
                break 'outer;
            }
            reconnect_attempt += 1;

            let delay = config.reconnect.calculate_delay(reconnect_attempt);
            info!(
                attempt = reconnect_attempt,
                max = config.reconnect.max_attempts,
                ?delay,
                "reconnecting transcription session"
            );
            tokio::time::sleep(delay).await;

            if intentional_close.load(Ordering::SeqCst) {
                debug!("close requested during reconnect delay");
                break 'outer;
            }

            let request = match OpenAiSttSession::build_ws_request(&config) {
                Ok(req) => req,
                Err(e) => {
                    error!("failed to build reconnect request: {e}");
                    continue;
                }
            };

            match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _)) => {
                    info!("transcription session reconnected");
                    let (sink, source) = stream.split();
                    ws_sink = sink;
                    ws_source = source;
                    connected.store(true, Ordering::SeqCst);
                    continue 'outer;
                }
                Err(e) => {
                    warn!(attempt = reconnect_attempt, "reconnect failed: {e}");
                }
            }
        }
    }

    *ws_sender.lock().await = None;
    debug!("transcription connection task ended");
}

/// Factory that mints one transcription session per call.
pub struct OpenAiSttFactory {
    config: OpenAiSttConfig,
}

impl OpenAiSttFactory {
    pub fn new(config: OpenAiSttConfig) -> Self {
        Self { config }
    }
}

impl SttSessionFactory for OpenAiSttFactory {
    fn create(&self) -> SttResult<Arc<dyn SttSession>> {
        if self.config.api_key.is_empty() {
            return Err(SttError::Configuration(
                "OpenAI API key is required for transcription".to_string(),
            ));
        }
        Ok(Arc::new(OpenAiSttSession::new(self.config.clone())))
    }
}

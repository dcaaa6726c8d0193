//! Mock capability backends for end-to-end tests.
//!
//! The telephony, TTS, and STT capabilities are replaced with
//! deterministic fakes; everything else (router, registry, call manager,
//! media socket plumbing) is the real thing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{Mutex, oneshot};

use voicebridge::core::call::{CallManager, CallRegistry, TurnTiming};
use voicebridge::core::stt::{
    PartialTranscriptCallback, SttError, SttResult, SttSession, SttSessionFactory,
};
use voicebridge::core::telephony::{TelephonyProvider, TelephonyResult, connect_document};
use voicebridge::core::tts::{AudioStream, BaseTts, TtsResult};
use voicebridge::{AppState, ServerConfig};

/// µ-law the mock STT must see before it commits a transcript, matching
/// a second and a half of telephone audio.
pub const STT_COMMIT_THRESHOLD_BYTES: usize = 3200;

// =============================================================================
// Telephony
// =============================================================================

pub struct MockTelephony {
    placed: AtomicUsize,
    pub hangups: AtomicUsize,
}

impl MockTelephony {
    pub fn new() -> Self {
        Self {
            placed: AtomicUsize::new(0),
            hangups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TelephonyProvider for MockTelephony {
    async fn place_call(
        &self,
        _to: &str,
        _from: &str,
        _webhook_url: &str,
    ) -> TelephonyResult<String> {
        let n = self.placed.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("pc-{n}"))
    }

    async fn start_streaming(
        &self,
        _provider_call_id: &str,
        _stream_url: &str,
    ) -> TelephonyResult<()> {
        Ok(())
    }

    async fn hangup(&self, _provider_call_id: &str) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_connect_document(&self, stream_url: &str) -> String {
        connect_document(stream_url)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// =============================================================================
// TTS
// =============================================================================

/// Emits a fixed span of silent 24 kHz PCM for every utterance.
pub struct MockTts {
    pub pcm_bytes: usize,
}

#[async_trait]
impl BaseTts for MockTts {
    async fn synthesize(&self, _text: &str) -> TtsResult<Bytes> {
        Ok(Bytes::from(vec![0u8; self.pcm_bytes]))
    }

    async fn synthesize_stream(&self, _text: &str) -> TtsResult<AudioStream> {
        let chunks: Vec<TtsResult<Bytes>> = vec![0u8; self.pcm_bytes]
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// =============================================================================
// STT
// =============================================================================

/// Scripted transcription session: once enough µ-law has been pushed and
/// a waiter is registered, the next scripted transcript is committed.
pub struct MockStt {
    script: Mutex<Vec<String>>,
    waiter: Mutex<Option<oneshot::Sender<String>>>,
    bytes_received: AtomicUsize,
}

impl MockStt {
    pub fn scripted(transcripts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(transcripts.iter().map(|s| s.to_string()).collect()),
            waiter: Mutex::new(None),
            bytes_received: AtomicUsize::new(0),
        })
    }

    async fn try_commit(&self) {
        if self.bytes_received.load(Ordering::SeqCst) < STT_COMMIT_THRESHOLD_BYTES {
            return;
        }
        let mut waiter = self.waiter.lock().await;
        if waiter.is_none() {
            return;
        }
        let mut script = self.script.lock().await;
        if script.is_empty() {
            return;
        }
        let transcript = script.remove(0);
        self.bytes_received.store(0, Ordering::SeqCst);
        if let Some(tx) = waiter.take() {
            let _ = tx.send(transcript);
        }
    }
}

#[async_trait]
impl SttSession for MockStt {
    async fn connect(&self) -> SttResult<()> {
        Ok(())
    }

    async fn send_audio(&self, mulaw: Bytes) {
        self.bytes_received.fetch_add(mulaw.len(), Ordering::SeqCst);
        self.try_commit().await;
    }

    async fn wait_for_transcript(&self, timeout: Duration) -> SttResult<String> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock().await = Some(tx);
        // The commit threshold may already have been crossed.
        self.try_commit().await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(transcript)) => Ok(transcript),
            Ok(Err(_)) => Err(SttError::Closed),
            Err(_) => {
                self.waiter.lock().await.take();
                Err(SttError::Timeout)
            }
        }
    }

    async fn on_partial(&self, _callback: PartialTranscriptCallback) {}

    async fn close(&self) {
        self.waiter.lock().await.take();
    }

    fn is_connected(&self) -> bool {
        true
    }
}

pub struct MockSttFactory {
    session: Arc<MockStt>,
}

impl MockSttFactory {
    pub fn new(session: Arc<MockStt>) -> Self {
        Self { session }
    }
}

impl SttSessionFactory for MockSttFactory {
    fn create(&self) -> SttResult<Arc<dyn SttSession>> {
        Ok(self.session.clone())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct TestHarness {
    pub state: Arc<AppState>,
    pub telephony: Arc<MockTelephony>,
    /// Base URL of the live test server.
    pub http_base: String,
    pub ws_base: String,
}

/// Timing tuned for tests: real pacing, short attach window. The ending
/// drain stays at its production two seconds so duration accounting is
/// observable.
pub fn test_timing() -> TurnTiming {
    TurnTiming {
        attach_timeout: Duration::from_secs(5),
        attach_poll: Duration::from_millis(10),
        frame_pace: Duration::from_millis(18),
        playback_tail: Duration::from_millis(100),
        ending_drain: Duration::from_secs(2),
        transcript_timeout: Duration::from_secs(10),
    }
}

/// Stand up the real router with mock capabilities on an ephemeral port.
pub async fn start_test_server(
    mut config: ServerConfig,
    stt: Arc<MockStt>,
    timing: TurnTiming,
) -> TestHarness {
    let telephony = Arc::new(MockTelephony::new());
    let tts = Arc::new(MockTts {
        pcm_bytes: 6 * 160 * 4,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.port = addr.port();

    let manager = Arc::new(
        CallManager::new(
            &config,
            Arc::new(CallRegistry::new()),
            telephony.clone(),
            tts,
            Arc::new(MockSttFactory::new(stt.clone())),
        )
        .with_timing(timing),
    );
    let state = Arc::new(AppState::from_parts(config, manager));

    let app = voicebridge::routes::create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestHarness {
        state,
        telephony,
        http_base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
    }
}

//! Call session core: lifecycle state machine and turn protocol.
//!
//! The [`CallManager`] owns every per-call operation. A call moves through
//! `Creating → Placing → AwaitingAttach → Ready`, then loops
//! `Speaking → Listening` one turn at a time until `Ending → Ended`.
//! Turns on a single call are serialized by the call's turn mutex; calls
//! are independent of each other.
//!
//! The webhook intake and media socket handler never touch call state
//! directly beyond the `Call` setters; anything keyed by provider call id
//! goes through the `handle_*` methods here so index maintenance stays in
//! one place.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::prelude::*;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::{Call, CallRegistry, CallState, MediaCommand};
use crate::config::ServerConfig;
use crate::core::audio::{self, MULAW_FRAME_BYTES};
use crate::core::stt::SttSessionFactory;
use crate::core::telephony::TelephonyProvider;
use crate::core::tts::{BaseTts, TtsError};
use crate::errors::{CallError, CallResult};

/// Timing knobs of the turn protocol.
#[derive(Debug, Clone)]
pub struct TurnTiming {
    /// Hard cap on waiting for the media stream to attach.
    pub attach_timeout: Duration,
    /// Poll interval while waiting for attach.
    pub attach_poll: Duration,
    /// Sleep between outbound media frames. Slightly tighter than the
    /// 20 ms of audio per frame so the provider buffer never runs dry.
    pub frame_pace: Duration,
    /// Grace period after the last frame so playback can finish.
    pub playback_tail: Duration,
    /// Drain window between the farewell and the REST hangup.
    pub ending_drain: Duration,
    /// Bound on a single listen operation.
    pub transcript_timeout: Duration,
}

impl Default for TurnTiming {
    fn default() -> Self {
        Self {
            attach_timeout: Duration::from_secs(15),
            attach_poll: Duration::from_millis(50),
            frame_pace: Duration::from_millis(18),
            playback_tail: Duration::from_millis(200),
            ending_drain: Duration::from_secs(2),
            transcript_timeout: Duration::from_millis(180_000),
        }
    }
}

/// Result of a successful initiate operation.
#[derive(Debug, Clone, Serialize)]
pub struct InitiateOutcome {
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(rename = "userReply")]
    pub user_reply: String,
}

/// A provider lifecycle event, routed through a single queue so events
/// for a given provider call id are processed in arrival order.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub event_type: String,
    pub provider_call_id: String,
    pub result: Option<String>,
}

/// Orchestrates per-call state, turns, and cleanup.
pub struct CallManager {
    registry: Arc<CallRegistry>,
    telephony: Arc<dyn TelephonyProvider>,
    tts: Arc<dyn BaseTts>,
    stt_factory: Arc<dyn SttSessionFactory>,
    timing: TurnTiming,
    user_number: String,
    from_number: String,
    /// Public hostname the provider can reach; filled in by the tunnel.
    public_host: RwLock<Option<String>>,
    /// Opt-in ephemeral-tunnel compatibility mode.
    pub allow_tunnel_compat: bool,
}

impl CallManager {
    pub fn new(
        config: &ServerConfig,
        registry: Arc<CallRegistry>,
        telephony: Arc<dyn TelephonyProvider>,
        tts: Arc<dyn BaseTts>,
        stt_factory: Arc<dyn SttSessionFactory>,
    ) -> Self {
        let timing = TurnTiming {
            transcript_timeout: Duration::from_millis(config.transcript_timeout_ms),
            ..TurnTiming::default()
        };
        Self {
            registry,
            telephony,
            tts,
            stt_factory,
            timing,
            user_number: config.user_number.clone(),
            from_number: config.phone_from_number.clone(),
            public_host: RwLock::new(config.public_host.clone()),
            allow_tunnel_compat: config.allow_tunnel_compat,
        }
    }

    /// Override the timing knobs; used by tests to shrink the windows.
    pub fn with_timing(mut self, timing: TurnTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn public_host(&self) -> Option<String> {
        self.public_host.read().unwrap().clone()
    }

    /// Record the public hostname once the tunnel reports it.
    pub fn set_public_host(&self, host: String) {
        *self.public_host.write().unwrap() = Some(host);
    }

    fn require_public_host(&self) -> CallResult<String> {
        self.public_host()
            .ok_or_else(|| CallError::ConfigInvalid("public host not yet available".to_string()))
    }

    /// Websocket URL the provider should connect its media stream to.
    pub fn stream_url_for(&self, call: &Call) -> CallResult<String> {
        let host = self.require_public_host()?;
        Ok(format!(
            "wss://{host}/media-stream?token={}",
            call.ws_token
        ))
    }

    /// XML connect document for the document-driven webhook response.
    pub fn connect_document_for(&self, call: &Call) -> CallResult<String> {
        Ok(self
            .telephony
            .stream_connect_document(&self.stream_url_for(call)?))
    }

    // =========================================================================
    // Tool-facing operations
    // =========================================================================

    /// Create a call, run `Creating → Ready`, then one speak+listen turn.
    pub async fn initiate(&self, text: &str) -> CallResult<InitiateOutcome> {
        let host = self.require_public_host()?;

        let (call_id, seq) = self.registry.mint_call_id();
        info!(%call_id, to = %self.user_number, "initiating call");

        let stt = self
            .stt_factory
            .create()
            .map_err(|e| CallError::SttConnectFailed(e.to_string()))?;
        let call = Arc::new(Call::new(
            call_id.clone(),
            seq,
            self.user_number.clone(),
            self.from_number.clone(),
            stt,
        ));
        // Indexed before the REST call so webhook events arriving during
        // placement can already find the call.
        self.registry.insert(call.clone());

        match self.run_initiate(&call, &host, text).await {
            Ok(user_reply) => Ok(InitiateOutcome {
                call_id,
                user_reply,
            }),
            Err(e) => {
                self.cleanup(&call).await;
                Err(e)
            }
        }
    }

    /// Run exactly one speak+listen turn on an existing call.
    pub async fn continue_call(&self, call_id: &str, text: &str) -> CallResult<String> {
        let call = self
            .registry
            .get(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;

        match self.run_turn(&call, text).await {
            Ok(transcript) => Ok(transcript),
            Err(e) => {
                self.cleanup(&call).await;
                Err(e)
            }
        }
    }

    /// Speak a farewell (no listen), hang up, and tear the call down.
    /// Returns the call duration in seconds.
    pub async fn end_call(&self, call_id: &str, text: &str) -> CallResult<u64> {
        let call = self
            .registry
            .get(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;

        {
            let _turn = call.turn_lock.lock().await;
            if call.state() == CallState::Ended {
                return Err(CallError::NotFound(call.call_id.clone()));
            }
            call.set_state(CallState::Ending);

            if !call.is_hung_up() {
                if let Err(e) = self.speak_streaming(&call, text).await {
                    warn!(call_id = %call.call_id, "farewell synthesis failed: {e}");
                } else {
                    // Let the provider play out its buffer before hanging up.
                    tokio::time::sleep(self.timing.ending_drain).await;
                }
            }

            if let Some(provider_call_id) = call.provider_call_id() {
                self.telephony.hangup(&provider_call_id).await;
            }
        }

        let duration = call.duration_secs();
        self.cleanup(&call).await;
        info!(call_id = %call.call_id, duration, "call ended");
        Ok(duration)
    }

    /// End every active call with a canned farewell. Used by graceful
    /// shutdown.
    pub async fn shutdown_all(&self, farewell: &str) {
        for call in self.registry.all_calls() {
            if let Err(e) = self.end_call(&call.call_id, farewell).await {
                warn!(call_id = %call.call_id, "shutdown hangup failed: {e}");
            }
        }
    }

    // =========================================================================
    // Webhook-facing operations (keyed by provider call id)
    // =========================================================================

    /// Route one provider event to its handler.
    pub async fn dispatch_provider_event(&self, event: ProviderEvent) {
        let provider_call_id = event.provider_call_id.as_str();
        match event.event_type.as_str() {
            "call.initiated" => {
                debug!(provider_call_id, "call initiated");
            }
            "call.answered" => {
                info!(provider_call_id, "call answered");
                self.handle_answered(provider_call_id).await;
            }
            "streaming.started" => {
                self.handle_streaming_started(provider_call_id);
            }
            "streaming.stopped" => {
                debug!(provider_call_id, "streaming stopped");
            }
            "call.hangup" => {
                self.handle_hangup(provider_call_id);
            }
            "call.machine.detection.ended" => {
                self.handle_machine_detection(provider_call_id, event.result.as_deref());
            }
            other => {
                debug!(provider_call_id, event_type = other, "unhandled event type");
            }
        }
    }

    /// The callee answered: ask the provider to open its media socket.
    pub async fn handle_answered(&self, provider_call_id: &str) {
        let Some(call) = self.registry.get_by_provider_id(provider_call_id) else {
            warn!(provider_call_id, "answered event for unknown call");
            return;
        };
        let stream_url = match self.stream_url_for(&call) {
            Ok(url) => url,
            Err(e) => {
                error!(provider_call_id, "cannot build stream URL: {e}");
                return;
            }
        };
        if let Err(e) = self
            .telephony
            .start_streaming(provider_call_id, &stream_url)
            .await
        {
            error!(provider_call_id, "failed to start media streaming: {e}");
        }
    }

    /// The provider confirmed bidirectional streaming is up.
    pub fn handle_streaming_started(&self, provider_call_id: &str) {
        if let Some(call) = self.registry.get_by_provider_id(provider_call_id) {
            call.set_streaming_ready();
        }
    }

    /// Remote hangup observed via webhook.
    pub fn handle_hangup(&self, provider_call_id: &str) {
        if let Some(call) = self.registry.get_by_provider_id(provider_call_id) {
            call.mark_hung_up();
            call.close_media();
            self.registry.remove_provider_id(provider_call_id);
        }
    }

    /// Answering-machine detection verdict; informational only.
    pub fn handle_machine_detection(&self, provider_call_id: &str, result: Option<&str>) {
        info!(
            provider_call_id,
            result = result.unwrap_or("unknown"),
            "answering machine detection ended"
        );
    }

    // =========================================================================
    // State machine internals
    // =========================================================================

    async fn run_initiate(
        &self,
        call: &Arc<Call>,
        host: &str,
        text: &str,
    ) -> CallResult<String> {
        let _turn = call.turn_lock.lock().await;

        call.stt
            .connect()
            .await
            .map_err(|e| CallError::SttConnectFailed(e.to_string()))?;

        let preview_id = call.call_id.clone();
        call.stt
            .on_partial(Arc::new(move |delta| {
                debug!(call_id = %preview_id, %delta, "partial transcript");
            }))
            .await;

        call.set_state(CallState::Placing);
        let webhook_url = format!("https://{host}/twiml");
        let provider_call_id = self
            .telephony
            .place_call(&call.user_number, &call.from_number, &webhook_url)
            .await?;
        call.set_provider_call_id(provider_call_id.clone());
        self.registry
            .register_provider_id(&provider_call_id, &call.call_id);

        // Pre-generate the greeting while the phone is still ringing, so
        // the first frame hits the wire the moment the stream attaches.
        let tts = self.tts.clone();
        let utterance = text.to_string();
        let pregen: JoinHandle<Result<Vec<u8>, TtsError>> = tokio::spawn(async move {
            let pcm = tts.synthesize(&utterance).await?;
            let narrowband = audio::downsample_24k_to_8k(&pcm);
            Ok(audio::encode_mulaw(&narrowband))
        });

        call.set_state(CallState::AwaitingAttach);
        if let Err(e) = self.await_attach(call).await {
            pregen.abort();
            return Err(e);
        }

        call.set_state(CallState::Speaking);
        let mut pending = match pregen.await {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => {
                return Err(CallError::Tts(TtsError::Stream(format!(
                    "synthesis task failed: {e}"
                ))));
            }
        };
        debug!(
            call_id = %call.call_id,
            bytes = pending.len(),
            "flushing pre-generated greeting"
        );
        if self.emit_frames(call, &mut pending, true).await {
            tokio::time::sleep(self.timing.playback_tail).await;
        }

        call.set_state(CallState::Listening);
        let transcript = self.listen(call).await?;
        call.push_turn(text.to_string(), transcript.clone());
        call.set_state(CallState::Ready);
        Ok(transcript)
    }

    async fn run_turn(&self, call: &Arc<Call>, text: &str) -> CallResult<String> {
        let _turn = call.turn_lock.lock().await;

        // A concurrent end may have finished while this turn queued.
        if matches!(call.state(), CallState::Ending | CallState::Ended) {
            return Err(CallError::NotFound(call.call_id.clone()));
        }
        if call.is_hung_up() {
            return Err(CallError::UserHungUp);
        }

        call.set_state(CallState::Speaking);
        self.speak_streaming(call, text).await?;

        call.set_state(CallState::Listening);
        let transcript = self.listen(call).await?;
        call.push_turn(text.to_string(), transcript.clone());
        call.set_state(CallState::Ready);
        Ok(transcript)
    }

    /// Wait for the media socket to be open and the provider to have
    /// signaled streaming (a `start` frame with a sid, or the REST-side
    /// streaming event, whichever the provider sends).
    async fn await_attach(&self, call: &Arc<Call>) -> CallResult<()> {
        let deadline = tokio::time::Instant::now() + self.timing.attach_timeout;
        loop {
            if call.is_hung_up() {
                return Err(CallError::UserHungUp);
            }
            if call.media_attached()
                && (call.stream_sid().is_some() || call.streaming_ready())
            {
                debug!(call_id = %call.call_id, "media stream attached");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CallError::AttachTimeout);
            }
            tokio::time::sleep(self.timing.attach_poll).await;
        }
    }

    /// Stream-synthesize `text` and pace it onto the media socket.
    ///
    /// A closed socket mid-emission is treated as a hangup: the flag is
    /// set and the method returns cleanly so the enclosing turn surfaces
    /// the condition at its listen.
    async fn speak_streaming(&self, call: &Arc<Call>, text: &str) -> CallResult<()> {
        let mut stream = self.tts.synthesize_stream(text).await?;

        let mut pending_pcm: Vec<u8> = Vec::new();
        let mut pending_mulaw: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pending_pcm.extend_from_slice(&chunk);

            // Resample in whole 6-byte units; the remainder waits for the
            // next chunk.
            let usable = pending_pcm.len() / 6 * 6;
            if usable > 0 {
                let narrowband = audio::downsample_24k_to_8k(&pending_pcm[..usable]);
                pending_mulaw.extend_from_slice(&audio::encode_mulaw(&narrowband));
                pending_pcm.drain(..usable);
            }

            if !self.emit_frames(call, &mut pending_mulaw, false).await {
                return Ok(());
            }
        }

        if !self.emit_frames(call, &mut pending_mulaw, true).await {
            return Ok(());
        }
        tokio::time::sleep(self.timing.playback_tail).await;
        Ok(())
    }

    /// Drain full 160-byte frames (and, when flushing, the trailing
    /// partial frame) to the socket with the configured pacing. Returns
    /// false once the socket is gone.
    async fn emit_frames(&self, call: &Arc<Call>, pending: &mut Vec<u8>, flush: bool) -> bool {
        while pending.len() >= MULAW_FRAME_BYTES {
            let frame: Vec<u8> = pending.drain(..MULAW_FRAME_BYTES).collect();
            if !self.send_media_frame(call, &frame).await {
                return false;
            }
            tokio::time::sleep(self.timing.frame_pace).await;
        }
        if flush && !pending.is_empty() {
            let frame = std::mem::take(pending);
            if !self.send_media_frame(call, &frame).await {
                return false;
            }
        }
        true
    }

    async fn send_media_frame(&self, call: &Arc<Call>, mulaw: &[u8]) -> bool {
        let mut frame = json!({
            "event": "media",
            "media": { "payload": BASE64_STANDARD.encode(mulaw) },
        });
        if let Some(sid) = call.stream_sid() {
            frame["streamSid"] = json!(sid);
        }

        let Some(tx) = call.media_sender() else {
            call.mark_hung_up();
            return false;
        };
        if tx.send(MediaCommand::Frame(frame.to_string())).await.is_err() {
            call.mark_hung_up();
            return false;
        }
        true
    }

    /// Wait for the next VAD-committed transcript, racing the hang-up
    /// flag and the listen timeout.
    async fn listen(&self, call: &Arc<Call>) -> CallResult<String> {
        let mut hung_rx = call.hung_up_rx();
        if *hung_rx.borrow() {
            return Err(CallError::UserHungUp);
        }

        tokio::select! {
            result = call.stt.wait_for_transcript(self.timing.transcript_timeout) => {
                let transcript = result?;
                debug!(call_id = %call.call_id, %transcript, "transcript received");
                Ok(transcript)
            }
            _ = hangup_signal(&mut hung_rx) => Err(CallError::UserHungUp),
        }
    }

    /// Idempotent teardown: close the transcription session, close the
    /// media socket, clear every index.
    pub async fn cleanup(&self, call: &Arc<Call>) {
        call.set_state(CallState::Ended);
        call.stt.close().await;
        call.close_media();
        self.registry.remove(&call.call_id);
    }
}

/// Resolves once the hang-up flag flips to true; pends forever if the
/// call outlives its channel (the listen timeout bounds that case).
async fn hangup_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

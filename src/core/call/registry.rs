//! Per-call state and the process-global call registry.
//!
//! A [`Call`] is shared between the turn loop, the webhook intake, and the
//! media socket handler, so every mutable field sits behind its own lock
//! or atomic. The [`CallRegistry`] owns the three lookup indices and is
//! the only place they are mutated, which keeps the index invariants in
//! one file:
//!
//! - a provider call id maps to at most one call at a time
//! - a websocket token is valid for exactly one upgrade
//! - `stream_sid` is set at most once per call
//! - the hung-up flag is monotonic
//! - removal clears all three indices and is idempotent

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::core::stt::SttSession;
use crate::utils;

/// Who said a history line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    User,
}

/// One line of the conversation.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
}

/// Call lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Creating,
    Placing,
    AwaitingAttach,
    Ready,
    Speaking,
    Listening,
    Ending,
    Ended,
}

/// Commands sent to the media socket's writer task.
#[derive(Debug)]
pub enum MediaCommand {
    /// A JSON text frame to put on the wire.
    Frame(String),
    /// Close the socket.
    Close,
}

/// State for one active call.
pub struct Call {
    /// Locally generated identifier; primary key for all lookups.
    pub call_id: String,
    /// Monotonic creation sequence, used for most-recent lookups.
    pub seq: u64,
    /// E.164 number of the callee.
    pub user_number: String,
    /// E.164 number the call is placed from.
    pub from_number: String,
    /// Random 128-bit token authenticating the media socket upgrade.
    pub ws_token: String,
    /// The call's transcription session; created before the call is
    /// placed, closed exactly once during cleanup.
    pub stt: Arc<dyn SttSession>,
    /// Start of the call, for duration accounting.
    pub started_at: Instant,

    state: Mutex<CallState>,
    provider_call_id: Mutex<Option<String>>,
    stream_sid: Mutex<Option<String>>,
    streaming_ready: AtomicBool,
    hung_up: watch::Sender<bool>,
    media_tx: Mutex<Option<mpsc::Sender<MediaCommand>>>,
    history: Mutex<Vec<HistoryEntry>>,
    /// Serializes turns: held across one speak+listen.
    pub(crate) turn_lock: tokio::sync::Mutex<()>,
}

impl Call {
    pub fn new(
        call_id: String,
        seq: u64,
        user_number: String,
        from_number: String,
        stt: Arc<dyn SttSession>,
    ) -> Self {
        let (hung_up, _) = watch::channel(false);
        Self {
            call_id,
            seq,
            user_number,
            from_number,
            ws_token: utils::mint_ws_token(),
            stt,
            started_at: Instant::now(),
            state: Mutex::new(CallState::Creating),
            provider_call_id: Mutex::new(None),
            stream_sid: Mutex::new(None),
            streaming_ready: AtomicBool::new(false),
            hung_up,
            media_tx: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            turn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: CallState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn provider_call_id(&self) -> Option<String> {
        self.provider_call_id.lock().unwrap().clone()
    }

    pub fn set_provider_call_id(&self, id: String) {
        *self.provider_call_id.lock().unwrap() = Some(id);
    }

    /// Record the provider's stream id from the first `start` frame.
    /// Later frames are ignored: the sid is set at most once.
    pub fn set_stream_sid(&self, sid: String) {
        let mut slot = self.stream_sid.lock().unwrap();
        if slot.is_none() {
            debug!(call_id = %self.call_id, stream_sid = %sid, "stream sid recorded");
            *slot = Some(sid);
        }
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.stream_sid.lock().unwrap().clone()
    }

    pub fn set_streaming_ready(&self) {
        self.streaming_ready.store(true, Ordering::SeqCst);
    }

    pub fn streaming_ready(&self) -> bool {
        self.streaming_ready.load(Ordering::SeqCst)
    }

    /// Flag the call as terminated. Monotonic: once set it never clears,
    /// no matter which path (webhook, socket close, explicit end) won.
    pub fn mark_hung_up(&self) {
        let was = self.hung_up.send_replace(true);
        if !was {
            info!(call_id = %self.call_id, "call hung up");
        }
    }

    pub fn is_hung_up(&self) -> bool {
        *self.hung_up.borrow()
    }

    /// Subscribe to the hang-up flag for select-based watching.
    pub fn hung_up_rx(&self) -> watch::Receiver<bool> {
        self.hung_up.subscribe()
    }

    /// Bind the media socket's writer channel once the provider connects.
    pub fn attach_media(&self, tx: mpsc::Sender<MediaCommand>) {
        *self.media_tx.lock().unwrap() = Some(tx);
    }

    pub fn media_sender(&self) -> Option<mpsc::Sender<MediaCommand>> {
        self.media_tx.lock().unwrap().clone()
    }

    /// Whether a media socket is attached and its writer still alive.
    pub fn media_attached(&self) -> bool {
        self.media_tx
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Ask the writer task to close the socket and drop the channel.
    pub fn close_media(&self) {
        if let Some(tx) = self.media_tx.lock().unwrap().take() {
            let _ = tx.try_send(MediaCommand::Close);
        }
    }

    /// Append one completed turn. Called only after the turn's listen
    /// resolved, so history strictly alternates agent/user.
    pub fn push_turn(&self, agent_text: String, user_text: String) {
        let mut history = self.history.lock().unwrap();
        history.push(HistoryEntry {
            speaker: Speaker::Agent,
            text: agent_text,
        });
        history.push(HistoryEntry {
            speaker: Speaker::User,
            text: user_text,
        });
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().clone()
    }

    pub fn duration_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[derive(Default)]
struct RegistryInner {
    calls: HashMap<String, Arc<Call>>,
    by_provider_id: HashMap<String, String>,
    by_ws_token: HashMap<String, String>,
}

/// Process-global call registry with the three lookup indices.
#[derive(Default)]
pub struct CallRegistry {
    inner: Mutex<RegistryInner>,
    next_seq: AtomicU64,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next call id and its creation sequence number.
    pub fn mint_call_id(&self) -> (String, u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        (format!("call-{seq}-{}", utils::short_id()), seq)
    }

    /// Register a freshly created call under its id and websocket token.
    pub fn insert(&self, call: Arc<Call>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .by_ws_token
            .insert(call.ws_token.clone(), call.call_id.clone());
        inner.calls.insert(call.call_id.clone(), call);
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<Call>> {
        self.inner.lock().unwrap().calls.get(call_id).cloned()
    }

    pub fn get_by_provider_id(&self, provider_call_id: &str) -> Option<Arc<Call>> {
        let inner = self.inner.lock().unwrap();
        let call_id = inner.by_provider_id.get(provider_call_id)?;
        inner.calls.get(call_id).cloned()
    }

    /// Map a provider call id back to its call.
    pub fn register_provider_id(&self, provider_call_id: &str, call_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .by_provider_id
            .insert(provider_call_id.to_string(), call_id.to_string());
    }

    /// Authenticate a websocket upgrade token and consume it.
    ///
    /// Candidate tokens are compared in constant time, not resolved by a
    /// hash lookup, so the comparison cannot leak token bytes through
    /// timing. A match removes the mapping: a token is good for exactly
    /// one upgrade.
    pub fn take_by_ws_token(&self, token: &str) -> Option<Arc<Call>> {
        let mut inner = self.inner.lock().unwrap();
        let matched = inner
            .by_ws_token
            .iter()
            .find(|(candidate, _)| utils::constant_time_eq(candidate.as_str(), token))
            .map(|(candidate, call_id)| (candidate.clone(), call_id.clone()))?;
        inner.by_ws_token.remove(&matched.0);
        inner.calls.get(&matched.1).cloned()
    }

    /// Most recently created call still in the registry, for the opt-in
    /// ephemeral-tunnel pairing fallback.
    pub fn most_recent_active(&self) -> Option<Arc<Call>> {
        let inner = self.inner.lock().unwrap();
        inner
            .calls
            .values()
            .filter(|call| !call.is_hung_up())
            .max_by_key(|call| call.seq)
            .cloned()
    }

    /// Drop the provider-id mapping on terminal events.
    pub fn remove_provider_id(&self, provider_call_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .by_provider_id
            .remove(provider_call_id);
    }

    /// Remove a call from every index. Idempotent.
    pub fn remove(&self, call_id: &str) -> Option<Arc<Call>> {
        let mut inner = self.inner.lock().unwrap();
        let call = inner.calls.remove(call_id)?;
        inner.by_ws_token.remove(&call.ws_token);
        if let Some(pid) = call.provider_call_id() {
            inner.by_provider_id.remove(&pid);
        }
        Some(call)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    pub fn all_calls(&self) -> Vec<Arc<Call>> {
        self.inner.lock().unwrap().calls.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stt::{SttResult, SttSession};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    struct NullStt;

    #[async_trait]
    impl SttSession for NullStt {
        async fn connect(&self) -> SttResult<()> {
            Ok(())
        }
        async fn send_audio(&self, _mulaw: Bytes) {}
        async fn wait_for_transcript(&self, _timeout: Duration) -> SttResult<String> {
            Ok(String::new())
        }
        async fn on_partial(&self, _cb: crate::core::stt::PartialTranscriptCallback) {}
        async fn close(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn make_call(registry: &CallRegistry) -> Arc<Call> {
        let (call_id, seq) = registry.mint_call_id();
        let call = Arc::new(Call::new(
            call_id,
            seq,
            "+15550001111".into(),
            "+15550002222".into(),
            Arc::new(NullStt),
        ));
        registry.insert(call.clone());
        call
    }

    #[test]
    fn call_ids_are_sequenced() {
        let registry = CallRegistry::new();
        let (a, _) = registry.mint_call_id();
        let (b, _) = registry.mint_call_id();
        assert!(a.starts_with("call-1-"));
        assert!(b.starts_with("call-2-"));
    }

    #[test]
    fn ws_token_is_single_use() {
        let registry = CallRegistry::new();
        let call = make_call(&registry);
        let token = call.ws_token.clone();

        assert!(registry.take_by_ws_token(&token).is_some());
        assert!(registry.take_by_ws_token(&token).is_none());
    }

    #[test]
    fn wrong_ws_token_does_not_authenticate() {
        let registry = CallRegistry::new();
        let call = make_call(&registry);

        // Same length, different bytes.
        let wrong: String = call
            .ws_token
            .chars()
            .map(|c| if c == '0' { '1' } else { '0' })
            .collect();
        assert!(registry.take_by_ws_token(&wrong).is_none());
        // The real token still works afterwards.
        assert!(registry.take_by_ws_token(&call.ws_token).is_some());
    }

    #[test]
    fn remove_clears_all_indices() {
        let registry = CallRegistry::new();
        let call = make_call(&registry);
        call.set_provider_call_id("pc-1".into());
        registry.register_provider_id("pc-1", &call.call_id);

        assert!(registry.remove(&call.call_id).is_some());
        assert!(registry.get(&call.call_id).is_none());
        assert!(registry.get_by_provider_id("pc-1").is_none());
        assert!(registry.take_by_ws_token(&call.ws_token).is_none());
        // Idempotent.
        assert!(registry.remove(&call.call_id).is_none());
    }

    #[test]
    fn stream_sid_is_set_at_most_once() {
        let registry = CallRegistry::new();
        let call = make_call(&registry);
        call.set_stream_sid("ss-1".into());
        call.set_stream_sid("ss-2".into());
        assert_eq!(call.stream_sid().as_deref(), Some("ss-1"));
    }

    #[test]
    fn hung_up_is_monotonic() {
        let registry = CallRegistry::new();
        let call = make_call(&registry);
        assert!(!call.is_hung_up());
        call.mark_hung_up();
        call.mark_hung_up();
        assert!(call.is_hung_up());
    }

    #[test]
    fn history_alternates_starting_with_agent() {
        let registry = CallRegistry::new();
        let call = make_call(&registry);
        call.push_turn("hello".into(), "hi".into());
        call.push_turn("more?".into(), "yes".into());

        let history = call.history();
        assert_eq!(history.len(), 4);
        for (i, entry) in history.iter().enumerate() {
            let expected = if i % 2 == 0 {
                Speaker::Agent
            } else {
                Speaker::User
            };
            assert_eq!(entry.speaker, expected, "entry {i}");
        }
    }

    #[test]
    fn most_recent_active_skips_hung_up_calls() {
        let registry = CallRegistry::new();
        let first = make_call(&registry);
        let second = make_call(&registry);

        assert_eq!(
            registry.most_recent_active().unwrap().call_id,
            second.call_id
        );
        second.mark_hung_up();
        assert_eq!(
            registry.most_recent_active().unwrap().call_id,
            first.call_id
        );
    }

    #[tokio::test]
    async fn media_attachment_tracks_writer_liveness() {
        let registry = CallRegistry::new();
        let call = make_call(&registry);
        assert!(!call.media_attached());

        let (tx, rx) = mpsc::channel(8);
        call.attach_media(tx);
        assert!(call.media_attached());

        drop(rx);
        assert!(!call.media_attached());
    }
}

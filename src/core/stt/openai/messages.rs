//! OpenAI realtime transcription WebSocket message types.
//!
//! The transcription intent of the Realtime API is used: audio is appended
//! to the input buffer, the server's VAD segments it into utterances, and
//! each utterance comes back as a completed transcription item.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - transcription_session.update - Configure formats, model, VAD
//! - input_audio_buffer.append - Append base64 audio to the buffer
//!
//! Server events (received from server):
//! - transcription_session.created / .updated - Session lifecycle
//! - input_audio_buffer.speech_started / .speech_stopped - VAD edges
//! - conversation.item.input_audio_transcription.delta - Partial text
//! - conversation.item.input_audio_transcription.completed - Final text
//! - error - Error occurred

use serde::{Deserialize, Serialize};

// =============================================================================
// Session Configuration
// =============================================================================

/// Transcription session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSessionConfig {
    /// Input audio format; always `g711_ulaw` on the phone path.
    pub input_audio_format: String,

    /// Transcription model selection.
    pub input_audio_transcription: InputAudioTranscription,

    /// Server-side VAD tuning.
    pub turn_detection: TurnDetection,
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "gpt-4o-transcribe")
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold
        threshold: f32,
        /// Audio prefix padding in ms
        prefix_padding_ms: u32,
        /// Silence duration that commits the utterance in ms
        silence_duration_ms: u32,
    },
}

// =============================================================================
// Client Events
// =============================================================================

/// Events sent to the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration.
    #[serde(rename = "transcription_session.update")]
    SessionUpdate {
        session: TranscriptionSessionConfig,
    },

    /// Append base64-encoded audio to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
}

// =============================================================================
// Server Events
// =============================================================================

/// Events received from the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Session created.
    #[serde(rename = "transcription_session.created")]
    SessionCreated { session: SessionInfo },

    /// Session configuration acknowledged.
    #[serde(rename = "transcription_session.updated")]
    SessionUpdated,

    /// VAD detected speech onset.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
    },

    /// VAD detected speech end.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
    },

    /// Partial transcript for the utterance in progress.
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        delta: String,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// VAD-committed final transcript.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        transcript: String,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Error reported by the server.
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Any event type this client does not act on.
    #[serde(other)]
    Unknown,
}

/// Session metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

/// Error payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

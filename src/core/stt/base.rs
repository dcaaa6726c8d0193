//! Base traits and types for streaming speech-to-text sessions.
//!
//! A session is a long-lived bidirectional connection: µ-law audio frames
//! are pushed in, and the provider's server-side voice-activity detection
//! decides when an utterance is finished and commits a final transcript.
//! The call core consumes exactly one committed transcript per listen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur on a transcription session.
#[derive(Debug, Error)]
pub enum SttError {
    /// The session could not be established.
    #[error("transcription connect failed: {0}")]
    ConnectionFailed(String),

    /// No final transcript arrived within the wait bound.
    #[error("timed out waiting for a transcript")]
    Timeout,

    /// The session was closed while a waiter was pending.
    #[error("transcription session closed")]
    Closed,

    /// The session dropped and reconnection attempts were exhausted.
    #[error("transcription session lost: {0}")]
    Disconnected(String),

    /// Provider credentials or settings are unusable.
    #[error("invalid transcription configuration: {0}")]
    Configuration(String),
}

/// Result type for STT operations.
pub type SttResult<T> = Result<T, SttError>;

/// Callback invoked with streaming partial transcripts.
pub type PartialTranscriptCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Server-side VAD tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Activation threshold (0.0 to 1.0).
    pub threshold: f32,
    /// Audio included before detected speech onset (ms).
    pub prefix_padding_ms: u32,
    /// Silence that commits the utterance (ms).
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 800,
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection on connection loss.
    pub enabled: bool,
    /// Maximum attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt (milliseconds).
    pub initial_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Ceiling on the computed delay (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay for a given attempt number (1-based) with exponential backoff.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Check if another attempt is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }
}

/// A live transcription session.
#[async_trait]
pub trait SttSession: Send + Sync {
    /// Open the bidirectional connection and configure it for µ-law input
    /// with server-side VAD.
    async fn connect(&self) -> SttResult<()>;

    /// Push µ-law audio. Push-only: silently dropped when the session is
    /// not connected.
    async fn send_audio(&self, mulaw: Bytes);

    /// Resolve with the next VAD-committed final transcript, or fail with
    /// [`SttError::Timeout`]. The waiter is single-shot: whether it
    /// resolves or rejects, it is cleared afterwards.
    async fn wait_for_transcript(&self, timeout: Duration) -> SttResult<String>;

    /// Register a callback for streaming partial transcripts.
    async fn on_partial(&self, callback: PartialTranscriptCallback);

    /// Close the session. Idempotent; marks the close as intentional so
    /// reconnect logic does not fire afterwards.
    async fn close(&self);

    /// Whether the underlying connection is currently up.
    fn is_connected(&self) -> bool;
}

/// Creates one session per call.
pub trait SttSessionFactory: Send + Sync {
    fn create(&self) -> SttResult<Arc<dyn SttSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(config.calculate_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn backoff_respects_ceiling() {
        let config = ReconnectConfig {
            max_delay_ms: 3_000,
            ..Default::default()
        };
        assert_eq!(config.calculate_delay(10), Duration::from_secs(3));
    }

    #[test]
    fn retry_stops_at_max_attempts() {
        let config = ReconnectConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));

        let disabled = ReconnectConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!disabled.should_retry(0));
    }

    #[test]
    fn vad_defaults_match_telephony_tuning() {
        let vad = VadConfig::default();
        assert_eq!(vad.silence_duration_ms, 800);
        assert_eq!(vad.prefix_padding_ms, 300);
        assert!((vad.threshold - 0.5).abs() < f32::EPSILON);
    }
}

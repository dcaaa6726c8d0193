//! Base trait and types for text-to-speech providers.
//!
//! Providers produce 16-bit linear PCM at 24 kHz, mono. Streaming
//! synthesis is the primary interface: the call pipeline pulls chunks one
//! at a time, so a slow consumer transparently slows the producer and no
//! buffering policy is needed here.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Sample rate of all synthesized audio.
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// Errors that can occur during synthesis.
#[derive(Debug, Error)]
pub enum TtsError {
    /// The HTTP request failed (connect, timeout, TLS).
    #[error("TTS request failed: {0}")]
    Http(String),

    /// The provider answered with a non-2xx status.
    #[error("TTS provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The response stream broke mid-utterance.
    #[error("TTS stream failed: {0}")]
    Stream(String),

    /// Provider credentials or settings are unusable.
    #[error("invalid TTS configuration: {0}")]
    Configuration(String),
}

/// Result type for TTS operations.
pub type TtsResult<T> = Result<T, TtsError>;

/// Async sequence of PCM16 chunks at 24 kHz.
pub type AudioStream = BoxStream<'static, TtsResult<Bytes>>;

/// Text-to-speech capability.
#[async_trait]
pub trait BaseTts: Send + Sync {
    /// Synthesize the full utterance and return it as one buffer.
    async fn synthesize(&self, text: &str) -> TtsResult<Bytes>;

    /// Synthesize the utterance as a chunk stream for low first-audio
    /// latency. Chunk boundaries are arbitrary and need not align to
    /// sample boundaries.
    async fn synthesize_stream(&self, text: &str) -> TtsResult<AudioStream>;

    /// Short provider name used in logs and the factory.
    fn name(&self) -> &'static str;
}

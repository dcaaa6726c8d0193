//! OpenAI TTS provider implementation.
//!
//! # API Reference
//!
//! - Endpoint: `POST https://api.openai.com/v1/audio/speech`
//! - Models: tts-1, tts-1-hd, gpt-4o-mini-tts
//! - Voices: alloy, ash, ballad, coral, echo, fable, onyx, nova, sage,
//!   shimmer, verse
//! - Output: raw PCM 16-bit little-endian at 24 kHz (no container)
//!
//! The raw-PCM response makes this provider directly consumable by the
//! telephony resample/µ-law pipeline without any container parsing.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::json;
use tracing::debug;

use super::base::{AudioStream, BaseTts, TtsError, TtsResult};

/// OpenAI TTS API endpoint.
pub const OPENAI_TTS_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Supported TTS models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenAiTtsModel {
    #[default]
    Tts1,
    Tts1Hd,
    Gpt4oMiniTts,
}

impl OpenAiTtsModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tts1 => "tts-1",
            Self::Tts1Hd => "tts-1-hd",
            Self::Gpt4oMiniTts => "gpt-4o-mini-tts",
        }
    }

    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "tts-1-hd" => Self::Tts1Hd,
            "gpt-4o-mini-tts" => Self::Gpt4oMiniTts,
            _ => Self::Tts1,
        }
    }
}

/// OpenAI TTS configuration.
#[derive(Debug, Clone)]
pub struct OpenAiTtsConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Voice id; anything the API accepts (default `onyx`).
    pub voice: String,
    /// Model selection.
    pub model: OpenAiTtsModel,
    /// Endpoint override, primarily for tests.
    pub api_url: String,
}

impl OpenAiTtsConfig {
    pub fn new(api_key: String, voice: Option<String>, model: &str) -> Self {
        Self {
            api_key,
            voice: voice.unwrap_or_else(|| "onyx".to_string()),
            model: OpenAiTtsModel::from_str_or_default(model),
            api_url: OPENAI_TTS_URL.to_string(),
        }
    }

    fn validate(&self) -> TtsResult<()> {
        if self.api_key.is_empty() {
            return Err(TtsError::Configuration(
                "OpenAI API key is required for TTS".to_string(),
            ));
        }
        Ok(())
    }
}

/// OpenAI TTS client.
pub struct OpenAiTts {
    config: OpenAiTtsConfig,
    http: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(config: OpenAiTtsConfig) -> TtsResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| TtsError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    /// Get the configured voice.
    pub fn voice(&self) -> &str {
        &self.config.voice
    }

    /// Get the configured model.
    pub fn model(&self) -> OpenAiTtsModel {
        self.config.model
    }

    async fn request(&self, text: &str) -> TtsResult<reqwest::Response> {
        let body = json!({
            "model": self.config.model.as_str(),
            "input": text,
            "voice": self.config.voice,
            "response_format": "pcm",
        });

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl BaseTts for OpenAiTts {
    async fn synthesize(&self, text: &str) -> TtsResult<Bytes> {
        let response = self.request(text).await?;
        let audio = response
            .bytes()
            .await
            .map_err(|e| TtsError::Stream(e.to_string()))?;
        debug!(bytes = audio.len(), "synthesized full utterance");
        Ok(audio)
    }

    async fn synthesize_stream(&self, text: &str) -> TtsResult<AudioStream> {
        let response = self.request(text).await?;
        let stream = response
            .bytes_stream()
            .map_err(|e| TtsError::Stream(e.to_string()));
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

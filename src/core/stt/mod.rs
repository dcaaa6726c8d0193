mod base;
pub mod openai;

use std::sync::Arc;

pub use base::{
    PartialTranscriptCallback, ReconnectConfig, SttError, SttResult, SttSession,
    SttSessionFactory, VadConfig,
};
pub use openai::{OPENAI_REALTIME_STT_URL, OpenAiSttConfig, OpenAiSttFactory, OpenAiSttSession};

use crate::config::ServerConfig;

/// Factory function to create a per-call transcription session factory.
///
/// # Supported Providers
///
/// - `"openai"` — Realtime API transcription sessions with server VAD
pub fn create_stt_factory(
    provider: &str,
    config: &ServerConfig,
) -> SttResult<Arc<dyn SttSessionFactory>> {
    match provider.to_lowercase().as_str() {
        "openai" => {
            let vad = VadConfig {
                silence_duration_ms: config.stt_silence_ms,
                ..VadConfig::default()
            };
            let stt_config = OpenAiSttConfig::new(
                config.openai_api_key.clone().unwrap_or_default(),
                vad,
            );
            Ok(Arc::new(OpenAiSttFactory::new(stt_config)))
        }
        other => Err(SttError::Configuration(format!(
            "Unsupported STT provider: {other}. Supported providers: openai"
        ))),
    }
}

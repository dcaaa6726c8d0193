mod base;
pub mod openai;

use std::sync::Arc;

pub use base::{AudioStream, BaseTts, TTS_SAMPLE_RATE, TtsError, TtsResult};
pub use openai::{OPENAI_TTS_URL, OpenAiTts, OpenAiTtsConfig, OpenAiTtsModel};

use crate::config::ServerConfig;

/// Factory function to create a TTS provider.
///
/// # Supported Providers
///
/// - `"openai"` — OpenAI speech API (tts-1, tts-1-hd, gpt-4o-mini-tts)
pub fn create_tts_provider(
    provider: &str,
    config: &ServerConfig,
) -> TtsResult<Arc<dyn BaseTts>> {
    match provider.to_lowercase().as_str() {
        "openai" => {
            let tts = OpenAiTts::new(OpenAiTtsConfig::new(
                config.openai_api_key.clone().unwrap_or_default(),
                Some(config.tts_voice.clone()),
                &config.tts_model,
            ))?;
            Ok(Arc::new(tts))
        }
        other => Err(TtsError::Configuration(format!(
            "Unsupported TTS provider: {other}. Supported providers: openai"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_provider() {
        let config = ServerConfig::for_tests();
        assert!(create_tts_provider("acme", &config).is_err());
    }

    #[test]
    fn factory_builds_openai() {
        let config = ServerConfig::for_tests();
        let tts = create_tts_provider("openai", &config).unwrap();
        assert_eq!(tts.name(), "openai");
    }
}

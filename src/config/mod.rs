//! Configuration module for the voicebridge server.
//!
//! Configuration is loaded from environment variables (with `.env` support
//! via `dotenvy` in `main`). Every knob the call core consumes is
//! enumerated here; `validate()` runs once at startup and any failure is
//! fatal.

use std::env;

use thiserror::Error;
use zeroize::Zeroize;

/// Default local HTTP port.
pub const DEFAULT_PORT: u16 = 3333;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration.
///
/// Contains everything needed to run the bridge: the local listener, the
/// telephony provider credentials, the speech service key, and the timing
/// knobs of the call core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    /// Telephony provider selection: `telnyx` or `twilio`.
    pub telephony_provider: String,

    /// E.164 number calls are placed from.
    pub phone_from_number: String,
    /// E.164 number of the human being called.
    pub user_number: String,

    // Telnyx credentials (event-driven provider)
    pub telnyx_api_key: Option<String>,
    pub telnyx_connection_id: Option<String>,

    // Twilio credentials (document-driven provider)
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,

    /// OpenAI API key for both TTS and realtime transcription.
    pub openai_api_key: Option<String>,

    /// Base64 Ed25519 public key for JSON webhook verification. Absence
    /// downgrades verification to a logged warning.
    pub webhook_public_key: Option<String>,

    /// TTS voice id.
    pub tts_voice: String,
    /// TTS model id.
    pub tts_model: String,

    /// Bound on a single listen operation (milliseconds).
    pub transcript_timeout_ms: u64,
    /// VAD silence window that commits an utterance (milliseconds).
    pub stt_silence_ms: u32,

    /// Public hostname reachable by the provider. Normally filled in by
    /// the tunnel at startup; set explicitly when running behind a fixed
    /// ingress.
    pub public_host: Option<String>,

    /// Whether to start the managed tunnel. Defaults to true when no
    /// `PUBLIC_HOST` is configured.
    pub use_tunnel: bool,

    /// Opt-in compatibility mode for free-tier ephemeral tunnels: accepts
    /// webhook signature mismatches (logged) and tokenless media-socket
    /// upgrades. Never enabled by default.
    pub allow_tunnel_compat: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let public_host = env_string("PUBLIC_HOST");
        let config = Self {
            host: env_string("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse("LOCAL_PORT", DEFAULT_PORT)?,
            telephony_provider: env_string("TELEPHONY_PROVIDER")
                .unwrap_or_else(|| "telnyx".to_string()),
            phone_from_number: env_string("PHONE_FROM_NUMBER").unwrap_or_default(),
            user_number: env_string("USER_NUMBER").unwrap_or_default(),
            telnyx_api_key: env_string("TELNYX_API_KEY"),
            telnyx_connection_id: env_string("TELNYX_CONNECTION_ID"),
            twilio_account_sid: env_string("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: env_string("TWILIO_AUTH_TOKEN"),
            openai_api_key: env_string("OPENAI_API_KEY"),
            webhook_public_key: env_string("WEBHOOK_PUBLIC_KEY"),
            tts_voice: env_string("TTS_VOICE").unwrap_or_else(|| "onyx".to_string()),
            tts_model: env_string("TTS_MODEL").unwrap_or_else(|| "tts-1".to_string()),
            transcript_timeout_ms: env_parse("TRANSCRIPT_TIMEOUT_MS", 180_000)?,
            stt_silence_ms: env_parse("STT_SILENCE_MS", 800)?,
            use_tunnel: env_parse("USE_TUNNEL", public_host.is_none())?,
            public_host,
            allow_tunnel_compat: env_parse("VOICEBRIDGE_ALLOW_TUNNEL_COMPAT", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field requirements. Failures are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, number) in [
            ("PHONE_FROM_NUMBER", &self.phone_from_number),
            ("USER_NUMBER", &self.user_number),
        ] {
            if number.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} is required")));
            }
            if !number.starts_with('+') {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be E.164 (got {number:?})"
                )));
            }
        }

        match self.telephony_provider.as_str() {
            "telnyx" => {
                if self.telnyx_api_key.is_none() || self.telnyx_connection_id.is_none() {
                    return Err(ConfigError::Invalid(
                        "TELNYX_API_KEY and TELNYX_CONNECTION_ID are required for telnyx"
                            .to_string(),
                    ));
                }
            }
            "twilio" => {
                if self.twilio_account_sid.is_none() || self.twilio_auth_token.is_none() {
                    return Err(ConfigError::Invalid(
                        "TWILIO_ACCOUNT_SID and TWILIO_AUTH_TOKEN are required for twilio"
                            .to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown TELEPHONY_PROVIDER {other:?} (expected telnyx or twilio)"
                )));
            }
        }

        if self.openai_api_key.is_none() {
            return Err(ConfigError::Invalid("OPENAI_API_KEY is required".to_string()));
        }

        if !self.use_tunnel && self.public_host.is_none() {
            return Err(ConfigError::Invalid(
                "PUBLIC_HOST is required when USE_TUNNEL=false".to_string(),
            ));
        }

        Ok(())
    }

    /// Local bind address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A fully populated configuration for unit and integration tests.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            telephony_provider: "telnyx".to_string(),
            phone_from_number: "+15550002222".to_string(),
            user_number: "+15550001111".to_string(),
            telnyx_api_key: Some("KEY_test".to_string()),
            telnyx_connection_id: Some("conn_test".to_string()),
            twilio_account_sid: Some("AC_test".to_string()),
            twilio_auth_token: Some("token_test".to_string()),
            openai_api_key: Some("sk-test".to_string()),
            webhook_public_key: None,
            tts_voice: "onyx".to_string(),
            tts_model: "tts-1".to_string(),
            transcript_timeout_ms: 180_000,
            stt_silence_ms: 800,
            public_host: Some("bridge.example.com".to_string()),
            use_tunnel: false,
            allow_tunnel_compat: false,
        }
    }
}

/// Zeroize secrets when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        for secret in [
            &mut self.telnyx_api_key,
            &mut self.twilio_auth_token,
            &mut self.openai_api_key,
        ]
        .into_iter()
        .flatten()
        {
            secret.zeroize();
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env_string(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{name} could not be parsed: {raw:?}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validates() {
        assert!(ServerConfig::for_tests().validate().is_ok());
    }

    #[test]
    fn rejects_non_e164_numbers() {
        let mut config = ServerConfig::for_tests();
        config.user_number = "5550001111".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_provider_credentials() {
        let mut config = ServerConfig::for_tests();
        config.telnyx_api_key = None;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::for_tests();
        config.telephony_provider = "twilio".to_string();
        config.twilio_auth_token = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut config = ServerConfig::for_tests();
        config.telephony_provider = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_public_host_without_tunnel() {
        let mut config = ServerConfig::for_tests();
        config.use_tunnel = false;
        config.public_host = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn address_joins_host_and_port() {
        let mut config = ServerConfig::for_tests();
        config.port = 3333;
        assert_eq!(config.address(), "127.0.0.1:3333");
    }
}

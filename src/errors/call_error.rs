//! Call-level error taxonomy.
//!
//! Every failure a turn can surface to the tool adapter is enumerated
//! here. Capability-specific errors (telephony, TTS, STT) convert into
//! this type at the call-core boundary; whatever the variant, the core
//! always routes the call through the same idempotent cleanup path.

use thiserror::Error;

use crate::core::stt::SttError;
use crate::core::telephony::TelephonyError;
use crate::core::tts::TtsError;

/// Errors surfaced by call operations.
#[derive(Debug, Error)]
pub enum CallError {
    /// Unusable configuration; fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Telephony REST failure; terminates the current operation.
    #[error(transparent)]
    Provider(#[from] TelephonyError),

    /// The provider never attached its media stream.
    #[error("media stream did not attach within the allowed window")]
    AttachTimeout,

    /// No transcript arrived within the listen bound.
    #[error("timed out waiting for the caller to speak")]
    ListenTimeout,

    /// The remote side terminated the call.
    #[error("the user hung up")]
    UserHungUp,

    /// The transcription session could not be established.
    #[error("transcription session could not be established: {0}")]
    SttConnectFailed(String),

    /// The transcription session dropped and could not be restored.
    #[error("transcription session lost: {0}")]
    SttDisconnected(String),

    /// Speech synthesis failure.
    #[error(transparent)]
    Tts(#[from] TtsError),

    /// Unknown or already-ended call id.
    #[error("no active call with id {0}")]
    NotFound(String),
}

/// Result type for call operations.
pub type CallResult<T> = Result<T, CallError>;

impl CallError {
    /// Stable machine-readable kind, used in tool adapter error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::Provider(_) => "provider_error",
            Self::AttachTimeout => "attach_timeout",
            Self::ListenTimeout => "listen_timeout",
            Self::UserHungUp => "user_hung_up",
            Self::SttConnectFailed(_) => "stt_connect_failed",
            Self::SttDisconnected(_) => "stt_disconnected",
            Self::Tts(_) => "tts_error",
            Self::NotFound(_) => "not_found",
        }
    }
}

impl From<SttError> for CallError {
    fn from(e: SttError) -> Self {
        match e {
            SttError::Timeout => Self::ListenTimeout,
            SttError::ConnectionFailed(m) | SttError::Configuration(m) => {
                Self::SttConnectFailed(m)
            }
            SttError::Closed => Self::SttDisconnected("session closed".to_string()),
            SttError::Disconnected(m) => Self::SttDisconnected(m),
        }
    }
}

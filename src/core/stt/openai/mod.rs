//! OpenAI realtime transcription provider.

mod client;
mod messages;

pub use client::{OPENAI_REALTIME_STT_URL, OpenAiSttConfig, OpenAiSttFactory, OpenAiSttSession};
pub use messages::{
    ClientEvent, ErrorInfo, InputAudioTranscription, ServerEvent, SessionInfo,
    TranscriptionSessionConfig, TurnDetection,
};

//! Base trait and types for outbound telephony providers.
//!
//! A provider knows how to place an outbound call, attach bidirectional
//! media streaming to it, and tear it down. Two wire styles exist: an
//! event-driven provider that takes REST actions in response to JSON
//! webhook events, and a document-driven provider that expects an XML
//! response at webhook time. The trait covers both so the call core never
//! branches on the concrete provider.

use async_trait::async_trait;
use thiserror::Error;

/// Ring timeout passed on every outbound call request.
pub const RING_TIMEOUT_SECS: u32 = 60;

/// Errors returned by telephony REST operations.
#[derive(Debug, Error)]
pub enum TelephonyError {
    /// The HTTP request itself failed (connect, timeout, TLS).
    #[error("provider request failed: {0}")]
    Http(String),

    /// The provider answered with a non-2xx status.
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The provider response could not be decoded.
    #[error("unexpected provider response: {0}")]
    Decode(String),

    /// Provider credentials or settings are unusable.
    #[error("invalid provider configuration: {0}")]
    Configuration(String),
}

/// Result type for telephony operations.
pub type TelephonyResult<T> = Result<T, TelephonyError>;

/// Abstract outbound-call operations.
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Place an outbound call and return the provider's call identifier.
    ///
    /// The request always carries answering-machine detection and the
    /// standard ring timeout. `webhook_url` is where the provider will
    /// deliver call lifecycle events.
    async fn place_call(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> TelephonyResult<String>;

    /// Ask the provider to open its media websocket to `stream_url`.
    ///
    /// Event-driven providers implement this as a REST action; document-
    /// driven providers connect from the webhook response instead and
    /// implement this as a no-op.
    async fn start_streaming(
        &self,
        provider_call_id: &str,
        stream_url: &str,
    ) -> TelephonyResult<()>;

    /// Hang up the call. Best-effort: failures are logged, not returned.
    async fn hangup(&self, provider_call_id: &str);

    /// XML document instructing the provider to connect call media to the
    /// given websocket URL, for providers that take instructions in the
    /// webhook response body.
    fn stream_connect_document(&self, stream_url: &str) -> String;

    /// Short provider name used in logs and the factory.
    fn name(&self) -> &'static str;
}

mod base;
pub mod telnyx;
pub mod twilio;

use std::sync::Arc;

pub use base::{RING_TIMEOUT_SECS, TelephonyError, TelephonyProvider, TelephonyResult};
pub use telnyx::{TELNYX_API_URL, TelnyxConfig, TelnyxProvider};
pub use twilio::{TWILIO_API_URL, TwilioConfig, TwilioProvider};

use crate::config::ServerConfig;

/// XML document instructing the provider to connect call media to the
/// given websocket URL. Shared by both providers: Twilio consumes it as
/// TwiML and Telnyx accepts the same shape as TeXML.
pub fn connect_document(stream_url: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n\
         \x20 <Connect>\n\
         \x20   <Stream url=\"{stream_url}\" />\n\
         \x20 </Connect>\n\
         </Response>"
    )
}

/// Factory function to create a telephony provider.
///
/// # Supported Providers
///
/// - `"telnyx"` — event-driven JSON webhooks plus REST streaming actions
/// - `"twilio"` — form-encoded webhooks answered with TwiML
pub fn create_telephony_provider(
    provider: &str,
    config: &ServerConfig,
) -> TelephonyResult<Arc<dyn TelephonyProvider>> {
    match provider.to_lowercase().as_str() {
        "telnyx" => {
            let provider = TelnyxProvider::new(TelnyxConfig::new(
                config.telnyx_api_key.clone().unwrap_or_default(),
                config.telnyx_connection_id.clone().unwrap_or_default(),
            ))?;
            Ok(Arc::new(provider))
        }
        "twilio" => {
            let provider = TwilioProvider::new(TwilioConfig::new(
                config.twilio_account_sid.clone().unwrap_or_default(),
                config.twilio_auth_token.clone().unwrap_or_default(),
            ))?;
            Ok(Arc::new(provider))
        }
        other => Err(TelephonyError::Configuration(format!(
            "Unsupported telephony provider: {other}. Supported providers: telnyx, twilio"
        ))),
    }
}

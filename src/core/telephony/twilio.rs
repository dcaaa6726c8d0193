//! Twilio voice provider.
//!
//! Document-driven: the call is placed over REST with a webhook URL, and
//! when the callee answers Twilio POSTs to that URL expecting a TwiML
//! document in the response. Media streaming is requested by returning a
//! `<Connect><Stream>` document rather than by a separate REST action.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::base::{RING_TIMEOUT_SECS, TelephonyError, TelephonyProvider, TelephonyResult};

/// Default Twilio API base.
pub const TWILIO_API_URL: &str = "https://api.twilio.com";

/// Twilio provider configuration.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    /// Account SID (`AC...`).
    pub account_sid: String,
    /// Auth token, also the webhook signing secret.
    pub auth_token: String,
    /// API base override, primarily for tests.
    pub api_base: String,
}

impl TwilioConfig {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self {
            account_sid,
            auth_token,
            api_base: TWILIO_API_URL.to_string(),
        }
    }

    fn validate(&self) -> TelephonyResult<()> {
        if self.account_sid.is_empty() || self.auth_token.is_empty() {
            return Err(TelephonyError::Configuration(
                "Twilio account SID and auth token are required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    sid: String,
}

/// Twilio REST client.
pub struct TwilioProvider {
    config: TwilioConfig,
    http: reqwest::Client,
}

impl TwilioProvider {
    pub fn new(config: TwilioConfig) -> TelephonyResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TelephonyError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.config.api_base, self.config.account_sid
        )
    }

    fn call_url(&self, sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{sid}.json",
            self.config.api_base, self.config.account_sid
        )
    }
}

#[async_trait]
impl TelephonyProvider for TwilioProvider {
    async fn place_call(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> TelephonyResult<String> {
        let timeout = RING_TIMEOUT_SECS.to_string();
        let form = [
            ("To", to),
            ("From", from),
            ("Url", webhook_url),
            ("Method", "POST"),
            ("MachineDetection", "Enable"),
            ("Timeout", timeout.as_str()),
        ];

        let response = self
            .http
            .post(self.calls_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| TelephonyError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelephonyError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CreateCallResponse = response
            .json()
            .await
            .map_err(|e| TelephonyError::Decode(e.to_string()))?;
        info!(call_sid = %parsed.sid, to, "Twilio call placed");
        Ok(parsed.sid)
    }

    async fn start_streaming(
        &self,
        _provider_call_id: &str,
        _stream_url: &str,
    ) -> TelephonyResult<()> {
        // Streaming is requested through the TwiML returned at webhook
        // time; there is no REST action to take here.
        Ok(())
    }

    async fn hangup(&self, provider_call_id: &str) {
        let result = self
            .http
            .post(self.call_url(provider_call_id))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    provider_call_id,
                    status = response.status().as_u16(),
                    "Twilio hangup rejected"
                );
            }
            Err(e) => warn!(provider_call_id, "Twilio hangup failed: {e}"),
            _ => {}
        }
    }

    fn stream_connect_document(&self, stream_url: &str) -> String {
        super::connect_document(stream_url)
    }

    fn name(&self) -> &'static str {
        "twilio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_credentials() {
        let result = TwilioProvider::new(TwilioConfig::new(String::new(), String::new()));
        assert!(matches!(result, Err(TelephonyError::Configuration(_))));
    }

    #[test]
    fn urls_embed_account_sid() {
        let provider =
            TwilioProvider::new(TwilioConfig::new("AC123".into(), "token".into())).unwrap();
        assert_eq!(
            provider.calls_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Calls.json"
        );
        assert_eq!(
            provider.call_url("CA9"),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Calls/CA9.json"
        );
    }

    #[test]
    fn create_call_response_parses() {
        let parsed: CreateCallResponse =
            serde_json::from_str(r#"{"sid":"CA42","status":"queued"}"#).unwrap();
        assert_eq!(parsed.sid, "CA42");
    }
}

//! Telnyx Call Control provider.
//!
//! Event-driven: the call is placed over REST, lifecycle events arrive as
//! JSON webhooks, and media streaming is attached with a follow-up REST
//! action once the call is answered.
//!
//! # API Reference
//!
//! - `POST /v2/calls` — place a call
//! - `POST /v2/calls/{id}/actions/streaming_start` — attach media
//! - `POST /v2/calls/{id}/actions/hangup` — tear down

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::base::{RING_TIMEOUT_SECS, TelephonyError, TelephonyProvider, TelephonyResult};

/// Default Telnyx API base.
pub const TELNYX_API_URL: &str = "https://api.telnyx.com";

/// Telnyx provider configuration.
#[derive(Debug, Clone)]
pub struct TelnyxConfig {
    /// API key (`KEY...`) used as a bearer token.
    pub api_key: String,
    /// Call Control connection id the outbound leg is placed on.
    pub connection_id: String,
    /// API base override, primarily for tests.
    pub api_base: String,
}

impl TelnyxConfig {
    pub fn new(api_key: String, connection_id: String) -> Self {
        Self {
            api_key,
            connection_id,
            api_base: TELNYX_API_URL.to_string(),
        }
    }

    fn validate(&self) -> TelephonyResult<()> {
        if self.api_key.is_empty() {
            return Err(TelephonyError::Configuration(
                "Telnyx API key is required".to_string(),
            ));
        }
        if self.connection_id.is_empty() {
            return Err(TelephonyError::Configuration(
                "Telnyx connection id is required".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct CreateCallRequest<'a> {
    connection_id: &'a str,
    to: &'a str,
    from: &'a str,
    webhook_url: &'a str,
    webhook_url_method: &'static str,
    answering_machine_detection: &'static str,
    timeout_secs: u32,
}

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    data: CreateCallData,
}

#[derive(Debug, Deserialize)]
struct CreateCallData {
    call_control_id: String,
}

#[derive(Debug, Serialize)]
struct StreamingStartRequest<'a> {
    stream_url: &'a str,
    stream_track: &'static str,
    stream_bidirectional_mode: &'static str,
    stream_bidirectional_codec: &'static str,
}

// =============================================================================
// Provider
// =============================================================================

/// Telnyx Call Control client.
pub struct TelnyxProvider {
    config: TelnyxConfig,
    http: reqwest::Client,
}

impl TelnyxProvider {
    pub fn new(config: TelnyxConfig) -> TelephonyResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TelephonyError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base)
    }

    async fn post_action<B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> TelephonyResult<reqwest::Response> {
        let mut req = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.config.api_key);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req
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
        Ok(response)
    }
}

#[async_trait]
impl TelephonyProvider for TelnyxProvider {
    async fn place_call(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> TelephonyResult<String> {
        let request = CreateCallRequest {
            connection_id: &self.config.connection_id,
            to,
            from,
            webhook_url,
            webhook_url_method: "POST",
            answering_machine_detection: "detect",
            timeout_secs: RING_TIMEOUT_SECS,
        };

        let response = self.post_action("/v2/calls", Some(&request)).await?;
        let parsed: CreateCallResponse = response
            .json()
            .await
            .map_err(|e| TelephonyError::Decode(e.to_string()))?;

        info!(
            call_control_id = %parsed.data.call_control_id,
            to, "Telnyx call placed"
        );
        Ok(parsed.data.call_control_id)
    }

    async fn start_streaming(
        &self,
        provider_call_id: &str,
        stream_url: &str,
    ) -> TelephonyResult<()> {
        let request = StreamingStartRequest {
            stream_url,
            stream_track: "both_tracks",
            stream_bidirectional_mode: "rtp",
            stream_bidirectional_codec: "PCMU",
        };

        self.post_action(
            &format!("/v2/calls/{provider_call_id}/actions/streaming_start"),
            Some(&request),
        )
        .await?;
        info!(provider_call_id, "Telnyx streaming started");
        Ok(())
    }

    async fn hangup(&self, provider_call_id: &str) {
        let result = self
            .post_action::<()>(
                &format!("/v2/calls/{provider_call_id}/actions/hangup"),
                None,
            )
            .await;
        if let Err(e) = result {
            warn!(provider_call_id, "Telnyx hangup failed: {e}");
        }
    }

    fn stream_connect_document(&self, stream_url: &str) -> String {
        // Telnyx attaches media over REST; the TeXML document is only used
        // if the connection is configured for webhook-driven instructions.
        super::connect_document(stream_url)
    }

    fn name(&self) -> &'static str {
        "telnyx"
    }
}

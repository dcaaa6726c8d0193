//! Provider webhook intake at `POST /twiml`.
//!
//! Two wire styles share one endpoint:
//!
//! - **JSON** (event-driven provider): Ed25519 signature over
//!   `timestamp|body`, events dispatched by type, 200 returned before the
//!   event is processed.
//! - **Form-urlencoded** (document-driven provider): HMAC-SHA1 signature
//!   over the canonical URL plus sorted parameters; terminal call
//!   statuses flag the call hung up, anything else is answered with the
//!   streaming-connect document.
//!
//! Unknown content types are rejected with 400.
//!
//! When the opt-in ephemeral-tunnel compatibility mode is active and the
//! public host is a free-tier tunnel domain, signature mismatches are
//! logged instead of rejected: such tunnels re-canonicalize headers in
//! ways that break verification. Every other host always enforces.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::prelude::*;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{debug, info, warn};

use crate::core::call::ProviderEvent;
use crate::state::AppState;
use crate::utils;

type HmacSha1 = Hmac<Sha1>;

/// Webhook entry point; branches on content type.
pub async fn twiml_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/json") {
        handle_json_event(state, &headers, &body).await
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        handle_form_event(state, &headers, &body).await
    } else {
        debug!(content_type, "webhook with unsupported content type");
        StatusCode::BAD_REQUEST.into_response()
    }
}

// =============================================================================
// JSON provider (event-driven)
// =============================================================================

#[derive(Debug, Deserialize)]
struct JsonEvent {
    data: JsonEventData,
}

#[derive(Debug, Deserialize)]
struct JsonEventData {
    event_type: String,
    #[serde(default)]
    payload: JsonEventPayload,
}

#[derive(Debug, Default, Deserialize)]
struct JsonEventPayload {
    #[serde(default)]
    call_control_id: Option<String>,
    #[serde(default)]
    result: Option<String>,
}

async fn handle_json_event(
    state: Arc<AppState>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    match verify_json_signature(&state, headers, body) {
        SignatureCheck::Valid => {}
        SignatureCheck::NoKeyConfigured => {
            warn!("no webhook public key configured, accepting unverified event");
        }
        SignatureCheck::Invalid => {
            if tunnel_compat_active(&state) {
                warn!("webhook signature mismatch tolerated in tunnel compatibility mode");
            } else {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    let event: JsonEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            warn!("unparseable webhook event: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // Acknowledge before processing; the queued dispatcher preserves
    // arrival order per call.
    let event_type = event.data.event_type;
    match event.data.payload.call_control_id {
        Some(provider_call_id) => {
            state.enqueue_provider_event(ProviderEvent {
                event_type,
                provider_call_id,
                result: event.data.payload.result,
            });
        }
        None => debug!(%event_type, "event without call id"),
    }
    StatusCode::OK.into_response()
}

enum SignatureCheck {
    Valid,
    Invalid,
    NoKeyConfigured,
}

fn verify_json_signature(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> SignatureCheck {
    let Some(public_key) = state.config.webhook_public_key.as_deref() else {
        return SignatureCheck::NoKeyConfigured;
    };

    let signature = headers
        .get("telnyx-signature-ed25519")
        .and_then(|v| v.to_str().ok());
    let timestamp = headers
        .get("telnyx-timestamp")
        .and_then(|v| v.to_str().ok());

    match (signature, timestamp) {
        (Some(signature), Some(timestamp))
            if verify_ed25519(public_key, timestamp, body, signature) =>
        {
            SignatureCheck::Valid
        }
        _ => SignatureCheck::Invalid,
    }
}

/// Verify an Ed25519 signature over `timestamp|body`.
pub fn verify_ed25519(
    public_key_b64: &str,
    timestamp: &str,
    body: &[u8],
    signature_b64: &str,
) -> bool {
    let Ok(key_bytes) = BASE64_STANDARD.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature_bytes) = BASE64_STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };

    let mut message = Vec::with_capacity(timestamp.len() + 1 + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'|');
    message.extend_from_slice(body);

    key.verify(&message, &signature).is_ok()
}

// =============================================================================
// Form provider (document-driven)
// =============================================================================

async fn handle_form_event(
    state: Arc<AppState>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    let params: BTreeMap<String, String> = url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if let Some(auth_token) = state.config.twilio_auth_token.as_deref() {
        let signature = headers
            .get("x-twilio-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let url = format!(
            "https://{}/twiml",
            state.manager.public_host().unwrap_or_default()
        );
        if !verify_form_signature(auth_token, &url, &params, signature) {
            if tunnel_compat_active(&state) {
                warn!("form webhook signature mismatch tolerated in tunnel compatibility mode");
            } else {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    let call_sid = params.get("CallSid").map(String::as_str).unwrap_or("");
    let call_status = params.get("CallStatus").map(String::as_str).unwrap_or("");

    if matches!(call_status, "completed" | "busy" | "no-answer" | "failed") {
        info!(call_sid, call_status, "terminal call status");
        state.manager.handle_hangup(call_sid);
        return StatusCode::OK.into_response();
    }

    let Some(call) = state.manager.registry().get_by_provider_id(call_sid) else {
        warn!(call_sid, "webhook for unknown call");
        return StatusCode::NOT_FOUND.into_response();
    };

    match state.manager.connect_document_for(&call) {
        Ok(document) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            document,
        )
            .into_response(),
        Err(e) => {
            warn!(call_sid, "cannot build connect document: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Verify the shared-secret HMAC-SHA1 signature: the public URL with the
/// form parameters appended in key order, keyed by the auth token.
pub fn verify_form_signature(
    auth_token: &str,
    url: &str,
    params: &BTreeMap<String, String>,
    signature_b64: &str,
) -> bool {
    let mut signed = String::from(url);
    for (key, value) in params {
        signed.push_str(key);
        signed.push_str(value);
    }

    let Ok(mut mac) = HmacSha1::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };
    mac.update(signed.as_bytes());
    let expected = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    utils::constant_time_eq(&expected, signature_b64)
}

fn tunnel_compat_active(state: &AppState) -> bool {
    state.manager.allow_tunnel_compat
        && state
            .manager
            .public_host()
            .is_some_and(|host| utils::is_ephemeral_tunnel_host(&host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn ed25519_round_trip() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public_b64 = BASE64_STANDARD.encode(signing.verifying_key().as_bytes());

        let body = br#"{"data":{"event_type":"call.answered"}}"#;
        let timestamp = "1718000000";
        let mut message = Vec::new();
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'|');
        message.extend_from_slice(body);
        let signature_b64 = BASE64_STANDARD.encode(signing.sign(&message).to_bytes());

        assert!(verify_ed25519(&public_b64, timestamp, body, &signature_b64));
        assert!(!verify_ed25519(&public_b64, "1718000001", body, &signature_b64));
        assert!(!verify_ed25519(&public_b64, timestamp, b"tampered", &signature_b64));
    }

    #[test]
    fn ed25519_rejects_malformed_inputs() {
        assert!(!verify_ed25519("not base64!!", "0", b"x", "also not"));
        let short_key = BASE64_STANDARD.encode([1u8; 16]);
        assert!(!verify_ed25519(&short_key, "0", b"x", ""));
    }

    #[test]
    fn form_signature_round_trip() {
        let auth_token = "shared-secret";
        let url = "https://bridge.example.com/twiml";
        let mut params = BTreeMap::new();
        params.insert("CallSid".to_string(), "CA42".to_string());
        params.insert("CallStatus".to_string(), "in-progress".to_string());

        // Compute the expected signature the way the provider does.
        let mut signed = String::from(url);
        for (k, v) in &params {
            signed.push_str(k);
            signed.push_str(v);
        }
        let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        assert!(verify_form_signature(auth_token, url, &params, &signature));
        assert!(!verify_form_signature("wrong-token", url, &params, &signature));
        params.insert("Extra".to_string(), "param".to_string());
        assert!(!verify_form_signature(auth_token, url, &params, &signature));
    }
}

//! End-to-end call flow tests.
//!
//! The real router, registry, call manager, and media socket plumbing run
//! against mock telephony/TTS/STT backends. A fake provider task plays
//! the part of the phone network: it opens the media websocket with the
//! call's token, sends the `start` frame, and streams inbound µ-law.

mod mock_providers;

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::{self, Message};

use mock_providers::{MockStt, start_test_server, test_timing};
use voicebridge::core::call::{Call, CallRegistry, Speaker};
use voicebridge::{CallError, ServerConfig, ToolAdapter};

/// Spawn the fake phone network: waits for a call to exist, "answers"
/// after a delay, opens the media socket, sends `start`, then streams
/// inbound audio frames until the socket closes.
fn spawn_fake_provider(
    ws_base: String,
    registry: Arc<CallRegistry>,
    answer_delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // Wait for the call record to appear.
        let call = loop {
            if let Some(call) = registry.most_recent_active() {
                break call;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let token = call.ws_token.clone();

        tokio::time::sleep(answer_delay).await;

        let url = format!("{ws_base}/media-stream?token={token}");
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .expect("media socket upgrade");
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(
            json!({"event": "start", "streamSid": "ss-1"}).to_string().into(),
        ))
        .await
        .expect("start frame");

        let payload = BASE64_STANDARD.encode([0xFFu8; 160]);
        let media_frame = json!({
            "event": "media",
            "media": { "track": "inbound", "payload": payload },
            "streamSid": "ss-1",
        })
        .to_string();

        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if sink
                        .send(Message::Text(media_frame.clone().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        // Drain the agent's outbound media.
                        Some(Ok(Message::Text(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }
    })
}

#[tokio::test]
async fn full_conversation_happy_path() {
    let stt = MockStt::scripted(&["move on to task B", "yes please"]);
    let harness = start_test_server(ServerConfig::for_tests(), stt, test_timing()).await;
    let registry = harness.state.manager.registry().clone();
    let provider = spawn_fake_provider(
        harness.ws_base.clone(),
        registry.clone(),
        Duration::from_millis(200),
    );

    let tools = ToolAdapter::new(harness.state.manager.clone());

    // Scenario: initiate speaks the greeting and returns the first reply.
    let outcome = tools
        .start_call("Hello, finished task A, what's next?")
        .await
        .unwrap();
    assert!(outcome.call_id.starts_with("call-1-"));
    assert_eq!(outcome.user_reply, "move on to task B");

    let call = registry.get(&outcome.call_id).unwrap();
    assert_eq!(call.stream_sid().as_deref(), Some("ss-1"));
    let history = call.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].speaker, Speaker::Agent);
    assert_eq!(history[0].text, "Hello, finished task A, what's next?");
    assert_eq!(history[1].speaker, Speaker::User);
    assert_eq!(history[1].text, "move on to task B");

    // Follow-up turn grows history by exactly one agent/user pair.
    let reply = tools
        .continue_call(&outcome.call_id, "Got it. Add rate limiting too?")
        .await
        .unwrap();
    assert_eq!(reply, "yes please");
    assert_eq!(call.history().len(), 4);

    // End: one more speak, no listen, and every index is cleared.
    let ended = tools
        .end_call(&outcome.call_id, "Perfect, talk soon.")
        .await
        .unwrap();
    assert!(
        ended.duration_seconds >= 2,
        "duration {} should include the drain",
        ended.duration_seconds
    );
    assert_eq!(registry.active_count(), 0);
    assert!(registry.get(&outcome.call_id).is_none());
    assert!(registry.get_by_provider_id("pc-1").is_none());
    assert!(
        harness
            .telephony
            .hangups
            .load(std::sync::atomic::Ordering::SeqCst)
            >= 1
    );

    // Ending twice is NotFound.
    assert!(matches!(
        tools.end_call(&outcome.call_id, "bye").await,
        Err(CallError::NotFound(_))
    ));

    provider.abort();
}

#[tokio::test]
async fn remote_hangup_mid_listen_raises_user_hung_up() {
    let stt = MockStt::scripted(&["hello there"]);
    let harness = start_test_server(ServerConfig::for_tests(), stt, test_timing()).await;
    let registry = harness.state.manager.registry().clone();
    let provider = spawn_fake_provider(
        harness.ws_base.clone(),
        registry.clone(),
        Duration::from_millis(100),
    );

    let outcome = harness.state.manager.initiate("Hello").await.unwrap();

    // The script is exhausted, so this turn parks in its listen.
    let manager = harness.state.manager.clone();
    let call_id = outcome.call_id.clone();
    let turn = tokio::spawn(async move { manager.continue_call(&call_id, "Still there?").await });
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The provider reports the remote hangup over the webhook.
    let response = reqwest::Client::new()
        .post(format!("{}/twiml", harness.http_base))
        .header("content-type", "application/json")
        .body(
            json!({
                "data": {
                    "event_type": "call.hangup",
                    "payload": { "call_control_id": "pc-1" }
                }
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert!(matches!(turn.await.unwrap(), Err(CallError::UserHungUp)));
    assert_eq!(registry.active_count(), 0);

    provider.abort();
}

#[tokio::test]
async fn attach_timeout_discards_the_call() {
    let stt = MockStt::scripted(&[]);
    let mut timing = test_timing();
    timing.attach_timeout = Duration::from_millis(400);
    let harness = start_test_server(ServerConfig::for_tests(), stt, timing).await;

    // No provider ever opens the media socket.
    let result = harness.state.manager.initiate("Hello").await;
    assert!(matches!(result, Err(CallError::AttachTimeout)));
    assert_eq!(harness.state.manager.registry().active_count(), 0);
}

#[tokio::test]
async fn webhook_rejects_bad_ed25519_signature() {
    let signing = SigningKey::from_bytes(&[42u8; 32]);
    let mut config = ServerConfig::for_tests();
    config.webhook_public_key =
        Some(BASE64_STANDARD.encode(signing.verifying_key().as_bytes()));

    let stt = MockStt::scripted(&[]);
    let harness = start_test_server(config, stt, test_timing()).await;

    let body = json!({
        "data": { "event_type": "call.initiated", "payload": { "call_control_id": "pc-9" } }
    })
    .to_string();
    let client = reqwest::Client::new();

    // Wrong signature: rejected, no state change.
    let response = client
        .post(format!("{}/twiml", harness.http_base))
        .header("content-type", "application/json")
        .header("telnyx-timestamp", "1718000000")
        .header(
            "telnyx-signature-ed25519",
            BASE64_STANDARD.encode([0u8; 64]),
        )
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(harness.state.manager.registry().active_count(), 0);

    // Correct signature over timestamp|body: accepted.
    let timestamp = "1718000000";
    let mut message = Vec::new();
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'|');
    message.extend_from_slice(body.as_bytes());
    let signature = BASE64_STANDARD.encode(signing.sign(&message).to_bytes());

    let response = client
        .post(format!("{}/twiml", harness.http_base))
        .header("content-type", "application/json")
        .header("telnyx-timestamp", timestamp)
        .header("telnyx-signature-ed25519", signature)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn webhook_rejects_unknown_content_type() {
    let stt = MockStt::scripted(&[]);
    let harness = start_test_server(ServerConfig::for_tests(), stt, test_timing()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/twiml", harness.http_base))
        .header("content-type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn media_socket_token_authentication() {
    let stt = MockStt::scripted(&[]);
    let harness = start_test_server(ServerConfig::for_tests(), stt.clone(), test_timing()).await;
    let registry = harness.state.manager.registry().clone();

    let (call_id, seq) = registry.mint_call_id();
    let call = Arc::new(Call::new(
        call_id,
        seq,
        "+15550001111".into(),
        "+15550002222".into(),
        stt,
    ));
    registry.insert(call.clone());

    // Wrong token on a non-ephemeral host is always 401.
    let bad = tokio_tungstenite::connect_async(format!(
        "{}/media-stream?token=deadbeefdeadbeefdeadbeefdeadbeef",
        harness.ws_base
    ))
    .await;
    match bad {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401, got {other:?}"),
    }

    // Missing token is 401 too (compat mode is off).
    let tokenless =
        tokio_tungstenite::connect_async(format!("{}/media-stream", harness.ws_base)).await;
    assert!(matches!(tokenless, Err(tungstenite::Error::Http(_))));

    // The correct token upgrades (101) exactly once.
    let url = format!("{}/media-stream?token={}", harness.ws_base, call.ws_token);
    let (socket, response) = tokio_tungstenite::connect_async(url.clone()).await.unwrap();
    assert_eq!(response.status(), 101);
    drop(socket);

    // The token was consumed by the first upgrade.
    let reused = tokio_tungstenite::connect_async(url).await;
    assert!(matches!(reused, Err(tungstenite::Error::Http(_))));
}

#[tokio::test]
async fn form_webhook_returns_connect_document_then_hangs_up() {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    let stt = MockStt::scripted(&[]);
    let harness = start_test_server(ServerConfig::for_tests(), stt.clone(), test_timing()).await;
    let registry = harness.state.manager.registry().clone();

    let (call_id, seq) = registry.mint_call_id();
    let call = Arc::new(Call::new(
        call_id.clone(),
        seq,
        "+15550001111".into(),
        "+15550002222".into(),
        stt,
    ));
    registry.insert(call.clone());
    call.set_provider_call_id("CA42".into());
    registry.register_provider_id("CA42", &call_id);

    let sign = |pairs: &[(&str, &str)]| {
        let mut signed = String::from("https://bridge.example.com/twiml");
        for (k, v) in pairs {
            signed.push_str(k);
            signed.push_str(v);
        }
        let mut mac = Hmac::<Sha1>::new_from_slice(b"token_test").unwrap();
        mac.update(signed.as_bytes());
        BASE64_STANDARD.encode(mac.finalize().into_bytes())
    };
    let client = reqwest::Client::new();

    // In-progress status: answered with the streaming-connect document.
    let pairs = [("CallSid", "CA42"), ("CallStatus", "in-progress")];
    let response = client
        .post(format!("{}/twiml", harness.http_base))
        .header("x-twilio-signature", sign(&pairs))
        .form(&pairs)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let document = response.text().await.unwrap();
    assert!(document.contains("<Connect>"));
    assert!(document.contains(&format!(
        "wss://bridge.example.com/media-stream?token={}",
        call.ws_token
    )));

    // Bad signature is rejected outright.
    let response = client
        .post(format!("{}/twiml", harness.http_base))
        .header("x-twilio-signature", "bogus")
        .form(&pairs)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Terminal status flags the call as hung up.
    let pairs = [("CallSid", "CA42"), ("CallStatus", "completed")];
    let response = client
        .post(format!("{}/twiml", harness.http_base))
        .header("x-twilio-signature", sign(&pairs))
        .form(&pairs)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(call.is_hung_up());
}

#[tokio::test]
async fn health_reports_active_calls() {
    let stt = MockStt::scripted(&[]);
    let harness = start_test_server(ServerConfig::for_tests(), stt, test_timing()).await;

    let body: serde_json::Value = reqwest::get(format!("{}/health", harness.http_base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeCalls"], 0);
}

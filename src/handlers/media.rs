//! Media socket endpoint at `GET /media-stream`.
//!
//! The telephony provider connects here after being handed
//! `wss://<host>/media-stream?token=<wsToken>`. The upgrade is
//! authenticated by the call's single-use token, compared in constant
//! time. After the upgrade the socket is split: a writer task owns the
//! send half and drains the call's media channel, while this handler
//! demultiplexes inbound frames.
//!
//! Inbound traffic is JSON text frames (`start` / `media` / `stop`).
//! Binary frames are ignored outright: their track cannot be determined,
//! and forwarding them would loop the agent's own synthesized audio back
//! into transcription.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::call::{Call, MediaCommand};
use crate::state::AppState;
use crate::utils;

/// Capacity of the per-call outbound frame channel. At one frame per
/// 18 ms this is several seconds of headroom.
const MEDIA_CHANNEL_CAPACITY: usize = 512;

/// Media socket upgrade handler.
pub async fn media_stream(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let call = match resolve_call(&state, params.get("token").map(String::as_str)) {
        Some(call) => call,
        None => return StatusCode::UNAUTHORIZED.into_response(),
    };

    info!(call_id = %call.call_id, "media socket upgrade accepted");
    ws.on_upgrade(move |socket| handle_media_socket(socket, call))
}

/// Pair the upgrade with its call.
///
/// The registry authenticates the token — candidates are compared in
/// constant time — and consumes the mapping (one upgrade per token). The
/// tokenless fallback to the most recently created call exists only
/// behind the explicit tunnel-compatibility opt-in, and only when the
/// public host is an ephemeral tunnel domain.
fn resolve_call(state: &AppState, token: Option<&str>) -> Option<Arc<Call>> {
    if let Some(token) = token
        && let Some(call) = state.manager.registry().take_by_ws_token(token)
    {
        return Some(call);
    }

    let compat = state.manager.allow_tunnel_compat
        && state
            .manager
            .public_host()
            .is_some_and(|host| utils::is_ephemeral_tunnel_host(&host));
    if !compat {
        warn!("media socket upgrade rejected: unknown or missing token");
        return None;
    }

    match state.manager.registry().most_recent_active() {
        Some(call) => {
            warn!(
                call_id = %call.call_id,
                "tokenless media socket paired with most recent call (tunnel compat)"
            );
            Some(call)
        }
        None => {
            warn!("tokenless media socket with no active call");
            None
        }
    }
}

/// Inbound frames from the provider.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        #[serde(default)]
        start: Option<StartInfo>,
    },
    Media {
        #[serde(default)]
        media: Option<MediaInfo>,
    },
    Stop,
    #[serde(other)]
    Other,
}

/// Nested `start` payload; some providers put the sid here instead of at
/// the top level.
#[derive(Debug, Deserialize)]
struct StartInfo {
    #[serde(rename = "streamSid", default)]
    stream_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    #[serde(default)]
    track: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

async fn handle_media_socket(socket: WebSocket, call: Arc<Call>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<MediaCommand>(MEDIA_CHANNEL_CAPACITY);
    call.attach_media(tx);

    // Writer task: owns the send half, paced upstream by the speak loop.
    let writer_call_id = call.call_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                MediaCommand::Frame(frame) => {
                    if let Err(e) = sender.send(Message::Text(frame.into())).await {
                        debug!(call_id = %writer_call_id, "media socket send failed: {e}");
                        break;
                    }
                }
                MediaCommand::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Control and media frames are JSON objects; anything
                // else on a text frame is noise.
                if text.as_bytes().first() != Some(&0x7B) {
                    continue;
                }
                match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(frame) => {
                        if !handle_inbound_frame(&call, frame).await {
                            break;
                        }
                    }
                    Err(e) => debug!(call_id = %call.call_id, "unparseable media frame: {e}"),
                }
            }
            // Binary frames carry no track marker; ignore them.
            Ok(Message::Binary(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(call_id = %call.call_id, "media socket closed by provider");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(call_id = %call.call_id, "media socket error: {e}");
                break;
            }
        }
    }

    // Whatever ended the read loop, the stream is gone.
    call.mark_hung_up();
    writer.abort();
    info!(call_id = %call.call_id, "media socket detached");
}

/// Returns false when the stream is over.
async fn handle_inbound_frame(call: &Arc<Call>, frame: InboundFrame) -> bool {
    match frame {
        InboundFrame::Start { stream_sid, start } => {
            let sid = stream_sid.or_else(|| start.and_then(|s| s.stream_sid));
            if let Some(sid) = sid {
                call.set_stream_sid(sid);
            } else {
                debug!(call_id = %call.call_id, "start frame without stream sid");
            }
            true
        }
        InboundFrame::Media { media } => {
            let Some(media) = media else { return true };
            // Only the caller's own track feeds transcription.
            if !matches!(media.track.as_deref(), Some("inbound" | "inbound_track")) {
                return true;
            }
            if let Some(payload) = media.payload
                && let Ok(mulaw) = BASE64_STANDARD.decode(payload)
            {
                call.stt.send_audio(Bytes::from(mulaw)).await;
            }
            true
        }
        InboundFrame::Stop => {
            info!(call_id = %call.call_id, "stop frame received");
            call.mark_hung_up();
            false
        }
        InboundFrame::Other => true,
    }
}

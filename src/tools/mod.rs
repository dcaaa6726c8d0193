//! Agent-facing tool adapter.
//!
//! Three operations, each a thin delegation to the call core:
//!
//! - `start_call(text)` — place the call, speak `text` once the stream
//!   attaches, return the callee's first reply
//! - `continue_call(call_id, text)` — one more speak+listen turn
//! - `end_call(call_id, text)` — speak a farewell (no listen) and tear
//!   the call down
//!
//! # Contract notes
//!
//! History reflects *intent*, not realized audio: if speaking fails after
//! some audio already went out, the turn appends nothing. Operations on a
//! call that is not in a state to accept them (or that no longer exists)
//! come back as error payloads; `end_call` on an already-ended call is
//! `not_found`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::core::call::{CallManager, InitiateOutcome};
use crate::errors::{CallError, CallResult};

/// Result of a successful end operation.
#[derive(Debug, Clone, Serialize)]
pub struct EndOutcome {
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: u64,
}

/// The tool surface handed to the agent runtime.
pub struct ToolAdapter {
    manager: Arc<CallManager>,
}

impl ToolAdapter {
    pub fn new(manager: Arc<CallManager>) -> Self {
        Self { manager }
    }

    /// Start a call and run the first turn.
    pub async fn start_call(&self, text: &str) -> CallResult<InitiateOutcome> {
        self.manager.initiate(text).await
    }

    /// Run one turn on an existing call.
    pub async fn continue_call(&self, call_id: &str, text: &str) -> CallResult<String> {
        self.manager.continue_call(call_id, text).await
    }

    /// Speak a farewell and end the call.
    pub async fn end_call(&self, call_id: &str, text: &str) -> CallResult<EndOutcome> {
        let duration_seconds = self.manager.end_call(call_id, text).await?;
        Ok(EndOutcome { duration_seconds })
    }
}

/// Render a call error as the structured payload the agent sees.
pub fn error_payload(error: &CallError) -> Value {
    json!({
        "error": error.kind(),
        "message": error.to_string(),
    })
}

//! Small shared utilities.

use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Compare two secrets without leaking their difference through timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Mint a random 128-bit websocket auth token.
pub fn mint_ws_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Short random suffix for human-scannable ids.
pub fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Whether a public host is a free-tier ephemeral tunnel domain.
///
/// Such hosts get a fresh name on every reconnect and are known to break
/// webhook header canonicalization, which is why the compatibility
/// carve-outs key on this.
pub fn is_ephemeral_tunnel_host(host: &str) -> bool {
    let host = host
        .trim_start_matches("https://")
        .trim_start_matches("wss://");
    let host = host.split(['/', ':']).next().unwrap_or(host);
    host.ends_with(".ngrok-free.app")
        || host.ends_with(".ngrok-free.dev")
        || host.ends_with(".ngrok.io")
}

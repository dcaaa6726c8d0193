//! Public tunnel lifecycle.
//!
//! The telephony provider has to reach the local webhook server, so the
//! bridge fronts itself with an ngrok tunnel: the agent process is
//! spawned as a child, and its public URL is read from the local agent
//! API. A health loop watches the tunnel and reconnects with exponential
//! backoff when it drops. A reconnect can come back with a different
//! public URL; that is logged loudly because the URL already handed to
//! the provider is then stale and new calls may fail until it propagates.

use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::stt::ReconnectConfig;

/// Local agent API of the ngrok process.
pub const NGROK_AGENT_API: &str = "http://127.0.0.1:4040";

/// Errors raised by tunnel management.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to launch tunnel process: {0}")]
    Spawn(String),

    #[error("tunnel agent API unreachable: {0}")]
    AgentApi(String),

    #[error("tunnel reported no public URL")]
    NoPublicUrl,
}

/// Tunnel configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local HTTP port being exposed.
    pub local_port: u16,
    /// Agent API base, overridable for tests.
    pub agent_api: String,
    /// Interval of the health probe.
    pub health_interval: Duration,
    /// How long to wait for the freshly spawned agent to report a URL.
    pub startup_timeout: Duration,
    /// Reconnect backoff: 2 s base, doubling, ten attempts.
    pub reconnect: ReconnectConfig,
}

impl TunnelConfig {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            agent_api: NGROK_AGENT_API.to_string(),
            health_interval: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(15),
            reconnect: ReconnectConfig {
                enabled: true,
                max_attempts: 10,
                initial_delay_ms: 2_000,
                backoff_multiplier: 2.0,
                max_delay_ms: 60_000,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct TunnelsResponse {
    #[serde(default)]
    tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Deserialize)]
struct TunnelInfo {
    public_url: String,
    #[serde(default)]
    proto: String,
}

/// Strip the scheme from a public URL, leaving the host the provider
/// sees.
pub fn public_host_from_url(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

/// Owns the tunnel child process and its health monitor.
pub struct TunnelManager {
    config: TunnelConfig,
    http: reqwest::Client,
    public_url: StdMutex<Option<String>>,
    /// Set by `stop()`; suppresses reconnection.
    stopping: AtomicBool,
    child: Mutex<Option<Child>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            public_url: StdMutex::new(None),
            stopping: AtomicBool::new(false),
            child: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// Launch the tunnel and wait for its public URL.
    pub async fn start(&self) -> Result<String, TunnelError> {
        self.stopping.store(false, Ordering::SeqCst);
        self.spawn_process().await?;
        let url = self.resolve_url().await?;
        *self.public_url.lock().unwrap() = Some(url.clone());
        info!(%url, "tunnel established");
        Ok(url)
    }

    /// Current public URL, if the tunnel is up.
    pub fn public_url(&self) -> Option<String> {
        self.public_url.lock().unwrap().clone()
    }

    /// Stop the tunnel and suppress any further reconnects.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to kill tunnel process: {e}");
            }
        }
        *self.public_url.lock().unwrap() = None;
        info!("tunnel stopped");
    }

    /// Run the 30-second health loop. `on_url_change` fires with the new
    /// public URL whenever a reconnect lands on a different one.
    pub async fn spawn_monitor(
        self: Arc<Self>,
        on_url_change: Arc<dyn Fn(String) + Send + Sync>,
    ) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(manager.config.health_interval).await;
                if manager.stopping.load(Ordering::SeqCst) {
                    break;
                }

                match manager.query_public_url().await {
                    Ok(url) => {
                        debug!(%url, "tunnel healthy");
                        let previous = manager.public_url.lock().unwrap().replace(url.clone());
                        if previous.as_deref() != Some(url.as_str()) {
                            warn!(%url, "tunnel URL changed; provider webhook URL is stale");
                            on_url_change(url);
                        }
                    }
                    Err(e) => {
                        warn!("tunnel lost ({e}), reconnecting");
                        if !manager.reconnect(&on_url_change).await {
                            error!("tunnel reconnect attempts exhausted");
                            break;
                        }
                    }
                }
            }
        });
        *self.monitor.lock().await = Some(handle);
    }

    /// Reconnect with exponential backoff. Returns false when attempts
    /// run out or a stop was requested.
    async fn reconnect(&self, on_url_change: &Arc<dyn Fn(String) + Send + Sync>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return false;
            }
            if !self.config.reconnect.should_retry(attempt) {
                return false;
            }
            attempt += 1;

            let delay = self.config.reconnect.calculate_delay(attempt);
            info!(
                attempt,
                max = self.config.reconnect.max_attempts,
                ?delay,
                "tunnel reconnect"
            );
            tokio::time::sleep(delay).await;

            if let Err(e) = self.spawn_process().await {
                warn!(attempt, "tunnel respawn failed: {e}");
                continue;
            }
            match self.resolve_url().await {
                Ok(url) => {
                    let previous = self.public_url.lock().unwrap().replace(url.clone());
                    if previous.as_deref() != Some(url.as_str()) {
                        warn!(%url, "tunnel reconnected with a new URL; re-register webhooks");
                        on_url_change(url);
                    } else {
                        info!("tunnel reconnected");
                    }
                    return true;
                }
                Err(e) => {
                    warn!(attempt, "tunnel came up without a URL: {e}");
                }
            }
        }
    }

    /// (Re)spawn the agent process, replacing any previous child.
    async fn spawn_process(&self) -> Result<(), TunnelError> {
        let mut slot = self.child.lock().await;
        if let Some(mut old) = slot.take() {
            let _ = old.kill().await;
        }

        let child = Command::new("ngrok")
            .arg("http")
            .arg(self.config.local_port.to_string())
            .arg("--log=stdout")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Spawn(e.to_string()))?;
        *slot = Some(child);
        Ok(())
    }

    /// Poll the agent API until it reports a public URL or the startup
    /// window elapses.
    async fn resolve_url(&self) -> Result<String, TunnelError> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            match self.query_public_url().await {
                Ok(url) => return Ok(url),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(e);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn query_public_url(&self) -> Result<String, TunnelError> {
        let response = self
            .http
            .get(format!("{}/api/tunnels", self.config.agent_api))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| TunnelError::AgentApi(e.to_string()))?;

        let parsed: TunnelsResponse = response
            .json()
            .await
            .map_err(|e| TunnelError::AgentApi(e.to_string()))?;

        select_public_url(&parsed).ok_or(TunnelError::NoPublicUrl)
    }
}

/// Prefer the https tunnel; fall back to whatever exists.
fn select_public_url(response: &TunnelsResponse) -> Option<String> {
    response
        .tunnels
        .iter()
        .find(|t| t.proto == "https")
        .or_else(|| response.tunnels.first())
        .map(|t| t.public_url.clone())
}

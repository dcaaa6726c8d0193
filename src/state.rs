//! Shared application state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::ServerConfig;
use crate::core::call::{CallManager, CallRegistry, ProviderEvent};
use crate::core::stt::create_stt_factory;
use crate::core::telephony::create_telephony_provider;
use crate::core::tts::create_tts_provider;
use crate::errors::{CallError, CallResult};

/// State shared by every HTTP and WebSocket handler.
pub struct AppState {
    pub config: ServerConfig,
    pub manager: Arc<CallManager>,
    /// Single-consumer webhook event queue; preserves arrival order.
    webhook_tx: mpsc::UnboundedSender<ProviderEvent>,
}

impl AppState {
    /// Build the full capability stack from configuration.
    ///
    /// Must run inside a tokio runtime: the webhook dispatcher task is
    /// spawned here.
    pub fn new(config: ServerConfig) -> CallResult<Self> {
        let registry = Arc::new(CallRegistry::new());
        let telephony = create_telephony_provider(&config.telephony_provider, &config)
            .map_err(|e| CallError::ConfigInvalid(e.to_string()))?;
        let tts = create_tts_provider("openai", &config)
            .map_err(|e| CallError::ConfigInvalid(e.to_string()))?;
        let stt_factory = create_stt_factory("openai", &config)
            .map_err(|e| CallError::ConfigInvalid(e.to_string()))?;

        let manager = Arc::new(CallManager::new(
            &config, registry, telephony, tts, stt_factory,
        ));
        Ok(Self::from_parts(config, manager))
    }

    /// Assemble state from a prebuilt manager; used by tests that swap in
    /// mock capabilities.
    pub fn from_parts(config: ServerConfig, manager: Arc<CallManager>) -> Self {
        let webhook_tx = spawn_webhook_dispatcher(manager.clone());
        Self {
            config,
            manager,
            webhook_tx,
        }
    }

    /// Queue a provider event for ordered processing. The webhook handler
    /// calls this after acknowledging the provider.
    pub fn enqueue_provider_event(&self, event: ProviderEvent) {
        if self.webhook_tx.send(event).is_err() {
            warn!("webhook dispatcher gone, dropping provider event");
        }
    }
}

/// One consumer task drains the queue, so events are handled strictly in
/// the order they arrived.
fn spawn_webhook_dispatcher(
    manager: Arc<CallManager>,
) -> mpsc::UnboundedSender<ProviderEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProviderEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            manager.dispatch_provider_event(event).await;
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_from_valid_config() {
        let state = AppState::new(ServerConfig::for_tests()).unwrap();
        assert_eq!(state.manager.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn rejects_unusable_provider_config() {
        let mut config = ServerConfig::for_tests();
        config.telnyx_api_key = Some(String::new());
        assert!(AppState::new(config).is_err());
    }

    #[tokio::test]
    async fn queued_events_reach_the_manager_in_order() {
        let state = AppState::new(ServerConfig::for_tests()).unwrap();
        // Events for unknown calls are logged and dropped; this only
        // exercises the queue plumbing.
        state.enqueue_provider_event(ProviderEvent {
            event_type: "call.initiated".to_string(),
            provider_call_id: "pc-x".to_string(),
            result: None,
        });
        state.enqueue_provider_event(ProviderEvent {
            event_type: "call.hangup".to_string(),
            provider_call_id: "pc-x".to_string(),
            result: None,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

//! The routing controller: owns the process-wide [`RoutingConfig`] and
//! decides, per request, whether stored context is applied.
//!
//! Config reads take a snapshot under a `std::sync::RwLock`; nothing awaits
//! while holding it. Concurrent writers race benignly (last write wins).

use crate::peer::{
    ContextPeer, EnhanceRequest, HttpContextPeer, LocalContextPeer, StoreExchangeRequest,
};
use kiln_config::{RoutingConfig, RoutingMode};
use kiln_context::ContextApplied;
use kiln_core::{ChatMessage, ConversationStore, Error, RoutingError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Partial update for `POST /routing/config`. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingUpdate {
    #[serde(default)]
    pub mode: Option<RoutingMode>,
    #[serde(default)]
    pub peer_host: Option<String>,
    #[serde(default)]
    pub peer_port: Option<u16>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Result of a successful toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleOutcome {
    pub context_enabled: bool,
    pub endpoint: Option<String>,
    pub message: String,
}

/// One connectivity probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingStatus {
    pub enabled: bool,
    pub config: RoutingConfig,
    pub endpoint: String,
    /// A fresh probe when routing is enabled, `None` otherwise.
    pub connection_test: Option<ConnectionTest>,
}

/// Messages ready for generation, plus whether stored context went into them.
#[derive(Debug, Clone, PartialEq)]
pub struct Enhanced {
    pub messages: Vec<ChatMessage>,
    pub context_enhanced: bool,
    pub applied: Option<ContextApplied>,
}

impl Enhanced {
    fn unchanged(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            context_enhanced: false,
            applied: None,
        }
    }
}

pub struct RoutingController {
    config: RwLock<RoutingConfig>,
    remote: Arc<dyn ContextPeer>,
    local: Arc<dyn ContextPeer>,
}

impl RoutingController {
    pub fn new(
        config: RoutingConfig,
        remote: Arc<dyn ContextPeer>,
        local: Arc<dyn ContextPeer>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            remote,
            local,
        }
    }

    /// HTTP peer for `peer` mode, `store` for `local` mode.
    pub fn with_store(
        config: RoutingConfig,
        store: Arc<dyn ConversationStore>,
        default_window: usize,
    ) -> Self {
        Self::new(
            config,
            Arc::new(HttpContextPeer::new()),
            Arc::new(LocalContextPeer::new(store, default_window)),
        )
    }

    pub fn config(&self) -> RoutingConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().unwrap_or_else(|e| e.into_inner()).enabled
    }

    fn set_enabled(&self, enabled: bool) {
        self.config.write().unwrap_or_else(|e| e.into_inner()).enabled = enabled;
    }

    fn peer(&self, mode: RoutingMode) -> &Arc<dyn ContextPeer> {
        match mode {
            RoutingMode::Peer => &self.remote,
            RoutingMode::Local => &self.local,
        }
    }

    fn describe_endpoint(config: &RoutingConfig) -> String {
        match config.mode {
            RoutingMode::Peer => config.endpoint(),
            RoutingMode::Local => "local".into(),
        }
    }

    /// Merge `update` into the current config. The `enabled` flag is only
    /// changed through [`toggle`](Self::toggle).
    pub fn update_config(&self, update: RoutingUpdate) -> Result<RoutingConfig, Error> {
        if update.peer_host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(Error::InvalidParameters("peer_host must not be empty".into()));
        }
        if update.peer_port == Some(0) {
            return Err(Error::InvalidParameters("peer_port must be > 0".into()));
        }
        if update.timeout_secs == Some(0) {
            return Err(Error::InvalidParameters("timeout_secs must be > 0".into()));
        }

        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        if let Some(mode) = update.mode {
            config.mode = mode;
        }
        if let Some(host) = update.peer_host {
            config.peer_host = host;
        }
        if let Some(port) = update.peer_port {
            config.peer_port = port;
        }
        if let Some(timeout) = update.timeout_secs {
            config.timeout_secs = timeout;
        }
        info!(
            mode = ?config.mode,
            endpoint = %config.endpoint(),
            timeout_secs = config.timeout_secs,
            "Routing config updated"
        );
        Ok(config.clone())
    }

    async fn probe(&self, config: &RoutingConfig) -> ConnectionTest {
        let started = Instant::now();
        let result = self.peer(config.mode).health(config).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        ConnectionTest {
            ok: result.is_ok(),
            latency_ms,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Set `enabled` to `enabled`, or flip it when `None`.
    ///
    /// Enabling probes the peer first. If the probe fails routing stays
    /// disabled and `PeerUnreachable` is returned.
    pub async fn toggle(&self, enabled: Option<bool>) -> Result<ToggleOutcome, RoutingError> {
        let config = self.config();
        let target = enabled.unwrap_or(!config.enabled);
        let endpoint = Self::describe_endpoint(&config);

        if !target {
            self.set_enabled(false);
            info!("Context routing disabled");
            return Ok(ToggleOutcome {
                context_enabled: false,
                endpoint: None,
                message: "Context routing disabled".into(),
            });
        }

        if let Err(e) = self.peer(config.mode).health(&config).await {
            self.set_enabled(false);
            warn!(%endpoint, error = %e, "Peer probe failed, routing stays disabled");
            return Err(match e {
                e @ RoutingError::PeerUnreachable { .. } => e,
                other => RoutingError::PeerUnreachable {
                    endpoint,
                    reason: other.to_string(),
                },
            });
        }

        self.set_enabled(true);
        info!(%endpoint, "Context routing enabled");
        Ok(ToggleOutcome {
            context_enabled: true,
            message: format!("Context routing enabled via {endpoint}"),
            endpoint: Some(endpoint),
        })
    }

    pub async fn status(&self) -> RoutingStatus {
        let config = self.config();
        let connection_test = if config.enabled {
            Some(self.probe(&config).await)
        } else {
            None
        };
        RoutingStatus {
            enabled: config.enabled,
            endpoint: Self::describe_endpoint(&config),
            config,
            connection_test,
        }
    }

    /// Apply stored context to `messages` when routing is enabled and a
    /// conversation is named. Any peer failure degrades to the caller's
    /// messages unchanged.
    pub async fn enhance(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<ChatMessage>,
        window_size: Option<usize>,
    ) -> Enhanced {
        let config = self.config();
        let Some(conversation_id) = conversation_id.filter(|_| config.enabled) else {
            return Enhanced::unchanged(messages);
        };

        let request = EnhanceRequest {
            messages,
            window_size,
        };
        match self
            .peer(config.mode)
            .enhance(&config, conversation_id, &request)
            .await
        {
            Ok(response) => {
                debug!(
                    conversation_id,
                    injections = response.context_applied.injections_count,
                    history = response.context_applied.history_count,
                    "Context applied"
                );
                Enhanced {
                    messages: response.enhanced_messages,
                    context_enhanced: true,
                    applied: Some(response.context_applied),
                }
            }
            Err(e) => {
                warn!(
                    conversation_id,
                    error = %e,
                    "Context enhancement failed, using original messages"
                );
                Enhanced::unchanged(request.messages)
            }
        }
    }

    /// Store a finished exchange, user message first. Failures are logged.
    pub async fn persist_exchange(
        &self,
        conversation_id: Option<&str>,
        user_message: &str,
        assistant_message: &str,
    ) {
        let config = self.config();
        let Some(conversation_id) = conversation_id.filter(|_| config.enabled) else {
            return;
        };

        let request = StoreExchangeRequest {
            user_message: Some(user_message.to_string()),
            assistant_message: Some(assistant_message.to_string()),
        };
        if let Err(e) = self
            .peer(config.mode)
            .store(&config, conversation_id, &request)
            .await
        {
            warn!(conversation_id, error = %e, "Failed to store exchange");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::EnhanceResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedPeer {
        down: AtomicBool,
        probes: AtomicUsize,
        stored: Mutex<Vec<(String, StoreExchangeRequest)>>,
    }

    impl ScriptedPeer {
        fn down() -> Arc<Self> {
            let peer = Self::default();
            peer.down.store(true, Ordering::SeqCst);
            Arc::new(peer)
        }

        fn check(&self) -> Result<(), RoutingError> {
            if self.down.load(Ordering::SeqCst) {
                Err(RoutingError::PeerUnreachable {
                    endpoint: "scripted".into(),
                    reason: "connection refused".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ContextPeer for ScriptedPeer {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn health(&self, _config: &RoutingConfig) -> Result<(), RoutingError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.check()
        }

        async fn enhance(
            &self,
            _config: &RoutingConfig,
            conversation_id: &str,
            request: &EnhanceRequest,
        ) -> Result<EnhanceResponse, RoutingError> {
            self.check()?;
            let mut enhanced_messages =
                vec![ChatMessage::system(format!("context for {conversation_id}"))];
            enhanced_messages.extend(request.messages.iter().cloned());
            Ok(EnhanceResponse {
                context_applied: ContextApplied {
                    injections_count: 1,
                    history_count: 0,
                    total_messages: enhanced_messages.len(),
                },
                enhanced_messages,
            })
        }

        async fn store(
            &self,
            _config: &RoutingConfig,
            conversation_id: &str,
            request: &StoreExchangeRequest,
        ) -> Result<(), RoutingError> {
            self.check()?;
            self.stored
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), request.clone()));
            Ok(())
        }
    }

    fn controller(remote: Arc<ScriptedPeer>) -> RoutingController {
        RoutingController::new(
            RoutingConfig::default(),
            remote,
            Arc::new(ScriptedPeer::default()),
        )
    }

    #[tokio::test]
    async fn enabling_with_unreachable_peer_stays_disabled() {
        let peer = ScriptedPeer::down();
        let ctl = controller(peer.clone());
        let before = ctl.config();

        let err = ctl.toggle(Some(true)).await.unwrap_err();
        assert!(matches!(err, RoutingError::PeerUnreachable { .. }));
        assert!(!ctl.is_enabled());
        assert_eq!(ctl.config(), before);

        // Flipping from disabled also probes and fails the same way.
        assert!(ctl.toggle(None).await.is_err());
        assert!(!ctl.is_enabled());
        assert_eq!(peer.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn toggle_flips_and_disabling_never_probes() {
        let peer = Arc::new(ScriptedPeer::default());
        let ctl = controller(peer.clone());

        let on = ctl.toggle(None).await.unwrap();
        assert!(on.context_enabled);
        assert_eq!(on.endpoint.as_deref(), Some("http://localhost:8001"));
        assert!(ctl.is_enabled());

        let off = ctl.toggle(None).await.unwrap();
        assert!(!off.context_enabled);
        assert!(off.endpoint.is_none());
        assert!(!ctl.is_enabled());

        ctl.toggle(Some(false)).await.unwrap();
        assert_eq!(peer.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_mode_uses_local_peer() {
        let remote = ScriptedPeer::down();
        let ctl = controller(remote.clone());
        ctl.update_config(RoutingUpdate {
            mode: Some(RoutingMode::Local),
            ..Default::default()
        })
        .unwrap();

        let outcome = ctl.toggle(Some(true)).await.unwrap();
        assert_eq!(outcome.endpoint.as_deref(), Some("local"));
        assert_eq!(remote.probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn update_config_merges_partially() {
        let ctl = controller(Arc::new(ScriptedPeer::default()));
        let updated = ctl
            .update_config(RoutingUpdate {
                peer_port: Some(9100),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.peer_port, 9100);
        assert_eq!(updated.peer_host, "localhost");
        assert_eq!(updated.timeout_secs, 5);
        assert_eq!(ctl.config(), updated);
    }

    #[test]
    fn update_config_rejects_bad_values() {
        let ctl = controller(Arc::new(ScriptedPeer::default()));
        for update in [
            RoutingUpdate {
                peer_port: Some(0),
                ..Default::default()
            },
            RoutingUpdate {
                timeout_secs: Some(0),
                ..Default::default()
            },
            RoutingUpdate {
                peer_host: Some(" ".into()),
                ..Default::default()
            },
        ] {
            let err = ctl.update_config(update).unwrap_err();
            assert_eq!(err.code(), "invalid_parameters");
        }
        assert_eq!(ctl.config(), RoutingConfig::default());
    }

    #[tokio::test]
    async fn status_probes_only_when_enabled() {
        let peer = Arc::new(ScriptedPeer::default());
        let ctl = controller(peer.clone());

        let status = ctl.status().await;
        assert!(!status.enabled);
        assert!(status.connection_test.is_none());

        ctl.toggle(Some(true)).await.unwrap();
        peer.down.store(true, Ordering::SeqCst);
        let status = ctl.status().await;
        let test = status.connection_test.unwrap();
        assert!(!test.ok);
        assert!(test.error.unwrap().contains("connection refused"));
        // Status reports; it does not disable.
        assert!(ctl.is_enabled());
    }

    #[tokio::test]
    async fn enhance_requires_enabled_and_conversation() {
        let ctl = controller(Arc::new(ScriptedPeer::default()));
        let messages = vec![ChatMessage::user("hi")];

        let out = ctl.enhance(Some("c1"), messages.clone(), None).await;
        assert!(!out.context_enhanced);
        assert_eq!(out.messages, messages);

        ctl.toggle(Some(true)).await.unwrap();
        let out = ctl.enhance(None, messages.clone(), None).await;
        assert!(!out.context_enhanced);

        let out = ctl.enhance(Some("c1"), messages.clone(), None).await;
        assert!(out.context_enhanced);
        assert_eq!(out.messages[0], ChatMessage::system("context for c1"));
        assert_eq!(out.applied.unwrap().total_messages, 2);
    }

    #[tokio::test]
    async fn enhance_degrades_when_peer_fails() {
        let peer = Arc::new(ScriptedPeer::default());
        let ctl = controller(peer.clone());
        ctl.toggle(Some(true)).await.unwrap();
        peer.down.store(true, Ordering::SeqCst);

        let messages = vec![ChatMessage::user("hi")];
        let out = ctl.enhance(Some("c1"), messages.clone(), Some(4)).await;
        assert!(!out.context_enhanced);
        assert!(out.applied.is_none());
        assert_eq!(out.messages, messages);
    }

    #[tokio::test]
    async fn persist_exchange_sends_user_then_assistant() {
        let peer = Arc::new(ScriptedPeer::default());
        let ctl = controller(peer.clone());

        ctl.persist_exchange(Some("c1"), "q", "a").await;
        assert!(peer.stored.lock().unwrap().is_empty());

        ctl.toggle(Some(true)).await.unwrap();
        ctl.persist_exchange(Some("c1"), "q", "a").await;
        let stored = peer.stored.lock().unwrap().clone();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "c1");
        let roles: Vec<_> = stored[0].1.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![kiln_core::Role::User, kiln_core::Role::Assistant]);

        // Failures are swallowed.
        peer.down.store(true, Ordering::SeqCst);
        ctl.persist_exchange(Some("c1"), "q", "a").await;
    }
}

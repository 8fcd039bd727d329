//! Where routed context lives.
//!
//! A [`ContextPeer`] answers three questions for the controller: is it up,
//! what does the prompt look like with stored context, and please remember
//! this exchange. The wire types here double as the request/response bodies
//! of the `/context/{id}/...` endpoints, so two kiln instances speak the
//! same format.

use async_trait::async_trait;
use kiln_config::RoutingConfig;
use kiln_context::{ContextApplied, assemble_for};
use kiln_core::{ChatMessage, ConversationStore, NewMessage, Role, RoutingError, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Body of `POST /context/{id}/enhance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
}

/// Response of `POST /context/{id}/enhance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceResponse {
    pub enhanced_messages: Vec<ChatMessage>,
    pub context_applied: ContextApplied,
}

/// Body of `POST /context/{id}/store`. Absent or empty parts are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreExchangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message: Option<String>,
}

impl StoreExchangeRequest {
    /// Messages to append, user first.
    pub fn messages(&self) -> Vec<NewMessage> {
        [
            (Role::User, &self.user_message),
            (Role::Assistant, &self.assistant_message),
        ]
        .into_iter()
        .filter_map(|(role, content)| {
            content
                .as_deref()
                .filter(|c| !c.is_empty())
                .map(|c| NewMessage::new(role, c))
        })
        .collect()
    }
}

/// A source of stored conversation context.
#[async_trait]
pub trait ContextPeer: Send + Sync {
    fn name(&self) -> &str;

    /// Connectivity probe, bounded by `config.timeout()`.
    async fn health(&self, config: &RoutingConfig) -> Result<(), RoutingError>;

    async fn enhance(
        &self,
        config: &RoutingConfig,
        conversation_id: &str,
        request: &EnhanceRequest,
    ) -> Result<EnhanceResponse, RoutingError>;

    async fn store(
        &self,
        config: &RoutingConfig,
        conversation_id: &str,
        request: &StoreExchangeRequest,
    ) -> Result<(), RoutingError>;
}

// ── HTTP peer ──────────────────────────────────────────────────────────

/// Another kiln instance at `config.endpoint()`.
#[derive(Debug, Clone, Default)]
pub struct HttpContextPeer {
    client: reqwest::Client,
}

impl HttpContextPeer {
    pub fn new() -> Self {
        Self::default()
    }

    fn url(config: &RoutingConfig, segments: &[&str]) -> Result<reqwest::Url, RoutingError> {
        let endpoint = config.endpoint();
        let unreachable = |reason: String| RoutingError::PeerUnreachable {
            endpoint: endpoint.clone(),
            reason,
        };

        let mut url = reqwest::Url::parse(&endpoint)
            .map_err(|e| unreachable(format!("invalid peer address: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| unreachable("peer address cannot carry a path".into()))?
            .clear()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        config: &RoutingConfig,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RoutingError> {
        let response = request
            .timeout(config.timeout())
            .send()
            .await
            .map_err(|e| RoutingError::PeerUnreachable {
                endpoint: config.endpoint(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RoutingError::PeerRejected {
                status_code: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ContextPeer for HttpContextPeer {
    fn name(&self) -> &str {
        "http"
    }

    async fn health(&self, config: &RoutingConfig) -> Result<(), RoutingError> {
        let url = Self::url(config, &["health"])?;
        Self::send(config, self.client.get(url)).await?;
        Ok(())
    }

    async fn enhance(
        &self,
        config: &RoutingConfig,
        conversation_id: &str,
        request: &EnhanceRequest,
    ) -> Result<EnhanceResponse, RoutingError> {
        let url = Self::url(config, &["context", conversation_id, "enhance"])?;
        debug!(%url, messages = request.messages.len(), "Requesting context from peer");

        let response = Self::send(config, self.client.post(url).json(request)).await?;
        response
            .json()
            .await
            .map_err(|e| RoutingError::InvalidResponse(e.to_string()))
    }

    async fn store(
        &self,
        config: &RoutingConfig,
        conversation_id: &str,
        request: &StoreExchangeRequest,
    ) -> Result<(), RoutingError> {
        let url = Self::url(config, &["context", conversation_id, "store"])?;
        Self::send(config, self.client.post(url).json(request)).await?;
        Ok(())
    }
}

// ── In-process peer ────────────────────────────────────────────────────

/// This process's own store, used in `local` routing mode.
#[derive(Clone)]
pub struct LocalContextPeer {
    store: Arc<dyn ConversationStore>,
    default_window: usize,
}

impl LocalContextPeer {
    pub fn new(store: Arc<dyn ConversationStore>, default_window: usize) -> Self {
        Self {
            store,
            default_window,
        }
    }
}

fn rejected(e: StoreError) -> RoutingError {
    let status_code = match e {
        StoreError::ConversationNotFound(_) => 404,
        _ => 500,
    };
    RoutingError::PeerRejected {
        status_code,
        message: e.to_string(),
    }
}

#[async_trait]
impl ContextPeer for LocalContextPeer {
    fn name(&self) -> &str {
        "local"
    }

    async fn health(&self, _config: &RoutingConfig) -> Result<(), RoutingError> {
        self.store
            .stats()
            .await
            .map(|_| ())
            .map_err(|e| RoutingError::PeerUnreachable {
                endpoint: format!("local:{}", self.store.name()),
                reason: e.to_string(),
            })
    }

    async fn enhance(
        &self,
        _config: &RoutingConfig,
        conversation_id: &str,
        request: &EnhanceRequest,
    ) -> Result<EnhanceResponse, RoutingError> {
        let window = request.window_size.unwrap_or(self.default_window);
        let assembled = assemble_for(
            self.store.as_ref(),
            conversation_id,
            window,
            &request.messages,
        )
        .await
        .map_err(rejected)?;

        Ok(EnhanceResponse {
            enhanced_messages: assembled.messages,
            context_applied: assembled.applied,
        })
    }

    async fn store(
        &self,
        _config: &RoutingConfig,
        conversation_id: &str,
        request: &StoreExchangeRequest,
    ) -> Result<(), RoutingError> {
        for message in request.messages() {
            self.store
                .append_message(conversation_id, message)
                .await
                .map_err(rejected)?;
        }
        Ok(())
    }
}

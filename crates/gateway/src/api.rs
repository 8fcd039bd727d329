//! HTTP API handlers.
//!
//! Endpoints:
//!
//! - `GET  /health`  Liveness plus model info
//! - `GET  /models`  Runtime presets and the loaded model
//! - `POST /models/load`  Load a model (with retries)
//! - `POST /models/unload`  Drop the loaded model
//! - `POST /generate`  Generate a completion
//! - `POST /generate/stream`  Generate, streamed as SSE
//! - `GET  /conversations`  List conversations
//! - `POST /conversations`  Create a conversation
//! - `GET  /conversations/{id}`  Conversation detail
//! - `GET  /conversations/{id}/messages`  History (`?limit=N`)
//! - `POST /conversations/{id}/messages`  Append a message
//! - `POST /conversations/{id}/inject`  Add a context injection
//! - `GET  /conversations/{id}/injections`  Active injections
//! - `POST /context/{id}/enhance`  Assemble context for messages
//! - `POST /context/{id}/store`  Store a user/assistant exchange
//! - `POST /routing/toggle`  Enable/disable context routing
//! - `GET  /routing/config`  Current routing config
//! - `POST /routing/config`  Partial routing config update
//! - `GET  /routing/status`  Config plus a live probe
//! - `GET  /stats`  Store statistics
//! - `POST /parameters/validate`  Check generation parameters
//! - `GET  /parameters/defaults`  Defaults and ranges

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Json,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use chrono::{DateTime, Utc};
use kiln_config::RoutingConfig;
use kiln_context::assemble_for;
use kiln_core::params::{ParameterInfo, parameter_info};
use kiln_core::{
    AvailableModel, ChatMessage, ContextInjection, Conversation, ConversationSummary,
    GenerationParams, InjectionKind, LoadRequest, Metadata, ModelInfo, NewInjection, NewMessage,
    Role, StoreError, StoredMessage,
};
use kiln_inference::StreamChunk;
use kiln_routing::{
    EnhanceRequest, EnhanceResponse, RoutingStatus, RoutingUpdate, StoreExchangeRequest,
    ToggleOutcome,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::SharedState;
use crate::error::{ApiError, ApiJson, ApiResult};

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub model_info: ModelInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub available_models: Vec<AvailableModel>,
    pub current_model: Option<String>,
    pub model_loaded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadModelResponse {
    pub success: bool,
    pub model_info: ModelInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnloadModelResponse {
    pub success: bool,
    pub was_loaded: bool,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Omitted fields take the server's configured defaults.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub window_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub generation_time: f64,
    pub parameters_used: GenerationParams,
    pub model_name: String,
    pub token_count: usize,
    pub context_enhanced: bool,
    pub conversation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation_id: String,
    pub conversation: Conversation,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageListResponse {
    pub conversation_id: String,
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendMessageResponse {
    pub message_id: i64,
    pub message: StoredMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InjectResponse {
    pub injection_id: String,
    pub injection: ContextInjection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InjectionListResponse {
    pub conversation_id: String,
    pub injections: Vec<ContextInjection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreExchangeResponse {
    pub success: bool,
    pub stored: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToggleRequest {
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub backend: String,
    pub conversation_count: u64,
    pub message_count: u64,
    pub active_injection_count: u64,
    pub model_info: ModelInfo,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DefaultsResponse {
    pub defaults: GenerationParams,
    pub ranges: Vec<ParameterInfo>,
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Overlay `overrides` on the configured defaults, then validate.
fn resolve_params(
    defaults: &GenerationParams,
    overrides: Option<serde_json::Value>,
) -> Result<GenerationParams, ApiError> {
    let params = match overrides {
        None | Some(serde_json::Value::Null) => defaults.clone(),
        Some(serde_json::Value::Object(fields)) => {
            let mut merged = match serde_json::to_value(defaults) {
                Ok(serde_json::Value::Object(base)) => base,
                _ => serde_json::Map::new(),
            };
            merged.extend(fields);
            serde_json::from_value(serde_json::Value::Object(merged))
                .map_err(|e| ApiError::invalid(format!("Invalid parameters: {e}")))?
        }
        Some(_) => return Err(ApiError::invalid("parameters must be an object")),
    };
    params.validate()?;
    Ok(params)
}

/// The turn the caller just added: the last user message, if any.
fn latest_user_message(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
}

async fn require_conversation(state: &SharedState, id: &str) -> Result<Conversation, ApiError> {
    state
        .store
        .get_conversation(id)
        .await?
        .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()).into())
}

fn sse_event(chunk: &StreamChunk) -> SseEvent {
    let name = match (chunk.finished, chunk.error.is_some()) {
        (true, true) => "error",
        (true, false) => "done",
        (false, _) => "token",
    };
    let data = serde_json::to_string(chunk).unwrap_or_default();
    SseEvent::default().event(name).data(data)
}

// ── Model handlers ────────────────────────────────────────────────────────

pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: Utc::now(),
        model_info: state.gate.model_info(),
    })
}

pub async fn models_handler(State(state): State<SharedState>) -> Json<ModelsResponse> {
    let info = state.gate.model_info();
    Json(ModelsResponse {
        available_models: state.gate.available_models(),
        current_model: info.model_name,
        model_loaded: info.loaded,
    })
}

pub async fn load_model_handler(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<LoadRequest>,
) -> ApiResult<LoadModelResponse> {
    if request.model_path.trim().is_empty() {
        return Err(ApiError::invalid("model_path must not be empty"));
    }
    info!(model = %request.model_path, "Load model request");
    let model_info = state.gate.load_model(request).await?;
    Ok(Json(LoadModelResponse {
        success: true,
        model_info,
    }))
}

pub async fn unload_model_handler(State(state): State<SharedState>) -> Json<UnloadModelResponse> {
    let was_loaded = state.gate.unload_model().await;
    Json(UnloadModelResponse {
        success: true,
        was_loaded,
    })
}

// ── Generation handlers ───────────────────────────────────────────────────

pub async fn generate_handler(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<GenerateRequest>,
) -> ApiResult<GenerateResponse> {
    if request.messages.is_empty() {
        return Err(ApiError::invalid("messages must not be empty"));
    }
    let params = resolve_params(&state.config.generation.defaults, request.parameters)?;
    let conversation_id = request.conversation_id;
    let user_message = latest_user_message(&request.messages);

    let enhanced = state
        .routing
        .enhance(
            conversation_id.as_deref(),
            request.messages,
            request.window_size,
        )
        .await;
    debug!(
        messages = enhanced.messages.len(),
        context_enhanced = enhanced.context_enhanced,
        "Generating"
    );

    let output = state.gate.generate(enhanced.messages, params).await?;

    if let Some(user_message) = &user_message {
        state
            .routing
            .persist_exchange(conversation_id.as_deref(), user_message, &output.text)
            .await;
    }

    Ok(Json(GenerateResponse {
        text: output.text,
        generation_time: output.generation_time,
        parameters_used: output.parameters_used,
        model_name: output.model_name,
        token_count: output.token_count,
        context_enhanced: enhanced.context_enhanced,
        conversation_id,
        timestamp: Utc::now(),
    }))
}

/// `POST /generate/stream`: SSE events `token`, then one `done` or `error`.
pub async fn generate_stream_handler(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<GenerateRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::invalid("messages must not be empty"));
    }
    let params = resolve_params(&state.config.generation.defaults, request.parameters)?;
    let conversation_id = request.conversation_id;
    let user_message = latest_user_message(&request.messages);

    let enhanced = state
        .routing
        .enhance(
            conversation_id.as_deref(),
            request.messages,
            request.window_size,
        )
        .await;
    let mut chunks = state.gate.stream_generate(enhanced.messages, params).await?;

    // Forward chunks to the client and store the exchange once it completes.
    // If the client goes away the forwarder returns, dropping `chunks`,
    // which stops generation.
    let (tx, rx) = mpsc::channel::<StreamChunk>(64);
    let routing = state.routing.clone();
    tokio::spawn(async move {
        while let Some(chunk) = chunks.recv().await {
            let completed = chunk.finished && chunk.error.is_none();
            let text = completed.then(|| chunk.full_text.clone());
            if tx.send(chunk).await.is_err() {
                debug!("Stream client disconnected");
                return;
            }
            if let (Some(text), Some(user_message)) = (text, &user_message) {
                routing
                    .persist_exchange(conversation_id.as_deref(), user_message, &text)
                    .await;
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|chunk| Ok(sse_event(&chunk)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Conversation handlers ─────────────────────────────────────────────────

pub async fn list_conversations_handler(
    State(state): State<SharedState>,
) -> ApiResult<ConversationListResponse> {
    let conversations = state.store.list_conversations().await?;
    Ok(Json(ConversationListResponse { conversations }))
}

pub async fn create_conversation_handler(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<CreateConversationRequest>,
) -> ApiResult<CreateConversationResponse> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::invalid("name must not be empty"));
    }
    let conversation = state
        .store
        .create_conversation(name, request.metadata)
        .await?;
    info!(id = %conversation.id, name = %conversation.name, "Conversation created");
    Ok(Json(CreateConversationResponse {
        conversation_id: conversation.id.clone(),
        conversation,
    }))
}

pub async fn get_conversation_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<ConversationSummary> {
    let conversation = require_conversation(&state, &id).await?;
    let message_count = state.store.message_count(&id).await?;
    Ok(Json(ConversationSummary {
        conversation,
        message_count,
    }))
}

pub async fn list_messages_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<MessageListResponse> {
    require_conversation(&state, &id).await?;
    let messages = state.store.get_history(&id, query.limit).await?;
    Ok(Json(MessageListResponse {
        conversation_id: id,
        messages,
    }))
}

pub async fn append_message_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(message): ApiJson<NewMessage>,
) -> ApiResult<AppendMessageResponse> {
    if message.content.is_empty() {
        return Err(ApiError::invalid("content must not be empty"));
    }
    let message = state.store.append_message(&id, message).await?;
    Ok(Json(AppendMessageResponse {
        message_id: message.id,
        message,
    }))
}

pub async fn inject_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(injection): ApiJson<NewInjection>,
) -> ApiResult<InjectResponse> {
    if injection.content.is_empty() {
        return Err(ApiError::invalid("content must not be empty"));
    }
    let injection = state.store.add_injection(&id, injection).await?;
    if injection.kind != InjectionKind::System {
        debug!(
            id = %injection.id,
            kind = injection.kind.as_str(),
            "Stored injection type is not merged into prompts"
        );
    }
    Ok(Json(InjectResponse {
        injection_id: injection.id.clone(),
        injection,
    }))
}

pub async fn list_injections_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<InjectionListResponse> {
    require_conversation(&state, &id).await?;
    let injections = state.store.get_active_injections(&id).await?;
    Ok(Json(InjectionListResponse {
        conversation_id: id,
        injections,
    }))
}

// ── Context handlers (the peer side of routing) ───────────────────────────

pub async fn enhance_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<EnhanceRequest>,
) -> ApiResult<EnhanceResponse> {
    let window = request
        .window_size
        .unwrap_or(state.config.context.default_window);
    let assembled = assemble_for(state.store.as_ref(), &id, window, &request.messages).await?;
    Ok(Json(EnhanceResponse {
        enhanced_messages: assembled.messages,
        context_applied: assembled.applied,
    }))
}

pub async fn store_exchange_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<StoreExchangeRequest>,
) -> ApiResult<StoreExchangeResponse> {
    let messages = request.messages();
    if !messages.is_empty() {
        require_conversation(&state, &id).await?;
    }
    let stored = messages.len();
    for message in messages {
        state.store.append_message(&id, message).await?;
    }
    Ok(Json(StoreExchangeResponse {
        success: true,
        stored,
    }))
}

// ── Routing handlers ──────────────────────────────────────────────────────

/// `POST /routing/toggle`. The body is optional; an empty one flips.
pub async fn toggle_routing_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> ApiResult<ToggleOutcome> {
    let request: ToggleRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ToggleRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::invalid(format!("Invalid toggle request: {e}")))?
    };
    let outcome = state.routing.toggle(request.enabled).await?;
    Ok(Json(outcome))
}

pub async fn get_routing_config_handler(State(state): State<SharedState>) -> Json<RoutingConfig> {
    Json(state.routing.config())
}

pub async fn update_routing_config_handler(
    State(state): State<SharedState>,
    ApiJson(update): ApiJson<RoutingUpdate>,
) -> ApiResult<RoutingConfig> {
    Ok(Json(state.routing.update_config(update)?))
}

pub async fn routing_status_handler(State(state): State<SharedState>) -> Json<RoutingStatus> {
    Json(state.routing.status().await)
}

// ── Stats & parameters ────────────────────────────────────────────────────

pub async fn stats_handler(State(state): State<SharedState>) -> ApiResult<StatsResponse> {
    let stats = state.store.stats().await?;
    Ok(Json(StatsResponse {
        backend: state.store.name().to_string(),
        conversation_count: stats.conversation_count,
        message_count: stats.message_count,
        active_injection_count: stats.active_injection_count,
        model_info: state.gate.model_info(),
    }))
}

/// Always 200: validity is reported in the body.
pub async fn validate_parameters_handler(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<ValidateRequest>,
) -> Json<ValidateResponse> {
    let overrides = match request.parameters {
        serde_json::Value::Null => None,
        other => Some(other),
    };
    match resolve_params(&state.config.generation.defaults, overrides) {
        Ok(params) => Json(ValidateResponse {
            valid: true,
            parameters: serde_json::to_value(params).unwrap_or_default(),
            error: None,
        }),
        Err(e) => Json(ValidateResponse {
            valid: false,
            parameters: serde_json::Value::Null,
            error: Some(e.message),
        }),
    }
}

pub async fn parameter_defaults_handler(State(state): State<SharedState>) -> Json<DefaultsResponse> {
    Json(DefaultsResponse {
        defaults: state.config.generation.defaults.clone(),
        ranges: parameter_info(),
    })
}

//! HTTP API gateway for kiln.
//!
//! One service hosts the conversation store, the context endpoints that peer
//! instances call, the routing controls, and the generation gate.
//!
//! Built on Axum; all handlers live in [`api`].

pub mod api;
pub mod error;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    http::{Method, header},
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use kiln_config::AppConfig;
use kiln_core::{ConversationStore, LoadRequest, ModelRuntime};
use kiln_inference::{GateOptions, GenerationGate};
use kiln_routing::RoutingController;

/// Shared application state. Handlers get it as `State<SharedState>`.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn ConversationStore>,
    pub gate: Arc<GenerationGate>,
    pub routing: Arc<RoutingController>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the routing controller to `store` and bundle everything.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ConversationStore>,
        gate: Arc<GenerationGate>,
    ) -> Self {
        let routing = Arc::new(RoutingController::with_store(
            config.routing.clone(),
            store.clone(),
            config.context.default_window,
        ));
        Self {
            config,
            store,
            gate,
            routing,
        }
    }
}

/// Build the router with every endpoint.
///
/// Layers:
/// - Request body size limit (1 MB)
/// - CORS for GET/POST with JSON bodies
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(api::health_handler))
        .route("/models", get(api::models_handler))
        .route("/models/load", post(api::load_model_handler))
        .route("/models/unload", post(api::unload_model_handler))
        .route("/generate", post(api::generate_handler))
        .route("/generate/stream", post(api::generate_stream_handler))
        .route(
            "/conversations",
            get(api::list_conversations_handler).post(api::create_conversation_handler),
        )
        .route("/conversations/{id}", get(api::get_conversation_handler))
        .route(
            "/conversations/{id}/messages",
            get(api::list_messages_handler).post(api::append_message_handler),
        )
        .route("/conversations/{id}/inject", post(api::inject_handler))
        .route(
            "/conversations/{id}/injections",
            get(api::list_injections_handler),
        )
        .route("/context/{id}/enhance", post(api::enhance_handler))
        .route("/context/{id}/store", post(api::store_exchange_handler))
        .route("/routing/toggle", post(api::toggle_routing_handler))
        .route(
            "/routing/config",
            get(api::get_routing_config_handler).post(api::update_routing_config_handler),
        )
        .route("/routing/status", get(api::routing_status_handler))
        .route("/stats", get(api::stats_handler))
        .route(
            "/parameters/validate",
            post(api::validate_parameters_handler),
        )
        .route("/parameters/defaults", get(api::parameter_defaults_handler))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the store, build the gate around `runtime`, and load the
/// configured model if there is one. A failed startup load is logged and
/// the server starts without a model.
pub async fn build_state(
    config: AppConfig,
    runtime: Arc<dyn ModelRuntime>,
) -> Result<SharedState, Box<dyn std::error::Error>> {
    let store = kiln_store::open(&config.store).await?;
    let gate = Arc::new(GenerationGate::new(
        runtime,
        GateOptions::from_config(&config),
    ));

    if let Some(path) = &config.model.path {
        let request = LoadRequest {
            model_path: path.clone(),
            tokenizer_config: config.model.tokenizer_config.clone(),
        };
        match gate.load_model(request).await {
            Ok(model) => info!(model = ?model.model_name, "Startup model ready"),
            Err(e) => warn!(
                model = %path,
                error = %e,
                "Startup model load failed, serving without a model"
            ),
        }
    }

    Ok(Arc::new(AppState::new(config, store, gate)))
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn start(
    config: AppConfig,
    runtime: Arc<dyn ModelRuntime>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = build_state(config, runtime).await?;
    let app = build_router(state);

    info!(addr = %addr, "kiln listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use kiln_core::{
        ChatMessage, GenerationParams, LoadedModel, RuntimeError, StoredMessage, TokenFlow,
    };
    use kiln_inference::RetryPolicy;
    use kiln_store::InMemoryStore;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    /// Loads anything except "missing"; every model replies "Hello there!".
    struct ScriptedRuntime;

    struct ScriptedModel;

    impl ModelRuntime for ScriptedRuntime {
        fn name(&self) -> &str {
            "scripted"
        }

        fn load(&self, request: &LoadRequest) -> Result<Box<dyn LoadedModel>, RuntimeError> {
            if request.model_path == "missing" {
                return Err(RuntimeError::NotFound("missing".into()));
            }
            Ok(Box::new(ScriptedModel))
        }
    }

    impl LoadedModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted-model"
        }

        fn model_type(&self) -> &str {
            "scripted"
        }

        fn generate(
            &mut self,
            _messages: &[ChatMessage],
            _params: &GenerationParams,
            on_token: &mut dyn FnMut(&str) -> TokenFlow,
        ) -> Result<(), RuntimeError> {
            for piece in ["Hello", " there", "!"] {
                if on_token(piece) == TokenFlow::Stop {
                    break;
                }
            }
            Ok(())
        }
    }

    fn test_state() -> SharedState {
        let mut config = AppConfig::default();
        config.routing.peer_host = "127.0.0.1".into();
        config.routing.peer_port = 1;
        config.routing.timeout_secs = 1;

        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        let gate = Arc::new(GenerationGate::new(
            Arc::new(ScriptedRuntime),
            GateOptions {
                retry: RetryPolicy::none(),
                ..Default::default()
            },
        ));
        Arc::new(AppState::new(config, store, gate))
    }

    async fn call(
        state: &SharedState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (status, bytes) = call_raw(state, method, uri, body).await;
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn call_raw(
        state: &SharedState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    async fn load(state: &SharedState) {
        let request = json!({"model_path": "tiny"});
        let (status, _) = call(state, "POST", "/models/load", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn create_conversation(state: &SharedState, name: &str) -> String {
        let request = json!({"name": name});
        let (status, body) = call(state, "POST", "/conversations", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        body["conversation_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_model_info() {
        let state = test_state();
        let (status, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_info"]["loaded"], false);

        load(&state).await;
        let (_, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(body["model_info"]["loaded"], true);
        assert_eq!(body["model_info"]["model_name"], "scripted-model");
    }

    #[tokio::test]
    async fn generate_without_model_is_rejected() {
        let state = test_state();
        let (status, body) = call(
            &state,
            "POST",
            "/generate",
            Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "no_model_loaded");
    }

    #[tokio::test]
    async fn generate_requires_messages() {
        let state = test_state();
        load(&state).await;
        let request = json!({"messages": []});
        let (status, body) = call(&state, "POST", "/generate", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_parameters");
    }

    #[tokio::test]
    async fn generate_returns_text_and_stats() {
        let state = test_state();
        load(&state).await;
        let (status, body) = call(
            &state,
            "POST",
            "/generate",
            Some(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "parameters": {"temperature": 0.2}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "Hello there!");
        assert_eq!(body["token_count"], 3);
        assert_eq!(body["model_name"], "scripted-model");
        assert_eq!(body["context_enhanced"], false);
        assert_eq!(body["parameters_used"]["temperature"], 0.2);
        assert_eq!(body["parameters_used"]["top_k"], 50);
    }

    #[tokio::test]
    async fn generate_rejects_bad_parameters() {
        let state = test_state();
        load(&state).await;
        for parameters in [json!({"temperature": 3.0}), json!({"temprature": 0.5})] {
            let (status, body) = call(
                &state,
                "POST",
                "/generate",
                Some(json!({"messages": [{"content": "hi"}], "parameters": parameters})),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], "invalid_parameters");
        }
    }

    #[tokio::test]
    async fn malformed_json_is_structured_error() {
        let state = test_state();
        let req = Request::builder()
            .method("POST")
            .uri("/conversations")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = build_router(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "invalid_parameters");
    }

    #[tokio::test]
    async fn load_failure_is_classified() {
        let state = test_state();
        let (status, body) = call(
            &state,
            "POST",
            "/models/load",
            Some(json!({"model_path": "missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "model_load_failed");
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn unload_is_idempotent() {
        let state = test_state();
        load(&state).await;
        let (_, body) = call(&state, "POST", "/models/unload", None).await;
        assert_eq!(body["was_loaded"], true);
        let (status, body) = call(&state, "POST", "/models/unload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["was_loaded"], false);
    }

    #[tokio::test]
    async fn models_lists_current_model() {
        let state = test_state();
        load(&state).await;
        let (status, body) = call(&state, "GET", "/models", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["current_model"], "scripted-model");
        assert!(body["available_models"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversation_lifecycle() {
        let state = test_state();
        let id = create_conversation(&state, "chat").await;

        let (status, body) = call(&state, "GET", &format!("/conversations/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "chat");
        assert_eq!(body["message_count"], 0);

        for content in ["hi", "hello"] {
            call(
                &state,
                "POST",
                &format!("/conversations/{id}/messages"),
                Some(json!({"content": content})),
            )
            .await;
        }
        let (_, body) = call(&state, "GET", &format!("/conversations/{id}"), None).await;
        assert_eq!(body["message_count"], 2);

        let (_, body) = call(&state, "GET", "/conversations", None).await;
        assert_eq!(body["conversations"].as_array().unwrap().len(), 1);

        let (status, body) = call(&state, "GET", "/conversations/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let request = json!({"name": "  "});
        let (status, _) = call(&state, "POST", "/conversations", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn messages_append_and_window() {
        let state = test_state();
        let id = create_conversation(&state, "chat").await;
        let uri = format!("/conversations/{id}/messages");

        for i in 1..=5 {
            let (status, body) = call(
                &state,
                "POST",
                &uri,
                Some(json!({"role": "user", "content": format!("M{i}")})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(body["message_id"].as_i64().is_some());
        }

        let (_, body) = call(&state, "GET", &format!("{uri}?limit=2"), None).await;
        let messages: Vec<StoredMessage> =
            serde_json::from_value(body["messages"].clone()).unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["M4", "M5"]);

        let (status, _) = call(&state, "POST", &uri, Some(json!({"content": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &state,
            "POST",
            "/conversations/nope/messages",
            Some(json!({"content": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn injections_come_back_in_priority_order() {
        let state = test_state();
        let id = create_conversation(&state, "chat").await;
        for (content, priority) in [("p5", 5), ("p10a", 10), ("p10b", 10), ("p1", 1)] {
            let (status, body) = call(
                &state,
                "POST",
                &format!("/conversations/{id}/inject"),
                Some(json!({"type": "system", "content": content, "priority": priority})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(body["injection_id"].is_string());
        }

        let uri = format!("/conversations/{id}/injections");
        let (_, body) = call(&state, "GET", &uri, None).await;
        let order: Vec<&str> = body["injections"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["content"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["p10a", "p10b", "p5", "p1"]);

        let (status, _) = call(
            &state,
            "POST",
            &format!("/conversations/{id}/inject"),
            Some(json!({"type": "memo", "content": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enhance_assembles_injections_history_and_new_turn() {
        let state = test_state();
        let id = create_conversation(&state, "chat").await;
        call(
            &state,
            "POST",
            &format!("/conversations/{id}/inject"),
            Some(json!({"type": "system", "content": "Be concise", "priority": 0})),
        )
        .await;
        let (status, body) = call(
            &state,
            "POST",
            &format!("/context/{id}/store"),
            Some(json!({"user_message": "hi", "assistant_message": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stored"], 2);

        let (status, body) = call(
            &state,
            "POST",
            &format!("/context/{id}/enhance"),
            Some(json!({
                "messages": [{"role": "user", "content": "how are you"}],
                "window_size": 10,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let messages: Vec<ChatMessage> =
            serde_json::from_value(body["enhanced_messages"].clone()).unwrap();
        assert_eq!(
            messages,
            vec![
                ChatMessage::system("Be concise"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
                ChatMessage::user("how are you"),
            ]
        );
        assert_eq!(body["context_applied"]["injections_count"], 1);
        assert_eq!(body["context_applied"]["history_count"], 2);
        assert_eq!(body["context_applied"]["total_messages"], 4);
    }

    #[tokio::test]
    async fn toggle_with_unreachable_peer_returns_503() {
        let state = test_state();
        let request = json!({"enabled": true});
        let (status, body) = call(&state, "POST", "/routing/toggle", Some(request)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "peer_unreachable");

        let (_, config) = call(&state, "GET", "/routing/config", None).await;
        assert_eq!(config["enabled"], false);
    }

    #[tokio::test]
    async fn routing_config_partial_update() {
        let state = test_state();
        let (status, body) = call(
            &state,
            "POST",
            "/routing/config",
            Some(json!({"peer_port": 9100})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["peer_port"], 9100);
        assert_eq!(body["peer_host"], "127.0.0.1");

        let request = json!({"peer_port": 0});
        let (status, body) = call(&state, "POST", "/routing/config", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_parameters");
    }

    #[tokio::test]
    async fn local_routing_enhances_and_persists() {
        let state = test_state();
        load(&state).await;
        let id = create_conversation(&state, "chat").await;

        call(&state, "POST", "/routing/config", Some(json!({"mode": "local"}))).await;
        // Empty body flips the flag.
        let (status, body) = call_raw(&state, "POST", "/routing/toggle", None).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["context_enabled"], true);

        let (_, status_body) = call(&state, "GET", "/routing/status", None).await;
        assert_eq!(status_body["connection_test"]["ok"], true);

        let (status, body) = call(
            &state,
            "POST",
            "/generate",
            Some(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "conversation_id": id,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["context_enhanced"], true);
        assert_eq!(body["conversation_id"], id.as_str());

        let uri = format!("/conversations/{id}/messages");
        let (_, body) = call(&state, "GET", &uri, None).await;
        let messages: Vec<StoredMessage> =
            serde_json::from_value(body["messages"].clone()).unwrap();
        let pairs: Vec<(&str, &str)> = messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect();
        assert_eq!(pairs, vec![("user", "hi"), ("assistant", "Hello there!")]);
    }

    #[tokio::test]
    async fn stream_emits_token_and_done_events() {
        let state = test_state();
        load(&state).await;
        let (status, bytes) = call_raw(
            &state,
            "POST",
            "/generate/stream",
            Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.matches("event: token").count(), 3);
        assert_eq!(text.matches("event: done").count(), 1);
        assert!(text.contains("\"full_text\":\"Hello there!\""));
        assert!(!text.contains("event: error"));
    }

    #[tokio::test]
    async fn stream_without_model_is_rejected_up_front() {
        let state = test_state();
        let (status, body) = call(
            &state,
            "POST",
            "/generate/stream",
            Some(json!({"messages": [{"content": "hi"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "no_model_loaded");
    }

    #[tokio::test]
    async fn parameter_endpoints() {
        let state = test_state();
        let (status, body) = call(
            &state,
            "POST",
            "/parameters/validate",
            Some(json!({"parameters": {"top_p": 0.5}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
        assert_eq!(body["parameters"]["top_p"], 0.5);

        let (status, body) = call(
            &state,
            "POST",
            "/parameters/validate",
            Some(json!({"parameters": {"min_p": 1.5}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], false);
        assert!(body["error"].as_str().unwrap().contains("min_p"));

        let (_, body) = call(&state, "GET", "/parameters/defaults", None).await;
        assert_eq!(body["defaults"]["max_length"], 512);
        assert!(body["ranges"].as_array().unwrap().len() >= 6);
    }

    #[tokio::test]
    async fn stats_counts_store_contents() {
        let state = test_state();
        let id = create_conversation(&state, "chat").await;
        call(
            &state,
            "POST",
            &format!("/conversations/{id}/messages"),
            Some(json!({"content": "hi"})),
        )
        .await;

        let (status, body) = call(&state, "GET", "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
        assert_eq!(body["conversation_count"], 1);
        assert_eq!(body["message_count"], 1);
        assert_eq!(body["active_injection_count"], 0);
    }
}

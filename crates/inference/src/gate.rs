//! The generation gate: single-flight access to the loaded model.
//!
//! At most one generation (streaming or not) runs at a time. The model slot
//! is a `tokio::sync::Mutex`, so waiters queue FIFO; the owned guard moves
//! into the blocking thread that drives the runtime and is released when that
//! thread finishes. A separate [`ModelInfo`] snapshot lets status endpoints
//! answer without touching the lock.

use crate::retry::{RetryPolicy, classify, describe};
use kiln_config::AppConfig;
use kiln_core::{
    AvailableModel, ChatMessage, GenerationError, GenerationParams, LoadRequest, LoadedModel,
    ModelInfo, ModelRuntime, RuntimeError, TokenFlow,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, error, info, warn};

type Slot = Option<Box<dyn LoadedModel>>;

const STREAM_BUFFER: usize = 64;

/// Tunables for a [`GenerationGate`].
#[derive(Debug, Clone, Default)]
pub struct GateOptions {
    pub retry: RetryPolicy,
    /// Fail with `Busy` if the slot is not acquired in time.
    pub acquire_timeout: Option<Duration>,
    /// Fail with `Timeout` if a non-streaming generation runs longer.
    pub generation_timeout: Option<Duration>,
}

impl GateOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry: RetryPolicy::from(&config.model.retry),
            acquire_timeout: config.generation.acquire_timeout(),
            generation_timeout: config.generation.timeout(),
        }
    }
}

/// Result of a non-streaming generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub text: String,
    pub token_count: usize,
    /// Seconds.
    pub generation_time: f64,
    pub parameters_used: GenerationParams,
    pub model_name: String,
}

/// One element of a generation stream.
///
/// Every stream ends with exactly one chunk where `finished` is true. It
/// carries the aggregate statistics, or `error` if the runtime failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub token: String,
    pub token_count: usize,
    pub full_text: String,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_used: Option<GenerationParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    fn token(token: &str, token_count: usize, full_text: &str) -> Self {
        Self {
            token: token.to_string(),
            token_count,
            full_text: full_text.to_string(),
            finished: false,
            generation_time: None,
            parameters_used: None,
            model_name: None,
            error: None,
        }
    }

    fn done(
        driven: Driven,
        generation_time: f64,
        parameters_used: GenerationParams,
        model_name: String,
    ) -> Self {
        Self {
            token: String::new(),
            token_count: driven.token_count,
            full_text: driven.text,
            finished: true,
            generation_time: Some(generation_time),
            parameters_used: Some(parameters_used),
            model_name: Some(model_name),
            error: None,
        }
    }

    fn failed(driven: Driven, error: String) -> Self {
        Self {
            token: String::new(),
            token_count: driven.token_count,
            full_text: driven.text,
            finished: true,
            generation_time: None,
            parameters_used: None,
            model_name: None,
            error: Some(error),
        }
    }
}

/// Text and token count produced by one runtime call.
#[derive(Debug, Default)]
struct Driven {
    text: String,
    token_count: usize,
}

/// Run one generation, enforcing `max_length`, stop sequences, and
/// cancellation on top of whatever the runtime does itself.
fn drive(
    model: &mut dyn LoadedModel,
    messages: &[ChatMessage],
    params: &GenerationParams,
    cancel: &AtomicBool,
    mut emit: impl FnMut(&str, usize, &str) -> TokenFlow,
) -> (Driven, Result<(), RuntimeError>) {
    let max_tokens = params.max_tokens();
    let mut text = String::new();
    let mut token_count = 0usize;

    let result = model.generate(messages, params, &mut |piece: &str| {
        if cancel.load(Ordering::Relaxed) || token_count >= max_tokens {
            return TokenFlow::Stop;
        }
        token_count += 1;
        text.push_str(piece);

        if emit(piece, token_count, &text) == TokenFlow::Stop {
            return TokenFlow::Stop;
        }
        if token_count >= max_tokens || params.matched_stop_sequence(&text).is_some() {
            TokenFlow::Stop
        } else {
            TokenFlow::Continue
        }
    });

    (Driven { text, token_count }, result)
}

/// Serializes access to a [`ModelRuntime`]'s loaded model.
pub struct GenerationGate {
    runtime: Arc<dyn ModelRuntime>,
    slot: Arc<Mutex<Slot>>,
    info: RwLock<ModelInfo>,
    options: GateOptions,
}

impl GenerationGate {
    pub fn new(runtime: Arc<dyn ModelRuntime>, options: GateOptions) -> Self {
        Self {
            runtime,
            slot: Arc::new(Mutex::new(None)),
            info: RwLock::new(ModelInfo::default()),
            options,
        }
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    pub fn available_models(&self) -> Vec<AvailableModel> {
        self.runtime.available_models()
    }

    /// Current model slot. Never blocks on a running generation.
    pub fn model_info(&self) -> ModelInfo {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_info(&self, info: ModelInfo) {
        *self.info.write().unwrap_or_else(|e| e.into_inner()) = info;
    }

    /// Load a model, retrying per the configured policy.
    ///
    /// The load itself runs outside the lock; only the swap into the slot
    /// waits for an in-flight generation. On failure any previously loaded
    /// model stays in place.
    pub async fn load_model(&self, request: LoadRequest) -> Result<ModelInfo, GenerationError> {
        let policy = self.options.retry;
        let mut attempt = 0u32;

        let loaded = loop {
            let runtime = Arc::clone(&self.runtime);
            let req = request.clone();
            let result = tokio::task::spawn_blocking(move || runtime.load(&req))
                .await
                .unwrap_or_else(|e| Err(RuntimeError::Other(format!("Load task failed: {e}"))));

            match result {
                Ok(model) => break model,
                Err(err) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        let cause = classify(&err);
                        error!(
                            model = %request.model_path,
                            attempts = attempt,
                            %cause,
                            error = %err,
                            "Model load failed"
                        );
                        return Err(GenerationError::ModelLoadFailed {
                            cause,
                            message: describe(cause, &request.model_path, &err),
                        });
                    }

                    let delay = policy.delay_for(attempt - 1);
                    warn!(
                        model = %request.model_path,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Model load attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let info = ModelInfo {
            loaded: true,
            model_name: Some(loaded.model_name().to_string()),
            model_type: Some(loaded.model_type().to_string()),
        };

        let mut slot = self.slot.lock().await;
        *slot = Some(loaded);
        self.set_info(info.clone());
        drop(slot);

        info!(
            model = info.model_name.as_deref().unwrap_or_default(),
            attempts = attempt + 1,
            "Model loaded"
        );
        Ok(info)
    }

    /// Drop the loaded model. Returns whether one was loaded.
    pub async fn unload_model(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let was_loaded = slot.take().is_some();
        self.set_info(ModelInfo::default());
        if was_loaded {
            info!("Model unloaded");
        }
        was_loaded
    }

    pub async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<GenerationOutput, GenerationError> {
        self.check_request(&messages, &params)?;
        let mut guard = self.acquire().await?;

        let cancel = Arc::new(AtomicBool::new(false));
        let task_cancel = Arc::clone(&cancel);
        let parameters_used = params.clone();
        let started = Instant::now();

        let mut handle = tokio::task::spawn_blocking(move || {
            let model = guard.as_deref_mut().ok_or(GenerationError::NoModelLoaded)?;
            let model_name = model.model_name().to_string();
            let (driven, result) =
                drive(model, &messages, &params, &task_cancel, |_, _, _| TokenFlow::Continue);
            result.map_err(|e| GenerationError::Runtime(e.to_string()))?;
            Ok::<_, GenerationError>((driven, model_name))
        });

        let joined = match self.options.generation_timeout {
            None => handle.await,
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.store(true, Ordering::Relaxed);
                    // Wait for the runtime to notice so the slot is free on return.
                    let _ = handle.await;
                    warn!(timeout_ms = limit.as_millis() as u64, "Generation timed out");
                    return Err(GenerationError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
        };

        let (driven, model_name) = joined
            .map_err(|e| GenerationError::Runtime(format!("Generation task failed: {e}")))??;
        let generation_time = started.elapsed().as_secs_f64();

        info!(
            model = %model_name,
            tokens = driven.token_count,
            seconds = generation_time,
            "Generation complete"
        );

        Ok(GenerationOutput {
            text: driven.text,
            token_count: driven.token_count,
            generation_time,
            parameters_used,
            model_name,
        })
    }

    /// Start a streaming generation.
    ///
    /// Request errors (bad parameters, no model, busy) are returned before
    /// the stream starts. Dropping the receiver stops generation at the next
    /// token and frees the slot.
    pub async fn stream_generate(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<mpsc::Receiver<StreamChunk>, GenerationError> {
        self.check_request(&messages, &params)?;
        let mut guard = self.acquire().await?;
        if guard.is_none() {
            return Err(GenerationError::NoModelLoaded);
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::task::spawn_blocking(move || {
            let Some(model) = guard.as_deref_mut() else {
                return;
            };
            let model_name = model.model_name().to_string();
            let started = Instant::now();
            let never = AtomicBool::new(false);
            let mut receiver_open = true;

            let (driven, result) = drive(model, &messages, &params, &never, |piece, count, text| {
                if tx.blocking_send(StreamChunk::token(piece, count, text)).is_ok() {
                    TokenFlow::Continue
                } else {
                    receiver_open = false;
                    TokenFlow::Stop
                }
            });

            if !receiver_open {
                debug!(tokens = driven.token_count, "Stream receiver dropped, generation stopped");
                return;
            }

            let terminal = match result {
                Ok(()) => {
                    let seconds = started.elapsed().as_secs_f64();
                    info!(
                        model = %model_name,
                        tokens = driven.token_count,
                        seconds,
                        "Streaming generation complete"
                    );
                    StreamChunk::done(driven, seconds, params, model_name)
                }
                Err(e) => {
                    warn!(error = %e, tokens = driven.token_count, "Streaming generation failed");
                    StreamChunk::failed(driven, e.to_string())
                }
            };
            let _ = tx.blocking_send(terminal);
        });

        Ok(rx)
    }

    fn check_request(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<(), GenerationError> {
        if messages.is_empty() {
            return Err(GenerationError::InvalidParameters(
                "messages must not be empty".into(),
            ));
        }
        params.validate()?;
        if !self.model_info().loaded {
            return Err(GenerationError::NoModelLoaded);
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<OwnedMutexGuard<Slot>, GenerationError> {
        let lock = Arc::clone(&self.slot).lock_owned();
        match self.options.acquire_timeout {
            None => Ok(lock.await),
            Some(limit) => tokio::time::timeout(limit, lock).await.map_err(|_| {
                warn!(waited_ms = limit.as_millis() as u64, "Generation slot busy");
                GenerationError::Busy {
                    waited_ms: limit.as_millis() as u64,
                }
            }),
        }
    }
}

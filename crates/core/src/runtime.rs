//! Model runtime traits: the seam between the generation gate and whatever
//! actually runs a model.
//!
//! Runtimes are synchronous. The gate calls them from a blocking thread and
//! guarantees at most one [`LoadedModel::generate`] is in flight at a time.

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::message::ChatMessage;
use crate::params::GenerationParams;

/// What to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    /// A local file path, a hub repo, or a runtime preset alias.
    pub model_path: String,
    /// Optional runtime-specific tokenizer settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_config: Option<serde_json::Value>,
}

impl LoadRequest {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            tokenizer_config: None,
        }
    }
}

/// Returned by the per-token callback to continue or halt generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlow {
    Continue,
    Stop,
}

/// A model the runtime knows how to fetch by alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableModel {
    pub name: String,
    pub source: String,
    pub description: String,
}

/// Snapshot of the gate's model slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub loaded: bool,
    pub model_name: Option<String>,
    pub model_type: Option<String>,
}

/// Loads models.
pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Load a model. Called on a blocking thread and may take a long time.
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn LoadedModel>, RuntimeError>;

    /// Preset models this runtime can resolve by alias.
    fn available_models(&self) -> Vec<AvailableModel> {
        Vec::new()
    }
}

/// A loaded model plus its tokenizer.
pub trait LoadedModel: Send {
    fn model_name(&self) -> &str;

    fn model_type(&self) -> &str;

    /// Generate from `messages`, calling `on_token` with each decoded piece
    /// of text in order. Generation ends at the model's natural stop, after
    /// `params.max_length` tokens, or when `on_token` returns
    /// [`TokenFlow::Stop`].
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<(), RuntimeError>;
}

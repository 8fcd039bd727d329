//! Candle runtime: runs GGUF-quantized models on the local CPU.
//!
//! Uses [Candle](https://github.com/huggingface/candle) (Rust-native ML) with
//! the quantized Llama architecture, which also covers Mistral, Qwen, SmolLM,
//! and TinyLlama GGUF exports.
//!
//! `model_path` may be:
//! - a path to a `.gguf` file (`tokenizer.json` is looked up next to it)
//! - a preset alias such as `tinyllama` or `qwen:0.5b`, fetched via `hf-hub`
//!
//! `tokenizer_config` may carry `tokenizer_file`, `tokenizer_repo`,
//! `chat_template`, and `eos_token` overrides.

use crate::sampling::{self, SamplingPlan};
use crate::template::ChatTemplate;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama as qlm;
use hf_hub::api::sync::Api;
use kiln_core::{
    AvailableModel, ChatMessage, GenerationParams, LoadRequest, LoadedModel, ModelRuntime,
    RuntimeError, TokenFlow,
};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

// ── Well-known model aliases ───────────────────────────────────────────

struct ModelPreset {
    aliases: &'static [&'static str],
    repo: &'static str,
    gguf_file: &'static str,
    tokenizer_repo: &'static str,
    chat_template: ChatTemplate,
    description: &'static str,
}

const PRESETS: &[ModelPreset] = &[
    ModelPreset {
        aliases: &["tinyllama", "tiny-llama", "tinyllama-1.1b"],
        repo: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
        gguf_file: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
        tokenizer_repo: "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
        chat_template: ChatTemplate::TinyLlama,
        description: "TinyLlama 1.1B chat, Q4_K_M (~670 MB)",
    },
    ModelPreset {
        aliases: &["smollm", "smollm:135m", "smollm-135m"],
        repo: "TheBloke/SmolLM-135M-Instruct-GGUF",
        gguf_file: "smollm-135m-instruct.Q4_K_M.gguf",
        tokenizer_repo: "HuggingFaceTB/SmolLM-135M-Instruct",
        chat_template: ChatTemplate::ChatMl,
        description: "SmolLM 135M instruct, Q4_K_M (~80 MB)",
    },
    ModelPreset {
        aliases: &["smollm:360m", "smollm-360m"],
        repo: "TheBloke/SmolLM-360M-Instruct-GGUF",
        gguf_file: "smollm-360m-instruct.Q4_K_M.gguf",
        tokenizer_repo: "HuggingFaceTB/SmolLM-360M-Instruct",
        chat_template: ChatTemplate::ChatMl,
        description: "SmolLM 360M instruct, Q4_K_M",
    },
    ModelPreset {
        aliases: &["qwen:0.5b", "qwen-0.5b", "qwen2-0.5b"],
        repo: "Qwen/Qwen2-0.5B-Instruct-GGUF",
        gguf_file: "qwen2-0_5b-instruct-q4_k_m.gguf",
        tokenizer_repo: "Qwen/Qwen2-0.5B-Instruct",
        chat_template: ChatTemplate::ChatMl,
        description: "Qwen2 0.5B instruct, Q4_K_M",
    },
    ModelPreset {
        aliases: &["qwen:1.5b", "qwen-1.5b", "qwen2-1.5b"],
        repo: "Qwen/Qwen2-1.5B-Instruct-GGUF",
        gguf_file: "qwen2-1_5b-instruct-q4_k_m.gguf",
        tokenizer_repo: "Qwen/Qwen2-1.5B-Instruct",
        chat_template: ChatTemplate::ChatMl,
        description: "Qwen2 1.5B instruct, Q4_K_M",
    },
    ModelPreset {
        aliases: &["llama3:8b", "llama-3-8b"],
        repo: "QuantFactory/Meta-Llama-3-8B-Instruct-GGUF",
        gguf_file: "Meta-Llama-3-8B-Instruct.Q4_K_M.gguf",
        tokenizer_repo: "meta-llama/Meta-Llama-3-8B-Instruct",
        chat_template: ChatTemplate::Llama3,
        description: "Llama 3 8B instruct, Q4_K_M (~4.9 GB)",
    },
];

fn resolve_preset(alias: &str) -> Option<&'static ModelPreset> {
    let alias = alias.to_lowercase();
    PRESETS.iter().find(|p| p.aliases.contains(&alias.as_str()))
}

const END_TOKENS: [&str; 5] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<|end_of_text|>"];

/// Optional settings read from `LoadRequest::tokenizer_config`.
#[derive(Debug, Default, PartialEq)]
struct TokenizerOverrides {
    tokenizer_file: Option<PathBuf>,
    tokenizer_repo: Option<String>,
    chat_template: Option<ChatTemplate>,
    eos_token: Option<String>,
}

impl TokenizerOverrides {
    fn from_config(config: Option<&serde_json::Value>) -> Result<Self, RuntimeError> {
        let Some(config) = config else {
            return Ok(Self::default());
        };
        let field = |key: &str| config.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let chat_template = match field("chat_template") {
            Some(name) => Some(ChatTemplate::parse(&name).ok_or_else(|| {
                RuntimeError::Other(format!("Unknown chat_template '{name}'"))
            })?),
            None => None,
        };

        Ok(Self {
            tokenizer_file: field("tokenizer_file").map(PathBuf::from),
            tokenizer_repo: field("tokenizer_repo"),
            chat_template,
            eos_token: field("eos_token"),
        })
    }
}

fn hub_err(what: &str, e: hf_hub::api::sync::ApiError) -> RuntimeError {
    let msg = format!("{what}: {e}");
    if msg.contains("404") || msg.to_lowercase().contains("not found") {
        RuntimeError::NotFound(msg)
    } else {
        RuntimeError::Network(msg)
    }
}

fn candle_err(e: candle_core::Error) -> RuntimeError {
    RuntimeError::Inference(format!("Candle inference error: {e}"))
}

fn fetch_tokenizer(api: Option<&Api>, repo: &str) -> Result<PathBuf, RuntimeError> {
    let owned;
    let api = match api {
        Some(api) => api,
        None => {
            owned = Api::new().map_err(|e| hub_err("Failed to initialize HuggingFace Hub API", e))?;
            &owned
        }
    };
    api.model(repo.to_string())
        .get("tokenizer.json")
        .map_err(|e| hub_err(&format!("Failed to download tokenizer from '{repo}'"), e))
}

// ── Runtime ────────────────────────────────────────────────────────────

/// A [`ModelRuntime`] backed by Candle on the CPU.
pub struct CandleRuntime {
    device: Device,
}

impl CandleRuntime {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
        }
    }
}

impl Default for CandleRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRuntime for CandleRuntime {
    fn name(&self) -> &str {
        "candle"
    }

    fn load(&self, request: &LoadRequest) -> Result<Box<dyn LoadedModel>, RuntimeError> {
        Ok(Box::new(CandleModel::load(request, &self.device)?))
    }

    fn available_models(&self) -> Vec<AvailableModel> {
        PRESETS
            .iter()
            .map(|p| AvailableModel {
                name: p.aliases[0].to_string(),
                source: format!("{}/{}", p.repo, p.gguf_file),
                description: p.description.to_string(),
            })
            .collect()
    }
}

/// Weights, tokenizer, and prompt format for one loaded model.
struct CandleModel {
    name: String,
    architecture: String,
    model: qlm::ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    template: ChatTemplate,
    eos_token_ids: Vec<u32>,
}

impl CandleModel {
    fn load(request: &LoadRequest, device: &Device) -> Result<Self, RuntimeError> {
        let overrides = TokenizerOverrides::from_config(request.tokenizer_config.as_ref())?;
        let path = Path::new(&request.model_path);

        let (model_file, tokenizer_file, template) = if path.exists() {
            if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
                return Err(RuntimeError::Other(format!(
                    "'{}' is not a .gguf file",
                    path.display()
                )));
            }
            let sibling = path.with_file_name("tokenizer.json");
            let tokenizer_file = match (&overrides.tokenizer_file, &overrides.tokenizer_repo) {
                (Some(file), _) => file.clone(),
                (None, _) if sibling.exists() => sibling,
                (None, Some(repo)) => fetch_tokenizer(None, repo)?,
                (None, None) => {
                    return Err(RuntimeError::NotFound(format!(
                        "No tokenizer.json next to {}; set tokenizer_config.tokenizer_file \
                         or tokenizer_config.tokenizer_repo",
                        path.display()
                    )));
                }
            };
            let template = overrides
                .chat_template
                .unwrap_or_else(|| ChatTemplate::guess(&request.model_path));
            (path.to_path_buf(), tokenizer_file, template)
        } else if let Some(preset) = resolve_preset(&request.model_path) {
            info!(
                model = %request.model_path,
                repo = preset.repo,
                file = preset.gguf_file,
                "Downloading/loading preset model"
            );
            let api = Api::new().map_err(|e| hub_err("Failed to initialize HuggingFace Hub API", e))?;
            let model_file = api.model(preset.repo.to_string()).get(preset.gguf_file).map_err(|e| {
                hub_err(
                    &format!("Failed to download '{}' from '{}'", preset.gguf_file, preset.repo),
                    e,
                )
            })?;
            let tokenizer_file = match &overrides.tokenizer_file {
                Some(file) => file.clone(),
                None => fetch_tokenizer(
                    Some(&api),
                    overrides.tokenizer_repo.as_deref().unwrap_or(preset.tokenizer_repo),
                )?,
            };
            let template = overrides.chat_template.unwrap_or(preset.chat_template);
            (model_file, tokenizer_file, template)
        } else {
            let known: Vec<&str> = PRESETS.iter().map(|p| p.aliases[0]).collect();
            return Err(RuntimeError::NotFound(format!(
                "Unknown model '{}'. Use a path to a .gguf file or one of: {}",
                request.model_path,
                known.join(", ")
            )));
        };

        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| RuntimeError::Other(format!("Failed to load tokenizer: {e}")))?;

        let mut file = std::fs::File::open(&model_file).map_err(|e| {
            RuntimeError::NotFound(format!("Failed to open {}: {e}", model_file.display()))
        })?;
        let gguf = gguf_file::Content::read(&mut file)
            .map_err(|e| RuntimeError::Other(format!("Failed to parse GGUF file: {e}")))?;

        let architecture = gguf
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .cloned()
            .unwrap_or_else(|| "llama".to_string());

        let mut eos_token_ids: Vec<u32> = gguf
            .metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|v| v.to_u32().ok())
            .into_iter()
            .collect();
        let extra = overrides.eos_token.iter().map(String::as_str).chain(END_TOKENS);
        for token in extra {
            if let Some(id) = tokenizer.token_to_id(token) {
                if !eos_token_ids.contains(&id) {
                    eos_token_ids.push(id);
                }
            }
        }

        let model = qlm::ModelWeights::from_gguf(gguf, &mut file, device)
            .map_err(|e| RuntimeError::Other(format!("Failed to load model weights: {e}")))?;

        let name = model_file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| request.model_path.clone());

        info!(
            model = %name,
            architecture = %architecture,
            template = ?template,
            eos_tokens = ?eos_token_ids,
            "Local model loaded"
        );

        Ok(Self {
            name,
            architecture,
            model,
            tokenizer,
            device: device.clone(),
            template,
            eos_token_ids,
        })
    }

    fn sampler(params: &GenerationParams) -> LogitsProcessor {
        let sampling = match SamplingPlan::from_params(params) {
            SamplingPlan::Greedy => Sampling::ArgMax,
            SamplingPlan::All { temperature } => Sampling::All { temperature },
            SamplingPlan::TopK { k, temperature } => Sampling::TopK { k, temperature },
            SamplingPlan::TopP { p, temperature } => Sampling::TopP { p, temperature },
            SamplingPlan::TopKThenTopP { k, p, temperature } => {
                Sampling::TopKThenTopP { k, p, temperature }
            }
        };
        let seed = params.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(42)
        });
        LogitsProcessor::from_sampling(seed, sampling)
    }
}

impl LoadedModel for CandleModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn model_type(&self) -> &str {
        &self.architecture
    }

    fn generate(
        &mut self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<(), RuntimeError> {
        let prompt = self.template.render(messages);
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| RuntimeError::Inference(format!("Tokenization failed: {e}")))?;
        let prompt_tokens = encoding.get_ids();
        if prompt_tokens.is_empty() {
            return Err(RuntimeError::Inference("Prompt encoded to zero tokens".into()));
        }

        debug!(
            prompt_tokens = prompt_tokens.len(),
            max_tokens = params.max_length,
            temperature = params.temperature,
            "Starting local generation"
        );

        let mut sampler = Self::sampler(params);
        let mut generated: Vec<u32> = Vec::new();
        let mut emitted = 0usize;
        let mut input = Tensor::new(prompt_tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(candle_err)?;
        let mut index_pos = 0usize;

        for _ in 0..params.max_tokens() {
            let seq_len = input.dim(1).map_err(candle_err)?;
            let logits = self.model.forward(&input, index_pos).map_err(candle_err)?;
            index_pos += seq_len;

            // The model returns logits for the last position only: (1, vocab).
            let mut values: Vec<f32> = logits
                .squeeze(0)
                .and_then(|l| l.to_dtype(DType::F32))
                .and_then(|l| l.to_vec1())
                .map_err(candle_err)?;
            sampling::adjust_logits(&mut values, &generated, params);
            let vocab = values.len();
            let adjusted = Tensor::from_vec(values, vocab, &self.device).map_err(candle_err)?;

            let next = sampler.sample(&adjusted).map_err(candle_err)?;
            if self.eos_token_ids.contains(&next) {
                break;
            }
            generated.push(next);

            // Decode the whole tail and emit only what is new and complete.
            let text = self
                .tokenizer
                .decode(&generated, true)
                .map_err(|e| RuntimeError::Inference(format!("Detokenization failed: {e}")))?;
            if text.len() > emitted && text.is_char_boundary(emitted) && !text.ends_with('\u{fffd}')
            {
                let piece = &text[emitted..];
                if self.template.end_markers().iter().any(|m| piece.contains(m)) {
                    break;
                }
                if on_token(piece) == TokenFlow::Stop {
                    break;
                }
                emitted = text.len();
            }

            input = Tensor::new(&[next][..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(candle_err)?;
        }

        debug!(tokens = generated.len(), "Local generation finished");
        Ok(())
    }
}

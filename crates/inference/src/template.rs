//! Chat templates: how a message list becomes a single prompt string.

use kiln_core::{ChatMessage, Role};

/// Prompt format expected by a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|system|>\n{content}</s>\n<|user|>\n{content}</s>\n<|assistant|>\n`
    TinyLlama,
    /// `<|im_start|>system\n{content}<|im_end|>\n...<|im_start|>assistant\n`
    ChatMl,
    /// `[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{content} [/INST]`
    Llama2,
    /// `<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{content}<|eot_id|>`
    Llama3,
}

impl ChatTemplate {
    /// Parse a template name as it appears in `tokenizer_config.chat_template`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "tinyllama" | "zephyr" => Some(Self::TinyLlama),
            "chatml" => Some(Self::ChatMl),
            "llama2" | "llama-2" => Some(Self::Llama2),
            "llama3" | "llama-3" => Some(Self::Llama3),
            _ => None,
        }
    }

    /// Pick a template from a model file or repo name.
    pub fn guess(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.contains("tinyllama") {
            Self::TinyLlama
        } else if lower.contains("llama-3") || lower.contains("llama3") {
            Self::Llama3
        } else if lower.contains("llama-2") || lower.contains("llama2") {
            Self::Llama2
        } else {
            Self::ChatMl
        }
    }

    pub fn render(&self, messages: &[ChatMessage]) -> String {
        match self {
            Self::TinyLlama => render_tinyllama(messages),
            Self::ChatMl => render_chatml(messages),
            Self::Llama2 => render_llama2(messages),
            Self::Llama3 => render_llama3(messages),
        }
    }

    /// End-of-turn markers a model may print instead of its EOS token.
    pub fn end_markers(&self) -> &'static [&'static str] {
        match self {
            Self::TinyLlama | Self::Llama2 => &["</s>"],
            Self::ChatMl => &["<|im_end|>", "<|endoftext|>"],
            Self::Llama3 => &["<|eot_id|>", "<|end_of_text|>"],
        }
    }
}

fn render_tinyllama(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        let tag = match msg.role {
            Role::System => "<|system|>\n",
            Role::User => "<|user|>\n",
            Role::Assistant => "<|assistant|>\n",
        };
        prompt.push_str(tag);
        prompt.push_str(&msg.content);
        prompt.push_str("</s>\n");
    }
    prompt.push_str("<|assistant|>\n");
    prompt
}

fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(msg.role.as_str());
        prompt.push('\n');
        prompt.push_str(&msg.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn render_llama2(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    let mut system = String::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                // Several system messages fold into one <<SYS>> block.
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&msg.content);
            }
            Role::User => {
                prompt.push_str("[INST] ");
                if !system.is_empty() {
                    prompt.push_str("<<SYS>>\n");
                    prompt.push_str(&system);
                    prompt.push_str("\n<</SYS>>\n\n");
                    system.clear();
                }
                prompt.push_str(&msg.content);
                prompt.push_str(" [/INST]");
            }
            Role::Assistant => {
                prompt.push(' ');
                prompt.push_str(&msg.content);
                prompt.push_str(" </s>");
            }
        }
    }
    prompt
}

fn render_llama3(messages: &[ChatMessage]) -> String {
    let mut prompt = String::from("<|begin_of_text|>");
    for msg in messages {
        prompt.push_str("<|start_header_id|>");
        prompt.push_str(msg.role.as_str());
        prompt.push_str("<|end_header_id|>\n\n");
        prompt.push_str(&msg.content);
        prompt.push_str("<|eot_id|>");
    }
    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    prompt
}

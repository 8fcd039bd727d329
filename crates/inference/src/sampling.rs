//! Logit adjustments applied before sampling, and the mapping from
//! [`GenerationParams`] to a sampling strategy.
//!
//! Everything here works on plain `f32` slices so it can be tested without
//! a model.

use kiln_core::GenerationParams;
use std::collections::HashMap;

/// How the next token is chosen from adjusted logits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingPlan {
    /// Always the most likely token.
    Greedy,
    All { temperature: f64 },
    TopK { k: usize, temperature: f64 },
    TopP { p: f64, temperature: f64 },
    TopKThenTopP { k: usize, p: f64, temperature: f64 },
}

impl SamplingPlan {
    pub fn from_params(params: &GenerationParams) -> Self {
        let temperature = params.temperature;
        if temperature <= 0.0 {
            return Self::Greedy;
        }

        let k = usize::try_from(params.top_k).unwrap_or(0);
        let p = params.top_p;
        match (k > 0, p < 1.0) {
            (false, false) => Self::All { temperature },
            (true, false) => Self::TopK { k, temperature },
            (false, true) => Self::TopP { p, temperature },
            (true, true) => Self::TopKThenTopP { k, p, temperature },
        }
    }
}

/// Scale down the logits of tokens present in `recent`.
///
/// Positive logits are divided by `penalty`, negative ones multiplied, so
/// the token always becomes less likely.
pub fn apply_repetition_penalty(logits: &mut [f32], recent: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = std::collections::HashSet::new();
    for &token in recent {
        if !seen.insert(token) {
            continue;
        }
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit >= 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

/// Subtract `frequency * count + presence` from every token seen in `generated`.
pub fn apply_frequency_presence(
    logits: &mut [f32],
    generated: &[u32],
    frequency: f32,
    presence: f32,
) {
    if frequency == 0.0 && presence == 0.0 {
        return;
    }
    let mut counts: HashMap<u32, u32> = HashMap::new();
    for &token in generated {
        *counts.entry(token).or_default() += 1;
    }
    for (token, count) in counts {
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit -= frequency * count as f32 + presence;
        }
    }
}

/// Mask tokens whose probability is below `min_p` times the top token's.
///
/// Works in logit space: `p_i / p_max >= min_p` iff `l_i - l_max >= ln(min_p)`.
pub fn apply_min_p(logits: &mut [f32], min_p: f32) {
    if min_p <= 0.0 {
        return;
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let threshold = max + min_p.ln();
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// All adjustments in the order they are applied during generation.
pub fn adjust_logits(logits: &mut [f32], generated: &[u32], params: &GenerationParams) {
    let window_start = generated.len().saturating_sub(params.repetition_context_size);
    apply_repetition_penalty(
        logits,
        &generated[window_start..],
        params.repetition_penalty as f32,
    );
    apply_frequency_presence(
        logits,
        generated,
        params.frequency_penalty as f32,
        params.presence_penalty as f32,
    );
    apply_min_p(logits, params.min_p as f32);
}

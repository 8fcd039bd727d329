//! Generation parameters and their validation rules.

use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Sampling and stopping parameters for a single generation.
///
/// Every field has a default, so `{}` deserializes to [`GenerationParams::default`].
/// Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i64,
    /// Maximum number of tokens to produce.
    pub max_length: i64,
    /// Generation halts once the accumulated text contains any of these.
    pub stop_sequences: Vec<String>,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub repetition_penalty: f64,
    /// How many trailing tokens the repetition penalty looks at.
    pub repetition_context_size: usize,
    pub min_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            max_length: 512,
            stop_sequences: Vec::new(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.05,
            repetition_context_size: 20,
            min_p: 0.0,
            seed: None,
        }
    }
}

impl GenerationParams {
    /// Check every ranged field, failing on the first violation.
    pub fn validate(&self) -> Result<(), GenerationError> {
        let invalid = |msg: String| Err(GenerationError::InvalidParameters(msg));

        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.temperature
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return invalid(format!("top_p must be between 0.0 and 1.0, got {}", self.top_p));
        }
        if self.top_k < 0 {
            return invalid(format!("top_k must be >= 0, got {}", self.top_k));
        }
        if self.max_length <= 0 {
            return invalid(format!("max_length must be > 0, got {}", self.max_length));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty < 1.0 {
            return invalid(format!(
                "repetition_penalty must be >= 1.0, got {}",
                self.repetition_penalty
            ));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return invalid(format!("min_p must be between 0.0 and 1.0, got {}", self.min_p));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// `max_length` as a token budget. Only meaningful after [`validate`](Self::validate).
    pub fn max_tokens(&self) -> usize {
        usize::try_from(self.max_length).unwrap_or(0)
    }

    /// First configured stop sequence contained in `text`, if any.
    pub fn matched_stop_sequence(&self, text: &str) -> Option<&str> {
        self.stop_sequences
            .iter()
            .filter(|s| !s.is_empty())
            .find(|s| text.contains(s.as_str()))
            .map(String::as_str)
    }
}

/// Human-readable description of one parameter, for `/parameters/defaults`.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub range: &'static str,
    pub description: &'static str,
}

pub fn parameter_info() -> Vec<ParameterInfo> {
    vec![
        ParameterInfo {
            name: "temperature",
            range: "0.0 - 2.0",
            description: "Controls randomness. Lower values are more deterministic",
        },
        ParameterInfo {
            name: "top_p",
            range: "0.0 - 1.0",
            description: "Nucleus sampling. Only tokens within this cumulative probability are considered",
        },
        ParameterInfo {
            name: "top_k",
            range: ">= 0",
            description: "Only the k most likely tokens are considered. 0 disables the filter",
        },
        ParameterInfo {
            name: "max_length",
            range: "> 0",
            description: "Maximum number of tokens to generate",
        },
        ParameterInfo {
            name: "stop_sequences",
            range: "list of strings",
            description: "Generation stops once the output contains any of these",
        },
        ParameterInfo {
            name: "frequency_penalty",
            range: "any",
            description: "Subtracted from a token's logit once per prior occurrence",
        },
        ParameterInfo {
            name: "presence_penalty",
            range: "any",
            description: "Subtracted from a token's logit if it has appeared at all",
        },
        ParameterInfo {
            name: "repetition_penalty",
            range: ">= 1.0",
            description: "Scales down logits of recently generated tokens",
        },
        ParameterInfo {
            name: "repetition_context_size",
            range: ">= 0",
            description: "Number of trailing tokens considered by the repetition penalty",
        },
        ParameterInfo {
            name: "min_p",
            range: "0.0 - 1.0",
            description: "Drops tokens whose probability is below min_p times the top probability",
        },
        ParameterInfo {
            name: "seed",
            range: "optional integer",
            description: "Seed for reproducible sampling",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let p = GenerationParams::default();
        assert!(p.is_valid());
        assert_eq!(p.max_length, 512);
        assert_eq!(p.top_k, 50);
    }

    #[test]
    fn empty_object_gives_defaults() {
        let p: GenerationParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p, GenerationParams::default());
    }

    #[test]
    fn unknown_fields_rejected() {
        let result: Result<GenerationParams, _> =
            serde_json::from_str(r#"{"temprature": 0.5}"#);
        assert!(result.is_err());
    }

    #[test]
    fn boundaries_are_inclusive() {
        let p = GenerationParams {
            temperature: 2.0,
            top_p: 0.0,
            top_k: 0,
            max_length: 1,
            repetition_penalty: 1.0,
            min_p: 1.0,
            ..Default::default()
        };
        assert!(p.is_valid());

        let p = GenerationParams {
            temperature: 0.0,
            top_p: 1.0,
            min_p: 0.0,
            ..Default::default()
        };
        assert!(p.is_valid());
    }

    #[test]
    fn any_single_out_of_range_field_fails() {
        let cases: Vec<(&str, GenerationParams)> = vec![
            ("temperature", GenerationParams { temperature: 2.01, ..Default::default() }),
            ("temperature", GenerationParams { temperature: -0.1, ..Default::default() }),
            ("top_p", GenerationParams { top_p: 1.5, ..Default::default() }),
            ("top_p", GenerationParams { top_p: -0.01, ..Default::default() }),
            ("top_k", GenerationParams { top_k: -1, ..Default::default() }),
            ("max_length", GenerationParams { max_length: 0, ..Default::default() }),
            ("max_length", GenerationParams { max_length: -5, ..Default::default() }),
            ("repetition_penalty", GenerationParams { repetition_penalty: 0.99, ..Default::default() }),
            ("min_p", GenerationParams { min_p: 1.1, ..Default::default() }),
            ("min_p", GenerationParams { min_p: -0.1, ..Default::default() }),
            ("temperature", GenerationParams { temperature: f64::NAN, ..Default::default() }),
            ("repetition_penalty", GenerationParams { repetition_penalty: f64::NAN, ..Default::default() }),
        ];

        for (field, params) in cases {
            match params.validate() {
                Err(GenerationError::InvalidParameters(msg)) => {
                    assert!(msg.contains(field), "message {msg:?} should name {field}")
                }
                other => panic!("expected InvalidParameters for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn stop_sequence_matching() {
        let p = GenerationParams {
            stop_sequences: vec!["".into(), "END".into(), "\n\n".into()],
            ..Default::default()
        };
        assert_eq!(p.matched_stop_sequence("hello END there"), Some("END"));
        assert_eq!(p.matched_stop_sequence("one\n\ntwo"), Some("\n\n"));
        assert_eq!(p.matched_stop_sequence("nothing"), None);
    }

    #[test]
    fn parameter_info_covers_fields() {
        let info = parameter_info();
        let names: Vec<_> = info.iter().map(|i| i.name).collect();
        let defaults = serde_json::to_value(GenerationParams::default()).unwrap();
        for key in defaults.as_object().unwrap().keys() {
            assert!(names.contains(&key.as_str()), "missing info for {key}");
        }
    }
}

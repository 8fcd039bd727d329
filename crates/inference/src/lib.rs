//! Model inference for kiln.
//!
//! [`GenerationGate`] owns the single loaded model and serializes access to
//! it. The model itself comes from a [`ModelRuntime`]: [`CandleRuntime`]
//! when built with the `local` feature, [`UnavailableRuntime`] otherwise.

pub mod gate;
pub mod retry;
pub mod sampling;
pub mod template;

#[cfg(feature = "local")]
pub mod local;

pub use gate::{GateOptions, GenerationGate, GenerationOutput, StreamChunk};
pub use retry::RetryPolicy;
pub use sampling::SamplingPlan;
pub use template::ChatTemplate;

#[cfg(feature = "local")]
pub use local::CandleRuntime;

use kiln_core::{LoadRequest, LoadedModel, ModelRuntime, RuntimeError};
use std::sync::Arc;

/// Runtime used when kiln is built without a model backend. Every load fails.
#[derive(Debug, Default)]
pub struct UnavailableRuntime;

impl ModelRuntime for UnavailableRuntime {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn load(&self, _request: &LoadRequest) -> Result<Box<dyn LoadedModel>, RuntimeError> {
        Err(RuntimeError::Other(
            "kiln was built without a model runtime; rebuild with `--features local`".into(),
        ))
    }
}

/// The best runtime compiled into this build.
pub fn default_runtime() -> Arc<dyn ModelRuntime> {
    #[cfg(feature = "local")]
    {
        Arc::new(CandleRuntime::new())
    }
    #[cfg(not(feature = "local"))]
    {
        Arc::new(UnavailableRuntime)
    }
}

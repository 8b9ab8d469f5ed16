use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::task::TokenId;

/// Opaque handle to a per-conversation engine context (KV cache, position
/// counters). Valid only for the model instance that created it.
pub type ContextId = u64;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("failed to create context: {0}")]
    ContextCreation(String),

    #[error("context {0} is not valid for this model instance")]
    InvalidContext(ContextId),
}

/// One generation step: the sampled token and whether the sequence is done
/// (end-of-sequence was sampled).
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub token: TokenId,
    pub done: bool,
}

/// A loaded model resident on the device. All methods block the calling
/// thread; the mux only invokes them from dedicated blocking workers, at most
/// one per context at a time.
pub trait ModelInstance: Send + Sync {
    fn create_context(&self) -> Result<ContextId, EngineError>;

    /// Feed `tokens` into the context's cache and sample the next token.
    /// The sampled token is not part of the cache until it is fed back in a
    /// subsequent call.
    fn generate_step(&self, context: ContextId, tokens: &[TokenId])
        -> Result<StepOutput, EngineError>;

    /// Remove cached tokens in positions `[start, end)` and re-anchor the
    /// remainder, as `llama_memory_seq_rm`/`seq_add` do. Used for context
    /// shifting and for discarding a divergent cached suffix.
    fn remove_tokens(&self, context: ContextId, start: usize, end: usize)
        -> Result<(), EngineError>;

    fn destroy_context(&self, context: ContextId);
}

/// Loads models. Device memory held by a model instance is released when the
/// last `Arc` to it drops.
pub trait InferenceBackend: Send + Sync + 'static {
    fn load_model(&self, path: &str, spec: &ModelSpec) -> Result<Arc<dyn ModelInstance>, EngineError>;
}

/// Model-load parameters consumed by the backend. Parsed upstream; unknown
/// fields are carried through untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub ctx_size: Option<usize>,
    #[serde(default)]
    pub n_gpu_layers: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The process-wide current engine: a model instance tagged with the
/// monotonic generation it belongs to. Replaced wholesale on swap, never
/// mutated. Contexts created under one generation are rejected (and lazily
/// re-created) under any other, so a stale handle is never dereferenced.
#[derive(Clone)]
pub struct EngineHandle {
    generation: u64,
    model: Arc<dyn ModelInstance>,
    model_path: String,
    model_spec: ModelSpec,
}

impl EngineHandle {
    pub fn new(
        generation: u64,
        model: Arc<dyn ModelInstance>,
        model_path: String,
        model_spec: ModelSpec,
    ) -> Self {
        Self {
            generation,
            model,
            model_path,
            model_spec,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn model(&self) -> &Arc<dyn ModelInstance> {
        &self.model
    }

    /// Path the current model was loaded from. Retained so a failed swap can
    /// roll back to it.
    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    pub fn model_spec(&self) -> &ModelSpec {
        &self.model_spec
    }
}

//! Deterministic mock engine for tests. Scripted generation (a fixed number
//! of steps, then EOS), per-context bookkeeping of fed tokens, failure
//! injection by path and by token, and an overlap detector that records any
//! concurrent `generate_step` calls against the same context.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::{ContextId, EngineError, InferenceBackend, ModelInstance, ModelSpec, StepOutput};
use crate::task::TokenId;

/// Tokens the mock emits: first generated token is `OUTPUT_TOKEN_BASE`,
/// second is `OUTPUT_TOKEN_BASE + 1`, and so on.
pub const OUTPUT_TOKEN_BASE: TokenId = 900;
/// Feeding this token makes `generate_step` fail.
pub const FAIL_TOKEN: TokenId = 666;

#[derive(Default)]
struct ContextState {
    fed: Vec<TokenId>,
    steps: usize,
}

pub struct MockModel {
    /// Emit EOS (done) on this step number.
    eos_after: usize,
    step_delay: Duration,
    contexts: Mutex<HashMap<ContextId, ContextState>>,
    next_context: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    steps: AtomicUsize,
    in_step: Mutex<HashSet<ContextId>>,
    overlap: AtomicBool,
    running: AtomicUsize,
    max_running: AtomicUsize,
    fail_context_creation: AtomicBool,
}

impl MockModel {
    pub fn new(eos_after: usize) -> Self {
        Self {
            eos_after: eos_after.max(1),
            step_delay: Duration::ZERO,
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicUsize::new(1),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            steps: AtomicUsize::new(0),
            in_step: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            fail_context_creation: AtomicBool::new(false),
        }
    }

    /// Make `create_context` fail until switched back off, simulating a
    /// transient device allocation failure.
    pub fn fail_context_creation(&self, fail: bool) {
        self.fail_context_creation.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every `generate_step`, to widen execution
    /// windows for overlap and cancellation tests.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn contexts_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn contexts_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn total_steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    /// True if two `generate_step` calls ever overlapped on one context.
    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `generate_step` calls observed across
    /// all contexts.
    pub fn max_concurrent_steps(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Tokens currently materialized in a context's cache.
    pub fn fed_tokens(&self, context: ContextId) -> Vec<TokenId> {
        self.contexts
            .lock()
            .unwrap()
            .get(&context)
            .map(|s| s.fed.clone())
            .unwrap_or_default()
    }

    /// Pre-populate a context's cache directly (test setup).
    pub fn feed(&self, context: ContextId, tokens: &[TokenId]) {
        let mut contexts = self.contexts.lock().unwrap();
        if let Some(state) = contexts.get_mut(&context) {
            state.fed.extend_from_slice(tokens);
        }
    }
}

impl ModelInstance for MockModel {
    fn create_context(&self) -> Result<ContextId, EngineError> {
        if self.fail_context_creation.load(Ordering::SeqCst) {
            return Err(EngineError::ContextCreation(
                "mock context allocation failure".into(),
            ));
        }
        let id = self.next_context.fetch_add(1, Ordering::SeqCst) as ContextId;
        self.contexts
            .lock()
            .unwrap()
            .insert(id, ContextState::default());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn generate_step(
        &self,
        context: ContextId,
        tokens: &[TokenId],
    ) -> Result<StepOutput, EngineError> {
        {
            let mut in_step = self.in_step.lock().unwrap();
            if !in_step.insert(context) {
                self.overlap.store(true, Ordering::SeqCst);
            }
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let result = self.step_inner(context, tokens);

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.in_step.lock().unwrap().remove(&context);
        result
    }

    fn remove_tokens(
        &self,
        context: ContextId,
        start: usize,
        end: usize,
    ) -> Result<(), EngineError> {
        let mut contexts = self.contexts.lock().unwrap();
        let state = contexts
            .get_mut(&context)
            .ok_or(EngineError::InvalidContext(context))?;
        if start > end || end > state.fed.len() {
            return Err(EngineError::Inference(format!(
                "remove_tokens range {start}..{end} out of bounds ({} cached)",
                state.fed.len()
            )));
        }
        state.fed.drain(start..end);
        Ok(())
    }

    fn destroy_context(&self, context: ContextId) {
        if self.contexts.lock().unwrap().remove(&context).is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockModel {
    fn step_inner(&self, context: ContextId, tokens: &[TokenId]) -> Result<StepOutput, EngineError> {
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        if tokens.contains(&FAIL_TOKEN) {
            return Err(EngineError::Inference("injected failure".into()));
        }
        let mut contexts = self.contexts.lock().unwrap();
        let state = contexts
            .get_mut(&context)
            .ok_or(EngineError::InvalidContext(context))?;
        state.fed.extend_from_slice(tokens);
        state.steps += 1;
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutput {
            token: OUTPUT_TOKEN_BASE + (state.steps - 1) as TokenId,
            done: state.steps >= self.eos_after,
        })
    }
}

pub struct MockBackend {
    eos_after: usize,
    step_delay: Duration,
    load_delay: Duration,
    fail_all: AtomicBool,
    loads: Mutex<Vec<String>>,
    instances: Mutex<Vec<(String, Arc<MockModel>)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            eos_after: 4,
            step_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_all: AtomicBool::new(false),
            loads: Mutex::new(Vec::new()),
            instances: Mutex::new(Vec::new()),
        }
    }

    /// Models loaded by this backend emit EOS after `n` steps.
    pub fn with_eos_after(mut self, n: usize) -> Self {
        self.eos_after = n;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Make every subsequent load fail, including rollback loads.
    pub fn fail_all_loads(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.lock().unwrap().len()
    }

    pub fn loaded_paths(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }

    /// The most recently loaded model instance.
    pub fn last_instance(&self) -> Option<Arc<MockModel>> {
        self.instances.lock().unwrap().last().map(|(_, m)| m.clone())
    }

    pub fn instance_for(&self, path: &str) -> Option<Arc<MockModel>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, m)| m.clone())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn load_model(&self, path: &str, _spec: &ModelSpec) -> Result<Arc<dyn ModelInstance>, EngineError> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.loads.lock().unwrap().push(path.to_string());
        // Paths containing "missing" simulate a bad model file.
        if self.fail_all.load(Ordering::SeqCst) || path.contains("missing") {
            return Err(EngineError::ModelLoad {
                path: path.to_string(),
                reason: "mock load failure".into(),
            });
        }
        let model = Arc::new(MockModel::new(self.eos_after).with_step_delay(self.step_delay));
        self.instances
            .lock()
            .unwrap()
            .push((path.to_string(), model.clone()));
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_generation_emits_eos() {
        let model = MockModel::new(3);
        let ctx = model.create_context().unwrap();

        let s1 = model.generate_step(ctx, &[1, 2, 3]).unwrap();
        assert_eq!(s1.token, OUTPUT_TOKEN_BASE);
        assert!(!s1.done);
        let s2 = model.generate_step(ctx, &[s1.token]).unwrap();
        assert!(!s2.done);
        let s3 = model.generate_step(ctx, &[s2.token]).unwrap();
        assert!(s3.done);
        assert_eq!(model.fed_tokens(ctx), vec![1, 2, 3, 900, 901]);
    }

    #[test]
    fn fail_token_injects_inference_error() {
        let model = MockModel::new(3);
        let ctx = model.create_context().unwrap();
        let err = model.generate_step(ctx, &[FAIL_TOKEN]).unwrap_err();
        assert!(matches!(err, EngineError::Inference(_)));
    }

    #[test]
    fn backend_fails_missing_paths() {
        let backend = MockBackend::new();
        assert!(backend.load_model("/models/missing.gguf", &ModelSpec::default()).is_err());
        assert!(backend.load_model("/models/ok.gguf", &ModelSpec::default()).is_ok());
        assert_eq!(backend.load_count(), 2);
    }

    #[test]
    fn destroyed_context_rejected() {
        let model = MockModel::new(3);
        let ctx = model.create_context().unwrap();
        model.destroy_context(ctx);
        let err = model.generate_step(ctx, &[1]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidContext(_)));
        assert_eq!(model.contexts_destroyed(), 1);
    }
}

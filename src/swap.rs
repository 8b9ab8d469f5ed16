//! Model hot-swap coordination: drain the scheduler, replace the engine,
//! resume — or roll back to the previous model.
//!
//! Replacing the engine is the only operation that invalidates shared state,
//! so it is the only stop-the-world phase. The serving loop drives the state
//! machine: it stops dequeuing when a swap begins, reports in-flight counts
//! via `poll`, and applies the outcome of `load`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::engine::{EngineHandle, InferenceBackend, ModelInstance, ModelSpec};
use crate::error::MuxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Idle,
    Draining,
    Loading,
    /// Rollback failed; the process must be externally restarted.
    Failed,
}

/// Progress events published while a swap runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SwapEvent {
    Draining { pending: usize },
    Loading { model: String },
    Ready { generation: u64 },
    RolledBack { error: String },
    Aborted { error: String },
    Failed { error: String },
}

/// An accepted swap request waiting for the drain to complete.
pub struct PendingSwap {
    pub target_path: String,
    pub target_spec: ModelSpec,
    pub reply: oneshot::Sender<Result<u64, MuxError>>,
    pub deadline: Instant,
}

/// What the serving loop should do about the swap this iteration.
pub enum SwapPoll {
    /// No swap in progress.
    Idle,
    /// Still draining in-flight tasks.
    Waiting,
    /// Drain timed out; the swap is aborted and service resumes.
    TimedOut(PendingSwap),
    /// All in-flight tasks finished; replace the engine now.
    ReadyToLoad(PendingSwap),
}

pub enum SwapOutcome {
    /// The target model is live.
    Activated { engine: EngineHandle },
    /// Loading the target failed; the previous model was reloaded.
    RolledBack { engine: EngineHandle, error: MuxError },
    /// Rollback failed too. Terminal.
    Failed { error: MuxError },
}

pub struct SwapCoordinator {
    state: SwapState,
    pending: Option<PendingSwap>,
    events: broadcast::Sender<SwapEvent>,
    drain_timeout: Duration,
}

impl SwapCoordinator {
    pub fn new(drain_timeout: Duration, events: broadcast::Sender<SwapEvent>) -> Self {
        Self {
            state: SwapState::Idle,
            pending: None,
            events,
            drain_timeout,
        }
    }

    pub fn state(&self) -> SwapState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state == SwapState::Failed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.events.subscribe()
    }

    /// Accept a swap request and enter DRAINING. `in_flight` is the current
    /// queued + running count, reported to subscribers.
    pub fn begin(
        &mut self,
        target_path: String,
        target_spec: ModelSpec,
        reply: oneshot::Sender<Result<u64, MuxError>>,
        in_flight: usize,
        now: Instant,
    ) -> Result<(), MuxError> {
        match self.state {
            SwapState::Failed => return Err(MuxError::BackendFailed),
            SwapState::Draining | SwapState::Loading => return Err(MuxError::SwapInProgress),
            SwapState::Idle => {}
        }
        tracing::info!(model = %target_path, in_flight, "model swap requested, draining");
        self.state = SwapState::Draining;
        self.pending = Some(PendingSwap {
            target_path,
            target_spec,
            reply,
            deadline: now + self.drain_timeout,
        });
        self.broadcast(SwapEvent::Draining { pending: in_flight });
        Ok(())
    }

    /// Advance the drain. Call once per loop iteration while not `Idle`.
    pub fn poll(&mut self, running: usize, now: Instant) -> SwapPoll {
        if self.state != SwapState::Draining {
            return SwapPoll::Idle;
        }
        let Some(pending) = self.pending.as_ref() else {
            self.state = SwapState::Idle;
            return SwapPoll::Idle;
        };
        if running == 0 {
            let pending = self.pending.take();
            // Checked above; take cannot fail here.
            match pending {
                Some(p) => return SwapPoll::ReadyToLoad(p),
                None => return SwapPoll::Idle,
            }
        }
        if now >= pending.deadline {
            tracing::warn!(running, "drain timed out, aborting swap");
            self.state = SwapState::Idle;
            self.broadcast(SwapEvent::Aborted {
                error: MuxError::DrainTimeout.to_string(),
            });
            match self.pending.take() {
                Some(p) => return SwapPoll::TimedOut(p),
                None => return SwapPoll::Idle,
            }
        }
        self.broadcast(SwapEvent::Draining { pending: running });
        SwapPoll::Waiting
    }

    /// The deadline the loop must wake up at while draining.
    pub fn drain_deadline(&self) -> Option<Instant> {
        if self.state == SwapState::Draining {
            self.pending.as_ref().map(|p| p.deadline)
        } else {
            None
        }
    }

    /// Replace the engine. Caller must have drained (no running tasks) and
    /// destroyed all contexts; `old` is dropped by the caller afterwards,
    /// releasing the previous model's device memory.
    ///
    /// On load failure the previous model is reloaded from its retained path
    /// and spec. A successful rollback still yields a new generation: the
    /// instance is new and old contexts are already gone. If rollback also
    /// fails the coordinator enters its terminal `Failed` state.
    pub async fn load(
        &mut self,
        target_path: String,
        target_spec: ModelSpec,
        backend: &Arc<dyn InferenceBackend>,
        old: &EngineHandle,
    ) -> SwapOutcome {
        self.state = SwapState::Loading;
        self.broadcast(SwapEvent::Loading {
            model: target_path.clone(),
        });
        let next_generation = old.generation() + 1;

        match load_model_blocking(backend.clone(), target_path.clone(), target_spec.clone()).await {
            Ok(model) => {
                let engine =
                    EngineHandle::new(next_generation, model, target_path, target_spec);
                self.state = SwapState::Idle;
                self.broadcast(SwapEvent::Ready {
                    generation: next_generation,
                });
                tracing::info!(generation = next_generation, "model swap complete");
                SwapOutcome::Activated { engine }
            }
            Err(load_err) => {
                tracing::warn!(error = %load_err, "model load failed, rolling back");
                let rollback = load_model_blocking(
                    backend.clone(),
                    old.model_path().to_string(),
                    old.model_spec().clone(),
                )
                .await;
                match rollback {
                    Ok(model) => {
                        let engine = EngineHandle::new(
                            next_generation,
                            model,
                            old.model_path().to_string(),
                            old.model_spec().clone(),
                        );
                        self.state = SwapState::Idle;
                        let error = MuxError::LoadFailed(load_err.to_string());
                        self.broadcast(SwapEvent::RolledBack {
                            error: error.to_string(),
                        });
                        tracing::info!(
                            generation = next_generation,
                            "rolled back to previous model"
                        );
                        SwapOutcome::RolledBack { engine, error }
                    }
                    Err(rollback_err) => {
                        self.state = SwapState::Failed;
                        let error = MuxError::RollbackFailed(format!(
                            "load: {load_err}; rollback: {rollback_err}"
                        ));
                        self.broadcast(SwapEvent::Failed {
                            error: error.to_string(),
                        });
                        tracing::error!(%error, "swap rollback failed, backend is down");
                        SwapOutcome::Failed { error }
                    }
                }
            }
        }
    }

    fn broadcast(&self, event: SwapEvent) {
        let _ = self.events.send(event);
    }
}

async fn load_model_blocking(
    backend: Arc<dyn InferenceBackend>,
    path: String,
    spec: ModelSpec,
) -> Result<Arc<dyn ModelInstance>, crate::engine::EngineError> {
    tokio::task::spawn_blocking(move || backend.load_model(&path, &spec))
        .await
        .map_err(|e| crate::engine::EngineError::ModelLoad {
            path: String::new(),
            reason: format!("load task panicked: {e}"),
        })?
}

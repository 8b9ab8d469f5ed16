//! The serving loop: single owner of the task queue and session table,
//! dispatching tasks to a bounded pool of blocking workers and coordinating
//! model swaps.
//!
//! The loop is the only writer of scheduling state, so no locks guard the
//! queue or the session table. A session's `ExecContext` is moved into the
//! worker for the duration of a task and moved back in the completion
//! message, which makes at-most-one-running-task-per-session structural.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::MuxConfig;
use crate::context;
use crate::engine::{EngineHandle, InferenceBackend, ModelInstance, ModelSpec};
use crate::error::MuxError;
use crate::queue::TaskQueue;
use crate::session::{ExecContext, SessionTable};
use crate::swap::{PendingSwap, SwapCoordinator, SwapEvent, SwapOutcome, SwapPoll, SwapState};
use crate::task::{
    FinishReason, GenerationParams, Priority, SessionId, Task, TaskId, TaskOutput, TaskState,
    TokenId,
};

// ─── Public API types ──────────────────────────────────────────────────────

pub struct SubmitRequest {
    pub session_id: SessionId,
    pub prompt_tokens: Vec<TokenId>,
    pub priority: Priority,
    pub params: GenerationParams,
    /// Deadline for the whole task, queued wait included.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MuxStatus {
    /// Queue depth per priority tier, HIGH first.
    pub queued: [usize; 3],
    pub running: usize,
    pub active_sessions: usize,
    pub idle_sessions: usize,
    pub generation: u64,
    pub swap_state: SwapState,
}

/// Cooperative cancellation flag, checked at every generation-step boundary.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── Commands and completions (internal) ───────────────────────────────────

type ResultReply = oneshot::Sender<Result<TaskOutput, MuxError>>;

enum Command {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<Result<TaskId, MuxError>>,
    },
    Fetch {
        task_id: TaskId,
        reply: ResultReply,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    CloseSession {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), MuxError>>,
    },
    Swap {
        target_path: String,
        target_spec: ModelSpec,
        reply: oneshot::Sender<Result<u64, MuxError>>,
    },
    Shutdown,
}

struct TaskCompletion {
    task_id: TaskId,
    session_id: SessionId,
    ctx: ExecContext,
    degraded: bool,
    result: Result<TaskOutput, MuxError>,
}

struct RunningTask {
    session_id: SessionId,
    cancel: CancelToken,
}

// ─── MuxHandle (public, cloneable) ─────────────────────────────────────────

#[derive(Clone)]
pub struct MuxHandle {
    cmd_tx: mpsc::Sender<Command>,
    accepting: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    status_rx: watch::Receiver<MuxStatus>,
    swap_events: broadcast::Sender<SwapEvent>,
}

impl MuxHandle {
    /// Enqueue a task. Admission failures (queue full, swap in progress,
    /// failed backend) are returned synchronously; nothing else blocks.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, MuxError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(MuxError::BackendFailed);
        }
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(MuxError::BackendShuttingDown);
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit { request, reply })
            .await
            .map_err(|_| MuxError::Shutdown)?;
        rx.await.map_err(|_| MuxError::Shutdown)?
    }

    /// Wait for a task's result. Each result is delivered once; fetching an
    /// unknown or already-delivered id fails with `TaskNotFound`, and a
    /// second fetch while another caller is already waiting fails with
    /// `FetchConflict`. A fetch abandoned by timeout frees its slot.
    pub async fn fetch(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<TaskOutput, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Fetch { task_id, reply })
            .await
            .map_err(|_| MuxError::Shutdown)?;
        match timeout {
            None => rx.await.map_err(|_| MuxError::Shutdown)?,
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(result) => result.map_err(|_| MuxError::Shutdown)?,
                Err(_) => Err(MuxError::FetchTimeout { task_id }),
            },
        }
    }

    /// Cancel a task. Queued tasks are removed immediately; running tasks
    /// get their flag set and stop at the next step boundary. Returns false
    /// for unknown ids.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Cancel { task_id, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn close_session(&self, session_id: SessionId) -> Result<(), MuxError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CloseSession { session_id, reply })
            .await
            .map_err(|_| MuxError::Shutdown)?;
        rx.await.map_err(|_| MuxError::Shutdown)?
    }

    /// Replace the loaded model. Resolves once the swap finishes (with the
    /// new generation id) or fails. Queued tasks survive the swap; the drain
    /// is bounded by the configured drain timeout.
    pub async fn swap_model(
        &self,
        target_path: impl Into<String>,
        target_spec: ModelSpec,
    ) -> Result<u64, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Swap {
                target_path: target_path.into(),
                target_spec,
                reply,
            })
            .await
            .map_err(|_| MuxError::Shutdown)?;
        rx.await.map_err(|_| MuxError::Shutdown)?
    }

    pub fn swap_events(&self) -> broadcast::Receiver<SwapEvent> {
        self.swap_events.subscribe()
    }

    /// Snapshot of queue depths, session counts, generation and swap state.
    /// Lock-free; never blocks, even mid-swap.
    pub fn status(&self) -> MuxStatus {
        self.status_rx.borrow().clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

// ─── Startup ───────────────────────────────────────────────────────────────

/// Load the initial model and start the serving loop.
pub async fn start_mux(
    backend: Arc<dyn InferenceBackend>,
    model_path: impl Into<String>,
    model_spec: ModelSpec,
    config: MuxConfig,
) -> Result<MuxHandle, MuxError> {
    let config = config.validate()?;
    let model_path = model_path.into();

    let load_backend = backend.clone();
    let load_path = model_path.clone();
    let load_spec = model_spec.clone();
    let model = tokio::task::spawn_blocking(move || load_backend.load_model(&load_path, &load_spec))
        .await
        .map_err(|e| MuxError::LoadFailed(format!("load task panicked: {e}")))?
        .map_err(|e| MuxError::LoadFailed(e.to_string()))?;
    let engine = EngineHandle::new(1, model, model_path, model_spec);
    tracing::info!(model = engine.model_path(), generation = 1, "engine loaded");

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (swap_events, _) = broadcast::channel(32);
    let accepting = Arc::new(AtomicBool::new(true));
    let failed = Arc::new(AtomicBool::new(false));
    let (status_tx, status_rx) = watch::channel(MuxStatus {
        queued: [0; 3],
        running: 0,
        active_sessions: 0,
        idle_sessions: 0,
        generation: 1,
        swap_state: SwapState::Idle,
    });

    let mux = MuxLoop {
        queue: TaskQueue::new(
            config.queue_size,
            config.priority_weights,
            config.starvation_threshold(),
        ),
        sessions: SessionTable::new(config.max_sessions, config.auto_cleanup),
        coordinator: SwapCoordinator::new(config.drain_timeout(), swap_events.clone()),
        config,
        backend,
        engine,
        running: HashMap::new(),
        waiters: HashMap::new(),
        finished: HashMap::new(),
        next_task_id: 1,
        cmd_rx,
        done_tx,
        done_rx,
        status_tx,
        accepting: accepting.clone(),
        failed: failed.clone(),
    };
    tokio::spawn(mux.run());

    Ok(MuxHandle {
        cmd_tx,
        accepting,
        failed,
        status_rx,
        swap_events,
    })
}

// ─── Serving loop ──────────────────────────────────────────────────────────

struct MuxLoop {
    config: MuxConfig,
    backend: Arc<dyn InferenceBackend>,
    engine: EngineHandle,
    queue: TaskQueue,
    sessions: SessionTable,
    coordinator: SwapCoordinator,
    running: HashMap<TaskId, RunningTask>,
    waiters: HashMap<TaskId, ResultReply>,
    finished: HashMap<TaskId, Result<TaskOutput, MuxError>>,
    next_task_id: TaskId,
    cmd_rx: mpsc::Receiver<Command>,
    done_tx: mpsc::UnboundedSender<TaskCompletion>,
    done_rx: mpsc::UnboundedReceiver<TaskCompletion>,
    status_tx: watch::Sender<MuxStatus>,
    accepting: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl MuxLoop {
    async fn run(mut self) {
        let sweep_period = (self.config.idle_timeout() / 4)
            .clamp(Duration::from_millis(50), Duration::from_secs(5));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Drain pending commands and completions without blocking.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(cmd) => {
                        if self.handle_command(cmd) {
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }
            while let Ok(completion) = self.done_rx.try_recv() {
                self.handle_completion(completion);
            }

            let now = Instant::now();
            for task in self.queue.expire(now) {
                self.deliver(task.id, Err(MuxError::QueuedTimeout { task_id: task.id }));
            }

            match self.coordinator.poll(self.running.len(), now) {
                SwapPoll::Idle | SwapPoll::Waiting => {}
                SwapPoll::TimedOut(pending) => {
                    // Swap aborted; service resumes against the old engine.
                    self.queue.set_accepting(true);
                    self.accepting.store(true, Ordering::SeqCst);
                    let _ = pending.reply.send(Err(MuxError::DrainTimeout));
                }
                SwapPoll::ReadyToLoad(pending) => {
                    self.perform_swap(pending).await;
                }
            }

            self.dispatch(now);
            self.publish_status();

            let draining = self.coordinator.state() == SwapState::Draining;
            let drain_wake = self
                .coordinator
                .drain_deadline()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            return;
                        }
                    }
                    None => return,
                },
                Some(completion) = self.done_rx.recv() => {
                    self.handle_completion(completion);
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    self.sessions
                        .sweep_idle(now, self.config.idle_timeout(), &self.engine);
                }
                _ = tokio::time::sleep_until(drain_wake), if draining => {}
            }
        }
    }

    /// Returns true on shutdown.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Submit { request, reply } => {
                let result = self.admit(request);
                let _ = reply.send(result);
            }
            Command::Fetch { task_id, reply } => {
                if let Some(result) = self.finished.remove(&task_id) {
                    if let Err(result) = reply.send(result) {
                        // Receiver gone (fetch timeout); keep the result.
                        self.finished.insert(task_id, result);
                    }
                } else if self.running.contains_key(&task_id) || self.queue.contains(task_id) {
                    // One live waiter per task. A waiter whose caller timed
                    // out and went away is replaced; a second concurrent
                    // fetch is rejected rather than silently unseating the
                    // first.
                    match self.waiters.entry(task_id) {
                        Entry::Occupied(mut entry) if entry.get().is_closed() => {
                            entry.insert(reply);
                        }
                        Entry::Occupied(_) => {
                            let _ = reply.send(Err(MuxError::FetchConflict { task_id }));
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(reply);
                        }
                    }
                } else {
                    let _ = reply.send(Err(MuxError::TaskNotFound { task_id }));
                }
            }
            Command::Cancel { task_id, reply } => {
                let cancelled = if let Some(task) = self.queue.cancel(task_id) {
                    tracing::info!(task_id = task.id, "queued task cancelled");
                    self.deliver(task_id, Err(MuxError::Cancelled { task_id }));
                    true
                } else if let Some(running) = self.running.get(&task_id) {
                    tracing::info!(task_id, "cancelling running task at next step boundary");
                    running.cancel.cancel();
                    true
                } else {
                    false
                };
                let _ = reply.send(cancelled);
            }
            Command::CloseSession { session_id, reply } => {
                let _ = reply.send(self.sessions.close(session_id, &self.engine));
            }
            Command::Swap {
                target_path,
                target_spec,
                reply,
            } => {
                if self.coordinator.is_failed() {
                    let _ = reply.send(Err(MuxError::BackendFailed));
                } else if self.coordinator.state() != SwapState::Idle {
                    let _ = reply.send(Err(MuxError::SwapInProgress));
                } else {
                    let in_flight = self.queue.len() + self.running.len();
                    // Cannot fail after the state checks above.
                    if self
                        .coordinator
                        .begin(target_path, target_spec, reply, in_flight, Instant::now())
                        .is_ok()
                    {
                        self.queue.set_accepting(false);
                        self.accepting.store(false, Ordering::SeqCst);
                    }
                }
            }
            Command::Shutdown => {
                tracing::info!(
                    running = self.running.len(),
                    queued = self.queue.len(),
                    "mux shutting down"
                );
                for running in self.running.values() {
                    running.cancel.cancel();
                }
                for (_, waiter) in self.waiters.drain() {
                    let _ = waiter.send(Err(MuxError::Shutdown));
                }
                return true;
            }
        }
        false
    }

    fn admit(&mut self, request: SubmitRequest) -> Result<TaskId, MuxError> {
        if self.coordinator.is_failed() {
            return Err(MuxError::BackendFailed);
        }
        let now = Instant::now();
        let id = self.next_task_id;
        let task = Task {
            id,
            session_id: request.session_id,
            priority: request.priority,
            prompt_tokens: request.prompt_tokens,
            params: request.params,
            enqueued_at: now,
            deadline: request.timeout.map(|t| now + t),
            state: TaskState::Queued,
            promotions: 0,
        };
        self.queue.push(task)?;
        self.next_task_id += 1;
        Ok(id)
    }

    fn handle_completion(&mut self, completion: TaskCompletion) {
        self.running.remove(&completion.task_id);
        let now = Instant::now();
        self.sessions.checkin(
            completion.session_id,
            completion.ctx,
            completion.degraded,
            now,
        );
        match &completion.result {
            Ok(output) => tracing::debug!(
                task_id = completion.task_id,
                session_id = completion.session_id,
                tokens = output.token_ids.len(),
                "task finished"
            ),
            Err(e) => tracing::warn!(
                task_id = completion.task_id,
                session_id = completion.session_id,
                error = %e,
                "task failed"
            ),
        }
        self.deliver(completion.task_id, completion.result);
    }

    fn deliver(&mut self, task_id: TaskId, result: Result<TaskOutput, MuxError>) {
        if let Some(waiter) = self.waiters.remove(&task_id) {
            if let Err(result) = waiter.send(result) {
                self.finished.insert(task_id, result);
            }
        } else {
            self.finished.insert(task_id, result);
        }
    }

    fn dispatch(&mut self, now: Instant) {
        if self.coordinator.state() != SwapState::Idle {
            return;
        }
        while self.running.len() < self.config.max_concurrent {
            let busy: HashSet<SessionId> =
                self.running.values().map(|r| r.session_id).collect();
            let Some(mut task) = self.queue.pop(&busy, now) else {
                break;
            };
            let ctx = match self.sessions.checkout(task.session_id, &self.engine, now) {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.deliver(task.id, Err(e));
                    continue;
                }
            };
            task.state = TaskState::Running;
            let cancel = CancelToken::new();
            self.running.insert(
                task.id,
                RunningTask {
                    session_id: task.session_id,
                    cancel: cancel.clone(),
                },
            );
            tracing::debug!(
                task_id = task.id,
                session_id = task.session_id,
                generation = self.engine.generation(),
                "task dispatched"
            );
            let model = self.engine.model().clone();
            let done_tx = self.done_tx.clone();
            let ctx_size = self.config.ctx_size;
            let n_keep = self.config.n_keep;
            tokio::task::spawn_blocking(move || {
                run_task(task, ctx, model, ctx_size, n_keep, cancel, done_tx);
            });
        }
    }

    async fn perform_swap(&mut self, pending: PendingSwap) {
        let PendingSwap {
            target_path,
            target_spec,
            reply,
            ..
        } = pending;
        // Drained: destroy every context before the old engine goes away.
        self.sessions.evict_all(&self.engine);
        let outcome = self
            .coordinator
            .load(target_path, target_spec, &self.backend, &self.engine)
            .await;
        match outcome {
            SwapOutcome::Activated { engine } => {
                self.engine = engine;
                self.queue.set_accepting(true);
                self.accepting.store(true, Ordering::SeqCst);
                let _ = reply.send(Ok(self.engine.generation()));
            }
            SwapOutcome::RolledBack { engine, error } => {
                self.engine = engine;
                self.queue.set_accepting(true);
                self.accepting.store(true, Ordering::SeqCst);
                let _ = reply.send(Err(error));
            }
            SwapOutcome::Failed { error } => {
                // Terminal: fail queued work, reject everything from now on.
                self.failed.store(true, Ordering::SeqCst);
                for task in self.queue.drain() {
                    self.deliver(task.id, Err(MuxError::BackendFailed));
                }
                let _ = reply.send(Err(error));
            }
        }
    }

    fn publish_status(&self) {
        let counts = self.sessions.counts();
        self.status_tx.send_replace(MuxStatus {
            queued: self.queue.depths(),
            running: self.running.len(),
            active_sessions: counts.active,
            idle_sessions: counts.idle,
            generation: self.engine.generation(),
            swap_state: self.coordinator.state(),
        });
    }
}

// ─── Blocking worker ───────────────────────────────────────────────────────

fn run_task(
    task: Task,
    mut ctx: ExecContext,
    model: Arc<dyn ModelInstance>,
    ctx_size: usize,
    n_keep: usize,
    cancel: CancelToken,
    done_tx: mpsc::UnboundedSender<TaskCompletion>,
) {
    let result = generate(&task, &mut ctx, model.as_ref(), ctx_size, n_keep, &cancel);
    let degraded = matches!(result, Err(MuxError::Inference(_)));
    let _ = done_tx.send(TaskCompletion {
        task_id: task.id,
        session_id: task.session_id,
        ctx,
        degraded,
        result,
    });
}

/// The token loop. Blocking from the first step to the last; cancellation
/// and the running deadline are only honored at step boundaries.
fn generate(
    task: &Task,
    ctx: &mut ExecContext,
    model: &dyn ModelInstance,
    ctx_size: usize,
    n_keep: usize,
    cancel: &CancelToken,
) -> Result<TaskOutput, MuxError> {
    let reused = context::reuse_prefix(ctx, model, &task.prompt_tokens)?;
    let mut input: Vec<TokenId> = task.prompt_tokens[reused..].to_vec();
    let mut generated = Vec::new();
    let mut finish_reason = FinishReason::Length;

    loop {
        if cancel.is_cancelled() {
            return Err(MuxError::Cancelled { task_id: task.id });
        }
        if task.past_deadline(Instant::now()) {
            return Err(MuxError::RunningTimeout { task_id: task.id });
        }
        context::ensure_capacity(ctx, model, input.len(), ctx_size, n_keep)?;
        let step = model.generate_step(ctx.context_id, &input)?;
        context::record_tokens(ctx, &input);
        generated.push(step.token);
        if step.done || task.params.stop_tokens.contains(&step.token) {
            finish_reason = FinishReason::Eos;
            break;
        }
        if generated.len() >= task.params.max_new_tokens {
            break;
        }
        input = vec![step.token];
    }

    Ok(TaskOutput {
        task_id: task.id,
        session_id: task.session_id,
        token_ids: generated,
        finish_reason,
    })
}

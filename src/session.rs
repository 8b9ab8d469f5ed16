use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::engine::{ContextId, EngineHandle};
use crate::error::MuxError;
use crate::task::{SessionId, TokenId};

/// Engine-resident conversation state for one session. Checked out of the
/// table while a task runs against it, which is what makes at-most-one
/// running task per session hold by construction.
#[derive(Debug)]
pub struct ExecContext {
    pub context_id: ContextId,
    /// Engine generation this context was created under. A context from any
    /// other generation is discarded without being dereferenced.
    pub generation: u64,
    /// Tokens currently materialized in the engine cache for this context.
    pub cached_tokens: Vec<TokenId>,
}

impl ExecContext {
    pub fn token_count(&self) -> usize {
        self.cached_tokens.len()
    }
}

enum Slot {
    /// Context parked between tasks.
    Idle(ExecContext),
    /// Context checked out by a running task.
    Running,
    /// Context destroyed (idle eviction or model swap); the next task
    /// re-initializes from scratch.
    Evicted,
}

struct SessionEntry {
    slot: Slot,
    last_used: Instant,
    /// Set after an engine failure; forces re-initialization on next access.
    degraded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub active: usize,
    pub idle: usize,
}

/// Maps session ids to engine contexts. Owned exclusively by the serving
/// loop; never locked.
pub struct SessionTable {
    entries: HashMap<SessionId, SessionEntry>,
    max_sessions: usize,
    auto_cleanup: bool,
}

impl SessionTable {
    pub fn new(max_sessions: usize, auto_cleanup: bool) -> Self {
        Self {
            entries: HashMap::new(),
            max_sessions,
            auto_cleanup,
        }
    }

    /// Check a session's context out for a task, creating or re-initializing
    /// it as needed. First use creates the session; an evicted, degraded or
    /// stale-generation context is rebuilt from the current engine.
    pub fn checkout(
        &mut self,
        session_id: SessionId,
        engine: &EngineHandle,
        now: Instant,
    ) -> Result<ExecContext, MuxError> {
        if let Some(entry) = self.entries.get_mut(&session_id) {
            entry.last_used = now;
            match std::mem::replace(&mut entry.slot, Slot::Running) {
                Slot::Running => {
                    // The scheduler's busy-set should prevent this.
                    return Err(MuxError::SessionBusy { session_id });
                }
                Slot::Idle(ctx) => {
                    if ctx.generation == engine.generation() && !entry.degraded {
                        return Ok(ctx);
                    }
                    // Stale generation: the engine that owned this context is
                    // gone, drop the handle unused. Same-generation degraded
                    // contexts are destroyed properly.
                    if ctx.generation == engine.generation() {
                        engine.model().destroy_context(ctx.context_id);
                    }
                    entry.degraded = false;
                    tracing::info!(session_id, "re-initializing session context");
                }
                Slot::Evicted => {
                    entry.degraded = false;
                    tracing::info!(session_id, "re-initializing evicted session");
                }
            }
            // The slot is already Running; park it back as Evicted if the
            // engine cannot produce a context, so the session stays usable.
            match Self::fresh_context(engine) {
                Ok(ctx) => return Ok(ctx),
                Err(e) => {
                    entry.slot = Slot::Evicted;
                    return Err(e);
                }
            }
        }

        if self.occupied() >= self.max_sessions {
            if !self.auto_cleanup || !self.evict_lru(engine) {
                return Err(MuxError::ResourceExhausted {
                    max_sessions: self.max_sessions,
                });
            }
        }

        let ctx = Self::fresh_context(engine)?;
        self.entries.insert(
            session_id,
            SessionEntry {
                slot: Slot::Running,
                last_used: now,
                degraded: false,
            },
        );
        tracing::info!(
            session_id,
            generation = engine.generation(),
            "session created"
        );
        Ok(ctx)
    }

    /// Return a context after its task finished. `degraded` marks the
    /// session for re-initialization on next access (engine failure).
    pub fn checkin(&mut self, session_id: SessionId, ctx: ExecContext, degraded: bool, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&session_id) {
            entry.slot = Slot::Idle(ctx);
            entry.last_used = now;
            entry.degraded = degraded;
        }
    }

    /// Close a session, destroying its context. Rejected while a task is
    /// running against it.
    pub fn close(&mut self, session_id: SessionId, engine: &EngineHandle) -> Result<(), MuxError> {
        match self.entries.get(&session_id) {
            None => return Err(MuxError::SessionNotFound { session_id }),
            Some(entry) => {
                if matches!(entry.slot, Slot::Running) {
                    return Err(MuxError::SessionBusy { session_id });
                }
            }
        }
        if let Some(entry) = self.entries.remove(&session_id) {
            if let Slot::Idle(ctx) = entry.slot {
                if ctx.generation == engine.generation() {
                    engine.model().destroy_context(ctx.context_id);
                }
            }
        }
        tracing::info!(session_id, "session closed");
        Ok(())
    }

    /// Evict idle sessions unused for longer than `idle_timeout`. Evicted
    /// ids disappear from the table; a later request re-initializes from
    /// scratch (conversation loss is expected).
    pub fn sweep_idle(
        &mut self,
        now: Instant,
        idle_timeout: Duration,
        engine: &EngineHandle,
    ) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                matches!(e.slot, Slot::Idle(_)) && now.duration_since(e.last_used) >= idle_timeout
            })
            .map(|(&id, _)| id)
            .collect();
        for &session_id in &stale {
            if let Some(entry) = self.entries.remove(&session_id) {
                if let Slot::Idle(ctx) = entry.slot {
                    if ctx.generation == engine.generation() {
                        engine.model().destroy_context(ctx.context_id);
                    }
                }
            }
            tracing::info!(session_id, "idle session evicted");
        }
        stale
    }

    /// Destroy every idle context ahead of a model swap. Entries stay in the
    /// table as `Evicted` so queued tasks re-initialize lazily against the
    /// new generation. Must only be called once the queue is drained (no
    /// `Running` slots).
    pub fn evict_all(&mut self, engine: &EngineHandle) {
        for (&session_id, entry) in &mut self.entries {
            match std::mem::replace(&mut entry.slot, Slot::Evicted) {
                Slot::Idle(ctx) => {
                    if ctx.generation == engine.generation() {
                        engine.model().destroy_context(ctx.context_id);
                    }
                    tracing::debug!(session_id, "context destroyed for swap");
                }
                Slot::Running => {
                    // Drained before LOADING; nothing should be running.
                    tracing::error!(session_id, "session still running during swap eviction");
                }
                Slot::Evicted => {}
            }
        }
    }

    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for entry in self.entries.values() {
            match entry.slot {
                Slot::Running => counts.active += 1,
                Slot::Idle(_) => counts.idle += 1,
                Slot::Evicted => {}
            }
        }
        counts
    }

    /// Sessions holding engine memory (idle or running). Evicted entries are
    /// bookkeeping only and do not count against `max_sessions`.
    fn occupied(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !matches!(e.slot, Slot::Evicted))
            .count()
    }

    fn fresh_context(engine: &EngineHandle) -> Result<ExecContext, MuxError> {
        let context_id = engine.model().create_context()?;
        Ok(ExecContext {
            context_id,
            generation: engine.generation(),
            cached_tokens: Vec::new(),
        })
    }

    fn evict_lru(&mut self, engine: &EngineHandle) -> bool {
        let lru = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.slot, Slot::Idle(_)))
            .min_by_key(|(_, e)| e.last_used)
            .map(|(&id, _)| id);
        let Some(session_id) = lru else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&session_id) {
            if let Slot::Idle(ctx) = entry.slot {
                if ctx.generation == engine.generation() {
                    engine.model().destroy_context(ctx.context_id);
                }
            }
        }
        tracing::info!(session_id, "LRU session evicted under capacity pressure");
        true
    }
}

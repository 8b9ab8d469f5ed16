use std::time::Instant;

use serde::Serialize;

pub type TaskId = u64;
pub type SessionId = u64;
pub type TokenId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Scheduler tier index: HIGH is tier 0.
    pub fn tier(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// One tier up, saturating at HIGH. Applied to tasks that waited past the
    /// starvation threshold.
    pub fn promoted(self) -> Self {
        match self {
            Self::High | Self::Normal => Self::High,
            Self::Low => Self::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The engine sampled end-of-sequence or a stop token.
    Eos,
    /// `max_new_tokens` was reached.
    Length,
}

/// Per-task generation controls. Sampling itself happens inside the engine;
/// these only bound and stop the token loop.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub stop_tokens: Vec<TokenId>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            stop_tokens: Vec::new(),
        }
    }
}

/// A unit of queued work against one session. Owned by the queue until
/// dispatch, then by the in-flight set, and dropped after its result is
/// delivered.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub priority: Priority,
    pub prompt_tokens: Vec<TokenId>,
    pub params: GenerationParams,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub state: TaskState,
    /// How many tiers this task has been promoted by aging.
    pub promotions: u8,
}

impl Task {
    pub fn effective_priority(&self) -> Priority {
        let mut p = self.priority;
        for _ in 0..self.promotions {
            p = p.promoted();
        }
        p
    }

    pub fn past_deadline(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub token_ids: Vec<TokenId>,
    pub finish_reason: FinishReason,
}

use thiserror::Error;

use crate::engine::EngineError;
use crate::task::{SessionId, TaskId};

/// Coarse error grouping, stable across releases. Callers that only need to
/// decide retry/reject/abort behavior can match on the kind instead of the
/// full variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Admission,
    Timeout,
    Resource,
    Engine,
    Swap,
    Session,
    Lifecycle,
}

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("backend is shutting down for a model swap")]
    BackendShuttingDown,

    #[error("task {task_id} timed out before execution")]
    QueuedTimeout { task_id: TaskId },

    #[error("task {task_id} exceeded its deadline while running")]
    RunningTimeout { task_id: TaskId },

    #[error("waiting for task {task_id} result timed out")]
    FetchTimeout { task_id: TaskId },

    #[error("session table full (max_sessions {max_sessions})")]
    ResourceExhausted { max_sessions: usize },

    #[error("context overflow: {needed} tokens needed, {available} available after shifting")]
    ContextOverflow { needed: usize, available: usize },

    #[error("inference failed: {0}")]
    Inference(#[from] EngineError),

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: SessionId },

    #[error("session {session_id} has a running task")]
    SessionBusy { session_id: SessionId },

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: TaskId },

    #[error("task {task_id} already has a pending fetch")]
    FetchConflict { task_id: TaskId },

    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: TaskId },

    #[error("model swap already in progress")]
    SwapInProgress,

    #[error("timed out draining in-flight tasks before swap")]
    DrainTimeout,

    #[error("failed to load model: {0}")]
    LoadFailed(String),

    #[error("model load failed and rollback to the previous model also failed: {0}")]
    RollbackFailed(String),

    #[error("backend is in a failed state and must be externally restarted")]
    BackendFailed,

    #[error("mux has shut down")]
    Shutdown,
}

impl MuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QueueFull { .. } | Self::BackendShuttingDown => ErrorKind::Admission,
            Self::QueuedTimeout { .. }
            | Self::RunningTimeout { .. }
            | Self::FetchTimeout { .. } => ErrorKind::Timeout,
            Self::ResourceExhausted { .. } | Self::ContextOverflow { .. } => ErrorKind::Resource,
            Self::Inference(_) => ErrorKind::Engine,
            Self::SwapInProgress
            | Self::DrainTimeout
            | Self::LoadFailed(_)
            | Self::RollbackFailed(_)
            | Self::BackendFailed => ErrorKind::Swap,
            Self::SessionNotFound { .. } | Self::SessionBusy { .. } => ErrorKind::Session,
            Self::TaskNotFound { .. }
            | Self::FetchConflict { .. }
            | Self::Cancelled { .. }
            | Self::Shutdown => ErrorKind::Lifecycle,
        }
    }

    /// True only for the unrecoverable post-rollback-failure states. Every
    /// other error affects a single task or a single swap attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed(_) | Self::BackendFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_queue_full() {
        let e = MuxError::QueueFull { capacity: 50 };
        assert_eq!(e.to_string(), "task queue full (capacity 50)");
        assert_eq!(e.kind(), ErrorKind::Admission);
    }

    #[test]
    fn error_display_context_overflow() {
        let e = MuxError::ContextOverflow {
            needed: 5000,
            available: 3840,
        };
        assert_eq!(
            e.to_string(),
            "context overflow: 5000 tokens needed, 3840 available after shifting"
        );
        assert_eq!(e.kind(), ErrorKind::Resource);
    }

    #[test]
    fn only_rollback_failure_is_fatal() {
        assert!(MuxError::RollbackFailed("no such file".into()).is_fatal());
        assert!(MuxError::BackendFailed.is_fatal());
        assert!(!MuxError::DrainTimeout.is_fatal());
        assert!(!MuxError::LoadFailed("bad magic".into()).is_fatal());
        assert!(!MuxError::QueueFull { capacity: 1 }.is_fatal());
    }

    #[test]
    fn timeout_kinds() {
        assert_eq!(
            MuxError::QueuedTimeout { task_id: 1 }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            MuxError::RunningTimeout { task_id: 1 }.kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn engine_error_converts() {
        let e: MuxError = EngineError::Inference("batch decode failed".into()).into();
        assert_eq!(e.kind(), ErrorKind::Engine);
    }
}

use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::MuxError;
use crate::task::{SessionId, Task, TaskId, TaskState};

const NUM_TIERS: usize = 3;

/// Three-tier FIFO queue with weighted round-robin dequeue and aging.
///
/// Each scheduling cycle grants `weights[tier]` dequeues to HIGH, NORMAL and
/// LOW in that order; a tier with no runnable task forfeits its remaining
/// grants to the next tier. Cycle position persists across calls, so with a
/// single consumer the dequeue order is fully determined by the arrival
/// trace. Any task waiting past the starvation threshold is promoted one
/// tier, which bounds LOW-priority wait under sustained HIGH load and keeps
/// HIGH from being stuck behind a deep LOW backlog.
///
/// Purely synchronous; the serving loop is the single owner.
pub struct TaskQueue {
    tiers: [VecDeque<Task>; NUM_TIERS],
    capacity: usize,
    weights: [u32; NUM_TIERS],
    starvation_threshold: Duration,
    /// Remaining dequeue grants in the current cycle, per tier.
    grants: [u32; NUM_TIERS],
    cursor: usize,
    accepting: bool,
}

impl TaskQueue {
    pub fn new(capacity: usize, weights: [u32; NUM_TIERS], starvation_threshold: Duration) -> Self {
        Self {
            tiers: Default::default(),
            capacity,
            weights,
            starvation_threshold,
            grants: weights,
            cursor: 0,
            accepting: true,
        }
    }

    /// Close or reopen the admission gate. While closed every `push` fails
    /// with `BackendShuttingDown`; queued tasks are preserved.
    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn push(&mut self, task: Task) -> Result<(), MuxError> {
        if !self.accepting {
            return Err(MuxError::BackendShuttingDown);
        }
        if self.len() >= self.capacity {
            return Err(MuxError::QueueFull {
                capacity: self.capacity,
            });
        }
        let tier = task.effective_priority().tier();
        tracing::debug!(
            task_id = task.id,
            session_id = task.session_id,
            tier,
            depth = self.len() + 1,
            "task queued"
        );
        self.tiers[tier].push_back(task);
        Ok(())
    }

    /// Remove a queued task. Returns the task (marked `Cancelled`) so the
    /// caller can deliver the cancellation to its waiter. Running tasks are
    /// not the queue's concern.
    pub fn cancel(&mut self, id: TaskId) -> Option<Task> {
        for tier in &mut self.tiers {
            if let Some(idx) = tier.iter().position(|t| t.id == id) {
                let mut task = tier.remove(idx)?;
                task.state = TaskState::Cancelled;
                return Some(task);
            }
        }
        None
    }

    /// Sweep out queued tasks whose deadline has passed, marking them
    /// `TimedOut`. They are reported, never executed.
    pub fn expire(&mut self, now: Instant) -> Vec<Task> {
        let mut expired = Vec::new();
        for tier in &mut self.tiers {
            let mut kept = VecDeque::with_capacity(tier.len());
            for mut task in tier.drain(..) {
                if task.past_deadline(now) {
                    task.state = TaskState::TimedOut;
                    tracing::warn!(
                        task_id = task.id,
                        waited_ms = now.duration_since(task.enqueued_at).as_millis() as u64,
                        "queued task expired"
                    );
                    expired.push(task);
                } else {
                    kept.push_back(task);
                }
            }
            *tier = kept;
        }
        expired
    }

    /// Dequeue the next task under the weighted policy. Tasks whose session
    /// is in `busy` are held in place, preserving per-session mutual
    /// exclusion; they keep their FIFO position.
    pub fn pop(&mut self, busy: &HashSet<SessionId>, now: Instant) -> Option<Task> {
        self.promote_starved(now);

        // At most one full refill: if a fresh cycle also finds nothing
        // runnable, the queue is empty or entirely held.
        for _ in 0..2 {
            while self.grants.iter().any(|&g| g > 0) {
                if self.grants[self.cursor] == 0 {
                    self.advance_cursor();
                    continue;
                }
                if let Some(task) = self.take_first_ready(self.cursor, busy) {
                    self.grants[self.cursor] -= 1;
                    return Some(task);
                }
                // Nothing runnable at this tier: forfeit its cycle.
                self.grants[self.cursor] = 0;
                self.advance_cursor();
            }
            self.grants = self.weights;
            self.cursor = 0;
        }
        None
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tiers.iter().any(|t| t.iter().any(|task| task.id == id))
    }

    /// Remove everything, in tier order. Used when the backend enters its
    /// terminal failed state and queued tasks can never execute.
    pub fn drain(&mut self) -> Vec<Task> {
        let mut all = Vec::with_capacity(self.len());
        for tier in &mut self.tiers {
            all.extend(tier.drain(..));
        }
        all
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Queue depth per tier, HIGH first.
    pub fn depths(&self) -> [usize; NUM_TIERS] {
        [
            self.tiers[0].len(),
            self.tiers[1].len(),
            self.tiers[2].len(),
        ]
    }

    fn advance_cursor(&mut self) {
        self.cursor = (self.cursor + 1) % NUM_TIERS;
    }

    fn take_first_ready(&mut self, tier: usize, busy: &HashSet<SessionId>) -> Option<Task> {
        let idx = self.tiers[tier]
            .iter()
            .position(|t| !busy.contains(&t.session_id))?;
        self.tiers[tier].remove(idx)
    }

    /// Move tasks that have waited past `threshold * (promotions + 1)` up one
    /// tier. Promoted tasks join the back of the upper tier, keeping their
    /// order relative to each other.
    fn promote_starved(&mut self, now: Instant) {
        if self.starvation_threshold.is_zero() {
            return;
        }
        for tier in (1..NUM_TIERS).rev() {
            let mut promoted = Vec::new();
            let mut kept = VecDeque::with_capacity(self.tiers[tier].len());
            for mut task in self.tiers[tier].drain(..) {
                let waited = now.duration_since(task.enqueued_at);
                let bound = self.starvation_threshold * (u32::from(task.promotions) + 1);
                if waited >= bound {
                    task.promotions += 1;
                    tracing::debug!(
                        task_id = task.id,
                        waited_ms = waited.as_millis() as u64,
                        promotions = task.promotions,
                        "task promoted by aging"
                    );
                    promoted.push(task);
                } else {
                    kept.push_back(task);
                }
            }
            self.tiers[tier] = kept;
            for task in promoted {
                self.tiers[tier - 1].push_back(task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{GenerationParams, Priority};

    fn make_task(id: TaskId, session_id: SessionId, priority: Priority, now: Instant) -> Task {
        Task {
            id,
            session_id,
            priority,
            prompt_tokens: vec![1, 2, 3],
            params: GenerationParams::default(),
            enqueued_at: now,
            deadline: None,
            state: TaskState::Queued,
            promotions: 0,
        }
    }

    fn queue() -> TaskQueue {
        TaskQueue::new(50, [4, 2, 1], Duration::from_secs(5))
    }

    fn drain_order(queue: &mut TaskQueue, now: Instant) -> Vec<TaskId> {
        let busy = HashSet::new();
        let mut order = Vec::new();
        while let Some(task) = queue.pop(&busy, now) {
            order.push(task.id);
        }
        order
    }

    #[test]
    fn fifo_within_tier() {
        let now = Instant::now();
        let mut q = queue();
        for id in 0..4 {
            q.push(make_task(id, id, Priority::Normal, now)).unwrap();
        }
        assert_eq!(drain_order(&mut q, now), vec![0, 1, 2, 3]);
    }

    #[test]
    fn weighted_cycle_order() {
        let now = Instant::now();
        let mut q = queue();
        // 5 HIGH, 3 NORMAL, 2 LOW; weights 4:2:1.
        for id in 0..5 {
            q.push(make_task(id, id, Priority::High, now)).unwrap();
        }
        for id in 10..13 {
            q.push(make_task(id, id, Priority::Normal, now)).unwrap();
        }
        for id in 20..22 {
            q.push(make_task(id, id, Priority::Low, now)).unwrap();
        }
        // Cycle 1: H0 H1 H2 H3, N10 N11, L20.
        // Cycle 2: H4, (high empty, forfeit) N12, (normal empty) L21.
        assert_eq!(
            drain_order(&mut q, now),
            vec![0, 1, 2, 3, 10, 11, 20, 4, 12, 21]
        );
    }

    #[test]
    fn empty_tier_forfeits_to_next() {
        let now = Instant::now();
        let mut q = queue();
        for id in 0..3 {
            q.push(make_task(id, id, Priority::Low, now)).unwrap();
        }
        // No HIGH or NORMAL tasks: LOW drains back to back.
        assert_eq!(drain_order(&mut q, now), vec![0, 1, 2]);
    }

    #[test]
    fn two_high_complete_within_first_six_dequeues() {
        let now = Instant::now();
        let mut q = queue();
        for id in 0..10 {
            q.push(make_task(id, id, Priority::Normal, now)).unwrap();
        }
        q.push(make_task(100, 100, Priority::High, now)).unwrap();
        q.push(make_task(101, 101, Priority::High, now)).unwrap();

        let order = drain_order(&mut q, now);
        let pos_a = order.iter().position(|&id| id == 100).unwrap();
        let pos_b = order.iter().position(|&id| id == 101).unwrap();
        assert!(pos_a < 6, "first HIGH dequeued at {pos_a}");
        assert!(pos_b < 6, "second HIGH dequeued at {pos_b}");
    }

    #[test]
    fn queue_full_rejected() {
        let now = Instant::now();
        let mut q = TaskQueue::new(2, [4, 2, 1], Duration::from_secs(5));
        q.push(make_task(0, 0, Priority::Normal, now)).unwrap();
        q.push(make_task(1, 1, Priority::Normal, now)).unwrap();
        let err = q.push(make_task(2, 2, Priority::Normal, now)).unwrap_err();
        assert!(matches!(err, MuxError::QueueFull { capacity: 2 }));
    }

    #[test]
    fn gate_closed_rejects_but_preserves_queued() {
        let now = Instant::now();
        let mut q = queue();
        q.push(make_task(0, 0, Priority::Normal, now)).unwrap();
        q.set_accepting(false);
        let err = q.push(make_task(1, 1, Priority::Normal, now)).unwrap_err();
        assert!(matches!(err, MuxError::BackendShuttingDown));
        assert_eq!(q.len(), 1);
        q.set_accepting(true);
        q.push(make_task(1, 1, Priority::Normal, now)).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn busy_session_is_held_not_dequeued() {
        let now = Instant::now();
        let mut q = queue();
        q.push(make_task(0, 7, Priority::High, now)).unwrap();
        q.push(make_task(1, 8, Priority::High, now)).unwrap();

        let mut busy = HashSet::new();
        busy.insert(7);
        let task = q.pop(&busy, now).unwrap();
        assert_eq!(task.id, 1);
        // Task 0 kept its place and is dequeued once the session frees up.
        busy.clear();
        assert_eq!(q.pop(&busy, now).unwrap().id, 0);
    }

    #[test]
    fn all_sessions_busy_dequeues_nothing() {
        let now = Instant::now();
        let mut q = queue();
        q.push(make_task(0, 7, Priority::High, now)).unwrap();
        let mut busy = HashSet::new();
        busy.insert(7);
        assert!(q.pop(&busy, now).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancel_queued_task() {
        let now = Instant::now();
        let mut q = queue();
        q.push(make_task(0, 0, Priority::Low, now)).unwrap();
        let cancelled = q.cancel(0).unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert!(q.cancel(0).is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn expire_marks_timed_out() {
        let now = Instant::now();
        let mut q = queue();
        let mut task = make_task(0, 0, Priority::Normal, now);
        task.deadline = Some(now + Duration::from_millis(10));
        q.push(task).unwrap();
        q.push(make_task(1, 1, Priority::Normal, now)).unwrap();

        let expired = q.expire(now + Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 0);
        assert_eq!(expired[0].state, TaskState::TimedOut);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn starved_low_task_promoted() {
        let now = Instant::now();
        let mut q = TaskQueue::new(50, [4, 2, 1], Duration::from_millis(100));
        q.push(make_task(0, 0, Priority::Low, now)).unwrap();

        let later = now + Duration::from_millis(150);
        q.promote_starved(later);
        assert_eq!(q.depths(), [0, 1, 0]);

        // Past twice the threshold it climbs to HIGH.
        let much_later = now + Duration::from_millis(250);
        q.promote_starved(much_later);
        assert_eq!(q.depths(), [1, 0, 0]);
    }

    #[test]
    fn high_not_starved_behind_continuous_low_arrivals() {
        let now = Instant::now();
        let mut q = queue();
        let busy = HashSet::new();
        for id in 0..20 {
            q.push(make_task(id, id, Priority::Low, now)).unwrap();
        }
        q.push(make_task(100, 100, Priority::High, now)).unwrap();

        // Keep feeding LOW tasks between dequeues; HIGH must still surface
        // within one weighted cycle.
        let mut next_low = 200;
        let mut dequeued = Vec::new();
        for _ in 0..7 {
            q.push(make_task(next_low, next_low, Priority::Low, now))
                .unwrap();
            next_low += 1;
            dequeued.push(q.pop(&busy, now).unwrap().id);
        }
        assert!(
            dequeued.contains(&100),
            "HIGH task starved: dequeued {dequeued:?}"
        );
    }

    #[test]
    fn cycle_position_persists_across_calls() {
        let now = Instant::now();
        let mut q = queue();
        let busy = HashSet::new();
        for id in 0..6 {
            q.push(make_task(id, id, Priority::High, now)).unwrap();
        }
        q.push(make_task(10, 10, Priority::Normal, now)).unwrap();

        // Four HIGH grants, then NORMAL gets its turn despite HIGH backlog.
        let ids: Vec<TaskId> = (0..5).map(|_| q.pop(&busy, now).unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 10]);
    }
}

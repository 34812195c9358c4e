//! Deferred task queue.
//!
//! Packet handlers must stay bounded, so anything heavier is scheduled here
//! and run later from task context. Lower priority values run first; tasks
//! of equal priority run in scheduling order. The queue is bounded like the
//! firmware's callback queue, and a refused task is reported to the caller.

use std::collections::VecDeque;

/// Default number of pending tasks per node.
pub const DEFAULT_TASK_CAPACITY: usize = 16;

/// Work deferred out of packet or timer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Rendezvous input: local computation finished and/or turn arrived
    ReadyToSend { proc_done: bool, turn: bool },
    /// Particle filter update on the freshly swapped table
    Update,
    /// Aggregator: normalize and publish a resample target
    Aggregate,
    /// Aggregated particle: a complete resample target has arrived
    ApplyTarget,
    /// Aggregated particle: broadcast the current state unconditionally
    SendState,
    /// Filter: forward the events that passed the mask
    Forward,
    /// Emit a position packet
    Output,
    /// Resend the undelivered tail of a burst
    Flush,
}

impl Task {
    pub fn priority(&self) -> u8 {
        match self {
            Task::ReadyToSend { .. }
            | Task::SendState
            | Task::Forward
            | Task::Output
            | Task::Flush => 2,
            Task::Update | Task::Aggregate | Task::ApplyTarget => 3,
        }
    }
}

#[derive(Debug)]
pub struct TaskQueue {
    pending: VecDeque<Task>,
    capacity: usize,
    refused: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
            capacity,
            refused: 0,
        }
    }

    /// Queue a task. Returns `false` if the queue is full.
    pub fn schedule(&mut self, task: Task) -> bool {
        if self.pending.len() >= self.capacity {
            self.refused += 1;
            return false;
        }
        self.pending.push_back(task);
        true
    }

    /// Next task to run: highest priority, oldest first.
    pub fn pop(&mut self) -> Option<Task> {
        let best = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(i, t)| (t.priority(), *i))
            .map(|(i, _)| i)?;
        self.pending.remove(best)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Tasks refused because the queue was full.
    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn contains(&self, task: Task) -> bool {
        self.pending.contains(&task)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = TaskQueue::default();
        queue.schedule(Task::Update);
        queue.schedule(Task::ReadyToSend {
            proc_done: false,
            turn: true,
        });
        queue.schedule(Task::Aggregate);
        queue.schedule(Task::ReadyToSend {
            proc_done: true,
            turn: false,
        });

        assert_eq!(
            queue.pop(),
            Some(Task::ReadyToSend {
                proc_done: false,
                turn: true
            })
        );
        assert_eq!(
            queue.pop(),
            Some(Task::ReadyToSend {
                proc_done: true,
                turn: false
            })
        );
        assert_eq!(queue.pop(), Some(Task::Update));
        assert_eq!(queue.pop(), Some(Task::Aggregate));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_full_queue_refuses() {
        let mut queue = TaskQueue::new(1);
        assert!(queue.schedule(Task::Update));
        assert!(!queue.schedule(Task::Update));
        assert_eq!(queue.refused(), 1);
        assert_eq!(queue.len(), 1);
    }
}

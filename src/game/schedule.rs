//! Authority-scoped delayed actions.
//!
//! Every task is stamped with the authority epoch it was scheduled under.
//! Handing authority over bumps the epoch, which discards every task from
//! the previous holder in one step; the new authority schedules its own.

use tracing::debug;

use crate::ws::protocol::{EntityId, PickupId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTask {
    Respawn(EntityId),
    RestartRound,
    EnablePickup(PickupId),
}

#[derive(Debug, Clone)]
struct Entry {
    due: f64,
    epoch: u64,
    task: ScheduledTask,
}

#[derive(Debug, Clone, Default)]
pub struct TaskScheduler {
    entries: Vec<Entry>,
    epoch: u64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Schedule `task` at `due` under the current epoch.
    /// A task already pending is rescheduled rather than duplicated.
    pub fn schedule(&mut self, due: f64, task: ScheduledTask) {
        self.entries.retain(|e| e.task != task);
        self.entries.push(Entry {
            due,
            epoch: self.epoch,
            task,
        });
    }

    pub fn cancel(&mut self, task: ScheduledTask) {
        self.entries.retain(|e| e.task != task);
    }

    pub fn is_pending(&self, task: ScheduledTask) -> bool {
        self.entries.iter().any(|e| e.task == task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a new epoch, invalidating every task scheduled before it
    pub fn advance_epoch(&mut self) -> u64 {
        self.epoch += 1;
        let before = self.entries.len();
        let epoch = self.epoch;
        self.entries.retain(|e| e.epoch == epoch);
        debug!(
            epoch,
            invalidated = before - self.entries.len(),
            "Authority epoch advanced"
        );
        self.epoch
    }

    /// Remove and return tasks due at `now`, earliest first
    pub fn drain_due(&mut self, now: f64) -> Vec<ScheduledTask> {
        let epoch = self.epoch;
        let mut due: Vec<Entry> = Vec::new();
        self.entries.retain(|e| {
            if e.due <= now && e.epoch == epoch {
                due.push(e.clone());
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.due.total_cmp(&b.due));
        due.into_iter().map(|e| e.task).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_fire_in_due_order() {
        let mut sched = TaskScheduler::new();
        sched.schedule(5.0, ScheduledTask::RestartRound);
        sched.schedule(2.0, ScheduledTask::Respawn(EntityId(1)));
        sched.schedule(9.0, ScheduledTask::EnablePickup(3));

        assert!(sched.drain_due(1.0).is_empty());
        assert_eq!(
            sched.drain_due(6.0),
            vec![
                ScheduledTask::Respawn(EntityId(1)),
                ScheduledTask::RestartRound
            ]
        );
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn epoch_change_invalidates_old_tasks() {
        let mut sched = TaskScheduler::new();
        sched.schedule(1.0, ScheduledTask::Respawn(EntityId(2)));
        sched.advance_epoch();
        assert!(sched.is_empty());
        assert!(sched.drain_due(100.0).is_empty());

        sched.schedule(1.0, ScheduledTask::Respawn(EntityId(2)));
        assert_eq!(sched.drain_due(2.0), vec![ScheduledTask::Respawn(EntityId(2))]);
    }

    #[test]
    fn rescheduling_replaces_pending_task() {
        let mut sched = TaskScheduler::new();
        sched.schedule(1.0, ScheduledTask::Respawn(EntityId(2)));
        sched.schedule(4.0, ScheduledTask::Respawn(EntityId(2)));
        assert_eq!(sched.len(), 1);
        assert!(sched.drain_due(2.0).is_empty());
        assert!(sched.is_pending(ScheduledTask::Respawn(EntityId(2))));
    }
}

// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use ahash::AHasher;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::BuildHasherDefault;
use std::thread::Thread;
use std::time::Instant;

use tether_common::{InvariantViolation, TaskId};

use crate::task::{Notifications, TaskCallback, TaskHandle, TaskState};

/// The scheduler's books. Every task the scheduler still owns is in `tasks` and in exactly one of
/// `delayed`, `queued` or `running`. All four are only ever touched together, under one lock.
pub(crate) struct TaskQ {
    tasks: HashMap<TaskId, TaskRecord, BuildHasherDefault<AHasher>>,
    /// Ordered by execution time, ties broken by id (submission order).
    delayed: BTreeSet<(Instant, TaskId)>,
    /// FIFO of tasks whose time has come, waiting for a worker slot.
    queued: VecDeque<TaskId>,
    running: HashSet<TaskId, BuildHasherDefault<AHasher>>,
    /// Callbacks still executing whose tasks were cancelled out from under them. They are off the
    /// books but still occupy a worker, so they count against capacity until they return.
    detached: usize,
    max_concurrent: usize,
    pub(crate) shut_down: bool,
}

/// Scheduler-side record for one task.
pub(crate) struct TaskRecord {
    pub(crate) handle: TaskHandle,
    pub(crate) execute_at: Instant,
    /// Taken when the task is started.
    callback: Option<TaskCallback>,
    /// The worker executing the callback, once there is one.
    worker: Option<Thread>,
}

/// What was done with a task that got taken off the books.
pub(crate) enum Removal {
    /// It never started; its callback is handed back so it can be dropped outside the lock.
    Pending(Option<TaskCallback>, Notifications),
    /// Its callback is still executing on the given worker.
    Running(Option<Thread>, Notifications),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub delayed: usize,
    pub queued: usize,
    pub running: usize,
    /// Cancelled tasks whose callbacks have not yet returned.
    pub detached: usize,
    /// Tasks the scheduler still owns, across all three active states.
    pub total: usize,
}

impl TaskQ {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: Default::default(),
            delayed: BTreeSet::new(),
            queued: VecDeque::new(),
            running: Default::default(),
            detached: 0,
            max_concurrent: max_concurrent.max(1),
            shut_down: false,
        }
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.running.len() + self.detached < self.max_concurrent
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.delayed.first().map(|(at, _)| *at)
    }

    pub(crate) fn insert_delayed(
        &mut self,
        handle: TaskHandle,
        execute_at: Instant,
        callback: TaskCallback,
    ) {
        let id = handle.id();
        self.delayed.insert((execute_at, id));
        self.tasks.insert(
            id,
            TaskRecord {
                handle,
                execute_at,
                callback: Some(callback),
                worker: None,
            },
        );
    }

    /// Book a task straight into a running slot. The caller has checked capacity.
    pub(crate) fn insert_running(&mut self, handle: TaskHandle, execute_at: Instant) {
        let id = handle.id();
        self.running.insert(id);
        self.tasks.insert(
            id,
            TaskRecord {
                handle,
                execute_at,
                callback: None,
                worker: None,
            },
        );
    }

    /// Move every delayed task whose time has come onto the back of the queue, earliest first.
    pub(crate) fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(&(at, id)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.pop_first();
            self.queued.push_back(id);
            if let Some(record) = self.tasks.get(&id) {
                record.handle.set_state(TaskState::Queued);
            }
            promoted += 1;
        }
        promoted
    }

    /// Pull queued tasks into free worker slots, returning what must now be started.
    pub(crate) fn take_startable(&mut self) -> Vec<(TaskHandle, TaskCallback)> {
        let mut startable = vec![];
        while self.has_capacity() {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            let Some(record) = self.tasks.get_mut(&id) else {
                continue;
            };
            let Some(callback) = record.callback.take() else {
                continue;
            };
            record.handle.set_state(TaskState::Running);
            self.running.insert(id);
            startable.push((record.handle.clone(), callback));
        }
        startable
    }

    pub(crate) fn bind_worker(&mut self, task_id: TaskId, worker: Thread) {
        if let Some(record) = self.tasks.get_mut(&task_id) {
            record.worker = Some(worker);
        }
    }

    /// Take a task off the books for cancellation. `None` if the scheduler no longer owns it.
    pub(crate) fn remove(&mut self, task_id: TaskId) -> Option<Removal> {
        let mut record = self.tasks.remove(&task_id)?;
        if self.running.remove(&task_id) {
            self.detached += 1;
            let notifications = record.handle.mark_removed(false);
            return Some(Removal::Running(record.worker.take(), notifications));
        }
        if !self.delayed.remove(&(record.execute_at, task_id)) {
            self.queued.retain(|queued| *queued != task_id);
        }
        let notifications = record.handle.mark_removed(true);
        Some(Removal::Pending(record.callback.take(), notifications))
    }

    /// The callback for `task_id` has returned (or could not be started). Frees its worker slot,
    /// whether the task was still on the books or had been cancelled while running.
    pub(crate) fn complete(&mut self, task_id: TaskId) {
        if self.running.remove(&task_id) {
            self.tasks.remove(&task_id);
        } else {
            self.detached = self.detached.saturating_sub(1);
        }
    }

    /// Take everything that has not started off the books. Used at shutdown.
    pub(crate) fn drain_pending(&mut self) -> Vec<Removal> {
        let pending: Vec<TaskId> = self
            .delayed
            .iter()
            .map(|(_, id)| *id)
            .chain(self.queued.iter().copied())
            .collect();
        pending
            .into_iter()
            .filter_map(|task_id| self.remove(task_id))
            .collect()
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            delayed: self.delayed.len(),
            queued: self.queued.len(),
            running: self.running.len(),
            detached: self.detached,
            total: self.tasks.len(),
        }
    }

    /// Verify that the four indexes agree with each other and with each task's reported state.
    pub(crate) fn check_consistency(&self) -> Result<(), InvariantViolation> {
        let partitioned = self.delayed.len() + self.queued.len() + self.running.len();
        if partitioned != self.tasks.len() {
            return Err(InvariantViolation(format!(
                "{} delayed + {} queued + {} running != {} tasks",
                self.delayed.len(),
                self.queued.len(),
                self.running.len(),
                self.tasks.len()
            )));
        }
        if self.running.len() + self.detached > self.max_concurrent {
            return Err(InvariantViolation(format!(
                "{} running + {} detached exceeds capacity {}",
                self.running.len(),
                self.detached,
                self.max_concurrent
            )));
        }
        if !self.queued.is_empty() && self.has_capacity() {
            return Err(InvariantViolation(format!(
                "{} tasks queued while worker slots are free",
                self.queued.len()
            )));
        }
        for (at, id) in &self.delayed {
            self.check_member(*id, TaskState::Delayed)?;
            if self.tasks[id].execute_at != *at {
                return Err(InvariantViolation(format!(
                    "task {id} is indexed under the wrong execution time"
                )));
            }
        }
        for id in &self.queued {
            self.check_member(*id, TaskState::Queued)?;
        }
        for id in &self.running {
            self.check_member(*id, TaskState::Running)?;
        }
        Ok(())
    }

    fn check_member(&self, task_id: TaskId, expected: TaskState) -> Result<(), InvariantViolation> {
        let Some(record) = self.tasks.get(&task_id) else {
            return Err(InvariantViolation(format!(
                "task {task_id} indexed as {expected:?} but not in the task table"
            )));
        };
        let state = record.handle.state();
        if state != expected {
            return Err(InvariantViolation(format!(
                "task {task_id} indexed as {expected:?} but reports {state:?}"
            )));
        }
        Ok(())
    }
}

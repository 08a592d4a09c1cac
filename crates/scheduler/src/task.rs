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

//! Caller-facing task handles, and the per-task record of what has happened to a task so far
//! (its state, its captured exception, and whoever is waiting to hear about it).

use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_common::{TaskException, TaskId};
use tracing::error;

/// The work a task performs. An `Err` is captured as the task's exception.
pub type TaskCallback = Box<dyn FnOnce() -> eyre::Result<()> + Send + 'static>;

pub(crate) type Observer = Box<dyn FnOnce(&TaskHandle) + Send + 'static>;
pub(crate) type ExceptionObserver = Box<dyn FnOnce(&TaskHandle, &TaskException) + Send + 'static>;

/// Where a task is in its lifecycle. Advisory only: by the time the caller looks at it, it may
/// already have moved on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for its execution time.
    Delayed,
    /// Due, waiting for a free worker slot.
    Queued,
    /// Its callback is executing on a worker thread.
    Running,
    /// Gone from the scheduler, through cancellation or completion. Terminal.
    Removed,
}

struct Signals {
    state: TaskState,
    terminated: bool,
    exception: Option<TaskException>,
    on_exception: Vec<ExceptionObserver>,
    on_removed: Vec<Observer>,
    on_terminated: Vec<Observer>,
}

pub(crate) struct TaskCell {
    id: TaskId,
    signals: Mutex<Signals>,
}

/// A lightweight reference to a scheduled task. Cloning is cheap; all clones refer to the same
/// task. Handles remain usable after the task is gone.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

/// Observers collected while a lock was held, to be invoked once it has been released.
#[must_use]
pub(crate) struct Notifications {
    handle: TaskHandle,
    exception: Option<(TaskException, Vec<ExceptionObserver>)>,
    removed: Vec<Observer>,
    terminated: Vec<Observer>,
}

fn fire_guarded(task_id: TaskId, what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(task_id, what, "Task observer panicked");
    }
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, state: TaskState) -> Self {
        Self {
            cell: Arc::new(TaskCell {
                id,
                signals: Mutex::new(Signals {
                    state,
                    terminated: false,
                    exception: None,
                    on_exception: vec![],
                    on_removed: vec![],
                    on_terminated: vec![],
                }),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn state(&self) -> TaskState {
        self.signals().state
    }

    /// True once the callback can never run again: it has returned, or the task was cancelled
    /// before it started.
    pub fn is_terminated(&self) -> bool {
        self.signals().terminated
    }

    /// The exception captured from the task's callback, if it failed.
    pub fn exception(&self) -> Option<TaskException> {
        self.signals().exception.clone()
    }

    fn signals(&self) -> MutexGuard<'_, Signals> {
        self.cell
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.signals().state = state;
    }

    /// Mark the task as taken off the scheduler's books. `terminated` is false when the callback
    /// is still executing on its worker (cooperative cancellation).
    pub(crate) fn mark_removed(&self, terminated: bool) -> Notifications {
        let mut signals = self.signals();
        let mut notifications = Notifications::empty(self.clone());
        if signals.state != TaskState::Removed {
            signals.state = TaskState::Removed;
            notifications.removed = std::mem::take(&mut signals.on_removed);
        }
        if terminated && !signals.terminated {
            signals.terminated = true;
            notifications.terminated = std::mem::take(&mut signals.on_terminated);
            // Observers of an exception that can now never happen are simply dropped.
            signals.on_exception.clear();
        }
        notifications
    }

    /// Record that the callback has returned, with its exception if it failed.
    pub(crate) fn mark_completed(&self, exception: Option<TaskException>) -> Notifications {
        let mut signals = self.signals();
        let mut notifications = Notifications::empty(self.clone());
        if signals.state != TaskState::Removed {
            signals.state = TaskState::Removed;
            notifications.removed = std::mem::take(&mut signals.on_removed);
        }
        if let Some(exception) = exception {
            signals.exception = Some(exception.clone());
            notifications.exception = Some((exception, std::mem::take(&mut signals.on_exception)));
        } else {
            signals.on_exception.clear();
        }
        signals.terminated = true;
        notifications.terminated = std::mem::take(&mut signals.on_terminated);
        notifications
    }

    pub(crate) fn add_exception_observer(&self, observer: ExceptionObserver) {
        let mut signals = self.signals();
        if !signals.terminated {
            signals.on_exception.push(observer);
            return;
        }
        let Some(exception) = signals.exception.clone() else {
            return;
        };
        drop(signals);
        fire_guarded(self.id(), "exception", || observer(self, &exception));
    }

    pub(crate) fn add_removed_observer(&self, observer: Observer) {
        let mut signals = self.signals();
        if signals.state != TaskState::Removed {
            signals.on_removed.push(observer);
            return;
        }
        drop(signals);
        fire_guarded(self.id(), "removed", || observer(self));
    }

    pub(crate) fn add_terminated_observer(&self, observer: Observer) {
        let mut signals = self.signals();
        if !signals.terminated {
            signals.on_terminated.push(observer);
            return;
        }
        drop(signals);
        fire_guarded(self.id(), "terminated", || observer(self));
    }
}

impl Notifications {
    pub(crate) fn empty(handle: TaskHandle) -> Self {
        Self {
            handle,
            exception: None,
            removed: vec![],
            terminated: vec![],
        }
    }

    /// True if the task failed and nobody was listening for it.
    pub(crate) fn unobserved_exception(&self) -> Option<&TaskException> {
        match &self.exception {
            Some((exception, observers)) if observers.is_empty() => Some(exception),
            _ => None,
        }
    }

    /// Invoke the collected observers, exception first, then removal, then termination. Each
    /// observer is isolated: one panicking does not keep the others from running.
    pub(crate) fn fire(self) {
        let task_id = self.handle.id();
        if let Some((exception, observers)) = self.exception {
            for observer in observers {
                fire_guarded(task_id, "exception", || observer(&self.handle, &exception));
            }
        }
        for observer in self.removed {
            fire_guarded(task_id, "removed", || observer(&self.handle));
        }
        for observer in self.terminated {
            fire_guarded(task_id, "terminated", || observer(&self.handle));
        }
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for TaskHandle {}

impl Hash for TaskHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cell.id.hash(state)
    }
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

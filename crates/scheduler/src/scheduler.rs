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

use std::any::Any;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tether_common::config::SchedulerConfig;
use tether_common::{SchedulerError, TaskException, TaskId};
use tracing::{debug, error, trace, warn};

use crate::task::{Notifications, TaskCallback, TaskHandle, TaskState};
use crate::task_q::{Removal, SchedulerStats, TaskQ};

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// The id of the task whose callback the calling thread is executing, if any.
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(|current| current.get())
}

/// Delays too large to represent as an `Instant` are clamped to this.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Responsible for running callbacks, either right away or once their deadline passes, on worker
/// threads of their own. No more than `max_concurrent` callbacks ever execute at once; the rest
/// wait their turn in FIFO order.
///
/// A single "timer" thread sleeps until the earliest deadline and promotes due tasks. Each
/// started task gets its own named OS thread, so a hung callback only ever occupies its own slot.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    task_q: Mutex<TaskQ>,
    /// Signalled when the earliest deadline changes, or on shutdown.
    timer_wakeup: Condvar,
    next_task_id: AtomicUsize,
    thread_name_prefix: String,
}

impl TaskScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let shared = Arc::new(Shared {
            task_q: Mutex::new(TaskQ::new(config.max_concurrent)),
            timer_wakeup: Condvar::new(),
            next_task_id: AtomicUsize::new(1),
            thread_name_prefix: config.thread_name_prefix.clone(),
        });
        let timer_shared = shared.clone();
        let timer_thread = std::thread::Builder::new()
            .name(format!("{}-timer", config.thread_name_prefix))
            .spawn(move || timer_shared.run_timer())
            .map_err(|e| SchedulerError::WorkerSpawnFailed(e.to_string()))?;
        debug!(
            max_concurrent = config.max_concurrent,
            "Task scheduler started"
        );
        Ok(Self {
            shared,
            timer_thread: Mutex::new(Some(timer_thread)),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.lock().max_concurrent()
    }

    /// Run `callback` as soon as a worker slot is free.
    pub fn schedule_now<F>(&self, callback: F) -> TaskHandle
    where
        F: FnOnce() -> eyre::Result<()> + Send + 'static,
    {
        self.submit(Instant::now(), Box::new(callback))
    }

    /// Run `callback` once `delay` has elapsed and a worker slot is free.
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> TaskHandle
    where
        F: FnOnce() -> eyre::Result<()> + Send + 'static,
    {
        let now = Instant::now();
        let execute_at = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.submit(execute_at, Box::new(callback))
    }

    /// Run `callback` once `deadline` has passed and a worker slot is free.
    pub fn schedule_at<F>(&self, deadline: Instant, callback: F) -> TaskHandle
    where
        F: FnOnce() -> eyre::Result<()> + Send + 'static,
    {
        self.submit(deadline, Box::new(callback))
    }

    /// Start `callback` immediately if a worker slot is free right now. Otherwise nothing is
    /// created and `None` comes back.
    pub fn schedule_if_under_capacity<F>(&self, callback: F) -> Option<TaskHandle>
    where
        F: FnOnce() -> eyre::Result<()> + Send + 'static,
    {
        let handle = {
            let mut task_q = self.shared.lock();
            if task_q.shut_down || !task_q.has_capacity() {
                return None;
            }
            let handle = TaskHandle::new(self.shared.next_id(), TaskState::Running);
            task_q.insert_running(handle.clone(), Instant::now());
            self.shared.debug_check(&task_q);
            handle
        };
        trace!(task_id = handle.id(), "Task admitted under capacity");
        let callback: TaskCallback = Box::new(callback);
        self.shared.start_workers(vec![(handle.clone(), callback)]);
        Some(handle)
    }

    fn submit(&self, execute_at: Instant, callback: TaskCallback) -> TaskHandle {
        let handle = TaskHandle::new(self.shared.next_id(), TaskState::Delayed);
        let startable = {
            let mut task_q = self.shared.lock();
            if task_q.shut_down {
                drop(task_q);
                warn!(
                    task_id = handle.id(),
                    "Task scheduled after shutdown; discarding"
                );
                handle.mark_removed(true).fire();
                return handle;
            }
            let rearm = task_q.next_deadline().is_none_or(|next| execute_at < next);
            task_q.insert_delayed(handle.clone(), execute_at, callback);
            let now = Instant::now();
            let startable = if execute_at <= now {
                task_q.promote_due(now);
                task_q.take_startable()
            } else {
                if rearm {
                    self.shared.timer_wakeup.notify_one();
                }
                vec![]
            };
            self.shared.debug_check(&task_q);
            startable
        };
        trace!(task_id = handle.id(), "Task scheduled");
        self.shared.start_workers(startable);
        handle
    }

    /// Take the task off the scheduler's books. Idempotent, and callable from any thread,
    /// including the task's own callback. A callback that is already executing is not interrupted;
    /// it runs to completion, but still holds its worker slot until it does.
    pub fn cancel(&self, handle: &TaskHandle) {
        let removal = {
            let mut task_q = self.shared.lock();
            let removal = task_q.remove(handle.id());
            self.shared.debug_check(&task_q);
            removal
        };
        match removal {
            None => {}
            Some(Removal::Pending(callback, notifications)) => {
                trace!(task_id = handle.id(), "Cancelled pending task");
                drop(callback);
                notifications.fire();
            }
            Some(Removal::Running(worker, notifications)) => {
                debug!(
                    task_id = handle.id(),
                    worker = worker.as_ref().and_then(|w| w.name()).unwrap_or("<unbound>"),
                    "Cancelled running task; callback will run to completion"
                );
                notifications.fire();
            }
        }
    }

    /// Block until the task has terminated. Calling this from the task's own callback would never
    /// return, so it is refused with `WaitOnSelf`.
    pub fn wait(&self, handle: &TaskHandle) -> Result<(), SchedulerError> {
        let receiver = self.subscribe_to_task(handle)?;
        receiver.recv().map_err(|_| SchedulerError::ShutDown)
    }

    /// As `wait`, giving up after `timeout`.
    pub fn wait_timeout(&self, handle: &TaskHandle, timeout: Duration) -> Result<(), SchedulerError> {
        let receiver = self.subscribe_to_task(handle)?;
        receiver.recv_timeout(timeout).map_err(|e| match e {
            oneshot::RecvTimeoutError::Timeout => SchedulerError::WaitTimedOut(handle.id()),
            oneshot::RecvTimeoutError::Disconnected => SchedulerError::ShutDown,
        })
    }

    fn subscribe_to_task(
        &self,
        handle: &TaskHandle,
    ) -> Result<oneshot::Receiver<()>, SchedulerError> {
        if current_task() == Some(handle.id()) {
            error!(task_id = handle.id(), "Task attempted to wait on itself");
            debug_assert!(false, "task {} attempted to wait on itself", handle.id());
            return Err(SchedulerError::WaitOnSelf(handle.id()));
        }
        let (sender, receiver) = oneshot::channel();
        handle.add_terminated_observer(Box::new(move |_| {
            let _ = sender.send(());
        }));
        Ok(receiver)
    }

    /// Advisory: the state may change as soon as this returns.
    pub fn status(&self, handle: &TaskHandle) -> TaskState {
        handle.state()
    }

    /// Called with the captured exception if the task's callback fails. Fires immediately if it
    /// already has.
    pub fn on_exception<F>(&self, handle: &TaskHandle, observer: F)
    where
        F: FnOnce(&TaskHandle, &TaskException) + Send + 'static,
    {
        handle.add_exception_observer(Box::new(observer));
    }

    /// Called once the task leaves the scheduler's books, through cancellation or completion.
    /// Fires immediately if it already has.
    pub fn on_removed<F>(&self, handle: &TaskHandle, observer: F)
    where
        F: FnOnce(&TaskHandle) + Send + 'static,
    {
        handle.add_removed_observer(Box::new(observer));
    }

    /// Called once the task can never execute again. Fires immediately if that is already so.
    pub fn on_terminated<F>(&self, handle: &TaskHandle, observer: F)
    where
        F: FnOnce(&TaskHandle) + Send + 'static,
    {
        handle.add_terminated_observer(Box::new(observer));
    }

    /// Run `action` over every item, one task per item, under the usual capacity limit. Blocks
    /// until all have finished. On the first failure the remaining tasks are cancelled and the
    /// failure is returned.
    ///
    /// Calling this from inside a task can starve if every worker slot is held by a caller doing
    /// the same.
    pub fn for_each<T, I, F>(&self, items: I, action: F) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        F: Fn(T) -> eyre::Result<()> + Send + Sync + 'static,
    {
        if self.shared.lock().shut_down {
            return Err(SchedulerError::ShutDown);
        }
        let action = Arc::new(action);
        let finished = Arc::new(AtomicUsize::new(0));
        let (outcome_send, outcome_recv) = flume::unbounded();
        let handles: Vec<TaskHandle> = items
            .into_iter()
            .map(|item| {
                let action = action.clone();
                let finished = finished.clone();
                let handle = self.schedule_now(move || {
                    let result = (*action)(item);
                    finished.fetch_add(1, Ordering::SeqCst);
                    result
                });
                let outcome_send = outcome_send.clone();
                handle.add_terminated_observer(Box::new(move |handle| {
                    let _ = outcome_send.send(handle.exception());
                }));
                handle
            })
            .collect();
        drop(outcome_send);

        for _ in 0..handles.len() {
            match outcome_recv.recv() {
                Ok(None) => continue,
                Ok(Some(exception)) => {
                    for handle in &handles {
                        self.cancel(handle);
                    }
                    return Err(SchedulerError::TaskFailed(exception));
                }
                Err(_) => break,
            }
        }
        // Tasks removed before they ever ran (a concurrent shutdown) did not do their work.
        if finished.load(Ordering::SeqCst) < handles.len() {
            return Err(SchedulerError::ShutDown);
        }
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats()
    }

    /// Verify the scheduler's internal indexes agree with one another.
    #[cfg(debug_assertions)]
    pub fn check_consistency(&self) -> Result<(), tether_common::InvariantViolation> {
        self.shared.lock().check_consistency()
    }

    /// Stop the timer and remove every task that has not yet started. Callbacks already running
    /// finish on their own. Anything scheduled afterwards is removed immediately.
    pub fn shutdown(&self) {
        let pending = {
            let mut task_q = self.shared.lock();
            if task_q.shut_down {
                return;
            }
            task_q.shut_down = true;
            task_q.drain_pending()
        };
        self.shared.timer_wakeup.notify_all();
        debug!(cancelled = pending.len(), "Task scheduler shutting down");
        for removal in pending {
            if let Removal::Pending(callback, notifications) = removal {
                drop(callback);
                notifications.fire();
            }
        }
        let timer_thread = self
            .timer_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer_thread) = timer_thread
            && timer_thread.join().is_err()
        {
            error!("Scheduler timer thread panicked");
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskQ> {
        self.task_q.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::SeqCst)
    }

    #[cfg(debug_assertions)]
    fn debug_check(&self, task_q: &TaskQ) {
        if let Err(violation) = task_q.check_consistency() {
            error!(%violation, "Scheduler consistency check failed");
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_check(&self, _task_q: &TaskQ) {}

    fn run_timer(self: Arc<Self>) {
        let mut task_q = self.lock();
        loop {
            if task_q.shut_down {
                break;
            }
            let now = Instant::now();
            if task_q.promote_due(now) > 0 {
                let startable = task_q.take_startable();
                self.debug_check(&task_q);
                if !startable.is_empty() {
                    drop(task_q);
                    self.start_workers(startable);
                    task_q = self.lock();
                }
                continue;
            }
            task_q = match task_q.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    self.timer_wakeup
                        .wait_timeout(task_q, timeout)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
                None => self
                    .timer_wakeup
                    .wait(task_q)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        trace!("Scheduler timer exiting");
    }

    fn start_workers(self: &Arc<Self>, startable: Vec<(TaskHandle, TaskCallback)>) {
        for (handle, callback) in startable {
            let task_id = handle.id();
            let shared = self.clone();
            let worker_handle = handle.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{task_id}", self.thread_name_prefix))
                .spawn(move || shared.run_task(worker_handle, callback));
            match spawned {
                Ok(join_handle) => {
                    self.lock().bind_worker(task_id, join_handle.thread().clone());
                }
                Err(e) => {
                    error!(task_id, error = %e, "Could not start worker thread for task");
                    self.finish(
                        &handle,
                        Some(TaskException::SpawnFailed {
                            task_id,
                            message: e.to_string(),
                        }),
                    );
                }
            }
        }
    }

    fn run_task(self: Arc<Self>, handle: TaskHandle, callback: TaskCallback) {
        let task_id = handle.id();
        CURRENT_TASK.with(|current| current.set(Some(task_id)));
        trace!(task_id, "Task started");
        let result = catch_unwind(AssertUnwindSafe(callback));
        CURRENT_TASK.with(|current| current.set(None));
        let exception = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(TaskException::Failed {
                task_id,
                message: format!("{e:#}"),
            }),
            Err(payload) => Some(TaskException::Panicked {
                task_id,
                message: panic_message(payload.as_ref()),
            }),
        };
        self.finish(&handle, exception);
    }

    /// Book-keeping for a callback that has returned: free its slot, start whatever was waiting
    /// for one, and tell the observers.
    fn finish(self: &Arc<Self>, handle: &TaskHandle, exception: Option<TaskException>) {
        let (notifications, startable) = {
            let mut task_q = self.lock();
            task_q.complete(handle.id());
            let notifications: Notifications = handle.mark_completed(exception);
            let startable = if task_q.shut_down {
                vec![]
            } else {
                task_q.take_startable()
            };
            self.debug_check(&task_q);
            (notifications, startable)
        };
        if let Some(exception) = notifications.unobserved_exception() {
            error!(task_id = handle.id(), %exception, "Task failed with no exception observer");
        } else {
            trace!(task_id = handle.id(), "Task finished");
        }
        notifications.fire();
        self.start_workers(startable);
    }
}

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

use crate::ids::{ConnectionId, SessionId, TaskId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Task {0} attempted to wait on itself")]
    WaitOnSelf(TaskId),
    #[error("Timed out waiting for task {0}")]
    WaitTimedOut(TaskId),
    #[error("Could not spawn worker thread: {0}")]
    WorkerSpawnFailed(String),
    #[error("Scheduler has been shut down")]
    ShutDown,
    #[error(transparent)]
    TaskFailed(#[from] TaskException),
}

/// The captured failure of a task's callback. Never propagated into the scheduler's own control
/// flow; it is held on the task and handed to exception observers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskException {
    #[error("Task {task_id} failed: {message}")]
    Failed { task_id: TaskId, message: String },
    #[error("Task {task_id} panicked: {message}")]
    Panicked { task_id: TaskId, message: String },
    #[error("Task {task_id} could not be started: {message}")]
    SpawnFailed { task_id: TaskId, message: String },
}

impl TaskException {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskException::Failed { task_id, .. }
            | TaskException::Panicked { task_id, .. }
            | TaskException::SpawnFailed { task_id, .. } => *task_id,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
    #[error("Custom object {key:?} is not of the requested type")]
    CustomObjectTypeMismatch { key: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,
    #[error("Transport I/O failure: {0}")]
    Io(String),
}

/// Raised by the debug-build consistency checks when two indexes disagree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invariant violated: {0}")]
pub struct InvariantViolation(pub String);

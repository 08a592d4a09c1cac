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

//! A delayed-execution task scheduler: callbacks run on worker threads of their own, either now
//! or after a deadline, with a hard cap on how many execute at once.

mod scheduler;
mod task;
mod task_q;

pub use scheduler::{TaskScheduler, current_task};
pub use task::{TaskCallback, TaskHandle, TaskState};
pub use task_q::SchedulerStats;

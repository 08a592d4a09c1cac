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

//! Session and connection bookkeeping for long-poll and socket transports: which logical
//! connections exist, which physical transport each is attached to, and the timeouts that evict
//! abandoned connections and refresh long-held requests.

mod custom;
mod events;
mod registry;
mod state;
mod transport;

pub use custom::{CustomObject, IntoAny};
pub use events::{ListenerId, RegistryEvent};
pub use registry::{ConnectionRegistry, SharedTransport};
pub use state::RegistryStats;
pub use transport::{CloseReason, Delivery, Transport};

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

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tether_common::{ConnectionId, SessionId};
use tracing::error;

/// Lifecycle notifications published by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegistryEvent {
    SessionAllocated(SessionId),
    SessionClosed(SessionId),
    ConnectionAllocated(ConnectionId),
    ConnectionRegistered(ConnectionId),
    /// The connection stayed detached too long and has been evicted.
    ConnectionLost(ConnectionId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(usize);

type Listener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Fan-out list of event subscribers. Meant to be wired up once at startup.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicUsize,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    pub(crate) fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver each event to every listener. A listener that panics is logged and skipped; the
    /// rest still hear about it.
    pub(crate) fn emit(&self, events: &[RegistryEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for event in events {
            for listener in &listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    error!(?event, "Registry event listener panicked");
                }
            }
        }
    }
}

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
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tether_common::config::RegistryConfig;
use tether_common::{ConnectionId, RegistryError, SessionId, TransportError};
use tether_scheduler::{TaskHandle, TaskScheduler, current_task};
use tracing::{debug, error, info, trace, warn};

use crate::custom::{CustomObject, CustomObjects, dispose_all, downcast};
use crate::events::{ListenerId, Listeners, RegistryEvent};
pub use crate::state::SharedTransport;
use crate::state::{Attachment, ConnectionEntry, RegistryState, RegistryStats, SessionEntry};
use crate::transport::{CloseReason, Delivery};

/// Tracks client sessions and the logical connections within them, and which physical transport
/// (if any) each connection is currently attached to.
///
/// A connection without a transport counts down to eviction; attaching one stops the clock and
/// detaching it starts the clock again. Long-held transports can also be given a "stale" clock,
/// after which they are reset so the client comes back with a fresh request. Both clocks are tasks
/// on the shared `TaskScheduler`.
///
/// One mutex guards all of the registry's indexes. Transports, listeners and custom objects are
/// only ever called after that lock has been released. The scheduler's own lock is a leaf (the
/// scheduler never calls out while holding it), so timers are armed while the registry lock is
/// held; they are only ever cancelled after it is released.
pub struct ConnectionRegistry<M> {
    shared: Arc<Shared<M>>,
}

struct Shared<M> {
    state: Mutex<RegistryState<M>>,
    scheduler: Arc<TaskScheduler>,
    config: RegistryConfig,
    listeners: Listeners,
}

/// Work collected under the lock, to be carried out once it has been released.
struct Deferred<M> {
    cancel: Vec<TaskHandle>,
    close: Vec<(SharedTransport<M>, CloseReason)>,
    dispose: Vec<(String, Arc<dyn CustomObject>)>,
    events: Vec<RegistryEvent>,
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    Session(&'a SessionId),
    Connection(&'a ConnectionId),
}

impl<M> Clone for ConnectionRegistry<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Send + 'static> ConnectionRegistry<M> {
    pub fn new(scheduler: Arc<TaskScheduler>, config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::new()),
                scheduler,
                config,
                listeners: Listeners::default(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Listen for lifecycle events. Listeners are called on whichever thread caused the event,
    /// never with the registry lock held.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, listener: ListenerId) -> bool {
        self.shared.listeners.unsubscribe(listener)
    }

    /// Create a new, detached connection in `session_id`, creating the session too if this is
    /// the first we've heard of it. The connection will be evicted unless a transport registers
    /// for it within the disconnection timeout.
    pub fn allocate_connection(&self, session_id: &SessionId) -> ConnectionId {
        let shared = &self.shared;
        let connection_id = ConnectionId::generate();
        let mut events = vec![];
        {
            let mut state = shared.lock();
            let disconnect_timer = shared.arm_disconnect_timer(&connection_id);
            let session = state
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| {
                    events.push(RegistryEvent::SessionAllocated(session_id.clone()));
                    SessionEntry::default()
                });
            session.connections.insert(connection_id.clone());
            state.connections.insert(
                connection_id.clone(),
                ConnectionEntry::detached(session_id.clone(), disconnect_timer),
            );
            events.push(RegistryEvent::ConnectionAllocated(connection_id.clone()));
            shared.debug_check(&state);
        }
        debug!(%session_id, %connection_id, "Connection allocated");
        shared.listeners.emit(&events);
        connection_id
    }

    /// Attach a transport to the connection it names. Returns false, changing nothing, if that
    /// connection is not (or no longer) tracked under that session; transports routinely arrive
    /// for connections that were just evicted.
    pub fn register_transport(
        &self,
        transport: SharedTransport<M>,
        start_stale_timeout: bool,
    ) -> bool {
        let shared = &self.shared;
        let connection_id = transport.connection_id().clone();
        let session_id = transport.session_id().clone();
        let mut deferred = Deferred::new();
        {
            let mut state = shared.lock();
            let Some(connection) = state
                .connections
                .get_mut(&connection_id)
                .filter(|connection| connection.session_id == session_id)
            else {
                debug!(
                    %connection_id,
                    %session_id,
                    "Transport arrived for an untracked connection"
                );
                return false;
            };
            deferred.cancel.extend(connection.disconnect_timer.take());
            let mut stale_timer = match connection.attachment.take() {
                Some(previous) if Arc::ptr_eq(&previous.transport, &transport) => {
                    previous.stale_timer
                }
                Some(previous) => {
                    warn!(%connection_id, "Replacing a transport that was still attached");
                    deferred.cancel.extend(previous.stale_timer);
                    deferred
                        .close
                        .push((previous.transport, CloseReason::Reset));
                    None
                }
                None => None,
            };
            if !start_stale_timeout {
                deferred.cancel.extend(stale_timer.take());
            } else if stale_timer.is_none() {
                stale_timer = Some(shared.arm_stale_timer(&connection_id));
            }
            connection.attachment = Some(Attachment {
                transport,
                stale_timer,
            });
            deferred
                .events
                .push(RegistryEvent::ConnectionRegistered(connection_id.clone()));
            shared.debug_check(&state);
        }
        trace!(%connection_id, start_stale_timeout, "Transport registered");
        shared.run_deferred(deferred);
        true
    }

    /// Detach `transport` from its connection and start the disconnection clock. Returns false,
    /// changing nothing, if it is not the transport currently attached.
    pub fn unregister_transport(&self, transport: &SharedTransport<M>) -> bool {
        let shared = &self.shared;
        let connection_id = transport.connection_id();
        let stale_timer = {
            let mut state = shared.lock();
            let Some(connection) = state.connections.get_mut(connection_id) else {
                debug!(%connection_id, "Unregistering transport for an untracked connection");
                return false;
            };
            let Some(attachment) = connection
                .attachment
                .take_if(|attachment| Arc::ptr_eq(&attachment.transport, transport))
            else {
                debug!(%connection_id, "Unregistering a transport that is not the one attached");
                return false;
            };
            connection.disconnect_timer = Some(shared.arm_disconnect_timer(connection_id));
            shared.debug_check(&state);
            attachment.stale_timer
        };
        if let Some(stale_timer) = stale_timer {
            shared.scheduler.cancel(&stale_timer);
        }
        trace!(%connection_id, "Transport unregistered");
        true
    }

    /// Tear the session down: every attached transport is closed with a logout, every custom
    /// object belonging to the session or its connections is disposed, and the session and its
    /// connections are forgotten. Returns false if the session was not known.
    pub fn session_ended(&self, session_id: &SessionId) -> bool {
        let shared = &self.shared;
        let mut deferred = Deferred::new();
        {
            let mut state = shared.lock();
            let Some(session) = state.sessions.remove(session_id) else {
                debug!(%session_id, "Ending an unknown session");
                return false;
            };
            for connection_id in &session.connections {
                if let Some(connection) = state.connections.remove(connection_id) {
                    deferred.retire(connection, CloseReason::Logout);
                }
            }
            deferred.dispose.extend(session.custom_objects);
            deferred
                .events
                .push(RegistryEvent::SessionClosed(session_id.clone()));
            shared.debug_check(&state);
        }
        info!(%session_id, closed = deferred.close.len(), "Session ended");
        shared.run_deferred(deferred);
        true
    }

    pub fn check_session_is_valid(&self, session_id: &SessionId) -> bool {
        self.shared.lock().sessions.contains_key(session_id)
    }

    /// True if the connection exists and belongs to `session_id`.
    pub fn check_connection_is_valid(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> bool {
        self.shared
            .lock()
            .connections
            .get(connection_id)
            .is_some_and(|connection| connection.session_id == *session_id)
    }

    pub fn check_connection_exists(&self, connection_id: &ConnectionId) -> bool {
        self.shared.lock().connections.contains_key(connection_id)
    }

    /// True if the connection exists and has an attached transport with no send in flight.
    pub fn check_connection_is_available(&self, connection_id: &ConnectionId) -> bool {
        self.shared
            .lock()
            .connections
            .get(connection_id)
            .is_some_and(|connection| connection.is_available())
    }

    pub fn connection_ids_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ConnectionId>, RegistryError> {
        let state = self.shared.lock();
        let mut connection_ids: Vec<_> = state
            .session(session_id)?
            .connections
            .iter()
            .cloned()
            .collect();
        connection_ids.sort();
        Ok(connection_ids)
    }

    pub fn session_for_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<SessionId, RegistryError> {
        Ok(self.shared.lock().connection(connection_id)?.session_id.clone())
    }

    /// Hand `messages` to the connection's transport if one is attached and idle. At most one send
    /// is ever in flight per connection; a delivery also stops the transport's stale clock.
    pub fn send_if_available(&self, connection_id: &ConnectionId, messages: Vec<M>) -> Delivery<M> {
        let shared = &self.shared;
        let (transport, stale_timer, send_seq) = {
            let mut state = shared.lock();
            let Some(connection) = state.connections.get_mut(connection_id) else {
                return Delivery::NoSuchConnection(messages);
            };
            if connection.send_in_flight.is_some() {
                return Delivery::NotAvailable(messages);
            }
            let Some(attachment) = connection.attachment.as_mut() else {
                return Delivery::NotAvailable(messages);
            };
            let transport = attachment.transport.clone();
            let stale_timer = attachment.stale_timer.take();
            connection.sends_started += 1;
            let send_seq = connection.sends_started;
            connection.send_in_flight = Some(send_seq);
            (transport, stale_timer, send_seq)
        };
        if let Some(stale_timer) = stale_timer {
            shared.scheduler.cancel(&stale_timer);
        }

        let result = catch_unwind(AssertUnwindSafe(|| transport.send(messages)))
            .unwrap_or_else(|_| Err(TransportError::Io("transport panicked during send".into())));

        {
            let mut state = shared.lock();
            if let Some(connection) = state.connections.get_mut(connection_id)
                && connection.send_in_flight == Some(send_seq)
            {
                connection.send_in_flight = None;
            }
            shared.debug_check(&state);
        }

        match result {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                warn!(%connection_id, error = %e, "Transport failed to deliver");
                Delivery::Failed(e)
            }
        }
    }

    /// The connection's custom object under `key`, if there is one.
    pub fn connection_custom_object<T: CustomObject>(
        &self,
        connection_id: &ConnectionId,
        key: &str,
    ) -> Result<Option<Arc<T>>, RegistryError> {
        self.shared
            .custom_object(Scope::Connection(connection_id), key)
    }

    /// The connection's custom object under `key`, created with `create` if missing. `create`
    /// runs without the registry lock held.
    pub fn connection_custom_object_or_insert_with<T, F>(
        &self,
        connection_id: &ConnectionId,
        key: &str,
        create: F,
    ) -> Result<Arc<T>, RegistryError>
    where
        T: CustomObject,
        F: FnOnce() -> T,
    {
        self.shared
            .custom_object_or_insert_with(Scope::Connection(connection_id), key, create)
    }

    /// Forget the connection's custom object under `key`, handing it back undisposed.
    pub fn unregister_connection_custom_object(
        &self,
        connection_id: &ConnectionId,
        key: &str,
    ) -> Result<Option<Arc<dyn CustomObject>>, RegistryError> {
        self.shared
            .remove_custom_object(Scope::Connection(connection_id), key)
    }

    pub fn session_custom_object<T: CustomObject>(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<Arc<T>>, RegistryError> {
        self.shared.custom_object(Scope::Session(session_id), key)
    }

    pub fn session_custom_object_or_insert_with<T, F>(
        &self,
        session_id: &SessionId,
        key: &str,
        create: F,
    ) -> Result<Arc<T>, RegistryError>
    where
        T: CustomObject,
        F: FnOnce() -> T,
    {
        self.shared
            .custom_object_or_insert_with(Scope::Session(session_id), key, create)
    }

    pub fn unregister_session_custom_object(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<Arc<dyn CustomObject>>, RegistryError> {
        self.shared
            .remove_custom_object(Scope::Session(session_id), key)
    }

    pub fn stats(&self) -> RegistryStats {
        self.shared.lock().stats()
    }

    /// Verify the session and connection indexes against each other.
    #[cfg(debug_assertions)]
    pub fn check_consistency(&self) -> Result<(), tether_common::InvariantViolation> {
        self.shared.lock().check_consistency()
    }
}

impl<M: Send + 'static> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, RegistryState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(debug_assertions)]
    fn debug_check(&self, state: &RegistryState<M>) {
        if let Err(violation) = state.check_consistency() {
            error!(%violation, "Connection registry consistency check failed");
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_check(&self, _state: &RegistryState<M>) {}

    fn arm_timer(
        self: &Arc<Self>,
        delay: Duration,
        connection_id: &ConnectionId,
        on_fire: fn(&Self, &ConnectionId),
    ) -> TaskHandle {
        let registry: Weak<Self> = Arc::downgrade(self);
        let connection_id = connection_id.clone();
        self.scheduler.schedule_after(delay, move || {
            if let Some(registry) = registry.upgrade() {
                on_fire(&registry, &connection_id);
            }
            Ok(())
        })
    }

    fn arm_disconnect_timer(self: &Arc<Self>, connection_id: &ConnectionId) -> TaskHandle {
        self.arm_timer(
            self.config.disconnection_timeout(),
            connection_id,
            Self::on_disconnection_timeout,
        )
    }

    fn arm_stale_timer(self: &Arc<Self>, connection_id: &ConnectionId) -> TaskHandle {
        self.arm_timer(
            self.config.stale_connection_timeout(),
            connection_id,
            Self::on_stale_timeout,
        )
    }

    /// The connection has been detached for the whole disconnection timeout: evict it, unless this
    /// timer has since been superseded.
    fn on_disconnection_timeout(&self, connection_id: &ConnectionId) {
        let mut deferred = Deferred::new();
        {
            let mut state = self.lock();
            let is_current = state.connections.get(connection_id).is_some_and(|connection| {
                is_running_timer(connection.disconnect_timer.as_ref())
            });
            if !is_current {
                trace!(%connection_id, "Superseded disconnection timer fired");
                return;
            }
            let Some(connection) = state.connections.remove(connection_id) else {
                return;
            };
            if let Some(session) = state.sessions.get_mut(&connection.session_id) {
                session.connections.remove(connection_id);
            }
            deferred.dispose.extend(connection.custom_objects);
            deferred
                .events
                .push(RegistryEvent::ConnectionLost(connection_id.clone()));
            self.debug_check(&state);
        }
        info!(%connection_id, "Connection lost after disconnection timeout");
        self.run_deferred(deferred);
    }

    /// The transport has been held for the whole stale timeout with nothing sent: reset it so the
    /// client reconnects. The transport is expected to unregister itself in response.
    fn on_stale_timeout(&self, connection_id: &ConnectionId) {
        let transport = {
            let mut state = self.lock();
            let Some(attachment) = state
                .connections
                .get_mut(connection_id)
                .and_then(|connection| connection.attachment.as_mut())
                .filter(|attachment| is_running_timer(attachment.stale_timer.as_ref()))
            else {
                trace!(%connection_id, "Superseded stale timer fired");
                return;
            };
            attachment.stale_timer = None;
            attachment.transport.clone()
        };
        debug!(%connection_id, "Resetting stale transport");
        close_guarded(&transport, CloseReason::Reset);
    }

    fn custom_object<T: CustomObject>(
        &self,
        scope: Scope<'_>,
        key: &str,
    ) -> Result<Option<Arc<T>>, RegistryError> {
        let object = {
            let mut state = self.lock();
            objects_mut(&mut state, scope)?.get(key).cloned()
        };
        object.map(|object| downcast(key, object)).transpose()
    }

    fn custom_object_or_insert_with<T, F>(
        &self,
        scope: Scope<'_>,
        key: &str,
        create: F,
    ) -> Result<Arc<T>, RegistryError>
    where
        T: CustomObject,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.custom_object::<T>(scope, key)? {
            return Ok(existing);
        }
        let created = Arc::new(create());
        let raced = {
            let mut state = self.lock();
            objects_mut(&mut state, scope).map(|objects| match objects.get(key) {
                Some(existing) => Some(existing.clone()),
                None => {
                    objects.insert(key.to_string(), created.clone());
                    None
                }
            })
        };
        match raced {
            Ok(None) => Ok(created),
            Ok(Some(existing)) => {
                dispose_all(vec![(key.to_string(), created as Arc<dyn CustomObject>)]);
                downcast(key, existing)
            }
            Err(e) => {
                dispose_all(vec![(key.to_string(), created as Arc<dyn CustomObject>)]);
                Err(e)
            }
        }
    }

    fn remove_custom_object(
        &self,
        scope: Scope<'_>,
        key: &str,
    ) -> Result<Option<Arc<dyn CustomObject>>, RegistryError> {
        let mut state = self.lock();
        Ok(objects_mut(&mut state, scope)?.remove(key))
    }

    fn run_deferred(&self, deferred: Deferred<M>) {
        for timer in &deferred.cancel {
            self.scheduler.cancel(timer);
        }
        for (transport, reason) in &deferred.close {
            close_guarded(transport, *reason);
        }
        dispose_all(deferred.dispose);
        self.listeners.emit(&deferred.events);
    }
}

impl<M> Drop for Shared<M> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for connection in state.connections.values() {
            if let Some(timer) = &connection.disconnect_timer {
                self.scheduler.cancel(timer);
            }
            if let Some(timer) = connection.attachment.as_ref().and_then(|a| a.stale_timer.as_ref()) {
                self.scheduler.cancel(timer);
            }
        }
    }
}

impl<M> Deferred<M> {
    fn new() -> Self {
        Self {
            cancel: vec![],
            close: vec![],
            dispose: vec![],
            events: vec![],
        }
    }

    /// Schedule the teardown of a connection that has just been taken off the books.
    fn retire(&mut self, connection: ConnectionEntry<M>, reason: CloseReason) {
        self.cancel.extend(connection.disconnect_timer);
        if let Some(attachment) = connection.attachment {
            self.cancel.extend(attachment.stale_timer);
            self.close.push((attachment.transport, reason));
        }
        self.dispose.extend(connection.custom_objects);
    }
}

/// True if the calling thread is executing the task behind `timer`.
fn is_running_timer(timer: Option<&TaskHandle>) -> bool {
    timer.is_some_and(|timer| current_task() == Some(timer.id()))
}

fn objects_mut<'s, M>(
    state: &'s mut RegistryState<M>,
    scope: Scope<'_>,
) -> Result<&'s mut CustomObjects, RegistryError> {
    match scope {
        Scope::Session(session_id) => Ok(&mut state.session_mut(session_id)?.custom_objects),
        Scope::Connection(connection_id) => {
            Ok(&mut state.connection_mut(connection_id)?.custom_objects)
        }
    }
}

fn close_guarded<M: Send>(transport: &SharedTransport<M>, reason: CloseReason) {
    if catch_unwind(AssertUnwindSafe(|| transport.close(reason))).is_err() {
        error!(
            connection_id = %transport.connection_id(),
            ?reason,
            "Transport panicked while closing"
        );
    }
}

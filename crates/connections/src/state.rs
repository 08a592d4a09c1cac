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
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use tether_common::{ConnectionId, InvariantViolation, RegistryError, SessionId};
use tether_scheduler::TaskHandle;

use crate::custom::CustomObjects;
use crate::transport::Transport;

/// How transports are held and shared between the registry and their adapters.
pub type SharedTransport<M> = Arc<dyn Transport<Message = M>>;

/// Everything the registry's lock guards.
pub(crate) struct RegistryState<M> {
    pub(crate) sessions: HashMap<SessionId, SessionEntry, BuildHasherDefault<AHasher>>,
    pub(crate) connections: HashMap<ConnectionId, ConnectionEntry<M>, BuildHasherDefault<AHasher>>,
}

#[derive(Default)]
pub(crate) struct SessionEntry {
    pub(crate) connections: HashSet<ConnectionId, BuildHasherDefault<AHasher>>,
    pub(crate) custom_objects: CustomObjects,
}

pub(crate) struct ConnectionEntry<M> {
    pub(crate) session_id: SessionId,
    /// Present while a transport is attached. Mutually exclusive with `disconnect_timer`.
    pub(crate) attachment: Option<Attachment<M>>,
    /// Counting down to eviction while detached.
    pub(crate) disconnect_timer: Option<TaskHandle>,
    /// Sequence number of the send currently in flight. Outlives the attachment it was started
    /// on, so a re-registered or replacement transport can't start a second, overlapping send.
    pub(crate) send_in_flight: Option<u64>,
    pub(crate) sends_started: u64,
    pub(crate) custom_objects: CustomObjects,
}

impl<M> ConnectionEntry<M> {
    pub(crate) fn detached(session_id: SessionId, disconnect_timer: TaskHandle) -> Self {
        Self {
            session_id,
            attachment: None,
            disconnect_timer: Some(disconnect_timer),
            send_in_flight: None,
            sends_started: 0,
            custom_objects: CustomObjects::default(),
        }
    }

    /// Attached, with no send in flight.
    pub(crate) fn is_available(&self) -> bool {
        self.attachment.is_some() && self.send_in_flight.is_none()
    }
}

pub(crate) struct Attachment<M> {
    pub(crate) transport: SharedTransport<M>,
    /// Counting down to a forced reset of a long-held transport.
    pub(crate) stale_timer: Option<TaskHandle>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub connections: usize,
    /// Connections with a transport attached.
    pub attached: usize,
    /// Connections with a send in flight.
    pub busy: usize,
}

impl<M> RegistryState<M> {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Default::default(),
            connections: Default::default(),
        }
    }

    pub(crate) fn session(&self, session_id: &SessionId) -> Result<&SessionEntry, RegistryError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    pub(crate) fn session_mut(
        &mut self,
        session_id: &SessionId,
    ) -> Result<&mut SessionEntry, RegistryError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    pub(crate) fn connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<&ConnectionEntry<M>, RegistryError> {
        self.connections
            .get(connection_id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(connection_id.clone()))
    }

    pub(crate) fn connection_mut(
        &mut self,
        connection_id: &ConnectionId,
    ) -> Result<&mut ConnectionEntry<M>, RegistryError> {
        self.connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(connection_id.clone()))
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            sessions: self.sessions.len(),
            connections: self.connections.len(),
            ..Default::default()
        };
        for connection in self.connections.values() {
            if connection.attachment.is_some() {
                stats.attached += 1;
            }
            if connection.send_in_flight.is_some() {
                stats.busy += 1;
            }
        }
        stats
    }

    /// Verify the session and connection indexes describe the same set of connections, and that
    /// every connection is either attached or counting down to eviction, never both.
    pub(crate) fn check_consistency(&self) -> Result<(), InvariantViolation> {
        let members: usize = self.sessions.values().map(|s| s.connections.len()).sum();
        if members != self.connections.len() {
            return Err(InvariantViolation(format!(
                "sessions list {members} member connections but {} connections are indexed",
                self.connections.len()
            )));
        }
        for (session_id, session) in &self.sessions {
            for connection_id in &session.connections {
                match self.connections.get(connection_id) {
                    None => {
                        return Err(InvariantViolation(format!(
                            "session {session_id} lists unknown connection {connection_id}"
                        )));
                    }
                    Some(connection) if &connection.session_id != session_id => {
                        return Err(InvariantViolation(format!(
                            "connection {connection_id} is listed by session {session_id} but belongs to {}",
                            connection.session_id
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        for (connection_id, connection) in &self.connections {
            if !self.sessions.contains_key(&connection.session_id) {
                return Err(InvariantViolation(format!(
                    "connection {connection_id} belongs to missing session {}",
                    connection.session_id
                )));
            }
            match (&connection.attachment, &connection.disconnect_timer) {
                (Some(_), Some(_)) => {
                    return Err(InvariantViolation(format!(
                        "connection {connection_id} is attached with a disconnection timer pending"
                    )));
                }
                (None, None) => {
                    return Err(InvariantViolation(format!(
                        "connection {connection_id} is detached with no disconnection timer"
                    )));
                }
                (Some(_), None) | (None, Some(_)) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_common::config::SchedulerConfig;
    use tether_scheduler::TaskScheduler;

    fn detached(scheduler: &TaskScheduler, session_id: &SessionId) -> ConnectionEntry<()> {
        ConnectionEntry::detached(
            session_id.clone(),
            scheduler.schedule_after(Duration::from_secs(3600), || Ok(())),
        )
    }

    #[test]
    fn test_consistency_catches_index_drift() {
        let scheduler = TaskScheduler::new(&SchedulerConfig::default()).unwrap();
        let session_id = SessionId::from("s1");
        let connection_id = ConnectionId::from("c1");
        let mut state: RegistryState<()> = RegistryState::new();
        state.sessions.insert(session_id.clone(), SessionEntry::default());
        state
            .connections
            .insert(connection_id.clone(), detached(&scheduler, &session_id));
        // Indexed as a connection, but the session doesn't list it.
        assert!(state.check_consistency().is_err());

        state
            .session_mut(&session_id)
            .unwrap()
            .connections
            .insert(connection_id.clone());
        state.check_consistency().unwrap();

        state.connection_mut(&connection_id).unwrap().disconnect_timer = None;
        assert!(state.check_consistency().is_err());

        state.sessions.clear();
        assert!(state.check_consistency().is_err());
        assert_eq!(
            state.session(&session_id).err(),
            Some(RegistryError::SessionNotFound(session_id))
        );
    }
}

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

//! Recording transport and registry fixtures shared by the registry test suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_common::config::{RegistryConfig, SchedulerConfig};
use tether_common::{ConnectionId, SessionId, TransportError};
use tether_connections::{
    CloseReason, ConnectionRegistry, CustomObject, RegistryEvent, SharedTransport, Transport,
};
use tether_scheduler::TaskScheduler;

/// Transport that records what the registry asks of it instead of talking to a peer.
pub struct RecordingTransport {
    session_id: SessionId,
    connection_id: ConnectionId,
    /// Each batch of messages passed to `send`, in order.
    pub sent: Mutex<Vec<Vec<String>>>,
    /// Every `close` signal received.
    pub closes: Mutex<Vec<CloseReason>>,
    /// How long each send takes.
    send_delay: Duration,
    in_flight: AtomicUsize,
    /// Times a send started while another was still in flight.
    pub overlaps: AtomicUsize,
    pub fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new(session_id: &SessionId, connection_id: &ConnectionId) -> Arc<Self> {
        Self::with_send_delay(session_id, connection_id, Duration::ZERO)
    }

    pub fn with_send_delay(
        session_id: &SessionId,
        connection_id: &ConnectionId,
        send_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.clone(),
            connection_id: connection_id.clone(),
            sent: Mutex::new(vec![]),
            closes: Mutex::new(vec![]),
            send_delay,
            in_flight: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedTransport<String> {
        self.clone()
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    type Message = String;

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn send(&self, messages: Vec<String>) -> Result<(), TransportError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.send_delay.is_zero() {
            std::thread::sleep(self.send_delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io("peer went away".to_string()));
        }
        self.sent.lock().unwrap().push(messages);
        Ok(())
    }

    fn close(&self, reason: CloseReason) {
        self.closes.lock().unwrap().push(reason);
    }
}

/// A custom object that counts its disposals.
#[derive(Default)]
pub struct DisposalProbe {
    pub disposals: AtomicUsize,
}

impl CustomObject for DisposalProbe {
    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Registry {
    pub scheduler: Arc<TaskScheduler>,
    pub registry: ConnectionRegistry<String>,
    pub events: Arc<Mutex<Vec<RegistryEvent>>>,
}

impl Registry {
    pub fn new(disconnection_seconds: f64, stale_connection_seconds: f64) -> Self {
        tether_common::tracing::init_test_tracing();
        let scheduler = Arc::new(
            TaskScheduler::new(&SchedulerConfig {
                max_concurrent: 16,
                thread_name_prefix: "registry-test".to_string(),
            })
            .unwrap(),
        );
        let registry = ConnectionRegistry::new(
            scheduler.clone(),
            RegistryConfig {
                disconnection_seconds,
                stale_connection_seconds,
            },
        );
        let events = Arc::new(Mutex::new(vec![]));
        let recorded = events.clone();
        registry.subscribe(move |event| recorded.lock().unwrap().push(event.clone()));
        Self {
            scheduler,
            registry,
            events,
        }
    }

    pub fn events(&self) -> Vec<RegistryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_events(&self, wanted: &RegistryEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| *event == wanted)
            .count()
    }

    /// Allocate a connection and attach a fresh recording transport to it.
    pub fn attached(
        &self,
        session_id: &SessionId,
        start_stale_timeout: bool,
    ) -> (ConnectionId, Arc<RecordingTransport>) {
        let connection_id = self.registry.allocate_connection(session_id);
        let transport = RecordingTransport::new(session_id, &connection_id);
        assert!(
            self.registry
                .register_transport(transport.shared(), start_stale_timeout)
        );
        (connection_id, transport)
    }
}

pub fn messages(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

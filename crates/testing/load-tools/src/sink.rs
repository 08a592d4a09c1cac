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

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tether_common::{ConnectionId, SessionId, TransportError};
use tether_connections::{CloseReason, Transport};

/// Tallies shared by every `SinkTransport` in a run.
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub sends: AtomicUsize,
    pub messages: AtomicUsize,
    pub resets: AtomicUsize,
    pub logouts: AtomicUsize,
}

/// A transport with no peer behind it. Sends take `send_delay` and are then discarded; every call
/// is counted.
pub struct SinkTransport {
    session_id: SessionId,
    connection_id: ConnectionId,
    send_delay: Duration,
    counters: Arc<SinkCounters>,
}

impl SinkTransport {
    pub fn new(
        session_id: SessionId,
        connection_id: ConnectionId,
        send_delay: Duration,
        counters: Arc<SinkCounters>,
    ) -> Self {
        Self {
            session_id,
            connection_id,
            send_delay,
            counters,
        }
    }
}

impl Transport for SinkTransport {
    type Message = String;

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn send(&self, messages: Vec<String>) -> Result<(), TransportError> {
        if !self.send_delay.is_zero() {
            std::thread::sleep(self.send_delay);
        }
        self.counters.sends.fetch_add(1, Ordering::Relaxed);
        self.counters
            .messages
            .fetch_add(messages.len(), Ordering::Relaxed);
        Ok(())
    }

    fn close(&self, reason: CloseReason) {
        let counter = match reason {
            CloseReason::Reset => &self.counters.resets,
            CloseReason::Logout => &self.counters.logouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

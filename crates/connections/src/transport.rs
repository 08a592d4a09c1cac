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

use tether_common::{ConnectionId, SessionId, TransportError};

/// The final signal a transport is closed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The client should come straight back with a fresh request or socket.
    Reset,
    /// The session is over; the client should not reconnect.
    Logout,
}

/// A physical channel (a held long-poll request, a socket) currently carrying one logical
/// connection. Implemented by the transport adapters, which register themselves with the
/// registry when a request or socket arrives.
///
/// Both `send` and `close` may block on I/O. The registry never calls either while holding its
/// own lock.
pub trait Transport: Send + Sync {
    type Message: Send;

    fn session_id(&self) -> &SessionId;

    fn connection_id(&self) -> &ConnectionId;

    /// Deliver messages to the peer. For request/response transports this typically completes the
    /// pending request.
    fn send(&self, messages: Vec<Self::Message>) -> Result<(), TransportError>;

    /// Send a final signal and terminate the transport.
    fn close(&self, reason: CloseReason);
}

/// Outcome of `ConnectionRegistry::send_if_available`. When nothing was sent the messages come
/// back to the caller, who decides whether to queue them for later.
#[derive(Debug)]
pub enum Delivery<M> {
    Delivered,
    /// The connection exists but has no idle transport right now.
    NotAvailable(Vec<M>),
    NoSuchConnection(Vec<M>),
    /// The transport accepted the messages but failed to deliver them.
    Failed(TransportError),
}

impl<M> Delivery<M> {
    pub fn delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }

    pub fn connection_exists(&self) -> bool {
        !matches!(self, Delivery::NoSuchConnection(_))
    }

    /// The undelivered messages, if they were handed back.
    pub fn into_undelivered(self) -> Option<Vec<M>> {
        match self {
            Delivery::NotAvailable(messages) | Delivery::NoSuchConnection(messages) => {
                Some(messages)
            }
            Delivery::Delivered | Delivery::Failed(_) => None,
        }
    }
}

//
// Copyright 2025-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Gateway session management
//!
//! Sessions live in memory only and disappear with the process.

pub mod registry;

use chrono::{DateTime, Utc};
use mudlink_common::{SessionAnnouncement, SessionId, SessionOption, TransportKind};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

/// Session lifecycle
///
/// States only ever move forward: `Negotiating -> Active -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Raw connection accepted, transport handshake in progress
    Negotiating,
    /// Handshake complete, traffic flows
    Active,
    /// Flushing buffered output before the transport is released
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session state transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// A client session in the gateway
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub transport: TransportKind,
    pub state: SessionState,
    pub negotiated_options: BTreeSet<SessionOption>,
    /// `(columns, rows)` as reported by the client
    pub window: Option<(u16, u16)>,
    /// Label attached by the engine, e.g. a character name
    pub identity: Option<String>,
    pub peer_addr: SocketAddr,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session in the `Negotiating` state
    pub fn new(id: SessionId, transport: TransportKind, peer_addr: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            id,
            transport,
            state: SessionState::Negotiating,
            negotiated_options: BTreeSet::new(),
            window: None,
            identity: None,
            peer_addr,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Move to a later state
    ///
    /// Re-entering the current state is accepted and changes nothing.
    pub fn transition(&mut self, new_state: SessionState) -> Result<(), TransitionError> {
        use SessionState::*;

        let valid = match (self.state, new_state) {
            (Negotiating, Active) => true,
            (Negotiating, Closed) => true,
            (Active, Closing) => true,
            (Closing, Closed) => true,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if valid {
            self.state = new_state;
            Ok(())
        } else {
            Err(TransitionError {
                from: self.state,
                to: new_state,
            })
        }
    }

    pub fn announcement(&self) -> SessionAnnouncement {
        SessionAnnouncement {
            session_id: self.id,
            transport: self.transport,
            peer_addr: self.peer_addr.to_string(),
            options: self.negotiated_options.clone(),
            window: self.window,
            identity: self.identity.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId::new(),
            TransportKind::Telnet,
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    #[test]
    fn test_session_creation() {
        let session = session();
        assert_eq!(session.state, SessionState::Negotiating);
        assert!(session.negotiated_options.is_empty());
        assert_eq!(session.created_at, session.last_activity_at);
    }

    #[test]
    fn test_forward_transitions() {
        let mut session = session();
        assert!(session.transition(SessionState::Active).is_ok());
        assert!(session.transition(SessionState::Closing).is_ok());
        assert!(session.transition(SessionState::Closed).is_ok());
        assert_eq!(session.state, SessionState::Closed);
    }

    #[test]
    fn test_failed_handshake_goes_straight_to_closed() {
        let mut session = session();
        assert!(session.transition(SessionState::Closed).is_ok());
    }

    #[test]
    fn test_states_are_never_revisited() {
        let mut session = session();
        session.transition(SessionState::Active).unwrap();
        session.transition(SessionState::Closing).unwrap();

        let err = session.transition(SessionState::Active).unwrap_err();
        assert_eq!(err.from, SessionState::Closing);
        assert_eq!(err.to, SessionState::Active);
        assert_eq!(session.state, SessionState::Closing);

        session.transition(SessionState::Closed).unwrap();
        assert!(session.transition(SessionState::Negotiating).is_err());
        assert!(session.transition(SessionState::Closing).is_err());
    }

    #[test]
    fn test_active_cannot_skip_closing() {
        let mut session = session();
        session.transition(SessionState::Active).unwrap();
        assert!(session.transition(SessionState::Closed).is_err());
    }

    #[test]
    fn test_same_state_is_noop() {
        let mut session = session();
        session.transition(SessionState::Active).unwrap();
        assert!(session.transition(SessionState::Active).is_ok());
    }

    #[test]
    fn test_touch() {
        let mut session = session();
        let before = session.last_activity_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        session.touch();
        assert!(session.last_activity_at > before);
    }

    #[test]
    fn test_announcement() {
        let mut session = session();
        session.identity = Some("Gandalf".to_string());
        session.window = Some((80, 24));
        let announcement = session.announcement();
        assert_eq!(announcement.session_id, session.id);
        assert_eq!(announcement.peer_addr, "127.0.0.1:4000");
        assert_eq!(announcement.identity.as_deref(), Some("Gandalf"));
        assert_eq!(announcement.window, Some((80, 24)));
    }
}

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

//! Session registry
//!
//! Owns every live session and the outbound handle of the task that drives
//! its transport. All mutation happens under one write lock, so a lookup
//! sees either the whole entry or nothing.

use crate::engine::SessionRoster;
use crate::session::{Session, SessionState};
use async_trait::async_trait;
use metrics::{counter, gauge};
use mudlink_common::{SessionAnnouncement, SessionId, SessionOption, TransportKind};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, mpsc};

/// Command for the task that owns a session's transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Line(String),
    Prompt(String),
    /// `true` shows client input, `false` hides it
    Echo(bool),
    /// Flush what is queued and close the transport
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} is no longer running")]
    Detached(SessionId),
}

/// Cloneable handle used to write to a session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    transport: TransportKind,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn write_line(&self, text: impl Into<String>) -> Result<(), RegistryError> {
        self.send(Outbound::Line(text.into()))
    }

    pub fn write_prompt(&self, text: impl Into<String>) -> Result<(), RegistryError> {
        self.send(Outbound::Prompt(text.into()))
    }

    pub fn set_echo(&self, visible: bool) -> Result<(), RegistryError> {
        self.send(Outbound::Echo(visible))
    }

    fn send(&self, command: Outbound) -> Result<(), RegistryError> {
        self.sender
            .send(command)
            .map_err(|_| RegistryError::Detached(self.session_id))
    }
}

#[derive(Debug)]
struct Entry {
    session: Session,
    handle: SessionHandle,
}

/// Registry of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    players: Arc<AtomicUsize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live session counter, shared with the MSSP responder
    pub fn players(&self) -> Arc<AtomicUsize> {
        self.players.clone()
    }

    fn publish_count(&self, count: usize) {
        self.players.store(count, Ordering::Relaxed);
        gauge!("gateway_sessions_active").set(count as f64);
    }

    /// Register a session whose transport handshake succeeded
    ///
    /// Returns the new id and the receiver the transport task must drain.
    pub async fn create(
        &self,
        transport: TransportKind,
        peer_addr: SocketAddr,
        options: BTreeSet<SessionOption>,
        window: Option<(u16, u16)>,
    ) -> (SessionId, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.write().await;

        let mut id = SessionId::new();
        while sessions.contains_key(&id) {
            id = SessionId::new();
        }

        let mut session = Session::new(id, transport, peer_addr);
        session.negotiated_options = options;
        session.window = window;
        if let Err(err) = session.transition(SessionState::Active) {
            tracing::error!(session_id = %id, "{}", err);
        }

        let handle = SessionHandle {
            session_id: id,
            transport,
            sender,
        };
        sessions.insert(id, Entry { session, handle });
        self.publish_count(sessions.len());
        counter!("gateway_sessions_opened_total", "transport" => transport.to_string())
            .increment(1);

        (id, receiver)
    }

    /// Handle for an active session
    ///
    /// Sessions that are closing no longer accept output.
    pub async fn lookup(&self, id: SessionId) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&id)
            .filter(|entry| entry.session.state == SessionState::Active)
            .map(|entry| entry.handle.clone())
    }

    /// Snapshot of a registered session
    pub async fn get(&self, id: SessionId) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(&id).map(|entry| entry.session.clone())
    }

    /// Ask a session to flush and close
    ///
    /// Closing an unknown or already closing session does nothing. If the
    /// owning task is already gone the entry is removed right away.
    pub async fn close(&self, id: SessionId) {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(&id) else {
            tracing::debug!(session_id = %id, "Close requested for unknown session");
            return;
        };
        if entry.session.state != SessionState::Active {
            return;
        }
        if let Err(err) = entry.session.transition(SessionState::Closing) {
            tracing::error!(session_id = %id, "{}", err);
            return;
        }
        if entry.handle.send(Outbound::Close).is_err() {
            tracing::debug!(session_id = %id, "Session task already gone, removing");
            sessions.remove(&id);
            self.publish_count(sessions.len());
            counter!("gateway_sessions_closed_total").increment(1);
        }
    }

    /// Move an active session to `Closing` from its own task
    pub async fn mark_closing(&self, id: SessionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&id) {
            if entry.session.state == SessionState::Active {
                if let Err(err) = entry.session.transition(SessionState::Closing) {
                    tracing::error!(session_id = %id, "{}", err);
                }
            }
        }
    }

    /// Drop the entry once its transport has been released
    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let mut entry = sessions.remove(&id)?;
        self.publish_count(sessions.len());
        drop(sessions);

        if entry.session.state == SessionState::Active {
            if let Err(err) = entry.session.transition(SessionState::Closing) {
                tracing::debug!(session_id = %id, "Removing session out of order: {}", err);
            }
        }
        if let Err(err) = entry.session.transition(SessionState::Closed) {
            tracing::error!(session_id = %id, "{}", err);
        }
        counter!("gateway_sessions_closed_total").increment(1);
        Some(entry.session)
    }

    /// Record client activity
    pub async fn touch(&self, id: SessionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&id) {
            entry.session.touch();
        }
    }

    /// Attach an engine supplied label to a session
    pub async fn set_identity(&self, id: SessionId, identity: Option<String>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(entry) => {
                entry.session.identity = identity;
                true
            }
            None => false,
        }
    }

    pub async fn set_options(&self, id: SessionId, options: BTreeSet<SessionOption>) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&id) {
            entry.session.negotiated_options = options;
        }
    }

    /// Number of registered sessions, including ones that are closing
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_ids(&self) -> Vec<SessionId> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|entry| entry.session.state == SessionState::Active)
            .map(|entry| entry.session.id)
            .collect()
    }

    /// Handles for every active session
    pub async fn handles(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|entry| entry.session.state == SessionState::Active)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Announcements for every active session, oldest first
    pub async fn announcements(&self) -> Vec<SessionAnnouncement> {
        let sessions = self.sessions.read().await;
        let mut announcements: Vec<SessionAnnouncement> = sessions
            .values()
            .filter(|entry| entry.session.state == SessionState::Active)
            .map(|entry| entry.session.announcement())
            .collect();
        announcements.sort_by_key(|announcement| announcement.created_at);
        announcements
    }
}

#[async_trait]
impl SessionRoster for SessionRegistry {
    async fn announcements(&self) -> Vec<SessionAnnouncement> {
        SessionRegistry::announcements(self).await
    }

    async fn is_registered(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    async fn count(&self) -> usize {
        SessionRegistry::count(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn create(registry: &SessionRegistry) -> (SessionId, mpsc::UnboundedReceiver<Outbound>) {
        registry
            .create(TransportKind::Telnet, peer(), BTreeSet::new(), None)
            .await
    }

    #[tokio::test]
    async fn test_create_registers_active_session() {
        let registry = SessionRegistry::new();
        let options = BTreeSet::from([SessionOption::SuppressGoAhead]);
        let (id, _rx) = registry
            .create(TransportKind::SecureTelnet, peer(), options.clone(), Some((80, 24)))
            .await;

        let session = registry.get(id).await.unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.transport, TransportKind::SecureTelnet);
        assert_eq!(session.negotiated_options, options);
        assert_eq!(session.window, Some((80, 24)));
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.players().load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_unique_ids() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (id, rx) = create(&registry).await;
                (id, rx)
            }));
        }

        let mut ids = HashSet::new();
        let mut receivers = Vec::new();
        for task in tasks {
            let (id, rx) = task.await.unwrap();
            ids.insert(id);
            receivers.push(rx);
        }
        assert_eq!(ids.len(), 64);
        assert_eq!(registry.count().await, 64);
    }

    #[tokio::test]
    async fn test_lookup_delivers_output() {
        let registry = SessionRegistry::new();
        let (id, mut rx) = create(&registry).await;

        let handle = registry.lookup(id).await.unwrap();
        assert_eq!(handle.session_id(), id);
        handle.write_line("A dark room.").unwrap();
        handle.write_prompt("> ").unwrap();
        handle.set_echo(false).unwrap();

        assert_eq!(rx.recv().await, Some(Outbound::Line("A dark room.".to_string())));
        assert_eq!(rx.recv().await, Some(Outbound::Prompt("> ".to_string())));
        assert_eq!(rx.recv().await, Some(Outbound::Echo(false)));
    }

    #[tokio::test]
    async fn test_lookup_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup(SessionId::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = SessionRegistry::new();
        let (id, mut rx) = create(&registry).await;

        registry.close(id).await;
        registry.close(id).await;

        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.get(id).await.unwrap().state, SessionState::Closing);
        assert!(registry.lookup(id).await.is_none());

        let removed = registry.remove(id).await.unwrap();
        assert_eq!(removed.state, SessionState::Closed);
        assert_eq!(registry.count().await, 0);

        // Closing after removal is still a no-op
        registry.close(id).await;
        assert!(registry.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn test_close_unknown_session_is_noop() {
        let registry = SessionRegistry::new();
        let (_id, _rx) = create(&registry).await;
        registry.close(SessionId::new()).await;
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_close_with_detached_task_removes_entry() {
        let registry = SessionRegistry::new();
        let (id, rx) = create(&registry).await;
        drop(rx);

        registry.close(id).await;
        assert!(registry.get(id).await.is_none());
        assert_eq!(registry.players().load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_remove_active_session_closes_it() {
        let registry = SessionRegistry::new();
        let (id, _rx) = create(&registry).await;

        let removed = registry.remove(id).await.unwrap();
        assert_eq!(removed.state, SessionState::Closed);
        assert_eq!(registry.count().await, 0);
        assert!(registry.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn test_mark_closing_hides_session() {
        let registry = SessionRegistry::new();
        let (id, _rx) = create(&registry).await;
        registry.mark_closing(id).await;

        assert!(registry.lookup(id).await.is_none());
        assert!(registry.active_ids().await.is_empty());
        assert!(registry.announcements().await.is_empty());
        assert!(SessionRoster::is_registered(&registry, id).await);
    }

    #[tokio::test]
    async fn test_identity_and_announcements() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = create(&registry).await;
        let (second, _rx2) = registry
            .create(TransportKind::Ssh, peer(), BTreeSet::new(), None)
            .await;

        assert!(registry.set_identity(second, Some("Aragorn".to_string())).await);
        assert!(!registry.set_identity(SessionId::new(), None).await);

        let announcements = registry.announcements().await;
        assert_eq!(announcements.len(), 2);
        assert_eq!(announcements[0].session_id, first);
        assert_eq!(announcements[1].session_id, second);
        assert_eq!(announcements[1].identity.as_deref(), Some("Aragorn"));
    }

    #[tokio::test]
    async fn test_handles_cover_active_sessions() {
        let registry = SessionRegistry::new();
        let (a, _rx1) = create(&registry).await;
        let (b, _rx2) = create(&registry).await;
        registry.close(b).await;

        let handles = registry.handles().await;
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].session_id(), a);
    }
}

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

//! Engine envelope
//!
//! Every frame exchanged with the engine is a single JSON object:
//!
//! ```json
//! {"session_id": "6f1c...", "kind": "input-line", "payload": "look"}
//! ```
//!
//! `session_id` is `null` for gateway or engine system traffic.

use crate::session::{SessionAnnouncement, SystemEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque session identifier, serialized as a UUID string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// A line typed by a client
    InputLine,
    /// A line of text destined for a client
    OutputLine,
    /// A session finished its handshake and is live
    SessionOpened,
    /// A session ended, or the engine wants it ended
    SessionClosed,
    /// Gateway or engine control traffic
    System,
}

/// Optional rendering or control hint attached to an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Directive {
    /// Write the payload without a line terminator and mark it as a prompt
    Prompt,
    /// Stop showing the client what it types
    EchoOff,
    /// Resume showing the client what it types
    EchoOn,
    /// Attach the payload to the session as its identity label
    Identify,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unit of communication with the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: Option<SessionId>,
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<Directive>,
}

impl Envelope {
    pub fn new(session_id: Option<SessionId>, kind: EnvelopeKind, payload: impl Into<String>) -> Self {
        Self {
            session_id,
            kind,
            payload: payload.into(),
            directive: None,
        }
    }

    pub fn with_directive(mut self, directive: Directive) -> Self {
        self.directive = Some(directive);
        self
    }

    pub fn input_line(session_id: SessionId, line: impl Into<String>) -> Self {
        Self::new(Some(session_id), EnvelopeKind::InputLine, line)
    }

    pub fn output_line(session_id: SessionId, line: impl Into<String>) -> Self {
        Self::new(Some(session_id), EnvelopeKind::OutputLine, line)
    }

    pub fn session_opened(announcement: &SessionAnnouncement) -> Result<Self, EnvelopeError> {
        Ok(Self::new(
            Some(announcement.session_id),
            EnvelopeKind::SessionOpened,
            serde_json::to_string(announcement)?,
        ))
    }

    pub fn session_closed(session_id: SessionId) -> Self {
        Self::new(Some(session_id), EnvelopeKind::SessionClosed, "")
    }

    /// Build a session-less system envelope carrying a [`SystemEvent`]
    pub fn system(event: &SystemEvent) -> Result<Self, EnvelopeError> {
        Ok(Self::new(None, EnvelopeKind::System, serde_json::to_string(event)?))
    }

    /// Interpret the payload of a system envelope as a [`SystemEvent`]
    pub fn system_event(&self) -> Result<SystemEvent, EnvelopeError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }
}

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

//! Session data types shared with the engine

use crate::envelope::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Transport a client arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Plain TCP Telnet
    Telnet,
    /// Telnet over TLS
    SecureTelnet,
    /// SSH interactive channel
    Ssh,
    /// Status crawler, never becomes a session
    MsspProbe,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Telnet => write!(f, "telnet"),
            TransportKind::SecureTelnet => write!(f, "secure-telnet"),
            TransportKind::Ssh => write!(f, "ssh"),
            TransportKind::MsspProbe => write!(f, "mssp-probe"),
        }
    }
}

/// Protocol option enabled on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOption {
    /// Go-ahead suppressed (Telnet SGA)
    SuppressGoAhead,
    /// Gateway controls echo, client input is hidden
    ServerEcho,
    /// Client edits lines locally (Telnet LINEMODE)
    LineMode,
    /// Client reports its window size
    WindowSize,
    /// Client understands MSSP
    Mssp,
    /// Client allocated a pseudo terminal (SSH)
    Pty,
}

/// Description of a live session sent on open and on resync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAnnouncement {
    pub session_id: SessionId,
    pub transport: TransportKind,
    pub peer_addr: String,
    #[serde(default)]
    pub options: BTreeSet<SessionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<(u16, u16)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session-less control message carried in a `system` envelope payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SystemEvent {
    /// First frame on every engine connection
    Hello { secret: String, gateway_id: String },
    /// Every currently registered session, sent after each (re)connect
    Resync { sessions: Vec<SessionAnnouncement> },
    /// Liveness ping
    Heartbeat { sessions: usize },
}

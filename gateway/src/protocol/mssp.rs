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

//! MSSP (Mud Server Status Protocol) responder
//!
//! Server list crawlers either negotiate telnet option 70 and receive the
//! record as a subnegotiation, or send the plaintext line `MSSP-REQUEST`
//! and receive a tab separated reply. Either way no session is created.
//!
//! Reference: https://tintin.mudhalla.net/protocols/mssp/

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// MSSP variable marker
pub const MSSP_VAR: u8 = 1;
/// MSSP value marker
pub const MSSP_VAL: u8 = 2;

/// Plaintext request line
pub const PLAINTEXT_REQUEST: &str = "MSSP-REQUEST";

const RESERVED: [&str; 3] = ["NAME", "PLAYERS", "UPTIME"];

/// Builds the server status record
#[derive(Debug)]
pub struct MsspResponder {
    name: String,
    started_at: i64,
    fields: BTreeMap<String, Vec<String>>,
    players: Arc<AtomicUsize>,
}

impl MsspResponder {
    /// `players` is the live session counter owned by the session registry
    pub fn new(
        name: impl Into<String>,
        fields: BTreeMap<String, Vec<String>>,
        players: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            name: name.into(),
            started_at: chrono::Utc::now().timestamp(),
            fields,
            players,
        }
    }

    /// Current record, mandatory fields first
    pub fn record(&self) -> Vec<(String, Vec<String>)> {
        let mut record = vec![
            ("NAME".to_string(), vec![self.name.clone()]),
            (
                "PLAYERS".to_string(),
                vec![self.players.load(Ordering::Relaxed).to_string()],
            ),
            ("UPTIME".to_string(), vec![self.started_at.to_string()]),
        ];
        record.extend(
            self.fields
                .iter()
                .filter(|(key, values)| {
                    !values.is_empty() && !RESERVED.contains(&key.to_ascii_uppercase().as_str())
                })
                .map(|(key, values)| (key.to_ascii_uppercase(), values.clone())),
        );
        record
    }

    /// Subnegotiation payload (without `IAC SB MSSP` / `IAC SE` framing)
    pub fn telnet_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (name, values) in self.record() {
            payload.push(MSSP_VAR);
            payload.extend_from_slice(name.as_bytes());
            for value in values {
                payload.push(MSSP_VAL);
                payload.extend_from_slice(value.as_bytes());
            }
        }
        payload
    }

    /// Plaintext reply to an `MSSP-REQUEST` line
    pub fn plaintext(&self) -> String {
        let mut reply = String::from("\r\nMSSP-REPLY-START\r\n");
        for (name, values) in self.record() {
            reply.push_str(&name);
            for value in values {
                reply.push('\t');
                reply.push_str(&value);
            }
            reply.push_str("\r\n");
        }
        reply.push_str("MSSP-REPLY-END\r\n");
        reply
    }

    pub fn is_plaintext_request(line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(PLAINTEXT_REQUEST)
    }
}

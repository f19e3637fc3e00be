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

//! Line-oriented client stream abstraction
//!
//! Every transport the gateway speaks (Telnet, Telnet over TLS and SSH) is
//! reduced to the same [`LineStream`] capability so that the router and the
//! engine bridge never need to know which wire protocol a player is using.

use async_trait::async_trait;
use mudlink_common::{SessionOption, TransportKind};
use std::collections::BTreeSet;

pub mod codec;
pub mod mssp;
pub mod ssh;
pub mod telnet;

/// Line-oriented, transport independent client stream
///
/// `read_line` must be cancel safe: the router polls it inside `select!`
/// alongside outbound traffic, so dropping an in-flight `read_line` future
/// may not lose input that was already received.
#[async_trait]
pub trait LineStream: Send {
    /// Transport this stream runs over
    fn transport(&self) -> TransportKind;

    /// Options negotiated so far
    fn options(&self) -> BTreeSet<SessionOption>;

    /// Client window size as `(columns, rows)`, if reported
    fn window_size(&self) -> Option<(u16, u16)>;

    /// Read the next complete line, or `None` at end of stream
    async fn read_line(&mut self) -> Result<Option<String>, StreamError>;

    /// Write one line of text followed by the transport's line terminator
    async fn write_line(&mut self, text: &str) -> Result<(), StreamError>;

    /// Write a prompt, leaving the cursor on the same line
    async fn write_prompt(&mut self, text: &str) -> Result<(), StreamError>;

    /// Show (`true`) or hide (`false`) what the client types
    async fn set_echo(&mut self, visible: bool) -> Result<(), StreamError>;

    /// Flush and close the underlying transport
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Client stream errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("subnegotiation exceeds {limit} bytes")]
    SubnegotiationTooLong { limit: usize },

    #[error("connection closed")]
    Closed,

    #[error("SSH error: {0}")]
    Ssh(String),
}
